//! Common Encryption of the samples of fragmented mp4 files.
//!
//! Samples are encrypted and decrypted with AES-128 in place, one track at a
//! time and strictly in decode order, since the IV of every sample follows
//! from the one before it.
//!
//! # Supported Encryption Schemes
//!
//! | Variant | Scheme | Cipher Mode | IV | Video pattern |
//! |---------|--------|-------------|----|---------------|
//! | [`CencVariant::PiffCtr`] | `piff` | AES-128-CTR | 8 bytes | - |
//! | [`CencVariant::PiffCbc`] | `piff` | AES-128-CBC | 16 bytes | - |
//! | [`CencVariant::MpegCenc`] | `cenc` | AES-128-CTR | 16 bytes | - |
//! | [`CencVariant::MpegCbc1`] | `cbc1` | AES-128-CBC | 16 bytes | - |
//! | [`CencVariant::MpegCens`] | `cens` | AES-128-CTR | 16 bytes | 1:9 |
//! | [`CencVariant::MpegCbcs`] | `cbcs` | AES-128-CBC | constant | 1:9 |
//!
//! Video tracks coded with AVC or HEVC get subsample encryption: NAL unit
//! lengths, headers and slice headers stay in the clear.
//!
//! # Quick Start
//!
//! ```no_run
//! use cenc_mp4::{CencDecryptingProcessor, CencEncryptingProcessor, CencVariant};
//! use std::fs;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut encrypter = CencEncryptingProcessor::builder(CencVariant::MpegCenc)
//!         .key(1, "100b6c20940f779a4589152b57d2dacb", "0a610676cb88f302")?
//!         .kid(1, "eb676abbcb345e96bbcf616630f1a3da")?
//!         .build()?;
//!
//!     let encrypted = encrypter.encrypt(&fs::read("input.mp4")?)?;
//!
//!     let decrypter = CencDecryptingProcessor::builder()
//!         .key("eb676abbcb345e96bbcf616630f1a3da", "100b6c20940f779a4589152b57d2dacb")?
//!         .build()?;
//!
//!     fs::write("output.mp4", decrypter.decrypt(&encrypted, None)?)?;
//!     Ok(())
//! }
//! ```
//!
//! # Thread Safety
//!
//! [`CencDecryptingProcessor`] is `Send + Sync` and can be shared across threads
//! using `Arc`. [`CencEncryptingProcessor`] owns the running IV of every track
//! and needs `&mut self`.

mod cipher;
mod decrypter;
mod decrypting;
mod encrypter;
mod encrypting;
mod fragment;
mod mapper;
mod sample_decrypter;
mod sample_info;
mod variant;

pub use cipher::{CipherDirection, StreamCipher};
pub use decrypter::SingleSampleDecrypter;
pub use decrypting::{CencDecryptingProcessor, CencDecryptingProcessorBuilder};
pub use encrypter::{
    CbcSampleEncrypter, CbcSubSampleEncrypter, CtrSampleEncrypter, CtrSubSampleEncrypter,
    EncryptedSample, SampleEncrypter, create_encrypter,
};
pub use encrypting::{CencEncryptingProcessor, CencEncryptingProcessorBuilder};
pub use mapper::{
    AdvancedSubSampleMapper, BasicSubSampleMapper, CbcsSubSampleMapper, SubSampleMap,
    SubSampleMapper, create_mapper,
};
pub use sample_decrypter::SampleDecrypter;
pub use sample_info::SampleInfoTable;
pub use variant::{CencVariant, CipherMode, CipherParams, EncryptOptions};
