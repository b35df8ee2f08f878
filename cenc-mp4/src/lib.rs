#![cfg_attr(docsrs, feature(doc_cfg))]

//! This crate encrypts and decrypts the samples of fragmented mp4 files with
//! the ISO Common Encryption schemes (`cenc`, `cbc1`, `cens`, `cbcs`) and the
//! older Microsoft PIFF scheme.
//!
//! The [`cenc`] module holds the processors which work on whole files and
//! segments, along with the per sample building blocks they are made of.
//! [`atom`] and [`boxes`] expose the box tree they edit and [`codec`] the
//! AVC/HEVC slice header parsing used to keep slice headers in the clear.
//!
//! # Optional Features
//!
//! The following are a list of [Cargo features](https://doc.rust-lang.org/stable/cargo/reference/features.html#the-features-section) that can be
//! enabled or disabled:
//!
//! - **serde**: Derives `Serialize` and `Deserialize` for the variant and cipher parameter types.

pub mod atom;
pub mod boxes;
pub mod cenc;
pub mod codec;

mod error;
mod reader;

pub use atom::{Atom, AtomBody, FourCc, atom_offsets, parse_atoms, write_atoms};
pub use cenc::{
    CencDecryptingProcessor, CencDecryptingProcessorBuilder, CencEncryptingProcessor,
    CencEncryptingProcessorBuilder, CencVariant, CipherMode, CipherParams, EncryptOptions,
    SampleInfoTable,
};
pub use error::Error;
pub use reader::Reader;

/// A `Result` alias where the `Err` case is `cenc_mp4::Error`.
pub type Result<T> = std::result::Result<T, Error>;
