use super::{
    decrypter::SingleSampleDecrypter, sample_info::SampleInfoTable, variant::CipherMode,
    variant::CipherParams,
};
use crate::{Error, Result};

/// Decrypts the samples of one track fragment with the IVs and subsample
/// maps of its [`SampleInfoTable`].
pub struct SampleDecrypter {
    decrypter: SingleSampleDecrypter,
    table: SampleInfoTable,
    mode: Option<CipherMode>,
}

impl SampleDecrypter {
    /// Checks the IV size of the table against the cipher: CTR takes 8 or 16
    /// byte IVs, CBC takes 16 bytes unless a constant IV of 8 bytes is used.
    pub fn create(params: &CipherParams, key: &[u8; 16], table: SampleInfoTable) -> Result<Self> {
        let iv_size = table.iv_size();
        let valid = match params.mode {
            CipherMode::Ctr => matches!(iv_size, 8 | 16),
            CipherMode::Cbc => iv_size == 16 || (params.constant_iv && iv_size == 8),
        };

        if !valid {
            return Err(Error::invalid_format(format!(
                "{} byte IVs cannot be used with {:?} mode",
                iv_size, params.mode
            )));
        }

        Ok(Self {
            decrypter: SingleSampleDecrypter::new(
                params.mode,
                key,
                params.crypt_byte_block,
                params.skip_byte_block,
                params.reset_iv_per_subsample,
            ),
            table,
            mode: Some(params.mode),
        })
    }

    /// Wrap an already built decrypter, used for tracks which copy samples through.
    pub fn new(decrypter: SingleSampleDecrypter, table: SampleInfoTable) -> Self {
        Self {
            decrypter,
            table,
            mode: None,
        }
    }

    pub fn table(&self) -> &SampleInfoTable {
        &self.table
    }

    pub fn decrypt_sample_data(&mut self, sample_index: u32, input: &[u8]) -> Result<Vec<u8>> {
        if self.decrypter.is_passthrough() {
            return Ok(input.to_vec());
        }

        let iv = self.table.get_iv(sample_index)?;
        let (_, cleartext, encrypted) = self.table.get_sample_info(sample_index)?;

        // an 8 byte constant IV is zero extended for CBC
        let mut block = [0; 16];
        let iv = if self.mode == Some(CipherMode::Cbc) && iv.len() == 8 {
            block[..8].copy_from_slice(iv);
            &block[..]
        } else {
            iv
        };

        self.decrypter
            .decrypt_sample_data(input, iv, cleartext, encrypted)
    }
}
