use super::{
    cipher::{CipherDirection, StreamCipher},
    variant::{ALGORITHM_ID_CBC, ALGORITHM_ID_CTR, ALGORITHM_ID_NONE, CipherMode},
};
use crate::{Error, Result};

/// Decrypts one sample at a time given its IV and subsample map.
///
/// Built without a cipher it copies samples through untouched, which is what
/// a PIFF track with algorithm id 0 asks for.
pub struct SingleSampleDecrypter {
    cipher: Option<StreamCipher>,
    reset_iv_per_subsample: bool,
}

impl SingleSampleDecrypter {
    pub fn new(
        mode: CipherMode,
        key: &[u8; 16],
        crypt_byte_block: u8,
        skip_byte_block: u8,
        reset_iv_per_subsample: bool,
    ) -> Self {
        Self {
            cipher: Some(
                StreamCipher::new(key, mode, CipherDirection::Decrypt)
                    .with_pattern(crypt_byte_block, skip_byte_block),
            ),
            reset_iv_per_subsample,
        }
    }

    pub fn passthrough() -> Self {
        Self {
            cipher: None,
            reset_iv_per_subsample: false,
        }
    }

    /// Decrypter for a PIFF track encryption algorithm id.
    pub fn from_algorithm_id(algorithm_id: u32, key: &[u8; 16]) -> Result<Self> {
        match algorithm_id {
            ALGORITHM_ID_NONE => Ok(Self::passthrough()),
            ALGORITHM_ID_CTR => Ok(Self::new(CipherMode::Ctr, key, 0, 0, false)),
            ALGORITHM_ID_CBC => Ok(Self::new(CipherMode::Cbc, key, 0, 0, false)),
            x => Err(Error::not_supported(format!(
                "piff algorithm id {} is unknown",
                x
            ))),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.cipher.is_none()
    }

    /// Decrypt `input`. Without subsamples the whole sample is encrypted; in
    /// CBC mode that means its whole blocks, the tail is copied.
    pub fn decrypt_sample_data(
        &mut self,
        input: &[u8],
        iv: &[u8],
        bytes_of_cleartext_data: &[u16],
        bytes_of_encrypted_data: &[u32],
    ) -> Result<Vec<u8>> {
        let Some(cipher) = self.cipher.as_mut() else {
            return Ok(input.to_vec());
        };

        if bytes_of_cleartext_data.len() != bytes_of_encrypted_data.len() {
            return Err(Error::invalid_parameters(format!(
                "{} clear sizes given for {} encrypted sizes",
                bytes_of_cleartext_data.len(),
                bytes_of_encrypted_data.len()
            )));
        }

        let mut output = vec![0; input.len()];
        cipher.set_iv(iv)?;

        if bytes_of_cleartext_data.is_empty() {
            cipher.process(input, &mut output)?;
            return Ok(output);
        }

        let mut offset = 0;

        for (cleartext_size, encrypted_size) in bytes_of_cleartext_data
            .iter()
            .zip(bytes_of_encrypted_data)
        {
            let cleartext_size = *cleartext_size as usize;
            let encrypted_size = *encrypted_size as usize;
            let end = offset + cleartext_size + encrypted_size;

            if end > input.len() {
                return Err(Error::invalid_format(format!(
                    "subsamples run to byte {} of a {} byte sample",
                    end,
                    input.len()
                )));
            }

            output[offset..offset + cleartext_size]
                .copy_from_slice(&input[offset..offset + cleartext_size]);
            offset += cleartext_size;

            if encrypted_size > 0 {
                if self.reset_iv_per_subsample {
                    cipher.set_iv(iv)?;
                }

                cipher.process(&input[offset..end], &mut output[offset..end])?;
            }

            offset = end;
        }

        output[offset..].copy_from_slice(&input[offset..]);
        Ok(output)
    }
}
