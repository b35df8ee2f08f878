use super::variant::CipherMode;
use crate::{Error, Result};
use aes::{
    Aes128,
    cipher::{
        BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher as _,
        generic_array::GenericArray,
    },
};

type Aes128Ctr = ctr::Ctr64BE<Aes128>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

pub(crate) const BLOCK_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherDirection {
    Encrypt,
    Decrypt,
}

enum CipherState {
    Ctr(Box<Aes128Ctr>),
    CbcEncrypt(Box<Aes128CbcEnc>),
    CbcDecrypt(Box<Aes128CbcDec>),
}

/// AES-128 in CTR or CBC mode with an optional crypt/skip block pattern.
///
/// The keystream position (CTR) and the chaining block (CBC) carry over from
/// one [`process`](Self::process) call to the next until [`set_iv`](Self::set_iv)
/// is called again. The pattern restarts with every call.
pub struct StreamCipher {
    key: [u8; 16],
    mode: CipherMode,
    direction: CipherDirection,
    crypt_byte_block: usize,
    skip_byte_block: usize,
    iv: [u8; 16],
    state: Option<CipherState>,
}

impl StreamCipher {
    pub fn new(key: &[u8; 16], mode: CipherMode, direction: CipherDirection) -> Self {
        Self {
            key: *key,
            mode,
            direction,
            crypt_byte_block: 0,
            skip_byte_block: 0,
            iv: [0; 16],
            state: None,
        }
    }

    /// Transform `crypt_byte_block` blocks then pass `skip_byte_block` blocks
    /// through, over and over. A pattern of 0:0 transforms every block.
    pub fn with_pattern(mut self, crypt_byte_block: u8, skip_byte_block: u8) -> Self {
        self.crypt_byte_block = crypt_byte_block as usize;
        self.skip_byte_block = skip_byte_block as usize;
        self
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    /// The IV last given to [`set_iv`](Self::set_iv), widened to 16 bytes.
    pub fn iv(&self) -> &[u8; 16] {
        &self.iv
    }

    /// Restart the cipher. An 8 byte IV fills the upper half of the counter
    /// block, the lower half is the block counter starting at zero.
    pub fn set_iv(&mut self, iv: &[u8]) -> Result<()> {
        self.iv = match (self.mode, iv.len()) {
            (CipherMode::Ctr, 8) => {
                let mut block = [0; 16];
                block[..8].copy_from_slice(iv);
                block
            }
            (_, 16) => {
                let mut block = [0; 16];
                block.copy_from_slice(iv);
                block
            }
            (mode, size) => {
                return Err(Error::invalid_parameters(format!(
                    "{} byte IV cannot be used with {:?} mode",
                    size, mode
                )));
            }
        };

        let key = GenericArray::from_slice(&self.key);
        let iv = GenericArray::from_slice(&self.iv);

        self.state = Some(match (self.mode, self.direction) {
            (CipherMode::Ctr, _) => CipherState::Ctr(Box::new(Aes128Ctr::new(key, iv))),
            (CipherMode::Cbc, CipherDirection::Encrypt) => {
                CipherState::CbcEncrypt(Box::new(Aes128CbcEnc::new(key, iv)))
            }
            (CipherMode::Cbc, CipherDirection::Decrypt) => {
                CipherState::CbcDecrypt(Box::new(Aes128CbcDec::new(key, iv)))
            }
        });

        Ok(())
    }

    /// Transform `input` into the start of `output`, returning the number of
    /// bytes written which is always `input.len()`.
    ///
    /// CBC only transforms whole blocks, a trailing partial block is copied.
    pub fn process(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        if output.len() < input.len() {
            return Err(Error::internal(format!(
                "output buffer of {} bytes cannot hold {} bytes",
                output.len(),
                input.len()
            )));
        }

        let state = self
            .state
            .as_mut()
            .ok_or_else(|| Error::internal("cipher used before an IV was set"))?;
        let output = &mut output[..input.len()];
        output.copy_from_slice(input);

        if self.crypt_byte_block == 0 {
            Self::transform(state, output);
            return Ok(input.len());
        }

        let crypt_size = self.crypt_byte_block * BLOCK_SIZE;
        let skip_size = self.skip_byte_block * BLOCK_SIZE;
        let mut offset = 0;

        // a final cycle without a whole crypt run stays in the clear
        while output.len() - offset >= crypt_size {
            Self::transform(state, &mut output[offset..offset + crypt_size]);
            offset += crypt_size + skip_size;

            if offset >= output.len() {
                break;
            }
        }

        Ok(input.len())
    }

    fn transform(state: &mut CipherState, data: &mut [u8]) {
        match state {
            CipherState::Ctr(cipher) => cipher.apply_keystream(data),
            CipherState::CbcEncrypt(cipher) => {
                for block in data.chunks_exact_mut(BLOCK_SIZE) {
                    cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            CipherState::CbcDecrypt(cipher) => {
                for block in data.chunks_exact_mut(BLOCK_SIZE) {
                    cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f,
        0x3c,
    ];

    fn process(cipher: &mut StreamCipher, input: &[u8]) -> Vec<u8> {
        let mut output = vec![0; input.len()];
        cipher.process(input, &mut output).unwrap();
        output
    }

    #[test]
    fn test_ctr_nist_vector() {
        // NIST SP 800-38A F.5.1
        let iv = hex::decode("f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff").unwrap();
        let plain = hex::decode("6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e51")
            .unwrap();
        let expected =
            hex::decode("874d6191b620e3261bef6864990db6ce9806f66b7970fdff8617187bb9fffdff")
                .unwrap();

        let mut cipher = StreamCipher::new(&KEY, CipherMode::Ctr, CipherDirection::Encrypt);
        cipher.set_iv(&iv).unwrap();
        assert_eq!(process(&mut cipher, &plain), expected);
    }

    #[test]
    fn test_cbc_nist_vector_with_partial_block() {
        // NIST SP 800-38A F.2.1
        let iv = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let mut plain =
            hex::decode("6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e51")
                .unwrap();
        plain.extend_from_slice(&[1, 2, 3]);

        let mut cipher = StreamCipher::new(&KEY, CipherMode::Cbc, CipherDirection::Encrypt);
        cipher.set_iv(&iv).unwrap();
        let encrypted = process(&mut cipher, &plain);
        assert_eq!(
            hex::encode(&encrypted[..32]),
            "7649abac8119b246cee98e9b12e9197d5086cb9b507219ee95db113a917678b2"
        );
        assert_eq!(&encrypted[32..], &[1, 2, 3]);

        let mut cipher = StreamCipher::new(&KEY, CipherMode::Cbc, CipherDirection::Decrypt);
        cipher.set_iv(&iv).unwrap();
        assert_eq!(process(&mut cipher, &encrypted), plain);
    }

    #[test]
    fn test_state_carries_across_calls() {
        let data = [0x5A; 64];

        for mode in [CipherMode::Ctr, CipherMode::Cbc] {
            let mut whole = StreamCipher::new(&KEY, mode, CipherDirection::Encrypt);
            whole.set_iv(&[7; 16]).unwrap();
            let expected = process(&mut whole, &data);

            let mut split = StreamCipher::new(&KEY, mode, CipherDirection::Encrypt);
            split.set_iv(&[7; 16]).unwrap();
            let mut actual = process(&mut split, &data[..32]);
            actual.extend(process(&mut split, &data[32..]));
            assert_eq!(actual, expected);
        }
    }

    #[test]
    fn test_short_ctr_iv_is_upper_half() {
        let mut short = StreamCipher::new(&KEY, CipherMode::Ctr, CipherDirection::Encrypt);
        short.set_iv(&[9; 8]).unwrap();

        let mut full = StreamCipher::new(&KEY, CipherMode::Ctr, CipherDirection::Encrypt);
        full.set_iv(&[9, 9, 9, 9, 9, 9, 9, 9, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap();

        assert_eq!(process(&mut short, &[0; 40]), process(&mut full, &[0; 40]));
        assert!(
            StreamCipher::new(&KEY, CipherMode::Cbc, CipherDirection::Encrypt)
                .set_iv(&[9; 8])
                .is_err()
        );
    }

    #[test]
    fn test_pattern_one_in_ten() {
        let plain = (0..160).map(|x| x as u8).collect::<Vec<_>>();

        for mode in [CipherMode::Ctr, CipherMode::Cbc] {
            let mut cipher =
                StreamCipher::new(&KEY, mode, CipherDirection::Encrypt).with_pattern(1, 9);
            cipher.set_iv(&[3; 16]).unwrap();
            let encrypted = process(&mut cipher, &plain);

            assert_ne!(&encrypted[..16], &plain[..16]);
            assert_eq!(&encrypted[16..], &plain[16..]);
        }
    }

    #[test]
    fn test_pattern_partial_cycle_is_clear() {
        let plain = [0x11; 16 * 12 + 5];
        let mut cipher =
            StreamCipher::new(&KEY, CipherMode::Cbc, CipherDirection::Encrypt).with_pattern(2, 8);
        cipher.set_iv(&[3; 16]).unwrap();
        let encrypted = process(&mut cipher, &plain);

        // blocks 0-1 and 10-11 are crypt runs, the 5 trailing bytes are not
        assert_ne!(&encrypted[..32], &plain[..32]);
        assert_eq!(&encrypted[32..160], &plain[32..160]);
        assert_ne!(&encrypted[160..192], &plain[160..192]);
        assert_eq!(&encrypted[192..], &plain[192..]);

        let mut cipher =
            StreamCipher::new(&KEY, CipherMode::Cbc, CipherDirection::Encrypt).with_pattern(2, 8);
        cipher.set_iv(&[3; 16]).unwrap();
        let short = [0x11; 16 * 11];
        // the second cycle only has one block left, it is skipped
        assert_eq!(&process(&mut cipher, &short)[160..], &short[160..]);
    }

    #[test]
    fn test_process_without_iv() {
        let mut cipher = StreamCipher::new(&KEY, CipherMode::Ctr, CipherDirection::Decrypt);
        let mut output = [0; 4];
        assert!(matches!(
            cipher.process(&[0; 4], &mut output),
            Err(Error::Internal(_))
        ));
    }
}
