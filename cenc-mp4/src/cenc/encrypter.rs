use super::{
    cipher::{BLOCK_SIZE, CipherDirection, StreamCipher},
    mapper::SubSampleMapper,
    variant::{CipherMode, CipherParams},
};
use crate::{Error, Result};

/// Output of [`SampleEncrypter::encrypt_sample_data`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptedSample {
    pub data: Vec<u8>,
    /// IV to store for the sample, empty when a constant IV is used.
    pub iv: Vec<u8>,
    /// Subsample record (`u16 count` and `u16 clear, u32 encrypted` pairs),
    /// empty for full sample encryption.
    pub info: Vec<u8>,
}

/// Encrypts the samples of one track in decode order.
///
/// Implementations own the running IV, which moves forward after every sample,
/// so samples must not be skipped or reordered.
pub trait SampleEncrypter: Send {
    fn encrypt_sample_data(&mut self, sample: &[u8]) -> Result<EncryptedSample>;

    /// The IV which the next sample will be encrypted with.
    fn iv(&self) -> &[u8; 16];

    fn has_subsamples(&self) -> bool;
}

/// IV bookkeeping shared by every encrypter.
struct IvState {
    iv: [u8; 16],
    /// Number of IV bytes stored per sample, zero for a constant IV.
    iv_size: usize,
}

impl IvState {
    fn new(iv: &[u8], params: &CipherParams) -> Result<Self> {
        if iv.len() != 8 && iv.len() != 16 {
            return Err(Error::invalid_parameters(format!(
                "IV must be 8 or 16 bytes, got {}",
                iv.len()
            )));
        }

        let mut block = [0; 16];
        block[..iv.len()].copy_from_slice(iv);

        if params.iv_size == 8 {
            block[8..].fill(0);
        }

        Ok(Self {
            iv: block,
            iv_size: params.iv_size as usize,
        })
    }

    /// IV handed to the cipher.
    fn cipher_iv(&self) -> &[u8] {
        if self.iv_size == 8 {
            &self.iv[..8]
        } else {
            &self.iv
        }
    }

    fn sample_iv(&self) -> Vec<u8> {
        self.iv[..self.iv_size].to_vec()
    }

    /// Move the counter on by the blocks used by a sample. An 8 byte IV only
    /// ever moves on by one.
    fn advance_ctr(&mut self, encrypted_size: usize) {
        if self.iv_size == 8 {
            let value = u64::from_be_bytes(self.iv[..8].try_into().unwrap_or_default());
            self.iv[..8].copy_from_slice(&value.wrapping_add(1).to_be_bytes());
        } else {
            let value = u64::from_be_bytes(self.iv[8..].try_into().unwrap_or_default());
            let blocks = encrypted_size.div_ceil(BLOCK_SIZE) as u64;
            self.iv[8..].copy_from_slice(&value.wrapping_add(blocks).to_be_bytes());
        }
    }

    /// Chain the next sample from the last ciphertext block.
    fn advance_cbc(&mut self, last_block: Option<&[u8]>) {
        if self.iv_size == 0 {
            return;
        }

        if let Some(block) = last_block {
            self.iv.copy_from_slice(block);
        }
    }
}

fn cipher(key: &[u8; 16], params: &CipherParams) -> StreamCipher {
    StreamCipher::new(key, params.mode, CipherDirection::Encrypt)
        .with_pattern(params.crypt_byte_block, params.skip_byte_block)
}

/// AES-CTR over whole samples.
pub struct CtrSampleEncrypter {
    cipher: StreamCipher,
    state: IvState,
}

impl CtrSampleEncrypter {
    pub fn new(key: &[u8; 16], iv: &[u8], params: &CipherParams) -> Result<Self> {
        Ok(Self {
            cipher: cipher(key, params),
            state: IvState::new(iv, params)?,
        })
    }
}

impl SampleEncrypter for CtrSampleEncrypter {
    fn encrypt_sample_data(&mut self, sample: &[u8]) -> Result<EncryptedSample> {
        let mut data = vec![0; sample.len()];
        let iv = self.state.sample_iv();

        self.cipher.set_iv(self.state.cipher_iv())?;
        self.cipher.process(sample, &mut data)?;
        self.state.advance_ctr(sample.len());

        Ok(EncryptedSample {
            data,
            iv,
            info: Vec::new(),
        })
    }

    fn iv(&self) -> &[u8; 16] {
        &self.state.iv
    }

    fn has_subsamples(&self) -> bool {
        false
    }
}

/// AES-CBC over the whole blocks of samples, a trailing partial block stays clear.
pub struct CbcSampleEncrypter {
    cipher: StreamCipher,
    state: IvState,
}

impl CbcSampleEncrypter {
    pub fn new(key: &[u8; 16], iv: &[u8], params: &CipherParams) -> Result<Self> {
        Ok(Self {
            cipher: cipher(key, params),
            state: IvState::new(iv, params)?,
        })
    }
}

impl SampleEncrypter for CbcSampleEncrypter {
    fn encrypt_sample_data(&mut self, sample: &[u8]) -> Result<EncryptedSample> {
        let mut data = vec![0; sample.len()];
        let iv = self.state.sample_iv();

        self.cipher.set_iv(&self.state.iv)?;
        self.cipher.process(sample, &mut data)?;

        let end = sample.len() / BLOCK_SIZE * BLOCK_SIZE;
        self.state
            .advance_cbc((end > 0).then(|| &data[end - BLOCK_SIZE..end]));

        Ok(EncryptedSample {
            data,
            iv,
            info: Vec::new(),
        })
    }

    fn iv(&self) -> &[u8; 16] {
        &self.state.iv
    }

    fn has_subsamples(&self) -> bool {
        false
    }
}

/// Walk the subsamples of `sample`, copying the clear runs and ciphering the
/// rest. Returns the end offset of the last whole ciphered block, if any.
fn encrypt_subsamples(
    cipher: &mut StreamCipher,
    iv: &[u8],
    reset_iv_per_subsample: bool,
    sample: &[u8],
    data: &mut [u8],
    mapper: &mut dyn SubSampleMapper,
) -> Result<(Vec<u8>, usize, Option<usize>)> {
    let map = mapper.map(sample)?;

    if map.total_size() != sample.len() {
        return Err(Error::internal(format!(
            "subsample map covers {} bytes of a {} byte sample",
            map.total_size(),
            sample.len()
        )));
    }

    cipher.set_iv(iv)?;
    let mut offset = 0;
    let mut last_block_end = None;

    for (cleartext_size, encrypted_size) in map.iter() {
        data[offset..offset + cleartext_size]
            .copy_from_slice(&sample[offset..offset + cleartext_size]);
        offset += cleartext_size;

        if encrypted_size > 0 {
            if reset_iv_per_subsample {
                cipher.set_iv(iv)?;
            }

            cipher.process(
                &sample[offset..offset + encrypted_size],
                &mut data[offset..offset + encrypted_size],
            )?;

            if encrypted_size >= BLOCK_SIZE {
                last_block_end = Some(offset + encrypted_size / BLOCK_SIZE * BLOCK_SIZE);
            }

            offset += encrypted_size;
        }
    }

    Ok((map.to_info()?, map.encrypted_size(), last_block_end))
}

/// AES-CTR over the encrypted ranges picked by a [`SubSampleMapper`].
pub struct CtrSubSampleEncrypter {
    cipher: StreamCipher,
    state: IvState,
    mapper: Box<dyn SubSampleMapper>,
    reset_iv_per_subsample: bool,
}

impl CtrSubSampleEncrypter {
    pub fn new(
        key: &[u8; 16],
        iv: &[u8],
        params: &CipherParams,
        mapper: Box<dyn SubSampleMapper>,
    ) -> Result<Self> {
        Ok(Self {
            cipher: cipher(key, params),
            state: IvState::new(iv, params)?,
            mapper,
            reset_iv_per_subsample: params.reset_iv_per_subsample,
        })
    }
}

impl SampleEncrypter for CtrSubSampleEncrypter {
    fn encrypt_sample_data(&mut self, sample: &[u8]) -> Result<EncryptedSample> {
        let mut data = vec![0; sample.len()];
        let iv = self.state.sample_iv();

        let (info, encrypted_size, _) = encrypt_subsamples(
            &mut self.cipher,
            self.state.cipher_iv(),
            self.reset_iv_per_subsample,
            sample,
            &mut data,
            self.mapper.as_mut(),
        )?;
        self.state.advance_ctr(encrypted_size);

        Ok(EncryptedSample { data, iv, info })
    }

    fn iv(&self) -> &[u8; 16] {
        &self.state.iv
    }

    fn has_subsamples(&self) -> bool {
        true
    }
}

/// AES-CBC over the encrypted ranges picked by a [`SubSampleMapper`].
///
/// The chain runs through all the subsamples of a sample, unless the IV is
/// reset at the start of each one as `cbcs` does.
pub struct CbcSubSampleEncrypter {
    cipher: StreamCipher,
    state: IvState,
    mapper: Box<dyn SubSampleMapper>,
    reset_iv_per_subsample: bool,
}

impl CbcSubSampleEncrypter {
    pub fn new(
        key: &[u8; 16],
        iv: &[u8],
        params: &CipherParams,
        mapper: Box<dyn SubSampleMapper>,
    ) -> Result<Self> {
        Ok(Self {
            cipher: cipher(key, params),
            state: IvState::new(iv, params)?,
            mapper,
            reset_iv_per_subsample: params.reset_iv_per_subsample,
        })
    }
}

impl SampleEncrypter for CbcSubSampleEncrypter {
    fn encrypt_sample_data(&mut self, sample: &[u8]) -> Result<EncryptedSample> {
        let mut data = vec![0; sample.len()];
        let iv = self.state.sample_iv();

        let (info, _, last_block_end) = encrypt_subsamples(
            &mut self.cipher,
            &self.state.iv,
            self.reset_iv_per_subsample,
            sample,
            &mut data,
            self.mapper.as_mut(),
        )?;
        self.state
            .advance_cbc(last_block_end.map(|end| &data[end - BLOCK_SIZE..end]));

        Ok(EncryptedSample { data, iv, info })
    }

    fn iv(&self) -> &[u8; 16] {
        &self.state.iv
    }

    fn has_subsamples(&self) -> bool {
        true
    }
}

/// Pick the encrypter for `params`. Samples are split into subsamples only
/// when a mapper is given.
pub fn create_encrypter(
    key: &[u8; 16],
    iv: &[u8],
    params: &CipherParams,
    mapper: Option<Box<dyn SubSampleMapper>>,
) -> Result<Box<dyn SampleEncrypter>> {
    Ok(match (params.mode, mapper) {
        (CipherMode::Ctr, None) => Box::new(CtrSampleEncrypter::new(key, iv, params)?),
        (CipherMode::Cbc, None) => Box::new(CbcSampleEncrypter::new(key, iv, params)?),
        (CipherMode::Ctr, Some(mapper)) => {
            Box::new(CtrSubSampleEncrypter::new(key, iv, params, mapper)?)
        }
        (CipherMode::Cbc, Some(mapper)) => {
            Box::new(CbcSubSampleEncrypter::new(key, iv, params, mapper)?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cenc::mapper::{AdvancedSubSampleMapper, SubSampleMap};
    use crate::codec::VideoCodec;

    const KEY: [u8; 16] = [0x42; 16];

    fn params(mode: CipherMode, iv_size: u8) -> CipherParams {
        CipherParams::new(mode, iv_size, 0, 0, false, false).unwrap()
    }

    /// Maps every sample as fixed (clear, encrypted) pairs.
    struct FixedMapper(Vec<(usize, u32)>);

    impl SubSampleMapper for FixedMapper {
        fn map(&mut self, _: &[u8]) -> Result<SubSampleMap> {
            let mut map = SubSampleMap::new();
            for (clear, encrypted) in &self.0 {
                map.push(*clear, *encrypted);
            }
            Ok(map)
        }
    }

    fn low_counter(iv: &[u8; 16]) -> u64 {
        u64::from_be_bytes(iv[8..].try_into().unwrap())
    }

    #[test]
    fn test_ctr_iv_advance() {
        let mut iv = [0; 16];
        iv[15] = 0xF0;
        let mut encrypter = CtrSampleEncrypter::new(&KEY, &iv, &params(CipherMode::Ctr, 16))
            .unwrap();

        for (size, expected) in [(0, 0xF0), (1, 0xF1), (16, 0xF2), (17, 0xF4), (4096, 0x1F4)] {
            let sample = encrypter.encrypt_sample_data(&vec![0; size]).unwrap();
            assert_eq!(sample.data.len(), size);
            assert_eq!(low_counter(encrypter.iv()), expected);
        }
    }

    #[test]
    fn test_ctr_iv_advance_with_8_byte_iv() {
        let mut encrypter =
            CtrSampleEncrypter::new(&KEY, &[1, 2, 3, 4, 5, 6, 7, 0xFF], &params(CipherMode::Ctr, 8))
                .unwrap();

        let sample = encrypter.encrypt_sample_data(&[0; 4096]).unwrap();
        assert_eq!(sample.iv, vec![1, 2, 3, 4, 5, 6, 7, 0xFF]);
        assert_eq!(&encrypter.iv()[..8], &[1, 2, 3, 4, 5, 6, 8, 0]);
        assert_eq!(low_counter(encrypter.iv()), 0);
    }

    #[test]
    fn test_cbc_chains_from_last_block() {
        let mut encrypter =
            CbcSampleEncrypter::new(&KEY, &[9; 16], &params(CipherMode::Cbc, 16)).unwrap();

        let first = encrypter.encrypt_sample_data(&[1; 40]).unwrap();
        assert_eq!(first.iv, vec![9; 16]);
        assert_eq!(&first.data[32..], &[1; 8]);
        assert_eq!(encrypter.iv(), &first.data[16..32]);

        // nothing to chain from
        let second = encrypter.encrypt_sample_data(&[1; 15]).unwrap();
        assert_eq!(second.data, vec![1; 15]);
        assert_eq!(encrypter.iv(), &first.data[16..32]);
    }

    #[test]
    fn test_cbc1_subsamples_chain() {
        let mapper = FixedMapper(vec![(4, 32), (8, 16)]);
        let mut encrypter = CbcSubSampleEncrypter::new(
            &KEY,
            &[5; 16],
            &params(CipherMode::Cbc, 16),
            Box::new(mapper),
        )
        .unwrap();
        let sample = (0..60).map(|x| x as u8).collect::<Vec<_>>();
        let encrypted = encrypter.encrypt_sample_data(&sample).unwrap();

        // the second subsample continues the chain of the first one
        let mut cipher = StreamCipher::new(&KEY, CipherMode::Cbc, CipherDirection::Encrypt);
        cipher.set_iv(&encrypted.data[20..36]).unwrap();
        let mut expected = [0; 16];
        cipher.process(&sample[44..60], &mut expected).unwrap();
        assert_eq!(&encrypted.data[44..60], &expected);
        assert_eq!(&encrypted.data[36..44], &sample[36..44]);
        assert_eq!(encrypter.iv(), &encrypted.data[44..60]);
        assert_eq!(encrypted.info, vec![0, 2, 0, 4, 0, 0, 0, 32, 0, 8, 0, 0, 0, 16]);
    }

    #[test]
    fn test_cbcs_subsamples_reset_iv() {
        let params = CipherParams::new(CipherMode::Cbc, 0, 1, 9, true, true).unwrap();
        let mapper = FixedMapper(vec![(4, 32), (8, 32)]);
        let mut encrypter =
            CbcSubSampleEncrypter::new(&KEY, &[5; 16], &params, Box::new(mapper)).unwrap();
        let sample = [0x33; 76];
        let encrypted = encrypter.encrypt_sample_data(&sample).unwrap();

        // same IV and same plaintext give the same first block in each subsample
        assert_eq!(&encrypted.data[4..20], &encrypted.data[44..60]);
        assert_eq!(&encrypted.data[20..36], &sample[20..36]);
        assert!(encrypted.iv.is_empty());
        assert_eq!(encrypter.iv(), &[5; 16]);
    }

    #[test]
    fn test_ctr_subsamples_advance_by_encrypted_blocks() {
        let mapper = AdvancedSubSampleMapper::new(4, VideoCodec::Avc).unwrap();
        let mut encrypter = CtrSubSampleEncrypter::new(
            &KEY,
            &[0; 16],
            &params(CipherMode::Ctr, 16),
            Box::new(mapper),
        )
        .unwrap();

        let mut sample = vec![0, 0, 1, 0, 0x65];
        sample.extend([7; 255]);
        let encrypted = encrypter.encrypt_sample_data(&sample).unwrap();

        // 260 - 96 = 164 -> 160 encrypted bytes, 10 blocks
        assert_eq!(low_counter(encrypter.iv()), 10);
        assert_eq!(&encrypted.data[..100], &sample[..100]);
        assert_ne!(&encrypted.data[100..], &sample[100..]);
    }

    #[test]
    fn test_bad_iv_size() {
        assert!(matches!(
            create_encrypter(&KEY, &[0; 12], &params(CipherMode::Ctr, 16), None),
            Err(Error::InvalidParameters(_))
        ));
    }
}
