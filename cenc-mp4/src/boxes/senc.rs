use super::TypedBox;
use crate::{Atom, Error, FourCc, Reader, Result, atom::full_box_payload};

/// Extended type of the PIFF sample encryption box.
pub const PIFF_SENC_UUID: [u8; 16] = [
    0xa2, 0x39, 0x4f, 0x52, 0x5a, 0x9b, 0x4f, 0x14, 0xa2, 0x44, 0x6c, 0x42, 0x7c, 0x64, 0x8d, 0xf4,
];

/// A subsample entry from the senc box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SencSubsample {
    /// Number of clear (unencrypted) bytes.
    pub bytes_of_clear_data: u16,
    /// Number of encrypted bytes.
    pub bytes_of_encrypted_data: u32,
}

/// Sample encryption information for a single sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SencSample {
    /// The initialization vector for this sample.
    pub iv: Vec<u8>,
    /// Subsample encryption entries (if present).
    pub subsamples: Vec<SencSubsample>,
}

/// Sample Encryption Box (senc) - contains per-sample encryption info.
///
/// The per sample records can only be decoded once the IV size is known, which
/// comes from the track encryption box unless the box overrides it. So the
/// records are kept as raw bytes and decoded on demand with [`SencBox::samples`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SencBox {
    pub version: u8,
    /// Flags from the full box header.
    pub flags: u32,
    /// Algorithm id, IV size and KID overriding the track defaults (flags & 0x1).
    pub override_params: Option<(u32, u8, [u8; 16])>,
    pub sample_count: u32,
    /// Concatenated per-sample records.
    pub sample_info_data: Vec<u8>,
}

impl SencBox {
    pub const FLAG_OVERRIDE_TRACK_PARAMS: u32 = 0x000001;
    pub const FLAG_USE_SUBSAMPLE_ENCRYPTION: u32 = 0x000002;

    pub fn new(has_subsamples: bool) -> Self {
        Self {
            version: 0,
            flags: if has_subsamples {
                Self::FLAG_USE_SUBSAMPLE_ENCRYPTION
            } else {
                0
            },
            override_params: None,
            sample_count: 0,
            sample_info_data: Vec::new(),
        }
    }

    /// Parse the PIFF 1.1 sample encryption box, which has the same layout.
    pub fn parse_piff(atom: &Atom) -> Result<Self> {
        Self::parse_payload(atom.payload().unwrap_or_default())
    }

    fn parse_payload(payload: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(payload);
        let version_and_flags = reader.read_u32()?;
        let version = (version_and_flags >> 24) as u8;
        let flags = version_and_flags & 0xFFFFFF;

        let override_params = if flags & Self::FLAG_OVERRIDE_TRACK_PARAMS != 0 {
            Some((reader.read_u24()?, reader.read_u8()?, reader.read_array()?))
        } else {
            None
        };

        Ok(Self {
            version,
            flags,
            override_params,
            sample_count: reader.read_u32()?,
            sample_info_data: reader.read_rest().to_vec(),
        })
    }

    /// Check if this senc box has subsample encryption info.
    pub fn has_subsamples(&self) -> bool {
        self.flags & Self::FLAG_USE_SUBSAMPLE_ENCRYPTION != 0
    }

    /// IV size to use for the records, the override wins over `default_iv_size`.
    pub fn iv_size(&self, default_iv_size: u8) -> u8 {
        self.override_params.map_or(default_iv_size, |(_, x, _)| x)
    }

    /// Append one sample record. `info` is the subsample blob produced by a subsample
    /// encrypter and is empty for full sample encryption.
    pub fn add_sample_info(&mut self, iv: &[u8], info: &[u8]) {
        self.sample_info_data.extend_from_slice(iv);
        self.sample_info_data.extend_from_slice(info);
        self.sample_count += 1;
    }

    /// Decode the per sample records.
    ///
    /// Fails with [`Error::InvalidFormat`] unless the records exactly fill the box.
    pub fn samples(&self, iv_size: u8) -> Result<Vec<SencSample>> {
        let mut reader = Reader::new(&self.sample_info_data);
        let mut samples = Vec::with_capacity(self.sample_count.min(65536) as usize);

        for _ in 0..self.sample_count {
            let iv = reader.read_bytes_u8(iv_size as usize)?;

            let subsamples = if self.has_subsamples() {
                let subsample_count = reader.read_u16()?;
                let mut subsamples = Vec::with_capacity(subsample_count as usize);

                for _ in 0..subsample_count {
                    subsamples.push(SencSubsample {
                        bytes_of_clear_data: reader.read_u16()?,
                        bytes_of_encrypted_data: reader.read_u32()?,
                    });
                }

                subsamples
            } else {
                Vec::new()
            };

            samples.push(SencSample { iv, subsamples });
        }

        if reader.has_more_data() {
            return Err(Error::invalid_format(format!(
                "senc box has {} bytes left after {} samples with {} byte IVs",
                reader.remaining(),
                self.sample_count,
                iv_size
            )));
        }

        Ok(samples)
    }

    fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(24 + self.sample_info_data.len());

        if let Some((algorithm_id, iv_size, kid)) = &self.override_params {
            payload.extend_from_slice(&algorithm_id.to_be_bytes()[1..]);
            payload.push(*iv_size);
            payload.extend_from_slice(kid);
        }

        payload.extend_from_slice(&self.sample_count.to_be_bytes());
        payload.extend_from_slice(&self.sample_info_data);
        full_box_payload(self.version, self.flags, &payload)
    }

    pub fn to_piff_atom(&self) -> Atom {
        Atom::uuid(PIFF_SENC_UUID, self.payload())
    }

    /// Offset of the first per sample record from the start of the box.
    pub fn sample_info_offset(atom: &Atom) -> Result<u64> {
        let (_, flags) = atom.version_and_flags()?;
        let overrides = if flags & Self::FLAG_OVERRIDE_TRACK_PARAMS != 0 {
            20
        } else {
            0
        };
        Ok(atom.header_size() + 4 + overrides + 4)
    }
}

impl TypedBox for SencBox {
    const KIND: FourCc = *b"senc";

    fn parse(atom: &Atom) -> Result<Self> {
        Self::parse_payload(atom.payload().unwrap_or_default())
    }

    fn to_atom(&self) -> Atom {
        Atom::leaf(&Self::KIND, self.payload())
    }
}
