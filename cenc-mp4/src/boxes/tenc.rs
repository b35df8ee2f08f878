use super::TypedBox;
use crate::{Atom, Error, FourCc, Reader, Result, atom::full_box_payload, parse_atoms};

/// Extended type of the PIFF track encryption box.
pub const PIFF_TENC_UUID: [u8; 16] = [
    0x89, 0x74, 0xdb, 0xce, 0x7b, 0xe7, 0x4c, 0x51, 0x84, 0xf9, 0x71, 0x48, 0xf9, 0x88, 0x25, 0x54,
];

/// Track encryption box (`tenc`, or the PIFF `uuid` variant) holding the track defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TencBox {
    pub version: u8,
    /// `is_protected` flag for `tenc`, algorithm id (0 none, 1 CTR, 2 CBC) for PIFF.
    pub default_is_protected: u32,
    pub default_crypt_byte_block: u8,
    pub default_skip_byte_block: u8,
    pub default_per_sample_iv_size: u8,
    pub default_kid: [u8; 16],
    /// Present only when `default_per_sample_iv_size` is zero.
    pub default_constant_iv: Option<Vec<u8>>,
}

impl TencBox {
    /// Parse the first track encryption box found in an init segment.
    pub fn from_init(data: &[u8]) -> Result<Option<Self>> {
        for atom in parse_atoms(data)?.iter().filter(|x| x.is(b"moov")) {
            for trak in atom.children_of(b"trak") {
                let Some(stsd) = trak.find("mdia/minf/stbl/stsd") else {
                    continue;
                };

                for entry in stsd.children() {
                    let Some(schi) = entry.find("sinf/schi") else {
                        continue;
                    };

                    if let Some(tenc) = Self::from_schi(schi)? {
                        return Ok(Some(tenc));
                    }
                }
            }
        }

        Ok(None)
    }

    /// Parse the track encryption box out of a scheme information box.
    pub fn from_schi(schi: &Atom) -> Result<Option<Self>> {
        if let Some(tenc) = schi.child(&Self::KIND) {
            return Ok(Some(Self::parse(tenc)?));
        }

        schi.uuid_child(&PIFF_TENC_UUID)
            .map(Self::parse_piff)
            .transpose()
    }

    /// Parse the PIFF 1.1 track encryption box.
    pub fn parse_piff(atom: &Atom) -> Result<Self> {
        let mut reader = Reader::new(atom.payload().unwrap_or_default());
        reader.skip(4)?;

        Ok(Self {
            version: 0,
            default_is_protected: reader.read_u24()?,
            default_crypt_byte_block: 0,
            default_skip_byte_block: 0,
            default_per_sample_iv_size: reader.read_u8()?,
            default_kid: reader.read_array()?,
            default_constant_iv: None,
        })
    }

    pub fn to_piff_atom(&self) -> Atom {
        let mut payload = Vec::with_capacity(20);
        payload.extend_from_slice(&self.default_is_protected.to_be_bytes()[1..]);
        payload.push(self.default_per_sample_iv_size);
        payload.extend_from_slice(&self.default_kid);
        Atom::uuid(PIFF_TENC_UUID, full_box_payload(0, 0, &payload))
    }

    pub fn default_kid_hex(&self) -> String {
        hex::encode(self.default_kid)
    }

    pub fn has_pattern(&self) -> bool {
        self.default_crypt_byte_block != 0 || self.default_skip_byte_block != 0
    }
}

impl TypedBox for TencBox {
    const KIND: FourCc = *b"tenc";

    fn parse(atom: &Atom) -> Result<Self> {
        let (version, _) = atom.version_and_flags()?;
        let mut reader = Reader::new(atom.payload().unwrap_or_default());
        reader.skip(4)?;
        reader.skip(1)?; // reserved

        let pattern = reader.read_u8()?;
        let (default_crypt_byte_block, default_skip_byte_block) = if version >= 1 {
            (pattern >> 4, pattern & 0x0F)
        } else {
            (0, 0)
        };

        let default_is_protected = reader.read_u8()? as u32;
        let default_per_sample_iv_size = reader.read_u8()?;
        let default_kid = reader.read_array()?;

        let default_constant_iv = if default_is_protected == 1 && default_per_sample_iv_size == 0
        {
            let size = reader.read_u8()?;

            if size != 8 && size != 16 {
                return Err(Error::invalid_format(format!(
                    "tenc box has a constant IV of {} bytes",
                    size
                )));
            }

            Some(reader.read_bytes_u8(size as usize)?)
        } else {
            None
        };

        Ok(Self {
            version,
            default_is_protected,
            default_crypt_byte_block,
            default_skip_byte_block,
            default_per_sample_iv_size,
            default_kid,
            default_constant_iv,
        })
    }

    fn to_atom(&self) -> Atom {
        let mut payload = Vec::with_capacity(37);
        payload.push(0);
        payload.push(if self.version >= 1 {
            (self.default_crypt_byte_block << 4) | (self.default_skip_byte_block & 0x0F)
        } else {
            0
        });
        payload.push(self.default_is_protected as u8);
        payload.push(self.default_per_sample_iv_size);
        payload.extend_from_slice(&self.default_kid);

        if self.default_per_sample_iv_size == 0
            && let Some(iv) = &self.default_constant_iv
        {
            payload.push(iv.len() as u8);
            payload.extend_from_slice(iv);
        }

        Atom::leaf(&Self::KIND, full_box_payload(self.version, 0, &payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenc_with_constant_iv() {
        let tenc = TencBox {
            version: 1,
            default_is_protected: 1,
            default_crypt_byte_block: 1,
            default_skip_byte_block: 9,
            default_per_sample_iv_size: 0,
            default_kid: [0xAB; 16],
            default_constant_iv: Some(vec![7; 16]),
        };

        let atom = tenc.to_atom();
        assert_eq!(atom.size(), 12 + 4 + 16 + 1 + 16);
        assert_eq!(atom.payload().unwrap()[5], 0x19);
        assert_eq!(TencBox::parse(&atom).unwrap(), tenc);
    }

    #[test]
    fn test_piff_tenc() {
        let mut payload = vec![0, 0, 0, 0, 0, 0, 1, 8];
        payload.extend_from_slice(&[0x11; 16]);
        let atom = Atom::uuid(PIFF_TENC_UUID, payload);

        let tenc = TencBox::parse_piff(&atom).unwrap();
        assert_eq!(tenc.default_is_protected, 1);
        assert_eq!(tenc.default_per_sample_iv_size, 8);
        assert_eq!(tenc.default_kid_hex(), "11".repeat(16));
        assert_eq!(tenc.to_piff_atom(), atom);
    }

    #[test]
    fn test_bad_constant_iv_size() {
        let mut payload = vec![0, 0, 1, 0];
        payload.extend_from_slice(&[0; 16]);
        payload.push(3);
        payload.extend_from_slice(&[0; 3]);
        let atom = Atom::full(b"tenc", 0, 0, &payload);
        assert!(TencBox::parse(&atom).unwrap_err().is_invalid_format());
    }
}
