use super::TypedBox;
use crate::{Atom, Error, FourCc, Reader, Result};

/// Track header box. Only the track id is decoded, the rest is carried as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TkhdBox {
    pub track_id: u32,
    raw: Vec<u8>,
}

impl TypedBox for TkhdBox {
    const KIND: FourCc = *b"tkhd";

    fn parse(atom: &Atom) -> Result<Self> {
        let raw = atom.payload().unwrap_or_default();
        let mut reader = Reader::new(raw);
        let version = reader.read_u8()?;
        reader.skip(3)?;

        match version {
            0 => reader.skip(8)?,
            1 => reader.skip(16)?,
            x => {
                return Err(Error::invalid_format(format!(
                    "tkhd box version {} is unknown",
                    x
                )));
            }
        }

        Ok(Self {
            track_id: reader.read_u32()?,
            raw: raw.to_vec(),
        })
    }

    fn to_atom(&self) -> Atom {
        Atom::leaf(&Self::KIND, self.raw.clone())
    }
}
