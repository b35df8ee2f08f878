use super::TypedBox;
use crate::{Atom, FourCc, Reader, Result, atom::full_box_payload};

/// Track extends box, the per track fragment defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrexBox {
    pub track_id: u32,
    pub default_sample_description_index: u32,
    pub default_sample_duration: u32,
    pub default_sample_size: u32,
    pub default_sample_flags: u32,
}

impl TypedBox for TrexBox {
    const KIND: FourCc = *b"trex";

    fn parse(atom: &Atom) -> Result<Self> {
        let mut reader = Reader::new(atom.payload().unwrap_or_default());
        reader.skip(4)?;
        Ok(Self {
            track_id: reader.read_u32()?,
            default_sample_description_index: reader.read_u32()?,
            default_sample_duration: reader.read_u32()?,
            default_sample_size: reader.read_u32()?,
            default_sample_flags: reader.read_u32()?,
        })
    }

    fn to_atom(&self) -> Atom {
        let mut payload = Vec::with_capacity(20);

        for value in [
            self.track_id,
            self.default_sample_description_index,
            self.default_sample_duration,
            self.default_sample_size,
            self.default_sample_flags,
        ] {
            payload.extend_from_slice(&value.to_be_bytes());
        }

        Atom::leaf(&Self::KIND, full_box_payload(0, 0, &payload))
    }
}
