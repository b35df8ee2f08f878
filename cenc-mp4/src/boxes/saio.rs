use super::TypedBox;
use crate::{Atom, FourCc, Reader, Result, atom::full_box_payload};

/// Sample auxiliary information offsets box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaioBox {
    pub version: u8,
    /// `aux_info_type` and `aux_info_type_parameter`, present when flags & 0x1.
    pub aux_info_type: Option<(FourCc, u32)>,
    pub offsets: Vec<u64>,
}

impl SaioBox {
    pub fn new(offset: u64) -> Self {
        Self {
            version: if offset > u32::MAX as u64 { 1 } else { 0 },
            aux_info_type: None,
            offsets: vec![offset],
        }
    }
}

impl TypedBox for SaioBox {
    const KIND: FourCc = *b"saio";

    fn parse(atom: &Atom) -> Result<Self> {
        let (version, flags) = atom.version_and_flags()?;
        let mut reader = Reader::new(atom.payload().unwrap_or_default());
        reader.skip(4)?;

        let aux_info_type = if flags & 0x000001 != 0 {
            Some((reader.read_array()?, reader.read_u32()?))
        } else {
            None
        };

        let entry_count = reader.read_u32()?;
        let mut offsets = Vec::with_capacity(entry_count.min(1024) as usize);

        for _ in 0..entry_count {
            offsets.push(if version == 0 {
                reader.read_u32()? as u64
            } else {
                reader.read_u64()?
            });
        }

        Ok(Self {
            version,
            aux_info_type,
            offsets,
        })
    }

    fn to_atom(&self) -> Atom {
        let mut payload = Vec::new();

        if let Some((kind, parameter)) = &self.aux_info_type {
            payload.extend_from_slice(kind);
            payload.extend_from_slice(&parameter.to_be_bytes());
        }

        payload.extend_from_slice(&(self.offsets.len() as u32).to_be_bytes());

        for offset in &self.offsets {
            if self.version == 0 {
                payload.extend_from_slice(&(*offset as u32).to_be_bytes());
            } else {
                payload.extend_from_slice(&offset.to_be_bytes());
            }
        }

        let flags = self.aux_info_type.map_or(0, |_| 1);
        Atom::leaf(&Self::KIND, full_box_payload(self.version, flags, &payload))
    }
}
