use super::TypedBox;
use crate::{Atom, Error, FourCc, Reader, Result, atom::full_box_payload};

/// Sample auxiliary information sizes box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaizBox {
    pub aux_info_type: Option<(FourCc, u32)>,
    /// Size shared by every sample, zero when sizes are listed per sample.
    pub default_sample_info_size: u8,
    pub sample_count: u32,
    pub sample_info_sizes: Vec<u8>,
}

impl SaizBox {
    pub fn new() -> Self {
        Self {
            aux_info_type: None,
            default_sample_info_size: 0,
            sample_count: 0,
            sample_info_sizes: Vec::new(),
        }
    }

    /// Record the size of one more sample. A single shared size is kept for
    /// as long as every sample has the same one.
    pub fn add_sample_info_size(&mut self, size: u8) {
        if self.sample_count == 0 {
            self.default_sample_info_size = size;
        } else if self.default_sample_info_size != 0 && self.default_sample_info_size != size {
            self.sample_info_sizes =
                vec![self.default_sample_info_size; self.sample_count as usize];
            self.default_sample_info_size = 0;
        }

        if self.default_sample_info_size == 0 {
            self.sample_info_sizes.push(size);
        }

        self.sample_count += 1;
    }

    pub fn sample_info_size(&self, index: usize) -> Result<u8> {
        if index >= self.sample_count as usize {
            return Err(Error::invalid_format(format!(
                "saiz box has no size for sample {}",
                index
            )));
        }

        if self.default_sample_info_size != 0 {
            return Ok(self.default_sample_info_size);
        }

        self.sample_info_sizes.get(index).copied().ok_or_else(|| {
            Error::invalid_format(format!("saiz box has no size for sample {}", index))
        })
    }
}

impl Default for SaizBox {
    fn default() -> Self {
        Self::new()
    }
}

impl TypedBox for SaizBox {
    const KIND: FourCc = *b"saiz";

    fn parse(atom: &Atom) -> Result<Self> {
        let (_, flags) = atom.version_and_flags()?;
        let mut reader = Reader::new(atom.payload().unwrap_or_default());
        reader.skip(4)?;

        let aux_info_type = if flags & 0x000001 != 0 {
            Some((reader.read_array()?, reader.read_u32()?))
        } else {
            None
        };

        let default_sample_info_size = reader.read_u8()?;
        let sample_count = reader.read_u32()?;
        let sample_info_sizes = if default_sample_info_size == 0 {
            reader.read_bytes_u8(sample_count as usize)?
        } else {
            Vec::new()
        };

        Ok(Self {
            aux_info_type,
            default_sample_info_size,
            sample_count,
            sample_info_sizes,
        })
    }

    fn to_atom(&self) -> Atom {
        let mut payload = Vec::with_capacity(13 + self.sample_info_sizes.len());

        if let Some((kind, parameter)) = &self.aux_info_type {
            payload.extend_from_slice(kind);
            payload.extend_from_slice(&parameter.to_be_bytes());
        }

        payload.push(self.default_sample_info_size);
        payload.extend_from_slice(&self.sample_count.to_be_bytes());

        if self.default_sample_info_size == 0 {
            payload.extend_from_slice(&self.sample_info_sizes);
        }

        let flags = self.aux_info_type.map_or(0, |_| 1);
        Atom::leaf(&Self::KIND, full_box_payload(0, flags, &payload))
    }
}
