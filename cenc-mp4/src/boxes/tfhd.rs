use super::TypedBox;
use crate::{Atom, FourCc, Reader, Result, atom::full_box_payload};

/// Track fragment header box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TfhdBox {
    pub flags: u32,
    /// Identifies the track over the whole presentation.
    pub track_id: u32,
    /// If specified via flags, this indicate the base data offset
    pub base_data_offset: Option<u64>,
    /// If specified via flags, this overrides the default sample
    /// description index in the Track Extends Box for this fragment
    pub sample_description_index: Option<u32>,
    /// If specified via flags, this overrides the default sample
    /// duration in the Track Extends Box for this fragment
    pub default_sample_duration: Option<u32>,
    /// If specified via flags, this overrides the default sample
    /// size in the Track Extends Box for this fragment
    pub default_sample_size: Option<u32>,
    pub default_sample_flags: Option<u32>,
}

impl TfhdBox {
    pub const FLAG_BASE_DATA_OFFSET_PRESENT: u32 = 0x000001;
    pub const FLAG_SAMPLE_DESCRIPTION_INDEX_PRESENT: u32 = 0x000002;
    pub const FLAG_DEFAULT_SAMPLE_DURATION_PRESENT: u32 = 0x000008;
    pub const FLAG_DEFAULT_SAMPLE_SIZE_PRESENT: u32 = 0x000010;
    pub const FLAG_DEFAULT_SAMPLE_FLAGS_PRESENT: u32 = 0x000020;
    pub const FLAG_DURATION_IS_EMPTY: u32 = 0x010000;
    pub const FLAG_DEFAULT_BASE_IS_MOOF: u32 = 0x020000;

    pub fn set_sample_description_index(&mut self, index: u32) {
        self.flags |= Self::FLAG_SAMPLE_DESCRIPTION_INDEX_PRESENT;
        self.sample_description_index = Some(index);
    }

    pub fn default_base_is_moof(&self) -> bool {
        self.flags & Self::FLAG_DEFAULT_BASE_IS_MOOF != 0
    }
}

impl TypedBox for TfhdBox {
    const KIND: FourCc = *b"tfhd";

    fn parse(atom: &Atom) -> Result<Self> {
        let (_, flags) = atom.version_and_flags()?;
        let mut reader = Reader::new(atom.payload().unwrap_or_default());
        reader.skip(4)?;

        let track_id = reader.read_u32()?;

        // Read "base_data_offset" if present.
        let base_data_offset = if flags & Self::FLAG_BASE_DATA_OFFSET_PRESENT != 0 {
            Some(reader.read_u64()?)
        } else {
            None
        };

        let mut read_if = |flag: u32| -> Result<Option<u32>> {
            if flags & flag != 0 {
                Ok(Some(reader.read_u32()?))
            } else {
                Ok(None)
            }
        };

        Ok(Self {
            flags,
            track_id,
            base_data_offset,
            sample_description_index: read_if(Self::FLAG_SAMPLE_DESCRIPTION_INDEX_PRESENT)?,
            default_sample_duration: read_if(Self::FLAG_DEFAULT_SAMPLE_DURATION_PRESENT)?,
            default_sample_size: read_if(Self::FLAG_DEFAULT_SAMPLE_SIZE_PRESENT)?,
            default_sample_flags: read_if(Self::FLAG_DEFAULT_SAMPLE_FLAGS_PRESENT)?,
        })
    }

    fn to_atom(&self) -> Atom {
        let mut flags = self.flags
            & !(Self::FLAG_BASE_DATA_OFFSET_PRESENT
                | Self::FLAG_SAMPLE_DESCRIPTION_INDEX_PRESENT
                | Self::FLAG_DEFAULT_SAMPLE_DURATION_PRESENT
                | Self::FLAG_DEFAULT_SAMPLE_SIZE_PRESENT
                | Self::FLAG_DEFAULT_SAMPLE_FLAGS_PRESENT);
        let mut payload = Vec::with_capacity(32);
        payload.extend_from_slice(&self.track_id.to_be_bytes());

        if let Some(offset) = self.base_data_offset {
            flags |= Self::FLAG_BASE_DATA_OFFSET_PRESENT;
            payload.extend_from_slice(&offset.to_be_bytes());
        }

        for (flag, value) in [
            (
                Self::FLAG_SAMPLE_DESCRIPTION_INDEX_PRESENT,
                self.sample_description_index,
            ),
            (
                Self::FLAG_DEFAULT_SAMPLE_DURATION_PRESENT,
                self.default_sample_duration,
            ),
            (
                Self::FLAG_DEFAULT_SAMPLE_SIZE_PRESENT,
                self.default_sample_size,
            ),
            (
                Self::FLAG_DEFAULT_SAMPLE_FLAGS_PRESENT,
                self.default_sample_flags,
            ),
        ] {
            if let Some(value) = value {
                flags |= flag;
                payload.extend_from_slice(&value.to_be_bytes());
            }
        }

        Atom::leaf(&Self::KIND, full_box_payload(0, flags, &payload))
    }
}
