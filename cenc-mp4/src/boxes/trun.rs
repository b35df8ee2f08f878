use super::TypedBox;
use crate::{Atom, FourCc, Reader, Result, atom::full_box_payload};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrunSample {
    /// The length of the sample in timescale units.
    pub sample_duration: Option<u32>,
    /// The size of the sample in bytes.
    pub sample_size: Option<u32>,
    pub sample_flags: Option<u32>,
    /// The time since the start of the sample in timescale units. Time
    /// offset is based of the start of the sample. If this value is
    /// missing, the accumulated durations preceeding this time sample will
    /// be used to create the start time.
    pub sample_composition_time_offset: Option<i32>,
}

/// Track fragment run box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrunBox {
    pub version: u8,
    pub flags: u32,
    /// If specified via flags, this indicate the offset of the first sample
    /// relative to the base data offset.
    pub data_offset: Option<i32>,
    pub first_sample_flags: Option<u32>,
    /// One entry per sample of the run.
    pub samples: Vec<TrunSample>,
}

impl TrunBox {
    pub const FLAG_DATA_OFFSET_PRESENT: u32 = 0x000001;
    pub const FLAG_FIRST_SAMPLE_FLAGS_PRESENT: u32 = 0x000004;
    pub const FLAG_SAMPLE_DURATION_PRESENT: u32 = 0x000100;
    pub const FLAG_SAMPLE_SIZE_PRESENT: u32 = 0x000200;
    pub const FLAG_SAMPLE_FLAGS_PRESENT: u32 = 0x000400;
    pub const FLAG_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT: u32 = 0x000800;

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

impl TypedBox for TrunBox {
    const KIND: FourCc = *b"trun";

    fn parse(atom: &Atom) -> Result<Self> {
        let (version, flags) = atom.version_and_flags()?;
        let mut reader = Reader::new(atom.payload().unwrap_or_default());
        reader.skip(4)?;

        let sample_count = reader.read_u32()?;

        // "data_offset"
        let data_offset = if (flags & Self::FLAG_DATA_OFFSET_PRESENT) != 0 {
            Some(reader.read_i32()?)
        } else {
            None
        };

        let first_sample_flags = if (flags & Self::FLAG_FIRST_SAMPLE_FLAGS_PRESENT) != 0 {
            Some(reader.read_u32()?)
        } else {
            None
        };

        let mut samples = Vec::with_capacity(sample_count.min(65536) as usize);

        for _ in 0..sample_count {
            let mut sample = TrunSample::default();

            // Read "sample duration" if present.
            if (flags & Self::FLAG_SAMPLE_DURATION_PRESENT) != 0 {
                sample.sample_duration = Some(reader.read_u32()?);
            }

            // Read "sample_size" if present.
            if (flags & Self::FLAG_SAMPLE_SIZE_PRESENT) != 0 {
                sample.sample_size = Some(reader.read_u32()?);
            }

            if (flags & Self::FLAG_SAMPLE_FLAGS_PRESENT) != 0 {
                sample.sample_flags = Some(reader.read_u32()?);
            }

            // Read "sample_time_offset" if present.
            if (flags & Self::FLAG_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT) != 0 {
                sample.sample_composition_time_offset = Some(reader.read_i32()?);
            }

            samples.push(sample);
        }

        Ok(Self {
            version,
            flags,
            data_offset,
            first_sample_flags,
            samples,
        })
    }

    fn to_atom(&self) -> Atom {
        let mut payload = Vec::with_capacity(12 + self.samples.len() * 16);
        payload.extend_from_slice(&(self.samples.len() as u32).to_be_bytes());

        if let Some(data_offset) = self.data_offset {
            payload.extend_from_slice(&data_offset.to_be_bytes());
        }

        if let Some(first_sample_flags) = self.first_sample_flags {
            payload.extend_from_slice(&first_sample_flags.to_be_bytes());
        }

        for sample in &self.samples {
            for (flag, value) in [
                (Self::FLAG_SAMPLE_DURATION_PRESENT, sample.sample_duration),
                (Self::FLAG_SAMPLE_SIZE_PRESENT, sample.sample_size),
                (Self::FLAG_SAMPLE_FLAGS_PRESENT, sample.sample_flags),
                (
                    Self::FLAG_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT,
                    sample.sample_composition_time_offset.map(|x| x as u32),
                ),
            ] {
                if self.flags & flag != 0 {
                    payload.extend_from_slice(&value.unwrap_or_default().to_be_bytes());
                }
            }
        }

        let mut flags = self.flags
            & !(Self::FLAG_DATA_OFFSET_PRESENT | Self::FLAG_FIRST_SAMPLE_FLAGS_PRESENT);

        if self.data_offset.is_some() {
            flags |= Self::FLAG_DATA_OFFSET_PRESENT;
        }

        if self.first_sample_flags.is_some() {
            flags |= Self::FLAG_FIRST_SAMPLE_FLAGS_PRESENT;
        }

        Atom::leaf(&Self::KIND, full_box_payload(self.version, flags, &payload))
    }
}
