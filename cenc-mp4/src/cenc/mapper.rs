//! Decide which bytes of a video sample stay in the clear.
//!
//! Every mapper walks the length prefixed NAL units of a sample and produces a
//! [`SubSampleMap`] whose entries add up to the sample size. The length
//! prefixes and NAL unit headers are never encrypted.

use super::{cipher::BLOCK_SIZE, variant::CencVariant};
use crate::{
    Error, Result,
    codec::{CodecParser, NaluIter, NaluKind, VideoCodec, check_nalu_length_size},
};
use log::trace;

/// NAL units smaller than this are left in the clear by the advanced mapper.
const ADVANCED_MIN_NALU_SIZE: usize = 112;
/// Bytes left in the clear at the front of a NAL unit by the advanced mapper,
/// before rounding the encrypted part down to whole blocks.
const ADVANCED_CLEAR_LEAD: usize = 96;

/// Clear and encrypted byte counts of the subsamples of one sample.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubSampleMap {
    pub bytes_of_cleartext_data: Vec<u16>,
    pub bytes_of_encrypted_data: Vec<u32>,
}

impl SubSampleMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a subsample. Clear runs which do not fit in 16 bits are split into
    /// extra entries without encrypted bytes.
    pub fn push(&mut self, mut cleartext_size: usize, encrypted_size: u32) {
        while cleartext_size > u16::MAX as usize {
            self.bytes_of_cleartext_data.push(u16::MAX);
            self.bytes_of_encrypted_data.push(0);
            cleartext_size -= u16::MAX as usize;
        }

        self.bytes_of_cleartext_data.push(cleartext_size as u16);
        self.bytes_of_encrypted_data.push(encrypted_size);
    }

    pub fn len(&self) -> usize {
        self.bytes_of_cleartext_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes_of_cleartext_data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.bytes_of_cleartext_data
            .iter()
            .zip(&self.bytes_of_encrypted_data)
            .map(|(x, y)| (*x as usize, *y as usize))
    }

    /// Number of bytes covered by all the subsamples.
    pub fn total_size(&self) -> usize {
        self.iter().map(|(x, y)| x + y).sum()
    }

    pub fn encrypted_size(&self) -> usize {
        self.iter().map(|(_, y)| y).sum()
    }

    /// Serialize as `u16 subsample_count` followed by `u16 clear, u32 encrypted`
    /// pairs, the layout of a `senc` subsample record.
    pub fn to_info(&self) -> Result<Vec<u8>> {
        let count = u16::try_from(self.len()).map_err(|_| {
            Error::not_supported(format!(
                "{} subsamples do not fit in a senc record",
                self.len()
            ))
        })?;
        let mut info = Vec::with_capacity(2 + self.len() * 6);
        info.extend_from_slice(&count.to_be_bytes());

        for (clear, encrypted) in self
            .bytes_of_cleartext_data
            .iter()
            .zip(&self.bytes_of_encrypted_data)
        {
            info.extend_from_slice(&clear.to_be_bytes());
            info.extend_from_slice(&encrypted.to_be_bytes());
        }

        Ok(info)
    }
}

/// Splits video samples into clear and encrypted subsamples.
pub trait SubSampleMapper: Send {
    fn map(&mut self, sample: &[u8]) -> Result<SubSampleMap>;
}

/// Encrypts whole blocks of every NAL unit, keeping at least the length
/// prefix and the first NAL unit byte in the clear. Used by the PIFF variants.
pub struct BasicSubSampleMapper {
    nalu_length_size: usize,
}

impl BasicSubSampleMapper {
    pub fn new(nalu_length_size: usize) -> Result<Self> {
        check_nalu_length_size(nalu_length_size)?;
        Ok(Self { nalu_length_size })
    }
}

impl SubSampleMapper for BasicSubSampleMapper {
    fn map(&mut self, sample: &[u8]) -> Result<SubSampleMap> {
        let mut map = SubSampleMap::new();
        let mut nalus = NaluIter::new(sample, self.nalu_length_size)?;

        for nalu in nalus.by_ref() {
            let chunk_size = self.nalu_length_size + nalu?.data.len();
            let mut block_count = chunk_size / BLOCK_SIZE;
            let mut cleartext_size = chunk_size % BLOCK_SIZE;

            if cleartext_size < self.nalu_length_size + 1 {
                if block_count == 0 {
                    cleartext_size = chunk_size;
                } else {
                    block_count -= 1;
                    cleartext_size += BLOCK_SIZE;
                }
            }

            map.push(cleartext_size, (block_count * BLOCK_SIZE) as u32);
        }

        let trailing = sample.len() - nalus.position();
        if trailing > 0 {
            map.push(trailing, 0);
        }

        Ok(map)
    }
}

/// Leaves non VCL and small NAL units in the clear and encrypts the whole
/// blocks of the rest after a clear lead. Clear bytes are folded into the next
/// encrypted subsample. Used by `cenc`, `cbc1` and `cens`.
pub struct AdvancedSubSampleMapper {
    nalu_length_size: usize,
    codec: VideoCodec,
}

impl AdvancedSubSampleMapper {
    pub fn new(nalu_length_size: usize, codec: VideoCodec) -> Result<Self> {
        check_nalu_length_size(nalu_length_size)?;
        Ok(Self {
            nalu_length_size,
            codec,
        })
    }
}

impl SubSampleMapper for AdvancedSubSampleMapper {
    fn map(&mut self, sample: &[u8]) -> Result<SubSampleMap> {
        let mut map = SubSampleMap::new();
        let mut nalus = NaluIter::new(sample, self.nalu_length_size)?;
        let mut pending_clear = 0;

        for nalu in nalus.by_ref() {
            let nalu = nalu?;
            let chunk_size = self.nalu_length_size + nalu.data.len();
            let is_vcl = nalu
                .data
                .first()
                .is_some_and(|x| self.codec.is_vcl(self.codec.nalu_type(*x)));

            if !is_vcl || chunk_size < ADVANCED_MIN_NALU_SIZE {
                pending_clear += chunk_size;
                continue;
            }

            let encrypted_size = (chunk_size - ADVANCED_CLEAR_LEAD) / BLOCK_SIZE * BLOCK_SIZE;
            map.push(
                pending_clear + chunk_size - encrypted_size,
                encrypted_size as u32,
            );
            pending_clear = 0;
        }

        pending_clear += sample.len() - nalus.position();
        if pending_clear > 0 {
            map.push(pending_clear, 0);
        }

        Ok(map)
    }
}

/// Keeps exactly the slice headers of coded slices in the clear and encrypts
/// the slice data that follows. Used by `cbcs`.
pub struct CbcsSubSampleMapper {
    nalu_length_size: usize,
    parser: Box<dyn CodecParser>,
}

impl CbcsSubSampleMapper {
    /// `parameter_sets` are the NAL units of the decoder configuration record.
    pub fn new(
        nalu_length_size: usize,
        codec: VideoCodec,
        parameter_sets: &[Vec<u8>],
    ) -> Result<Self> {
        check_nalu_length_size(nalu_length_size)?;
        let mut parser = codec.parser();

        for nalu in parameter_sets {
            parser.feed(nalu)?;
        }

        Ok(Self {
            nalu_length_size,
            parser,
        })
    }
}

impl SubSampleMapper for CbcsSubSampleMapper {
    fn map(&mut self, sample: &[u8]) -> Result<SubSampleMap> {
        let mut map = SubSampleMap::new();
        let mut nalus = NaluIter::new(sample, self.nalu_length_size)?;
        let mut pending_clear = 0;
        let nalu_header_size = self.parser.codec().nalu_header_size();

        for nalu in nalus.by_ref() {
            let nalu = nalu?;
            let chunk_size = self.nalu_length_size + nalu.data.len();

            if self.parser.feed(nalu.data)? != NaluKind::Slice {
                pending_clear += chunk_size;
                continue;
            }

            let header_size = nalu_header_size + self.parser.slice_header_size(nalu.data)?;

            if header_size > nalu.data.len() {
                return Err(Error::invalid_format(format!(
                    "slice header of {} bytes exceeds its {} byte NAL unit",
                    header_size,
                    nalu.data.len()
                )));
            }

            let encrypted_size = nalu.data.len() - header_size;

            if encrypted_size == 0 {
                pending_clear += chunk_size;
                continue;
            }

            map.push(
                pending_clear + self.nalu_length_size + header_size,
                encrypted_size as u32,
            );
            pending_clear = 0;
        }

        pending_clear += sample.len() - nalus.position();
        if pending_clear > 0 {
            map.push(pending_clear, 0);
        }

        Ok(map)
    }
}

/// Pick the mapper used by `variant` for a video track.
pub fn create_mapper(
    variant: CencVariant,
    nalu_length_size: usize,
    codec: VideoCodec,
    parameter_sets: &[Vec<u8>],
) -> Result<Box<dyn SubSampleMapper>> {
    trace!(
        "{} subsample mapper for {:?} with {} byte NAL unit lengths",
        variant, codec, nalu_length_size
    );

    Ok(match variant {
        CencVariant::PiffCtr | CencVariant::PiffCbc => {
            Box::new(BasicSubSampleMapper::new(nalu_length_size)?)
        }
        CencVariant::MpegCenc | CencVariant::MpegCbc1 | CencVariant::MpegCens => {
            Box::new(AdvancedSubSampleMapper::new(nalu_length_size, codec)?)
        }
        CencVariant::MpegCbcs => Box::new(CbcsSubSampleMapper::new(
            nalu_length_size,
            codec,
            parameter_sets,
        )?),
    })
}
