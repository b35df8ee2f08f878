//! Just enough of the AVC and HEVC bitstream syntax to find where each coded
//! slice payload starts.
//!
//! Samples are expected in the length prefixed form used inside mp4 files, with
//! the prefix size taken from the `avcC` or `hvcC` decoder configuration record.

mod avc;
mod bits;
mod hevc;

pub use avc::{AvcDecoderConfig, AvcParser};
pub use bits::BitReader;
pub use hevc::{HevcDecoderConfig, HevcParser};

use crate::{Error, FourCc, Result};

/// Coding format of a video track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    Avc,
    Hevc,
}

impl VideoCodec {
    /// Codec of a (clear) sample entry type.
    pub fn from_format(format: &FourCc) -> Option<Self> {
        match format {
            b"avc1" | b"avc2" | b"avc3" | b"avc4" | b"dva1" | b"dvav" => Some(Self::Avc),
            b"hvc1" | b"hev1" | b"dvh1" | b"dvhe" => Some(Self::Hevc),
            _ => None,
        }
    }

    /// Size of the NAL unit header in bytes.
    pub fn nalu_header_size(&self) -> usize {
        match self {
            Self::Avc => 1,
            Self::Hevc => 2,
        }
    }

    /// NAL unit type from the first header byte.
    pub fn nalu_type(&self, header: u8) -> u8 {
        match self {
            Self::Avc => header & 0x1F,
            Self::Hevc => (header >> 1) & 0x3F,
        }
    }

    /// Whether the NAL unit type belongs to the video coding layer.
    pub fn is_vcl(&self, nalu_type: u8) -> bool {
        match self {
            Self::Avc => (1..=5).contains(&nalu_type),
            Self::Hevc => nalu_type < 32,
        }
    }

    /// A parser which tracks this codec's parameter sets.
    pub fn parser(&self) -> Box<dyn CodecParser> {
        match self {
            Self::Avc => Box::new(AvcParser::new()),
            Self::Hevc => Box::new(HevcParser::new()),
        }
    }
}

/// What [`CodecParser::feed`] found in a NAL unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluKind {
    ParameterSet,
    Slice,
    Other,
}

/// Tracks parameter sets so that slice header lengths can be computed.
pub trait CodecParser: Send {
    /// Inspect one NAL unit (without its length prefix), ingesting it when it
    /// is a parameter set.
    fn feed(&mut self, nalu: &[u8]) -> Result<NaluKind>;

    /// Number of bytes of the NAL unit, after its NAL unit header, which hold the
    /// slice (segment) header. Emulation prevention bytes are counted.
    fn slice_header_size(&self, nalu: &[u8]) -> Result<usize>;

    fn codec(&self) -> VideoCodec;
}

/// A NAL unit found by [`NaluIter`].
#[derive(Debug, Clone, Copy)]
pub struct Nalu<'a> {
    /// Offset of the length prefix within the sample.
    pub offset: usize,
    /// NAL unit bytes, without the length prefix.
    pub data: &'a [u8],
}

/// Iterates over the length prefixed NAL units of a sample.
///
/// Iteration stops at trailing bytes which are too short to hold a prefix and
/// a NAL unit header byte.
pub struct NaluIter<'a> {
    sample: &'a [u8],
    nalu_length_size: usize,
    position: usize,
    failed: bool,
}

impl<'a> NaluIter<'a> {
    pub fn new(sample: &'a [u8], nalu_length_size: usize) -> Result<Self> {
        check_nalu_length_size(nalu_length_size)?;
        Ok(Self {
            sample,
            nalu_length_size,
            position: 0,
            failed: false,
        })
    }

    /// Offset of the first byte which has not been handed out yet.
    pub fn position(&self) -> usize {
        self.position
    }
}

impl<'a> Iterator for NaluIter<'a> {
    type Item = Result<Nalu<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.sample.len() - self.position;

        if self.failed || remaining <= self.nalu_length_size {
            return None;
        }

        let prefix = &self.sample[self.position..self.position + self.nalu_length_size];
        let nalu_length = prefix.iter().fold(0usize, |acc, x| (acc << 8) | *x as usize);
        let start = self.position + self.nalu_length_size;

        if nalu_length > self.sample.len() - start {
            self.failed = true;
            return Some(Err(Error::invalid_format(format!(
                "NAL unit of {} bytes at offset {} exceeds the sample size {}",
                nalu_length,
                self.position,
                self.sample.len()
            ))));
        }

        let nalu = Nalu {
            offset: self.position,
            data: &self.sample[start..start + nalu_length],
        };
        self.position = start + nalu_length;
        Some(Ok(nalu))
    }
}

pub(crate) fn check_nalu_length_size(nalu_length_size: usize) -> Result<()> {
    match nalu_length_size {
        1 | 2 | 4 => Ok(()),
        x => Err(Error::invalid_format(format!(
            "NAL unit length size {} is not supported",
            x
        ))),
    }
}

/// Remove emulation prevention bytes (`00 00 03` becomes `00 00`).
pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;

    for &byte in data {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }

        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
    }

    out
}

/// Number of escaped bytes needed to produce the first `unescaped_size` bytes of
/// [`unescape`]`(data)`.
pub fn escaped_size(data: &[u8], unescaped_size: usize) -> usize {
    let mut produced = 0;
    let mut zeros = 0;

    for (i, &byte) in data.iter().enumerate() {
        if produced == unescaped_size {
            return i;
        }

        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }

        zeros = if byte == 0 { zeros + 1 } else { 0 };
        produced += 1;
    }

    data.len()
}

/// Skip `scaling_list()` syntax shared by AVC and HEVC range extension lists.
pub(crate) fn skip_scaling_list(reader: &mut BitReader, size: u32) -> Result<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;

    for _ in 0..size {
        if next_scale != 0 {
            let delta_scale = reader.read_se()?;
            next_scale = (last_scale + delta_scale + 256).rem_euclid(256);
        }

        if next_scale != 0 {
            last_scale = next_scale;
        }
    }

    Ok(())
}
