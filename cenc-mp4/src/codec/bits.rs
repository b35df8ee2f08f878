use crate::{Error, Result};

/// Bit level reader over an unescaped RBSP, with exp-golomb support.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    position: usize,
}

fn unexpected_end() -> Error {
    Error::invalid_format("bitstream ended unexpectedly")
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Number of bits consumed so far.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining_bits(&self) -> usize {
        (self.data.len() * 8).saturating_sub(self.position)
    }

    pub fn is_byte_aligned(&self) -> bool {
        self.position % 8 == 0
    }

    pub fn read_bit(&mut self) -> Result<bool> {
        let byte = self.data.get(self.position / 8).ok_or_else(unexpected_end)?;
        let bit = (byte >> (7 - (self.position % 8))) & 1;
        self.position += 1;
        Ok(bit != 0)
    }

    pub fn read_flag(&mut self) -> Result<bool> {
        self.read_bit()
    }

    /// Read up to 32 bits as an unsigned integer.
    pub fn read_bits(&mut self, n: u32) -> Result<u32> {
        if n > 32 {
            return Err(Error::internal("cannot read more than 32 bits at once"));
        }

        if self.remaining_bits() < n as usize {
            return Err(unexpected_end());
        }

        let mut value = 0u64;

        for _ in 0..n {
            value = (value << 1) | (self.read_bit()? as u64);
        }

        Ok(value as u32)
    }

    pub fn skip_bits(&mut self, n: usize) -> Result<()> {
        if self.remaining_bits() < n {
            return Err(unexpected_end());
        }

        self.position += n;
        Ok(())
    }

    /// Read an unsigned exp-golomb coded value, ue(v).
    pub fn read_ue(&mut self) -> Result<u32> {
        let mut leading_zeros = 0;

        while !self.read_bit()? {
            leading_zeros += 1;

            if leading_zeros > 31 {
                return Err(Error::invalid_format("exp-golomb code is longer than 32 bits"));
            }
        }

        let suffix = self.read_bits(leading_zeros)? as u64;
        Ok(((1u64 << leading_zeros) - 1 + suffix) as u32)
    }

    /// Read an unsigned exp-golomb value and check it against an inclusive upper bound.
    pub fn read_ue_max(&mut self, max: u32, what: &str) -> Result<u32> {
        let value = self.read_ue()?;

        if value > max {
            return Err(Error::invalid_format(format!(
                "{} is {} which exceeds {}",
                what, value, max
            )));
        }

        Ok(value)
    }

    /// Read a signed exp-golomb coded value, se(v).
    pub fn read_se(&mut self) -> Result<i32> {
        let ue = self.read_ue()? as i64;
        let value = (ue + 1) / 2;
        Ok(if ue % 2 == 0 { -value } else { value } as i32)
    }

    pub fn skip_ue(&mut self) -> Result<()> {
        self.read_ue().map(|_| ())
    }

    pub fn skip_se(&mut self) -> Result<()> {
        self.read_se().map(|_| ())
    }

    /// Skip to the next byte boundary.
    pub fn byte_align(&mut self) {
        self.position = self.position.div_ceil(8) * 8;
    }
}

/// Number of bits needed to code values in `0..n`, Ceil(Log2(n)).
pub fn ceil_log2(n: u32) -> u32 {
    if n <= 1 {
        0
    } else {
        32 - (n - 1).leading_zeros()
    }
}

/// Writes bitstreams for tests of the parsers.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct BitWriter {
    bytes: Vec<u8>,
    bits: usize,
}

#[cfg(test)]
impl BitWriter {
    pub(crate) fn put(&mut self, value: u32, n: u32) -> &mut Self {
        for i in (0..n).rev() {
            if self.bits % 8 == 0 {
                self.bytes.push(0);
            }

            if (value >> i) & 1 == 1 {
                let last = self.bytes.len() - 1;
                self.bytes[last] |= 0x80 >> (self.bits % 8);
            }

            self.bits += 1;
        }

        self
    }

    pub(crate) fn flag(&mut self, value: bool) -> &mut Self {
        self.put(value as u32, 1)
    }

    pub(crate) fn ue(&mut self, value: u32) -> &mut Self {
        let code = value as u64 + 1;
        let len = 64 - code.leading_zeros();
        self.put(0, len - 1);

        for i in (0..len).rev() {
            self.put(((code >> i) & 1) as u32, 1);
        }

        self
    }

    pub(crate) fn se(&mut self, value: i32) -> &mut Self {
        let code = if value > 0 {
            2 * value as u32 - 1
        } else {
            2 * value.unsigned_abs()
        };
        self.ue(code)
    }

    /// Stop bit followed by zero bits up to the next byte boundary.
    pub(crate) fn trailing_bits(&mut self) -> &mut Self {
        self.put(1, 1);

        while self.bits % 8 != 0 {
            self.put(0, 1);
        }

        self
    }

    pub(crate) fn bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }
}

/// Insert emulation prevention bytes into an RBSP.
#[cfg(test)]
pub(crate) fn escape(rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + 8);
    let mut zeros = 0;

    for &byte in rbsp {
        if zeros >= 2 && byte <= 3 {
            out.push(3);
            zeros = 0;
        }

        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
    }

    out
}
