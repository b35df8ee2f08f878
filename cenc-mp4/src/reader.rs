use crate::{Error, Result};
use std::io::{Cursor, Read};

/// Big endian reader for parsing mp4 boxes.
///
/// Every read is bounds checked and fails with [`Error::InvalidFormat`]
/// instead of panicking on truncated data.
#[derive(Clone)]
pub struct Reader<'a> {
    inner: Cursor<&'a [u8]>,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            inner: Cursor::new(data),
        }
    }

    pub fn has_more_data(&self) -> bool {
        self.inner.position() < (self.inner.get_ref().len() as u64)
    }

    pub fn get_length(&self) -> u64 {
        self.inner.get_ref().len() as u64
    }

    pub fn get_position(&self) -> u64 {
        self.inner.position()
    }

    /// Number of bytes left after the current position.
    pub fn remaining(&self) -> u64 {
        self.get_length().saturating_sub(self.get_position())
    }

    pub fn skip(&mut self, bytes: u64) -> Result<()> {
        let position = self
            .get_position()
            .checked_add(bytes)
            .filter(|x| *x <= self.get_length())
            .ok_or_else(|| Error::invalid_format("reader skips out of bounds"))?;

        self.inner.set_position(position);
        Ok(())
    }

    fn read_exact<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0; N];
        self.inner.read_exact(&mut buf).map_err(|_| {
            Error::invalid_format(format!(
                "cannot read {} bytes at offset {}",
                N,
                self.get_position()
            ))
        })?;
        Ok(buf)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(u8::from_be_bytes(self.read_exact()?))
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_exact()?))
    }

    pub fn read_u24(&mut self) -> Result<u32> {
        let [a, b, c] = self.read_exact()?;
        Ok(u32::from_be_bytes([0, a, b, c]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_exact()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.read_exact()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.read_exact()?))
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.read_exact()
    }

    pub fn read_bytes_u8(&mut self, bytes: usize) -> Result<Vec<u8>> {
        Ok(self.read_slice(bytes)?.to_vec())
    }

    /// Borrow the next `bytes` bytes without copying them.
    pub fn read_slice(&mut self, bytes: usize) -> Result<&'a [u8]> {
        let start = self.get_position() as usize;
        let end = start
            .checked_add(bytes)
            .filter(|x| *x <= self.inner.get_ref().len())
            .ok_or_else(|| {
                Error::invalid_format(format!("cannot read {} bytes at offset {}", bytes, start))
            })?;
        let data: &'a [u8] = self.inner.get_ref();
        self.inner.set_position(end as u64);
        Ok(&data[start..end])
    }

    /// Borrow everything after the current position.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let data: &'a [u8] = self.inner.get_ref();
        let start = (self.get_position() as usize).min(data.len());
        self.inner.set_position(data.len() as u64);
        &data[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_integers() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09];
        let mut reader = Reader::new(&data);
        assert_eq!(reader.read_u8().unwrap(), 0x01);
        assert_eq!(reader.read_u24().unwrap(), 0x020304);
        assert_eq!(reader.read_u16().unwrap(), 0x0506);
        assert_eq!(reader.remaining(), 3);
        assert!(reader.read_u32().unwrap_err().is_invalid_format());
    }

    #[test]
    fn test_read_slice_bounds() {
        let data = [0u8; 4];
        let mut reader = Reader::new(&data);
        assert_eq!(reader.read_slice(3).unwrap().len(), 3);
        assert!(reader.read_slice(2).is_err());
        assert!(reader.skip(2).is_err());
        assert_eq!(reader.read_rest().len(), 1);
        assert!(!reader.has_more_data());
    }
}
