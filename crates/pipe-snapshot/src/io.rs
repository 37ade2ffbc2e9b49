//! Big-endian field helpers for snapshot streams.

use std::io::{Read, Write};

use crate::error::{Result, SnapshotError};

pub trait WriteBeExt: Write {
    fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_all(&[v])?;
        Ok(())
    }

    fn write_bool(&mut self, v: bool) -> Result<()> {
        self.write_u8(u8::from(v))
    }

    fn write_u16_be(&mut self, v: u16) -> Result<()> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn write_u32_be(&mut self, v: u32) -> Result<()> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn write_i32_be(&mut self, v: i32) -> Result<()> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn write_u64_be(&mut self, v: u64) -> Result<()> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_all(bytes)?;
        Ok(())
    }

    fn write_len_prefixed_bytes_u32(&mut self, bytes: &[u8]) -> Result<()> {
        let len: u32 = bytes
            .len()
            .try_into()
            .map_err(|_| SnapshotError::Corrupt("length does not fit in u32"))?;
        self.write_u32_be(len)?;
        self.write_bytes(bytes)?;
        Ok(())
    }

    fn write_string_u32(&mut self, s: &str) -> Result<()> {
        self.write_len_prefixed_bytes_u32(s.as_bytes())
    }
}

impl<T: Write + ?Sized> WriteBeExt for T {}

pub trait ReadBeExt: Read {
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(SnapshotError::Corrupt("invalid bool")),
        }
    }

    fn read_u16_be(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn read_u32_be(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_i32_be(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    fn read_u64_be(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn read_exact_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| SnapshotError::OutOfMemory { len })?;
        buf.resize(len, 0);
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Reads a `u32` length followed by that many bytes, rejecting lengths above `max`.
    fn read_len_prefixed_bytes_u32(&mut self, max: usize) -> Result<Vec<u8>> {
        let len = self.read_u32_be()? as usize;
        if len > max {
            return Err(SnapshotError::Corrupt("length prefix too large"));
        }
        self.read_exact_vec(len)
    }

    fn read_string_u32(&mut self, max: usize) -> Result<String> {
        let bytes = self.read_len_prefixed_bytes_u32(max)?;
        Ok(String::from_utf8(bytes)?)
    }
}

impl<T: Read + ?Sized> ReadBeExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn fields_are_big_endian() {
        let mut out = Vec::new();
        out.write_u32_be(0x0102_0304).unwrap();
        out.write_u64_be(0x0A0B_0C0D_0E0F_1011).unwrap();
        out.write_i32_be(-4).unwrap();
        assert_eq!(
            out,
            [1, 2, 3, 4, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10, 0x11, 0xFF, 0xFF, 0xFF, 0xFC]
        );
    }

    #[test]
    fn read_exact_vec_allocation_failure_returns_error() {
        let mut cursor = Cursor::new(Vec::new());
        let err = cursor.read_exact_vec(usize::MAX).unwrap_err();
        assert!(matches!(err, SnapshotError::OutOfMemory { .. }));
    }

    #[test]
    fn oversized_length_prefix_is_corrupt() {
        let mut out = Vec::new();
        out.write_string_u32("pipe:zero").unwrap();
        let err = Cursor::new(&out).read_string_u32(4).unwrap_err();
        assert!(matches!(err, SnapshotError::Corrupt(_)));
        assert_eq!(Cursor::new(&out).read_string_u32(64).unwrap(), "pipe:zero");
    }

    #[test]
    fn bools_other_than_zero_or_one_are_rejected() {
        assert!(matches!(
            Cursor::new([2u8]).read_bool(),
            Err(SnapshotError::Corrupt("invalid bool"))
        ));
    }
}
