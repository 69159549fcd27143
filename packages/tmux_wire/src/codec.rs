//! Primitive readers and writers shared by every payload codec.
//!
//! Integers are little-endian, strings and byte blobs carry a `u32` length
//! prefix, optional values are preceded by a presence byte.

use crate::error::WireError;

#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bool(&mut self, v: bool) {
        self.put_u8(u8::from(v));
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    pub fn put_str(&mut self, v: &str) {
        self.put_bytes(v.as_bytes());
    }

    pub fn put_fixed(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn put_opt_str(&mut self, v: Option<&str>) {
        match v {
            Some(s) => {
                self.put_u8(1);
                self.put_str(s);
            }
            None => self.put_u8(0),
        }
    }

    pub fn put_opt_u16(&mut self, v: Option<u16>) {
        match v {
            Some(n) => {
                self.put_u8(1);
                self.put_u16(n);
            }
            None => self.put_u8(0),
        }
    }

    pub fn put_opt_u32(&mut self, v: Option<u32>) {
        match v {
            Some(n) => {
                self.put_u8(1);
                self.put_u32(n);
            }
            None => self.put_u8(0),
        }
    }
}

pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Fail if any bytes are left over after a payload was decoded.
    pub fn finish(&self) -> Result<(), WireError> {
        if self.remaining() != 0 {
            return Err(WireError::PayloadDecode(format!(
                "{} trailing bytes",
                self.remaining()
            )));
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::PayloadDecode(format!(
                "need {} bytes at offset {}, {} left",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    pub fn bool(&mut self) -> Result<bool, WireError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::PayloadDecode(format!(
                "invalid bool byte {}",
                other
            ))),
        }
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn string(&mut self) -> Result<String, WireError> {
        let raw = self.bytes()?;
        String::from_utf8(raw).map_err(|e| WireError::PayloadDecode(format!("invalid utf-8: {e}")))
    }

    pub fn fixed<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let b = self.take(N)?;
        let mut arr = [0u8; N];
        arr.copy_from_slice(b);
        Ok(arr)
    }

    fn present(&mut self) -> Result<bool, WireError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::PayloadDecode(format!(
                "invalid presence byte {}",
                other
            ))),
        }
    }

    pub fn opt_string(&mut self) -> Result<Option<String>, WireError> {
        if self.present()? {
            Ok(Some(self.string()?))
        } else {
            Ok(None)
        }
    }

    pub fn opt_u16(&mut self) -> Result<Option<u16>, WireError> {
        if self.present()? {
            Ok(Some(self.u16()?))
        } else {
            Ok(None)
        }
    }

    pub fn opt_u32(&mut self) -> Result<Option<u32>, WireError> {
        if self.present()? {
            Ok(Some(self.u32()?))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_are_length_prefixed() {
        let mut w = ByteWriter::new();
        w.put_str("hé");
        assert_eq!(w.into_inner(), vec![3, 0, 0, 0, b'h', 0xC3, 0xA9]);
    }

    #[test]
    fn optionals_carry_presence_byte() {
        let mut w = ByteWriter::new();
        w.put_opt_str(None);
        w.put_opt_u16(Some(0x0102));
        assert_eq!(w.into_inner(), vec![0, 1, 0x02, 0x01]);
    }

    #[test]
    fn reader_reports_truncation() {
        let mut r = ByteReader::new(&[5, 0, 0, 0, b'a']);
        assert!(matches!(r.string(), Err(WireError::PayloadDecode(_))));
    }

    #[test]
    fn reader_rejects_bad_bool_and_presence() {
        assert!(ByteReader::new(&[2]).bool().is_err());
        assert!(ByteReader::new(&[9]).opt_u32().is_err());
    }

    #[test]
    fn reader_rejects_invalid_utf8() {
        let mut r = ByteReader::new(&[1, 0, 0, 0, 0xFF]);
        assert!(r.string().is_err());
    }

    #[test]
    fn finish_detects_trailing_bytes() {
        let mut r = ByteReader::new(&[1, 2]);
        r.u8().unwrap();
        assert!(r.finish().is_err());
        r.u8().unwrap();
        assert!(r.finish().is_ok());
    }
}
