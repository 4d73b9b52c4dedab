//! Input side of the codec.
//!
//! `Unpack` is a read-only cursor over a borrowed slice. Every `pop_*`
//! checks the remaining length first and moves the cursor only when the
//! whole value could be read, so a failed read leaves the cursor where it
//! was and the caller can retry once more bytes have arrived.

use crate::error::{Result, WireError};

#[derive(Debug, Clone)]
pub struct Unpack<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Unpack<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Offset of the cursor from the start of the slice.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// The unread tail.
    #[inline]
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Fail with `TrailingData` if anything is left unread.
    pub fn finish(&self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            remaining => Err(WireError::TrailingData { remaining }),
        }
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        let remaining = self.remaining();
        if remaining < needed {
            return Err(WireError::NotEnoughData { needed, remaining });
        }
        Ok(())
    }

    fn peek_array<const N: usize>(&self) -> Result<[u8; N]> {
        self.ensure(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.pos..self.pos + N]);
        Ok(out)
    }

    fn pop_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let out = self.peek_array::<N>()?;
        self.pos += N;
        Ok(out)
    }

    /// Take exactly `n` raw bytes.
    pub fn pop_fetch(&mut self, n: usize) -> Result<&'a [u8]> {
        self.ensure(n)?;
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Advance past `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.pop_fetch(n).map(|_| ())
    }

    pub fn pop_u8(&mut self) -> Result<u8> {
        Ok(self.pop_array::<1>()?[0])
    }

    pub fn pop_u16(&mut self) -> Result<u16> {
        self.pop_array().map(u16::from_be_bytes)
    }

    pub fn pop_u32(&mut self) -> Result<u32> {
        self.pop_array().map(u32::from_be_bytes)
    }

    pub fn pop_u64(&mut self) -> Result<u64> {
        self.pop_array().map(u64::from_be_bytes)
    }

    pub fn pop_i64(&mut self) -> Result<i64> {
        self.pop_array().map(i64::from_be_bytes)
    }

    pub fn pop_f64(&mut self) -> Result<f64> {
        self.pop_array().map(f64::from_ne_bytes)
    }

    /// Nonzero decodes as `true`.
    pub fn pop_bool(&mut self) -> Result<bool> {
        self.pop_u8().map(|b| b != 0)
    }

    pub fn peek_u16(&self) -> Result<u16> {
        self.peek_array().map(u16::from_be_bytes)
    }

    pub fn peek_u32(&self) -> Result<u32> {
        self.peek_array().map(u32::from_be_bytes)
    }

    /// u16 length prefix then that many bytes.
    pub fn pop_varstr(&mut self) -> Result<&'a [u8]> {
        let len = self.peek_u16()? as usize;
        self.ensure(2 + len)?;
        self.pos += 2;
        self.pop_fetch(len)
    }

    /// u32 length prefix then that many bytes.
    pub fn pop_varstr32(&mut self) -> Result<&'a [u8]> {
        let len = self.peek_u32()? as usize;
        self.ensure(4usize.saturating_add(len))?;
        self.pos += 4;
        self.pop_fetch(len)
    }

    /// UTF-8 checked varstr.
    pub fn pop_str(&mut self) -> Result<&'a str> {
        let mark = self.pos;
        let bytes = self.pop_varstr()?;
        match std::str::from_utf8(bytes) {
            Ok(s) => Ok(s),
            Err(_) => {
                self.pos = mark;
                Err(WireError::InvalidUtf8)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::Pack;

    #[test]
    fn test_scalar_round_trip() {
        let mut p = Pack::new();
        p.push_u8(0xFE).unwrap();
        p.push_u16(0xBEEF).unwrap();
        p.push_u32(0xDEAD_BEEF).unwrap();
        p.push_u64(u64::MAX - 1).unwrap();
        p.push_i64(-42).unwrap();
        p.push_f64(-0.25).unwrap();
        p.push_bool(true).unwrap();

        let mut u = Unpack::new(p.data());
        assert_eq!(u.pop_u8().unwrap(), 0xFE);
        assert_eq!(u.pop_u16().unwrap(), 0xBEEF);
        assert_eq!(u.pop_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(u.pop_u64().unwrap(), u64::MAX - 1);
        assert_eq!(u.pop_i64().unwrap(), -42);
        assert_eq!(u.pop_f64().unwrap(), -0.25);
        assert!(u.pop_bool().unwrap());
        assert!(u.finish().is_ok());
    }

    #[test]
    fn test_failed_pop_does_not_advance() {
        let data = [0x00, 0x01, 0x02];
        let mut u = Unpack::new(&data);
        assert_eq!(
            u.pop_u32().unwrap_err(),
            WireError::NotEnoughData { needed: 4, remaining: 3 }
        );
        assert_eq!(u.position(), 0);
        assert_eq!(u.pop_u16().unwrap(), 1);
        assert_eq!(u.remaining(), 1);
        assert!(u.pop_u64().is_err());
        assert_eq!(u.pop_u8().unwrap(), 2);
        assert!(u.pop_u8().is_err());
    }

    #[test]
    fn test_truncated_varstr_keeps_prefix() {
        // Prefix says 5 bytes, only 3 follow.
        let data = [0x00, 0x05, b'a', b'b', b'c'];
        let mut u = Unpack::new(&data);
        assert_eq!(
            u.pop_varstr().unwrap_err(),
            WireError::NotEnoughData { needed: 7, remaining: 5 }
        );
        assert_eq!(u.position(), 0);
        assert_eq!(u.peek_u16().unwrap(), 5);
    }

    #[test]
    fn test_varstr_and_fetch() {
        let mut p = Pack::new();
        p.push_str("hello").unwrap();
        p.push_varstr32(b"world").unwrap();
        p.push_bytes(b"xyz").unwrap();

        let mut u = Unpack::new(p.data());
        assert_eq!(u.pop_str().unwrap(), "hello");
        assert_eq!(u.pop_varstr32().unwrap(), b"world");
        assert_eq!(u.pop_fetch(2).unwrap(), b"xy");
        assert_eq!(u.finish().unwrap_err(), WireError::TrailingData { remaining: 1 });
        assert_eq!(u.rest(), b"z");
    }

    #[test]
    fn test_invalid_utf8_rewinds() {
        let data = [0x00, 0x02, 0xC3, 0x28];
        let mut u = Unpack::new(&data);
        assert_eq!(u.pop_str().unwrap_err(), WireError::InvalidUtf8);
        assert_eq!(u.position(), 0);
        assert_eq!(u.pop_varstr().unwrap(), &[0xC3, 0x28]);
    }

    #[test]
    fn test_nonzero_bool() {
        let data = [7u8];
        assert!(Unpack::new(&data).pop_bool().unwrap());
    }
}
