//! Output side of the codec.
//!
//! Every integer is written in network byte order. `f64` is the exception:
//! its bytes are copied in host representation, so both peers must share a
//! float layout.

use crate::error::{Result, WireError};

/// Growable encode buffer with an optional hard size limit.
#[derive(Debug, Clone, Default)]
pub struct Pack {
    buf: Vec<u8>,
    limit: Option<usize>,
}

impl Pack {
    /// Unlimited pack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pack that refuses to grow past `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit: Some(limit),
        }
    }

    /// Limited pack that starts with `reserved` zero bytes already written.
    /// The limit is raised to `reserved` if it is smaller.
    pub fn with_reserved(reserved: usize, limit: usize) -> Self {
        Self {
            buf: vec![0; reserved],
            limit: Some(limit.max(reserved)),
        }
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Drop everything past `len`.
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    fn check_room(&self, extra: usize) -> Result<()> {
        if let Some(limit) = self.limit {
            let requested = self.buf.len().saturating_add(extra);
            if requested > limit {
                return Err(WireError::BufferOverflow { limit, requested });
            }
        }
        Ok(())
    }

    /// Append raw bytes with no length prefix.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<&mut Self> {
        self.check_room(bytes.len())?;
        self.buf.extend_from_slice(bytes);
        Ok(self)
    }

    /// Append `n` zero bytes and return the offset where they start.
    ///
    /// Used to reserve header space that is back-patched later.
    pub fn reserve_zeroed(&mut self, n: usize) -> Result<usize> {
        self.check_room(n)?;
        let at = self.buf.len();
        self.buf.resize(at + n, 0);
        Ok(at)
    }

    pub fn push_u8(&mut self, v: u8) -> Result<&mut Self> {
        self.push_bytes(&[v])
    }

    pub fn push_u16(&mut self, v: u16) -> Result<&mut Self> {
        self.push_bytes(&v.to_be_bytes())
    }

    pub fn push_u32(&mut self, v: u32) -> Result<&mut Self> {
        self.push_bytes(&v.to_be_bytes())
    }

    pub fn push_u64(&mut self, v: u64) -> Result<&mut Self> {
        self.push_bytes(&v.to_be_bytes())
    }

    pub fn push_i64(&mut self, v: i64) -> Result<&mut Self> {
        self.push_bytes(&v.to_be_bytes())
    }

    pub fn push_f64(&mut self, v: f64) -> Result<&mut Self> {
        self.push_bytes(&v.to_ne_bytes())
    }

    pub fn push_bool(&mut self, v: bool) -> Result<&mut Self> {
        self.push_u8(v as u8)
    }

    /// u16 length prefix followed by the bytes.
    pub fn push_varstr(&mut self, bytes: &[u8]) -> Result<&mut Self> {
        let len = u16::try_from(bytes.len()).map_err(|_| WireError::VarstrTooLong { len: bytes.len() })?;
        self.check_room(2 + bytes.len())?;
        self.push_u16(len)?;
        self.push_bytes(bytes)
    }

    /// u32 length prefix followed by the bytes.
    pub fn push_varstr32(&mut self, bytes: &[u8]) -> Result<&mut Self> {
        let len = u32::try_from(bytes.len()).map_err(|_| WireError::VarstrTooLong { len: bytes.len() })?;
        self.check_room(4 + bytes.len())?;
        self.push_u32(len)?;
        self.push_bytes(bytes)
    }

    pub fn push_str(&mut self, s: &str) -> Result<&mut Self> {
        self.push_varstr(s.as_bytes())
    }

    // ── back-patching ──

    /// Overwrite `bytes.len()` bytes at absolute offset `pos`.
    ///
    /// Returns the offset just past the patched span.
    pub fn replace(&mut self, pos: usize, bytes: &[u8]) -> Result<usize> {
        let end = pos.saturating_add(bytes.len());
        if end > self.buf.len() {
            return Err(WireError::BufferOverflow {
                limit: self.buf.len(),
                requested: end,
            });
        }
        self.buf[pos..end].copy_from_slice(bytes);
        Ok(end)
    }

    pub fn replace_u8(&mut self, pos: usize, v: u8) -> Result<usize> {
        self.replace(pos, &[v])
    }

    pub fn replace_u16(&mut self, pos: usize, v: u16) -> Result<usize> {
        self.replace(pos, &v.to_be_bytes())
    }

    pub fn replace_u32(&mut self, pos: usize, v: u32) -> Result<usize> {
        self.replace(pos, &v.to_be_bytes())
    }
}
