//! Elastic byte buffer.
//!
//! `ElasticBuffer` is the staging area every socket uses for received bytes
//! waiting to be framed and for queued bytes waiting for the kernel to
//! accept them. Storage is managed in whole blocks:
//!
//! - `append()` grows by the smallest number of blocks that covers the
//!   deficit, copying into fresh storage.
//! - `erase()` drops bytes from the front and gives blocks back only when at
//!   least [`SHRINK_THRESHOLD`] of them are free, and never below the
//!   configured floor.
//!
//! ```text
//!  capacity = block_size * block_count
//!  ┌──────────── size ────────────┬──────── free ────────┐
//!  │ live bytes (front = oldest)  │  unused tail         │
//!  └──────────────────────────────┴──────────────────────┘
//! ```
//!
//! Growing eagerly and shrinking late keeps a socket whose backlog oscillates
//! around a block boundary from reallocating on every read.

use std::fmt;

/// Default and minimum block size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Default and minimum number of blocks kept when shrinking.
pub const DEFAULT_MIN_BLOCKS: usize = 50;

/// Number of free whole blocks required before `erase()` reallocates.
pub const SHRINK_THRESHOLD: usize = 10;

/// Errors surfaced by buffer mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// The allocator refused a request for `requested` bytes.
    AllocationFailed { requested: usize },
    /// The size computation overflowed `usize`.
    CapacityOverflow,
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationFailed { requested } => {
                write!(f, "buffer allocation of {} bytes failed", requested)
            }
            Self::CapacityOverflow => write!(f, "buffer capacity overflow"),
        }
    }
}

impl std::error::Error for BufferError {}

/// Block-granular growable/shrinkable byte accumulator.
///
/// Invariants: `capacity() == block_size() * block_count()` and
/// `size() <= capacity()`.
pub struct ElasticBuffer {
    /// Backing storage. `storage.len()` is always the capacity.
    storage: Vec<u8>,
    size: usize,
    block_size: usize,
    block_count: usize,
    min_block_count: usize,
}

impl ElasticBuffer {
    /// Buffer with 4 KiB blocks and a 50-block shrink floor.
    pub fn new() -> Self {
        Self::with_blocks(DEFAULT_BLOCK_SIZE, DEFAULT_MIN_BLOCKS)
    }

    /// Buffer with custom block geometry.
    ///
    /// Both values are clamped up to their defaults, so a caller can raise
    /// but never lower them.
    pub fn with_blocks(block_size: usize, min_block_count: usize) -> Self {
        Self {
            storage: Vec::new(),
            size: 0,
            block_size: block_size.max(DEFAULT_BLOCK_SIZE),
            block_count: 0,
            min_block_count: min_block_count.max(DEFAULT_MIN_BLOCKS),
        }
    }

    /// The live bytes, oldest first.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.storage[..self.size]
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.block_size * self.block_count
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    #[inline]
    pub fn min_block_count(&self) -> usize {
        self.min_block_count
    }

    /// Append `bytes` to the back of the buffer.
    ///
    /// On error the buffer is left exactly as it was.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        let free = self.capacity() - self.size;
        if free >= bytes.len() {
            self.storage[self.size..self.size + bytes.len()].copy_from_slice(bytes);
            self.size += bytes.len();
            return Ok(());
        }

        let deficit = bytes.len() - free;
        let extra_blocks = deficit.div_ceil(self.block_size);
        let new_block_count = self
            .block_count
            .checked_add(extra_blocks)
            .ok_or(BufferError::CapacityOverflow)?;
        let new_capacity = new_block_count
            .checked_mul(self.block_size)
            .ok_or(BufferError::CapacityOverflow)?;

        let mut fresh = Vec::new();
        fresh
            .try_reserve_exact(new_capacity)
            .map_err(|_| BufferError::AllocationFailed { requested: new_capacity })?;
        fresh.extend_from_slice(&self.storage[..self.size]);
        fresh.extend_from_slice(bytes);
        fresh.resize(new_capacity, 0);

        self.storage = fresh;
        self.size += bytes.len();
        self.block_count = new_block_count;
        Ok(())
    }

    /// Drop up to `n` bytes from the front.
    pub fn erase(&mut self, n: usize) {
        let n = n.min(self.size);
        if n == 0 {
            return;
        }
        self.storage.copy_within(n..self.size, 0);
        self.size -= n;

        let free_blocks = (self.capacity() - self.size) / self.block_size;
        let releasable = free_blocks.min(self.block_count.saturating_sub(self.min_block_count));
        if releasable < SHRINK_THRESHOLD {
            return;
        }

        let new_block_count = self.block_count - releasable;
        let new_capacity = new_block_count * self.block_size;
        let mut fresh = Vec::new();
        // Shrinking is an optimisation; keep the larger storage if the
        // allocator says no.
        if fresh.try_reserve_exact(new_capacity).is_err() {
            return;
        }
        fresh.extend_from_slice(&self.storage[..self.size]);
        fresh.resize(new_capacity, 0);
        self.storage = fresh;
        self.block_count = new_block_count;
    }

    /// Drop every live byte. Capacity follows the normal shrink rule.
    pub fn clear(&mut self) {
        self.erase(self.size);
    }
}

impl Default for ElasticBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ElasticBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElasticBuffer")
            .field("size", &self.size)
            .field("capacity", &self.capacity())
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .field("min_block_count", &self.min_block_count)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn check_invariants(buf: &ElasticBuffer) {
        assert!(buf.size() <= buf.capacity());
        assert_eq!(buf.capacity() % buf.block_size(), 0);
        assert_eq!(buf.capacity(), buf.block_size() * buf.block_count());
    }

    /// Tiny deterministic generator so the interleaving test is repeatable.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            self.0 >> 33
        }
    }

    #[test]
    fn test_new_is_empty() {
        let buf = ElasticBuffer::new();
        assert_eq!(buf.size(), 0);
        assert_eq!(buf.capacity(), 0);
        assert!(buf.data().is_empty());
        check_invariants(&buf);
    }

    #[test]
    fn test_geometry_clamped() {
        let buf = ElasticBuffer::with_blocks(100, 3);
        assert_eq!(buf.block_size(), 4096);
        assert_eq!(buf.min_block_count(), 50);

        let buf = ElasticBuffer::with_blocks(8192, 64);
        assert_eq!(buf.block_size(), 8192);
        assert_eq!(buf.min_block_count(), 64);
    }

    #[test]
    fn test_append_grows_by_whole_blocks() {
        let mut buf = ElasticBuffer::new();
        buf.append(&[1u8; 10]).unwrap();
        assert_eq!(buf.block_count(), 1);

        // Fits in the remaining 4086 bytes: no growth.
        buf.append(&[2u8; 4086]).unwrap();
        assert_eq!(buf.block_count(), 1);
        assert_eq!(buf.size(), 4096);

        // One byte over: exactly one more block.
        buf.append(&[3u8]).unwrap();
        assert_eq!(buf.block_count(), 2);

        // Deficit of 3 blocks + 1 byte rounds up to 4.
        let free = buf.capacity() - buf.size();
        buf.append(&vec![4u8; free + 3 * 4096 + 1]).unwrap();
        assert_eq!(buf.block_count(), 6);
        check_invariants(&buf);
    }

    #[test]
    fn test_erase_preserves_remainder() {
        let mut buf = ElasticBuffer::new();
        buf.append(b"hello world").unwrap();
        buf.erase(6);
        assert_eq!(buf.data(), b"world");
        buf.erase(100);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_erase_below_floor_never_shrinks() {
        let mut buf = ElasticBuffer::new();
        buf.append(&vec![0u8; 40 * 4096]).unwrap();
        assert_eq!(buf.block_count(), 40);
        buf.erase(40 * 4096);
        assert_eq!(buf.block_count(), 40);
    }

    #[test]
    fn test_shrink_keeps_floor() {
        let mut buf = ElasticBuffer::new();
        buf.append(&vec![7u8; 100 * 4096]).unwrap();
        assert_eq!(buf.block_count(), 100);

        buf.erase(100 * 4096 - 5);
        assert_eq!(buf.data(), &[7u8; 5]);
        assert_eq!(buf.block_count(), 50);
        check_invariants(&buf);
    }

    #[test]
    fn test_small_free_count_does_not_shrink() {
        let mut buf = ElasticBuffer::new();
        buf.append(&vec![0u8; 100 * 4096]).unwrap();
        // Nine free blocks is under the threshold.
        buf.erase(9 * 4096);
        assert_eq!(buf.block_count(), 100);
        // The tenth tips it over.
        buf.erase(4096);
        assert_eq!(buf.block_count(), 90);
    }

    #[test]
    fn test_no_shrink_while_refilling() {
        let mut buf = ElasticBuffer::new();
        buf.append(&vec![1u8; 80 * 4096]).unwrap();
        buf.erase(80 * 4096);
        assert_eq!(buf.block_count(), 50);

        // Refill to the old size: only growth happens.
        let mut last = buf.block_count();
        for _ in 0..80 {
            buf.append(&[2u8; 4096]).unwrap();
            assert!(buf.block_count() >= last);
            last = buf.block_count();
        }
        assert_eq!(buf.block_count(), 80);
        assert_eq!(buf.size(), 80 * 4096);

        // Small erases under the threshold keep the storage.
        buf.erase(4096);
        assert_eq!(buf.block_count(), 80);
    }

    #[test]
    fn test_interleaving_matches_reference() {
        let mut rng = Lcg(0x5eed);
        let mut buf = ElasticBuffer::new();
        let mut model: Vec<u8> = Vec::new();
        let mut counter = 0u8;

        for _ in 0..2000 {
            if rng.next() % 3 != 0 {
                let n = (rng.next() % 20_000) as usize;
                let chunk: Vec<u8> = (0..n)
                    .map(|_| {
                        counter = counter.wrapping_add(1);
                        counter
                    })
                    .collect();
                buf.append(&chunk).unwrap();
                model.extend_from_slice(&chunk);
            } else {
                let n = (rng.next() % 40_000) as usize;
                buf.erase(n);
                let n = n.min(model.len());
                model.drain(..n);
            }
            assert_eq!(buf.data(), &model[..]);
            check_invariants(&buf);
        }
    }

    #[test]
    fn test_clear() {
        let mut buf = ElasticBuffer::new();
        buf.append(&vec![0u8; 70 * 4096]).unwrap();
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.block_count(), 50);
    }

    #[test]
    fn test_error_display() {
        let e = BufferError::AllocationFailed { requested: 4096 };
        assert_eq!(format!("{}", e), "buffer allocation of 4096 bytes failed");
    }
}
