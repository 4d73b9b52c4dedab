//! Readiness interest mask.
//!
//! Bit values are fixed (`READ = 1`, `WRITE = 2`, `ERROR = 4`) so masks can
//! be logged and compared as plain integers.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Set of readiness kinds a descriptor is registered for (or reported with).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    /// No interest at all.
    pub const NONE: Interest = Interest(0);
    /// Readable without blocking.
    pub const READ: Interest = Interest(1);
    /// Writable without blocking.
    pub const WRITE: Interest = Interest(2);
    /// Error condition pending on the descriptor.
    pub const ERROR: Interest = Interest(4);

    /// The steady-state mask for an idle connected socket.
    pub const READ_ERROR: Interest = Interest(1 | 4);
    /// The mask while output is queued or a connect is in flight.
    pub const ALL: Interest = Interest(1 | 2 | 4);

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Interest(bits & 0b111)
    }

    /// True if every bit of `other` is set in `self`.
    #[inline]
    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    #[inline]
    pub const fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    #[inline]
    pub const fn union(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    #[inline]
    pub const fn without(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }
}

impl BitOr for Interest {
    type Output = Interest;

    #[inline]
    fn bitor(self, rhs: Interest) -> Interest {
        self.union(rhs)
    }
}

impl BitOrAssign for Interest {
    #[inline]
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let mut first = true;
        for (flag, name) in [(Self::READ, "READ"), (Self::WRITE, "WRITE"), (Self::ERROR, "ERROR")] {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_values() {
        assert_eq!(Interest::READ.bits(), 1);
        assert_eq!(Interest::WRITE.bits(), 2);
        assert_eq!(Interest::ERROR.bits(), 4);
        assert_eq!((Interest::READ | Interest::ERROR), Interest::READ_ERROR);
    }

    #[test]
    fn test_contains() {
        let all = Interest::ALL;
        assert!(all.contains(Interest::WRITE));
        assert!(!Interest::READ_ERROR.contains(Interest::WRITE));
        assert!(!all.contains(Interest::NONE));
        assert_eq!(all.without(Interest::WRITE), Interest::READ_ERROR);
    }

    #[test]
    fn test_debug_format() {
        assert_eq!(format!("{:?}", Interest::ALL), "READ|WRITE|ERROR");
        assert_eq!(format!("{:?}", Interest::READ_ERROR), "READ|ERROR");
        assert_eq!(format!("{}", Interest::NONE), "NONE");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(Interest::from_bits_truncate(0xFF), Interest::ALL);
    }
}
