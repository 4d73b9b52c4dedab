//! Wire codec error types.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// A read needed more bytes than the cursor had left.
    NotEnoughData { needed: usize, remaining: usize },
    /// A u16-prefixed string was longer than 65,535 bytes.
    VarstrTooLong { len: usize },
    /// An encoded packet would exceed the 16-bit length field.
    PacketTooLarge { size: usize },
    /// A size-limited `Pack` refused to grow past its limit.
    BufferOverflow { limit: usize, requested: usize },
    /// `finish()` found unread bytes.
    TrailingData { remaining: usize },
    /// A `String` field was not valid UTF-8.
    InvalidUtf8,
    /// A frame declared a length shorter than its own header.
    BadLength { length: u16 },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotEnoughData { needed, remaining } => {
                write!(f, "not enough data: need {} bytes, {} remaining", needed, remaining)
            }
            Self::VarstrTooLong { len } => write!(f, "varstr too long: {} bytes", len),
            Self::PacketTooLarge { size } => write!(f, "packet too large: {} bytes", size),
            Self::BufferOverflow { limit, requested } => {
                write!(f, "pack overflow: {} bytes requested, limit {}", requested, limit)
            }
            Self::TrailingData { remaining } => write!(f, "{} trailing bytes after value", remaining),
            Self::InvalidUtf8 => write!(f, "string is not valid UTF-8"),
            Self::BadLength { length } => write!(f, "frame length {} shorter than header", length),
        }
    }
}

impl std::error::Error for WireError {}

pub type Result<T> = std::result::Result<T, WireError>;
