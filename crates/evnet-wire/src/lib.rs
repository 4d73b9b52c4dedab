//! # evnet-wire
//!
//! Byte-exact binary codec used by evnet peers.
//!
//! ## Modules
//!
//! - `pack` / `unpack` - Scalar and string encode/decode cursors
//! - `marshal` - `Marshallable` trait, container and tuple impls
//! - `packet` - Two-level frame header, `Encoder` / `Decoder`
//! - `error` - `WireError`
//!
//! The codec has no knowledge of sockets. A packet handler typically calls
//! [`Decoder::frame_len`] on the bytes a socket has buffered, decodes the
//! complete frame and answers with an [`Encoder`].

pub mod error;
pub mod marshal;
pub mod pack;
pub mod packet;
pub mod unpack;

pub use error::{Result, WireError};
pub use marshal::{from_bytes, to_bytes, Marshallable, Varstr, Varstr32};
pub use pack::Pack;
pub use packet::{
    encode_packet, Decoder, Encoder, PacketHeader, HEADER_SIZE, MAIN_CMD_PAXOS, MAIN_CMD_UNKNOWN,
    MAX_PACKET_SIZE, PROTO_HEADER_SIZE, SUB_HEADER_SIZE,
};
pub use unpack::Unpack;
