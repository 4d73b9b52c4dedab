//! Two-level packet framing.
//!
//! ```text
//!   0       2       4               8       10      12
//!   ┌───────┬───────┬───────────────┬───────┬───────┬──────────────┐
//!   │length │main   │sequence       │sub    │check  │ body ...     │
//!   │  u16  │cmd u16│     u32       │cmd u16│code   │              │
//!   └───────┴───────┴───────────────┴───────┴───────┴──────────────┘
//!   └──────── outer header ─────────┘└─ inner hdr ─┘
//! ```
//!
//! All fields are big-endian. `length` counts the whole frame, header
//! included, so a frame is at most 65,535 bytes. The check code is carried
//! verbatim: nothing here computes or verifies it.
//!
//! Encoding reserves the header, marshals the body behind it and then
//! back-patches the header once the total length is known.

use tracing::debug;

use crate::error::{Result, WireError};
use crate::marshal::Marshallable;
use crate::pack::Pack;
use crate::unpack::Unpack;

/// Outer header: length, main command, sequence.
pub const PROTO_HEADER_SIZE: usize = 8;
/// Inner header: sub command, check code.
pub const SUB_HEADER_SIZE: usize = 4;
/// Full header size. Also the smallest valid frame.
pub const HEADER_SIZE: usize = PROTO_HEADER_SIZE + SUB_HEADER_SIZE;
/// Largest frame the 16-bit length field can describe.
pub const MAX_PACKET_SIZE: usize = 65535;

pub const MAIN_CMD_UNKNOWN: u16 = 0;
pub const MAIN_CMD_PAXOS: u16 = 1;

const OFF_LENGTH: usize = 0;
const OFF_MAIN_CMD: usize = 2;
const OFF_SEQUENCE: usize = 4;
const OFF_SUB_CMD: usize = 8;
const OFF_CHECK_CODE: usize = 10;

/// Decoded or to-be-encoded header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub length: u16,
    pub main_cmd: u16,
    pub sequence: u32,
    pub sub_cmd: u16,
    pub check_code: u16,
}

impl Default for PacketHeader {
    fn default() -> Self {
        Self {
            length: HEADER_SIZE as u16,
            main_cmd: MAIN_CMD_PAXOS,
            sequence: 0,
            sub_cmd: 0,
            check_code: 0,
        }
    }
}

impl PacketHeader {
    /// Body length implied by `length`.
    #[inline]
    pub fn body_len(&self) -> usize {
        (self.length as usize).saturating_sub(HEADER_SIZE)
    }
}

// ============================================================================
// Encoder
// ============================================================================

/// Builds one frame.
///
/// ```ignore
/// let mut enc = Encoder::new();
/// enc.set_sequence(42);
/// enc.serialize(7, &body)?;
/// socket_send(enc.data());
/// ```
#[derive(Debug, Clone)]
pub struct Encoder {
    header: PacketHeader,
    pack: Pack,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            header: PacketHeader::default(),
            pack: Pack::with_reserved(HEADER_SIZE, MAX_PACKET_SIZE),
        }
    }

    #[inline]
    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn set_main_cmd(&mut self, cmd: u16) -> &mut Self {
        self.header.main_cmd = cmd;
        self
    }

    pub fn set_sequence(&mut self, seq: u32) -> &mut Self {
        self.header.sequence = seq;
        self
    }

    pub fn set_check_code(&mut self, code: u16) -> &mut Self {
        self.header.check_code = code;
        self
    }

    /// Whole frame, header first. Only meaningful after `serialize`.
    #[inline]
    pub fn data(&self) -> &[u8] {
        self.pack.data()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.pack.len()
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.pack.data()[HEADER_SIZE..]
    }

    #[inline]
    pub fn body_size(&self) -> usize {
        self.pack.len() - HEADER_SIZE
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.pack.into_vec()
    }

    /// Drop the body and reset the header to its defaults.
    pub fn clear(&mut self) {
        self.pack.truncate(HEADER_SIZE);
        self.header = PacketHeader::default();
    }

    /// Append `msg` to the body under `sub_cmd` and patch the header.
    ///
    /// If the body would push the frame past [`MAX_PACKET_SIZE`] the
    /// encoder is rolled back to its previous contents and
    /// `PacketTooLarge` is returned.
    pub fn serialize(&mut self, sub_cmd: u16, msg: &dyn Marshallable) -> Result<()> {
        let mark = self.pack.len();
        if let Err(e) = msg.marshal(&mut self.pack) {
            self.pack.truncate(mark);
            return Err(match e {
                WireError::BufferOverflow { requested, .. } => {
                    debug!(size = requested, sub_cmd, "packet exceeds frame limit");
                    WireError::PacketTooLarge { size: requested }
                }
                other => other,
            });
        }

        self.header.sub_cmd = sub_cmd;
        self.header.length = self.pack.len() as u16;
        self.patch_header()
    }

    fn patch_header(&mut self) -> Result<()> {
        let h = self.header;
        self.pack.replace_u16(OFF_LENGTH, h.length)?;
        self.pack.replace_u16(OFF_MAIN_CMD, h.main_cmd)?;
        self.pack.replace_u32(OFF_SEQUENCE, h.sequence)?;
        self.pack.replace_u16(OFF_SUB_CMD, h.sub_cmd)?;
        self.pack.replace_u16(OFF_CHECK_CODE, h.check_code)?;
        Ok(())
    }
}

/// One-shot helper: encode a complete frame into a new `Vec`.
pub fn encode_packet(
    main_cmd: u16,
    sequence: u32,
    sub_cmd: u16,
    check_code: u16,
    msg: &dyn Marshallable,
) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    enc.set_main_cmd(main_cmd).set_sequence(sequence).set_check_code(check_code);
    enc.serialize(sub_cmd, msg)?;
    Ok(enc.into_vec())
}

// ============================================================================
// Decoder
// ============================================================================

/// Reads one frame.
pub struct Decoder<'a> {
    up: Unpack<'a>,
}

impl<'a> Decoder<'a> {
    pub fn new(frame: &'a [u8]) -> Self {
        Self { up: Unpack::new(frame) }
    }

    /// Read the header, then let `msg` unmarshal the body.
    ///
    /// The body cursor is bounded by the declared length, so a message
    /// cannot read into the next frame. Bytes the message leaves unread
    /// are ignored.
    pub fn deserialize(&mut self, msg: &mut dyn Marshallable) -> Result<PacketHeader> {
        let header = self.read_header()?;
        let body = self.up.pop_fetch(header.body_len())?;
        let mut body = Unpack::new(body);
        msg.unmarshal(&mut body)?;
        Ok(header)
    }

    /// Read only the header. The cursor is left at the start of the body.
    pub fn read_header(&mut self) -> Result<PacketHeader> {
        let mut cursor = self.up.clone();
        let header = PacketHeader {
            length: cursor.pop_u16()?,
            main_cmd: cursor.pop_u16()?,
            sequence: cursor.pop_u32()?,
            sub_cmd: cursor.pop_u16()?,
            check_code: cursor.pop_u16()?,
        };
        if (header.length as usize) < HEADER_SIZE {
            return Err(WireError::BadLength { length: header.length });
        }
        self.up = cursor;
        Ok(header)
    }

    // ── peeks at a raw prefix ──

    pub fn peek_length(data: &[u8]) -> Option<u16> {
        peek_u16_at(data, OFF_LENGTH)
    }

    pub fn peek_main_cmd(data: &[u8]) -> Option<u16> {
        peek_u16_at(data, OFF_MAIN_CMD)
    }

    pub fn peek_sequence(data: &[u8]) -> Option<u32> {
        let bytes = data.get(OFF_SEQUENCE..OFF_SEQUENCE + 4)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn peek_sub_cmd(data: &[u8]) -> Option<u16> {
        peek_u16_at(data, OFF_SUB_CMD)
    }

    pub fn peek_check_code(data: &[u8]) -> Option<u16> {
        peek_u16_at(data, OFF_CHECK_CODE)
    }

    /// Classify an accumulated byte prefix.
    ///
    /// - `Ok(None)`: not a whole frame yet, wait for more bytes.
    /// - `Ok(Some(n))`: the first `n` bytes are one complete frame.
    /// - `Err(_)`: the prefix can never become a valid frame.
    pub fn frame_len(data: &[u8]) -> Result<Option<usize>> {
        let length = match Self::peek_length(data) {
            Some(len) => len,
            None => return Ok(None),
        };
        if (length as usize) < HEADER_SIZE {
            return Err(WireError::BadLength { length });
        }
        if data.len() < length as usize {
            return Ok(None);
        }
        Ok(Some(length as usize))
    }

    /// [`frame_len`](Self::frame_len) folded into a packet handler's return
    /// value: bytes consumed, 0 to wait, negative to reject.
    pub fn handler_verdict(data: &[u8]) -> isize {
        match Self::frame_len(data) {
            Ok(Some(n)) => n as isize,
            Ok(None) => 0,
            Err(_) => -1,
        }
    }
}

fn peek_u16_at(data: &[u8], at: usize) -> Option<u16> {
    let bytes = data.get(at..at + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::Varstr;

    #[test]
    fn test_round_trip_header_and_body() {
        let mut enc = Encoder::new();
        enc.set_main_cmd(MAIN_CMD_PAXOS).set_sequence(42).set_check_code(0);
        enc.serialize(7, &Varstr(b"hi".to_vec())).unwrap();

        // varstr "hi" = 2-byte prefix + 2 bytes.
        assert_eq!(enc.size(), HEADER_SIZE + 4);
        assert_eq!(enc.header().length as usize, enc.size());

        let mut body = Varstr::default();
        let header = Decoder::new(enc.data()).deserialize(&mut body).unwrap();
        assert_eq!(
            header,
            PacketHeader { length: 16, main_cmd: 1, sequence: 42, sub_cmd: 7, check_code: 0 }
        );
        assert_eq!(body.0, b"hi");
    }

    #[test]
    fn test_raw_body_length() {
        struct Raw(&'static [u8]);
        impl Marshallable for Raw {
            fn marshal(&self, p: &mut Pack) -> Result<()> {
                p.push_bytes(self.0).map(|_| ())
            }
            fn unmarshal(&mut self, _u: &mut Unpack<'_>) -> Result<()> {
                Ok(())
            }
        }

        let frame = encode_packet(1, 42, 7, 0, &Raw(b"hi")).unwrap();
        assert_eq!(frame.len(), 14);
        assert_eq!(
            &frame[..HEADER_SIZE],
            &[0, 14, 0, 1, 0, 0, 0, 42, 0, 7, 0, 0]
        );
        assert_eq!(&frame[HEADER_SIZE..], b"hi");
        assert_eq!(Decoder::peek_sequence(&frame), Some(42));
        assert_eq!(Decoder::peek_sub_cmd(&frame), Some(7));
    }

    #[test]
    fn test_too_large_rolls_back() {
        let mut enc = Encoder::new();
        let err = enc
            .serialize(1, &Varstr(vec![0u8; MAX_PACKET_SIZE - HEADER_SIZE]))
            .unwrap_err();
        assert_eq!(err, WireError::PacketTooLarge { size: MAX_PACKET_SIZE + 2 });
        assert_eq!(enc.size(), HEADER_SIZE);

        // Exactly at the limit is fine.
        enc.serialize(1, &Varstr(vec![0u8; MAX_PACKET_SIZE - HEADER_SIZE - 2])).unwrap();
        assert_eq!(enc.size(), MAX_PACKET_SIZE);
        assert_eq!(Decoder::peek_length(enc.data()), Some(0xFFFF));
    }

    #[test]
    fn test_frame_len_classification() {
        let frame = encode_packet(1, 1, 1, 0, &String::from("abc")).unwrap();
        assert_eq!(Decoder::frame_len(&frame[..1]).unwrap(), None);
        assert_eq!(Decoder::frame_len(&frame[..HEADER_SIZE]).unwrap(), None);
        assert_eq!(Decoder::frame_len(&frame).unwrap(), Some(frame.len()));

        let mut two = frame.clone();
        two.extend_from_slice(&frame);
        assert_eq!(Decoder::frame_len(&two).unwrap(), Some(frame.len()));
        assert_eq!(Decoder::handler_verdict(&two), frame.len() as isize);

        let bogus = [0u8, 3, 0, 0];
        assert_eq!(Decoder::frame_len(&bogus).unwrap_err(), WireError::BadLength { length: 3 });
        assert_eq!(Decoder::handler_verdict(&bogus), -1);
        assert_eq!(Decoder::handler_verdict(&[]), 0);
    }

    #[test]
    fn test_decoder_bounds_body() {
        let frame = encode_packet(1, 5, 2, 9, &7u32).unwrap();
        let mut joined = frame.clone();
        joined.extend_from_slice(&[0xAA; 8]);

        // A greedy message must not see the trailing bytes.
        let mut greedy = Vec::<u8>::new();
        struct Greedy<'b>(&'b mut Vec<u8>);
        impl Marshallable for Greedy<'_> {
            fn marshal(&self, _p: &mut Pack) -> Result<()> {
                Ok(())
            }
            fn unmarshal(&mut self, u: &mut Unpack<'_>) -> Result<()> {
                self.0.extend_from_slice(u.rest());
                Ok(())
            }
        }
        let header = Decoder::new(&joined).deserialize(&mut Greedy(&mut greedy)).unwrap();
        assert_eq!(header.check_code, 9);
        assert_eq!(greedy, vec![0, 0, 0, 7]);
    }

    #[test]
    fn test_truncated_frame_errors() {
        let frame = encode_packet(1, 5, 2, 0, &7u32).unwrap();
        let mut v = 0u32;
        let err = Decoder::new(&frame[..frame.len() - 1]).deserialize(&mut v).unwrap_err();
        assert!(matches!(err, WireError::NotEnoughData { .. }));
    }

    #[test]
    fn test_new_encoder_holds_blank_header() {
        let enc = Encoder::new();
        assert_eq!(enc.size(), HEADER_SIZE);
        assert_eq!(enc.data(), &[0u8; HEADER_SIZE]);
        assert!(enc.body().is_empty());
    }

    #[test]
    fn test_clear_resets() {
        let mut enc = Encoder::new();
        enc.set_sequence(3);
        enc.serialize(1, &1u8).unwrap();
        enc.clear();
        assert_eq!(enc.size(), HEADER_SIZE);
        assert_eq!(*enc.header(), PacketHeader::default());
    }
}
