//! Binary RPC framing.
//!
//! Every message on an inter-node link is a fixed 12-byte header followed by
//! `body_len` bytes of body:
//!
//! ```text
//! 0      2       3          4            8            12
//! ├──────┼───────┼──────────┼────────────┼────────────┼──── body ────
//! │opcode│ flags │ reserved │ request_id │  body_len  │
//! └──────┴───────┴──────────┴────────────┴────────────┘
//! ```
//!
//! All integers are big-endian. [`RpcTable`] is the two-phase table that
//! parses this format through the generic [`Reader`](crate::Reader).

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};
use zerocopy::{
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::{BigEndian, U16, U32},
};

use crate::{
    MAX_BODY_SIZE,
    errors::{ProtocolError, Result},
    opcodes::Opcode,
    reader::{PhaseTable, Step},
    writer::Writer,
};

bitflags! {
    /// Per-frame flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RpcFlags: u8 {
        /// Frame answers the request with the same id
        const RESPONSE = 0b0000_0001;
        /// Sender does not expect a response
        const NO_REPLY = 0b0000_0010;
        /// Response carries an error string instead of a record
        const ERROR = 0b0000_0100;
    }
}

/// Fixed RPC header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct RpcHeader {
    opcode: U16<BigEndian>,
    flags: u8,
    reserved: u8,
    request_id: U32<BigEndian>,
    body_len: U32<BigEndian>,
}

const _: () = assert!(std::mem::size_of::<RpcHeader>() == RpcHeader::SIZE);

impl RpcHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 12;

    /// Header for a body of `body_len` bytes.
    pub fn new(opcode: Opcode, flags: RpcFlags, request_id: u32, body_len: u32) -> Self {
        Self {
            opcode: U16::new(opcode.to_u16()),
            flags: flags.bits(),
            reserved: 0,
            request_id: U32::new(request_id),
            body_len: U32::new(body_len),
        }
    }

    /// Parse a header from the first [`Self::SIZE`] bytes of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let prefix = bytes.get(..Self::SIZE).ok_or(ProtocolError::HeaderTooShort {
            expected: Self::SIZE,
            actual: bytes.len(),
        })?;
        Self::read_from_bytes(prefix).map_err(|_| ProtocolError::HeaderTooShort {
            expected: Self::SIZE,
            actual: bytes.len(),
        })
    }

    /// Opcode of the message.
    pub fn opcode(&self) -> Opcode {
        Opcode::new(self.opcode.get())
    }

    /// Frame flags; unknown bits are dropped.
    pub fn flags(&self) -> RpcFlags {
        RpcFlags::from_bits_truncate(self.flags)
    }

    /// Correlation id.
    pub fn request_id(&self) -> u32 {
        self.request_id.get()
    }

    /// Body length in bytes.
    pub fn body_len(&self) -> u32 {
        self.body_len.get()
    }

    /// True if this frame answers an earlier request.
    pub fn is_response(&self) -> bool {
        self.flags().contains(RpcFlags::RESPONSE)
    }

    /// Raw header bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }
}

/// A complete RPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcFrame {
    /// Routing and correlation header
    pub header: RpcHeader,
    /// Message body
    pub body: Bytes,
}

impl RpcFrame {
    /// Frame with a header matching `body`.
    pub fn new(opcode: Opcode, flags: RpcFlags, request_id: u32, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        let header = RpcHeader::new(opcode, flags, request_id, body.len() as u32);
        Self { header, body }
    }

    /// Header and body in one contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(RpcHeader::SIZE + self.body.len());
        out.extend_from_slice(self.header.as_bytes());
        out.extend_from_slice(&self.body);
        out.freeze()
    }

    /// Append header and body to a writer.
    pub fn write_to(&self, writer: &mut Writer) {
        writer.put_slice(self.header.as_bytes());
        writer.put_slice(&self.body);
    }
}

/// Write a header followed by an already-serialized body writer.
pub fn write_frame(out: &mut Writer, opcode: Opcode, flags: RpcFlags, request_id: u32, body: &Writer) {
    let header = RpcHeader::new(opcode, flags, request_id, body.len() as u32);
    out.put_slice(header.as_bytes());
    for chunk in body.chunks() {
        out.put_slice(chunk);
    }
}

/// Phases of the RPC format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcPhase {
    /// Waiting for the fixed header
    Header,
    /// Waiting for the body announced by the header
    Body,
}

/// Phase table for [`RpcFrame`]s.
#[derive(Debug, Clone)]
pub struct RpcTable {
    max_body: usize,
    current: RpcHeader,
}

impl RpcTable {
    /// Table accepting bodies up to [`MAX_BODY_SIZE`].
    pub fn new() -> Self {
        Self::with_max_body(MAX_BODY_SIZE)
    }

    /// Table accepting bodies up to `max_body` bytes.
    pub fn with_max_body(max_body: usize) -> Self {
        Self { max_body, current: RpcHeader::new_zeroed() }
    }
}

impl Default for RpcTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTable for RpcTable {
    type Phase = RpcPhase;
    type Output = RpcFrame;
    type Error = ProtocolError;

    fn initial(&self) -> (RpcPhase, usize) {
        (RpcPhase::Header, RpcHeader::SIZE)
    }

    fn step(&mut self, phase: RpcPhase, bytes: Bytes) -> Result<Step<RpcPhase, RpcFrame>> {
        match phase {
            RpcPhase::Header => {
                let header = RpcHeader::from_bytes(&bytes)?;
                let len = header.body_len() as usize;
                if len > self.max_body {
                    return Err(ProtocolError::BodyTooLarge { size: len as u64, max: self.max_body });
                }

                if len == 0 {
                    let frame = RpcFrame { header, body: Bytes::new() };
                    return Ok(Step::emit(RpcPhase::Header, RpcHeader::SIZE, frame));
                }

                self.current = header;
                Ok(Step::advance(RpcPhase::Body, len))
            },
            RpcPhase::Body => {
                let frame = RpcFrame { header: self.current, body: bytes };
                Ok(Step::emit(RpcPhase::Header, RpcHeader::SIZE, frame))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use proptest::prelude::*;

    use super::*;
    use crate::reader::Reader;

    #[test]
    fn header_layout_is_big_endian() {
        let header = RpcHeader::new(Opcode::new(0x0102), RpcFlags::RESPONSE, 0x0304_0506, 7);
        assert_eq!(header.to_bytes(), hex!("0102 01 00 03040506 00000007"));
    }

    #[test]
    fn header_round_trips_fields() {
        let bytes = hex!("0100 02 00 0000002a 00000003");
        let header = RpcHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.opcode(), Opcode::new(0x0100));
        assert_eq!(header.flags(), RpcFlags::NO_REPLY);
        assert_eq!(header.request_id(), 42);
        assert_eq!(header.body_len(), 3);
    }

    #[test]
    fn short_header_is_rejected() {
        let result = RpcHeader::from_bytes(&[0u8; 5]);
        assert_eq!(result, Err(ProtocolError::HeaderTooShort { expected: 12, actual: 5 }));
    }

    #[test]
    fn empty_body_rearms_header_phase() {
        let frame = RpcFrame::new(Opcode::PING, RpcFlags::empty(), 1, Bytes::new());
        let mut reader = Reader::new(RpcTable::new());
        let out = reader.feed(&frame.encode()).unwrap();
        assert_eq!(out, vec![frame]);
        assert_eq!(reader.phase(), RpcPhase::Header);
    }

    #[test]
    fn oversized_body_is_rejected_before_buffering() {
        let header = RpcHeader::new(Opcode::new(0x0100), RpcFlags::empty(), 0, 1024);
        let mut reader = Reader::new(RpcTable::with_max_body(512));
        let result = reader.feed(header.as_bytes());
        assert!(matches!(result, Err(ProtocolError::BodyTooLarge { size: 1024, max: 512 })));
    }

    proptest! {
        #[test]
        fn frames_survive_arbitrary_receive_boundaries(
            bodies in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 1..8),
            cut in 1usize..17,
        ) {
            let frames: Vec<RpcFrame> = bodies
                .into_iter()
                .enumerate()
                .map(|(i, body)| RpcFrame::new(Opcode::new(0x0100), RpcFlags::empty(), i as u32, body))
                .collect();
            let wire: Vec<u8> = frames.iter().flat_map(|f| f.encode().to_vec()).collect();

            let mut reader = Reader::new(RpcTable::new());
            let mut parsed = Vec::new();
            for chunk in wire.chunks(cut) {
                parsed.extend(reader.feed(chunk).unwrap());
            }

            prop_assert_eq!(parsed, frames);
            prop_assert_eq!(reader.buffered(), 0);
        }
    }
}
