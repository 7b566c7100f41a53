//! Streaming sub-protocol frames.
//!
//! Streaming clients speak the RFC 6455 framing with a fixed payload type:
//!
//! ```text
//!  byte 0          byte 1          (opt) 2 or 8 bytes   (opt) 4 bytes   payload
//! ┌─┬───┬────────┬─┬─────────────┬────────────────────┬───────────────┬─────────
//! │F│RSV│ opcode │M│   len (7)   │  extended length   │   mask key    │  ...
//! └─┴───┴────────┴─┴─────────────┴────────────────────┴───────────────┴─────────
//! ```
//!
//! Only unfragmented binary (0x2) and close (0x8) frames are accepted, and a
//! table reading client frames also requires every frame to be masked. The
//! table phases are: the leading byte pair, an optional 16- or 64-bit length,
//! an optional mask key, and the payload. A frame whose payload is empty is
//! emitted by whichever phase completes its header, and the reader re-arms
//! the leading-pair phase on its own.

use bytes::{Bytes, BytesMut};

use crate::{
    MAX_BODY_SIZE,
    errors::{ProtocolError, Result},
    reader::{PhaseTable, Step},
    writer::Writer,
};

const FIN: u8 = 0x80;
const RSV_MASK: u8 = 0x70;
const OPCODE_MASK: u8 = 0x0f;
const MASKED: u8 = 0x80;
const LEN_MASK: u8 = 0x7f;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

/// Payload types the stream protocol accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOpcode {
    /// Binary data
    Binary,
    /// Graceful close
    Close,
}

impl StreamOpcode {
    /// Parse a frame opcode nibble.
    pub fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            other => Err(ProtocolError::UnsupportedStreamOpcode(other)),
        }
    }

    /// Opcode nibble.
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Binary => 0x2,
            Self::Close => 0x8,
        }
    }
}

/// A complete, unmasked stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    /// Payload type
    pub opcode: StreamOpcode,
    /// Unmasked payload
    pub payload: Bytes,
}

/// Phases of the stream frame format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// FIN/opcode byte and mask/length byte
    Header,
    /// 16-bit extended length
    Length16,
    /// 64-bit extended length
    Length64,
    /// 4-byte mask key
    Mask,
    /// Payload bytes
    Payload,
}

/// Phase table for [`StreamFrame`]s.
#[derive(Debug, Clone)]
pub struct StreamTable {
    max_payload: usize,
    require_mask: bool,
    opcode: StreamOpcode,
    masked: bool,
    len: usize,
    mask: [u8; 4],
}

impl StreamTable {
    /// Table accepting payloads up to [`MAX_BODY_SIZE`].
    pub fn new() -> Self {
        Self::with_max_payload(MAX_BODY_SIZE)
    }

    /// Table accepting payloads up to `max_payload` bytes.
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { max_payload, require_mask: false, opcode: StreamOpcode::Binary, masked: false, len: 0, mask: [0; 4] }
    }

    /// Table for frames sent by clients: like [`StreamTable::new`], but an
    /// unmasked frame is a protocol error.
    pub fn from_clients() -> Self {
        Self { require_mask: true, ..Self::new() }
    }

    fn after_length(&mut self, len: u64) -> Result<Step<StreamPhase, StreamFrame>> {
        if len > self.max_payload as u64 {
            return Err(ProtocolError::BodyTooLarge { size: len, max: self.max_payload });
        }
        self.len = len as usize;
        if self.masked {
            return Ok(Step::advance(StreamPhase::Mask, 4));
        }
        Ok(self.after_mask())
    }

    fn after_mask(&self) -> Step<StreamPhase, StreamFrame> {
        if self.len == 0 {
            let frame = StreamFrame { opcode: self.opcode, payload: Bytes::new() };
            return Step::emit(StreamPhase::Header, 2, frame);
        }
        Step::advance(StreamPhase::Payload, self.len)
    }
}

impl Default for StreamTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTable for StreamTable {
    type Phase = StreamPhase;
    type Output = StreamFrame;
    type Error = ProtocolError;

    fn initial(&self) -> (StreamPhase, usize) {
        (StreamPhase::Header, 2)
    }

    fn step(&mut self, phase: StreamPhase, bytes: Bytes) -> Result<Step<StreamPhase, StreamFrame>> {
        match phase {
            StreamPhase::Header => {
                let (first, second) = (bytes[0], bytes[1]);
                if first & FIN == 0 || first & RSV_MASK != 0 {
                    return Err(ProtocolError::UnsupportedStreamFraming(first));
                }
                self.opcode = StreamOpcode::from_u8(first & OPCODE_MASK)?;
                self.masked = second & MASKED != 0;
                self.mask = [0; 4];
                if self.require_mask && !self.masked {
                    return Err(ProtocolError::UnmaskedClientFrame);
                }

                match second & LEN_MASK {
                    LEN_16 => Ok(Step::advance(StreamPhase::Length16, 2)),
                    LEN_64 => Ok(Step::advance(StreamPhase::Length64, 8)),
                    inline => self.after_length(u64::from(inline)),
                }
            },
            StreamPhase::Length16 => self.after_length(u64::from(u16::from_be_bytes([bytes[0], bytes[1]]))),
            StreamPhase::Length64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes);
                self.after_length(u64::from_be_bytes(raw))
            },
            StreamPhase::Mask => {
                self.mask.copy_from_slice(&bytes);
                Ok(self.after_mask())
            },
            StreamPhase::Payload => {
                let payload = if self.masked {
                    let mut buf = BytesMut::from(bytes.as_ref());
                    apply_mask(&mut buf, self.mask);
                    buf.freeze()
                } else {
                    bytes
                };
                let frame = StreamFrame { opcode: self.opcode, payload };
                Ok(Step::emit(StreamPhase::Header, 2, frame))
            },
        }
    }
}

/// XOR `buf` with the rotating 4-byte `mask`.
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b ^= mask[i % 4];
    }
}

fn write_header(writer: &mut Writer, opcode: StreamOpcode, len: usize, mask: Option<[u8; 4]>) {
    writer.put_u8(FIN | opcode.to_u8());
    let mask_bit = if mask.is_some() { MASKED } else { 0 };
    if len < usize::from(LEN_16) {
        writer.put_u8(mask_bit | len as u8);
    } else if let Ok(short) = u16::try_from(len) {
        writer.put_u8(mask_bit | LEN_16);
        writer.put_u16(short);
    } else {
        writer.put_u8(mask_bit | LEN_64);
        writer.put_u64(len as u64);
    }
    if let Some(key) = mask {
        writer.put_slice(&key);
    }
}

/// Append an unmasked binary frame (server to client).
pub fn write_binary_frame(writer: &mut Writer, payload: &[u8]) {
    write_header(writer, StreamOpcode::Binary, payload.len(), None);
    writer.put_slice(payload);
}

/// Append a masked binary frame (client to server).
pub fn write_masked_binary_frame(writer: &mut Writer, payload: &[u8], mask: [u8; 4]) {
    write_header(writer, StreamOpcode::Binary, payload.len(), Some(mask));
    let mut masked = payload.to_vec();
    apply_mask(&mut masked, mask);
    writer.put_slice(&masked);
}

/// Append an empty close frame.
pub fn write_close_frame(writer: &mut Writer) {
    write_header(writer, StreamOpcode::Close, 0, None);
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use proptest::prelude::*;

    use super::*;
    use crate::{reader::Reader, segment::SegmentPool};

    fn writer() -> Writer {
        Writer::new(SegmentPool::with_capacity(64))
    }

    #[test]
    fn masked_zero_length_frame_rearms_header_phase() {
        // FIN|binary, MASK|len 0, mask key; nothing after the key.
        let wire = hex!("82 80 11223344");
        let mut reader = Reader::new(StreamTable::new());
        let out = reader.feed(&wire).unwrap();

        assert_eq!(out, vec![StreamFrame { opcode: StreamOpcode::Binary, payload: Bytes::new() }]);
        assert_eq!(reader.phase(), StreamPhase::Header);
        assert_eq!(reader.needed(), 2);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn masked_payload_is_unmasked() {
        let mut w = writer();
        write_masked_binary_frame(&mut w, b"hello", [1, 2, 3, 4]);
        let out = Reader::new(StreamTable::new()).feed(&w.to_bytes()).unwrap();
        assert_eq!(out[0].payload.as_ref(), b"hello");
    }

    #[test]
    fn extended_lengths_are_chosen_by_size() {
        let mut w = writer();
        write_binary_frame(&mut w, &[7u8; 300]);
        let bytes = w.to_bytes();
        assert_eq!(&bytes[..4], &hex!("82 7e 012c"));

        let out = Reader::new(StreamTable::new()).feed(&bytes).unwrap();
        assert_eq!(out[0].payload.len(), 300);
    }

    #[test]
    fn text_frames_are_rejected() {
        let result = Reader::new(StreamTable::new()).feed(&hex!("81 00"));
        assert_eq!(result, Err(ProtocolError::UnsupportedStreamOpcode(0x1)));
    }

    #[test]
    fn fragmented_frames_are_rejected() {
        let result = Reader::new(StreamTable::new()).feed(&hex!("02 00"));
        assert_eq!(result, Err(ProtocolError::UnsupportedStreamFraming(0x02)));
    }

    #[test]
    fn client_frames_must_be_masked() {
        let mut w = writer();
        write_binary_frame(&mut w, b"hello");
        let unmasked = w.to_bytes();

        assert_eq!(Reader::new(StreamTable::from_clients()).feed(&unmasked), Err(ProtocolError::UnmaskedClientFrame));
        assert!(Reader::new(StreamTable::new()).feed(&unmasked).is_ok());

        let mut w = writer();
        write_masked_binary_frame(&mut w, b"hello", [9, 8, 7, 6]);
        let out = Reader::new(StreamTable::from_clients()).feed(&w.to_bytes()).unwrap();
        assert_eq!(out[0].payload.as_ref(), b"hello");
    }

    #[test]
    fn close_frame_is_emitted() {
        let mut w = writer();
        write_close_frame(&mut w);
        let out = Reader::new(StreamTable::new()).feed(&w.to_bytes()).unwrap();
        assert_eq!(out[0].opcode, StreamOpcode::Close);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let result = Reader::new(StreamTable::with_max_payload(100)).feed(&hex!("82 7e 0400"));
        assert!(matches!(result, Err(ProtocolError::BodyTooLarge { size: 1024, max: 100 })));
    }

    proptest! {
        #[test]
        fn masked_frames_survive_arbitrary_receive_boundaries(
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..200), 1..6),
            mask in any::<[u8; 4]>(),
            cut in 1usize..9,
        ) {
            let mut w = writer();
            for p in &payloads {
                write_masked_binary_frame(&mut w, p, mask);
            }
            let wire = w.to_bytes();

            let mut reader = Reader::new(StreamTable::new());
            let mut parsed = Vec::new();
            for chunk in wire.chunks(cut) {
                parsed.extend(reader.feed(chunk).unwrap());
            }

            let got: Vec<Vec<u8>> = parsed.into_iter().map(|f| f.payload.to_vec()).collect();
            prop_assert_eq!(got, payloads);
        }
    }
}
