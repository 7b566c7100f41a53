//! Ledger record format.
//!
//! ```text
//! 0          4       8            16           24
//! ├──────────┼───────┼────────────┼────────────┼──── body ────
//! │ body_len │  crc  │  sequence  │ timestamp  │
//! └──────────┴───────┴────────────┴────────────┘
//! ```
//!
//! Big-endian, CRC-32 over the body only. Sequences start at 1 and are
//! contiguous within a chain.

use bytes::{Bytes, BytesMut};
use keel_proto::{MAX_BODY_SIZE, PhaseTable, Step};
use zerocopy::{
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::{BigEndian, U32, U64},
};

use crate::{chain::ChainKind, error::LedgerError};

/// Fixed record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct RecordHeader {
    body_len: U32<BigEndian>,
    crc: U32<BigEndian>,
    sequence: U64<BigEndian>,
    timestamp: U64<BigEndian>,
}

const _: () = assert!(std::mem::size_of::<RecordHeader>() == RecordHeader::SIZE);

impl RecordHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 24;

    /// Header describing `tx`, or `None` if its body is too large to store.
    pub fn for_transaction(tx: &Transaction) -> Option<Self> {
        let body_len = u32::try_from(tx.body.len()).ok().filter(|&len| len as usize <= MAX_BODY_SIZE)?;
        Some(Self {
            body_len: U32::new(body_len),
            crc: U32::new(crc32fast::hash(&tx.body)),
            sequence: U64::new(tx.sequence),
            timestamp: U64::new(tx.timestamp),
        })
    }

    /// Body length.
    pub fn body_len(&self) -> u32 {
        self.body_len.get()
    }

    /// Stored checksum.
    pub fn crc(&self) -> u32 {
        self.crc.get()
    }

    /// Sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence.get()
    }

    /// Timestamp, milliseconds since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp.get()
    }
}

/// One transaction of a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Position in the chain, from 1
    pub sequence: u64,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    /// Opaque body
    pub body: Bytes,
}

impl Transaction {
    /// Header and body as stored on disk. `None` if the body exceeds
    /// `MAX_BODY_SIZE`.
    pub fn encode(&self) -> Option<Bytes> {
        let header = RecordHeader::for_transaction(self)?;
        let mut out = BytesMut::with_capacity(RecordHeader::SIZE + self.body.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.body);
        Some(out.freeze())
    }

    /// Bytes this transaction occupies on disk.
    pub fn encoded_len(&self) -> usize {
        RecordHeader::SIZE + self.body.len()
    }
}

/// Phases of the record format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordPhase {
    /// Waiting for the fixed header
    Header,
    /// Waiting for the body
    Body,
}

/// Phase table for chain records.
#[derive(Debug, Clone)]
pub struct RecordTable {
    chain: ChainKind,
    /// File offset of the record being parsed
    offset: u64,
    current: RecordHeader,
}

impl RecordTable {
    /// Table for records of `chain`, starting at file offset `offset`.
    pub fn new(chain: ChainKind, offset: u64) -> Self {
        Self { chain, offset, current: RecordHeader::new_zeroed() }
    }

    /// File offset of the next record to complete.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn finish(&mut self, body: Bytes) -> Result<Step<RecordPhase, Transaction>, LedgerError> {
        let computed = crc32fast::hash(&body);
        if computed != self.current.crc() {
            return Err(LedgerError::Corrupt {
                chain: self.chain,
                offset: self.offset,
                stored: self.current.crc(),
                computed,
            });
        }

        let tx = Transaction { sequence: self.current.sequence(), timestamp: self.current.timestamp(), body };
        self.offset += tx.encoded_len() as u64;
        Ok(Step::emit(RecordPhase::Header, RecordHeader::SIZE, tx))
    }
}

impl PhaseTable for RecordTable {
    type Phase = RecordPhase;
    type Output = Transaction;
    type Error = LedgerError;

    fn initial(&self) -> (RecordPhase, usize) {
        (RecordPhase::Header, RecordHeader::SIZE)
    }

    fn step(&mut self, phase: RecordPhase, bytes: Bytes) -> Result<Step<RecordPhase, Transaction>, LedgerError> {
        match phase {
            RecordPhase::Header => {
                let header = RecordHeader::read_from_bytes(&bytes).map_err(|_| LedgerError::TruncatedTail {
                    chain: self.chain,
                    offset: self.offset,
                    partial: bytes.len(),
                })?;
                let len = header.body_len() as usize;
                if len > MAX_BODY_SIZE {
                    return Err(LedgerError::RecordTooLarge { chain: self.chain, offset: self.offset, len: len as u64 });
                }

                self.current = header;
                if len == 0 {
                    return self.finish(Bytes::new());
                }
                Ok(Step::advance(RecordPhase::Body, len))
            },
            RecordPhase::Body => self.finish(bytes),
        }
    }
}
