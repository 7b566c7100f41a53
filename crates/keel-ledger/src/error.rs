//! Ledger error types.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::chain::ChainKind;

/// Errors raised by chain storage.
///
/// Any error during [`Ledger::load`](crate::Ledger::load) is fatal to startup.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Filesystem failure
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Stored checksum does not match the record body
    #[error("{chain:?} chain corrupt at offset {offset}: crc {stored:#010x} != {computed:#010x}")]
    Corrupt {
        /// Chain
        chain: ChainKind,
        /// Byte offset of the record
        offset: u64,
        /// Checksum in the header
        stored: u32,
        /// Checksum of the body
        computed: u32,
    },

    /// File ends inside a record
    #[error("{chain:?} chain ends inside a record at offset {offset} ({partial} bytes)")]
    TruncatedTail {
        /// Chain
        chain: ChainKind,
        /// Offset of the partial record
        offset: u64,
        /// Bytes present
        partial: usize,
    },

    /// Record body exceeds the size limit
    #[error("{chain:?} record at offset {offset} declares {len} bytes")]
    RecordTooLarge {
        /// Chain
        chain: ChainKind,
        /// Offset of the record
        offset: u64,
        /// Declared body length
        len: u64,
    },

    /// Sequence numbers are not contiguous
    #[error("{chain:?} chain expected sequence {expected}, got {actual}")]
    SequenceGap {
        /// Chain
        chain: ChainKind,
        /// Next sequence the chain accepts
        expected: u64,
        /// Sequence presented
        actual: u64,
    },

    /// A replicated transaction disagrees with the one stored at its sequence
    #[error("{chain:?} chain already holds a different transaction at sequence {sequence}: crc {stored:#010x} != {incoming:#010x}")]
    Conflict {
        /// Chain
        chain: ChainKind,
        /// Sequence both claim
        sequence: u64,
        /// Checksum of the stored body
        stored: u32,
        /// Checksum of the incoming body
        incoming: u32,
    },

    /// An earlier write failed and could not be undone
    #[error("{0:?} chain refuses appends after a failed write")]
    Poisoned(ChainKind),

    /// Paired append was asked of a chain with no base
    #[error("{0:?} chain has no base chain")]
    NoBaseChain(ChainKind),
}

impl LedgerError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}
