//! Server error types.

use std::{io, path::PathBuf};

use keel_core::{ClusterError, KeyError, LinkError};
use keel_ledger::LedgerError;
use keel_proto::{Opcode, ProtocolError};
use thiserror::Error;

/// Errors that end a node, a listener or a single connection.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket I/O failed
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// Malformed bytes on a connection
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The link state machine refused the peer
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// Cluster membership is unusable
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Ledger failed to load or write
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Handshake key is malformed
    #[error("handshake key: {0}")]
    Key(#[from] KeyError),

    /// Configuration file could not be read or parsed
    #[error("config error in {path}: {message}")]
    Config {
        /// File being read
        path: PathBuf,
        /// What went wrong
        message: String,
    },

    /// A streaming payload did not hold exactly one RPC frame
    #[error("stream payload holds {frames} frames and {trailing} trailing bytes")]
    MalformedStreamPayload {
        /// Complete frames found
        frames: usize,
        /// Bytes left over
        trailing: usize,
    },
}

/// Why a request handler refused a request. Sent back as an error response.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Required field absent or of the wrong type
    #[error("missing or mistyped field `{0}`")]
    MissingField(&'static str),

    /// Chain tag does not name a chain
    #[error("unknown chain {0}")]
    UnknownChain(u8),

    /// Encoded change would not fit in a replication request
    #[error("change of {size} bytes exceeds the {max} byte limit")]
    ChangeTooLarge {
        /// Encoded change size
        size: usize,
        /// Largest accepted change
        max: usize,
    },

    /// Opcode may only be called over an inter-node link
    #[error("opcode {0} is restricted to cluster links")]
    Forbidden(Opcode),

    /// Body could not be decoded or encoded
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Id assignment failed
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Ledger write failed
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Why a call to a peer produced no response record.
#[derive(Debug, Error)]
pub enum CallError {
    /// The link closed before the response arrived
    #[error("link to node {0} closed")]
    Closed(u32),

    /// No response within the call timeout
    #[error("call to node {peer} timed out after {elapsed_ms} ms")]
    Timeout {
        /// Peer called
        peer: u32,
        /// Time waited
        elapsed_ms: u64,
    },

    /// Peer answered with an error response
    #[error("node {peer} refused: {message}")]
    Remote {
        /// Peer called
        peer: u32,
        /// Error text from the peer
        message: String,
    },

    /// Peer answered a request under a different opcode
    #[error("node {peer} answered {sent} with {received}")]
    Mismatched {
        /// Peer called
        peer: u32,
        /// Opcode of the request
        sent: Opcode,
        /// Opcode of the response
        received: Opcode,
    },

    /// Request or response body did not match its plan
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
