//! Error types for link and cluster logic.

use keel_proto::{Opcode, ProtocolError};
use thiserror::Error;

use crate::link::LinkState;

/// Errors raised by the link state machine.
///
/// Every variant ends the link; the driver closes the transport and drains
/// the link's request table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// Operation is not valid in the current state
    #[error("invalid state {state:?} for operation {operation}")]
    InvalidState {
        /// Current state
        state: LinkState,
        /// Attempted operation
        operation: String,
    },

    /// Peer sent a message that makes no sense in this state
    #[error("unexpected {opcode:?} in state {state:?}")]
    UnexpectedPayload {
        /// Current state
        state: LinkState,
        /// Offending opcode
        opcode: Opcode,
    },

    /// Handshake signature did not verify
    #[error("handshake signature from node {sender} to node {receiver} is invalid")]
    BadSignature {
        /// Claimed sender
        sender: u32,
        /// Claimed receiver
        receiver: u32,
    },

    /// Handshake names a different node than expected
    #[error("handshake identity mismatch: expected node {expected}, got {actual}")]
    WrongPeer {
        /// Node this link expects
        expected: u32,
        /// Node the handshake names
        actual: u32,
    },

    /// Peer speaks a different link protocol version
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Malformed payload or schema
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Errors in cluster membership or stripe configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    /// Stripe count must be positive
    #[error("stripe count must be at least 1")]
    ZeroStripeCount,

    /// A stripe id is not below the stripe count
    #[error("stripe {stripe} out of range for {stripe_count} stripes")]
    StripeOutOfRange {
        /// Offending stripe
        stripe: u32,
        /// Configured stripe count
        stripe_count: u32,
    },

    /// Two nodes claim the same stripe
    #[error("stripe {stripe} owned by both node {first} and node {second}")]
    StripeOverlap {
        /// Contested stripe
        stripe: u32,
        /// First claimant
        first: u32,
        /// Second claimant
        second: u32,
    },

    /// A node id appears twice
    #[error("node {0} listed twice")]
    DuplicateNode(u32),

    /// Node id not present in the cluster map
    #[error("unknown node {0}")]
    UnknownNode(u32),

    /// An assigner was configured without stripes
    #[error("no stripes owned")]
    NoStripes,

    /// The next id in a stripe would overflow
    #[error("id space exhausted in stripe {0}")]
    IdSpaceExhausted(u32),
}

/// Errors loading the handshake key.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KeyError {
    /// Key text is not valid hex
    #[error("handshake key is not hex: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Key material was rejected by the MAC
    #[error("handshake key has invalid length")]
    Length,

    /// Key is empty
    #[error("handshake key is empty")]
    Empty,
}
