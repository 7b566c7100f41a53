//! Protocol error types.

use thiserror::Error;

/// Result alias for wire-level operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while framing, parsing or encoding messages.
///
/// Every variant is a protocol fault: the connection that produced it is
/// closed by its owner. Schema skew (a field of unknown type) is deliberately
/// absent here because it is tolerated, not reported.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Declared body or payload length exceeds the configured maximum
    #[error("body of {size} bytes exceeds maximum of {max}")]
    BodyTooLarge {
        /// Declared size
        size: u64,
        /// Maximum accepted size
        max: usize,
    },

    /// Buffer is shorter than a fixed header layout
    #[error("header too short: expected {expected} bytes, got {actual}")]
    HeaderTooShort {
        /// Required length
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// No handler is registered for this opcode
    #[error("unknown opcode {0:#06x}")]
    UnknownOpcode(u16),

    /// Opcode registered twice while building a registry
    #[error("opcode {0:#06x} registered twice")]
    DuplicateOpcode(u16),

    /// Streaming frame declared a type other than binary or close
    #[error("unsupported stream opcode {0:#x}")]
    UnsupportedStreamOpcode(u8),

    /// Streaming frame without FIN, or with reserved bits set
    #[error("fragmented or extended stream frame (first byte {0:#04x})")]
    UnsupportedStreamFraming(u8),

    /// Client sent a frame without a mask key
    #[error("unmasked stream frame from client")]
    UnmaskedClientFrame,

    /// Field ran past the end of the message body
    #[error("field `{field}` truncated: needs {needed} bytes, {available} available")]
    Truncated {
        /// Field being decoded
        field: String,
        /// Bytes the field needs
        needed: usize,
        /// Bytes left in the body
        available: usize,
    },

    /// String field is not valid UTF-8
    #[error("field `{0}` is not valid UTF-8")]
    InvalidUtf8(String),

    /// Descend/ascend markers in a field list do not nest
    #[error("unbalanced field plan: {0}")]
    UnbalancedPlan(String),

    /// Peer declared a wire shape that contradicts a known builtin type
    #[error("field `{field}` declares shape {declared:?}, builtin needs {expected:?}")]
    ShapeMismatch {
        /// Field name
        field: String,
        /// Shape the peer declared
        declared: crate::schema::WireShape,
        /// Shape of the local builtin
        expected: crate::schema::WireShape,
    },

    /// Record value does not match the type the plan expects
    #[error("field `{field}` expects {expected}")]
    TypeMismatch {
        /// Field name
        field: String,
        /// Expected type
        expected: &'static str,
    },

    /// Content type referenced by a registration is unknown
    #[error("unknown content type {0}")]
    UnknownContentType(u16),

    /// Content type id too large to be carried as a reference type code
    #[error("content type {0} cannot be referenced")]
    UnreferenceableContentType(u16),

    /// CBOR payload could not be encoded
    #[error("payload encode failed: {0}")]
    PayloadEncode(String),

    /// CBOR payload could not be decoded
    #[error("payload decode failed: {0}")]
    PayloadDecode(String),

    /// Opcode does not carry a session payload
    #[error("opcode {0:#06x} does not carry a session payload")]
    NotSessionOpcode(u16),
}
