//! Wire substrate for the Keel cluster protocol.
//!
//! Outgoing messages are built in fixed-size [`Segment`]s drawn from a shared
//! [`SegmentPool`] and chained together by a [`Writer`], so a message of any
//! size is assembled without ever resizing or copying one contiguous buffer.
//! Incoming bytes are parsed by a [`Reader`] that drives a protocol-specific
//! [`PhaseTable`]: each phase declares how many bytes it needs, and the reader
//! stops when starved and resumes on the next receive. The same driver runs
//! the RPC header ([`rpc`]), the streaming frame header ([`stream`]) and the
//! ledger record format in `keel-ledger`.
//!
//! Message bodies on inter-node links are encoded through a [`FieldPlan`]
//! negotiated at handshake. Fields the local node cannot interpret are walked
//! byte-for-byte and discarded, which keeps mixed-version clusters talking
//! during rolling upgrades.
//!
//! # Security
//!
//! Headers are read through `zerocopy` layouts. Bodies and stream payloads are
//! capped at 16 MB before any buffer is reserved for them.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod errors;
pub mod opcodes;
pub mod payloads;
pub mod plan;
pub mod reader;
pub mod rpc;
pub mod schema;
pub mod segment;
pub mod stream;
pub mod value;
pub mod writer;

pub use errors::{ProtocolError, Result};
pub use opcodes::{Opcode, OpcodeEntry, OpcodeRegistry, OpcodeRegistryBuilder, Scope};
pub use payloads::Payload;
pub use plan::{FieldPlan, PlanSet};
pub use reader::{PhaseTable, Reader, Step};
pub use rpc::{RpcFlags, RpcFrame, RpcHeader, RpcTable};
pub use schema::{BuiltinType, ContentTypeId, FieldDescriptor, MessageSchema, SchemaRegistry};
pub use segment::{Segment, SegmentChain, SegmentPool};
pub use stream::{StreamFrame, StreamOpcode, StreamTable};
pub use value::{ContentRef, Record, Value};
pub use writer::{Writer, WriterPool};

/// Largest RPC body or stream payload accepted from a peer.
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;
