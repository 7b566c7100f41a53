//! Session payload types.
//!
//! These travel as CBOR bodies under the session opcodes, before and
//! alongside application traffic. Application bodies never use CBOR; they are
//! encoded with the field plans announced here.

use serde::{Deserialize, Serialize};

use crate::schema::MessageSchema;

/// Current link protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Handshake initiation
///
/// # Protocol Flow
///
/// Sent by the connecting node as the first frame on a link:
/// 1. Initiator signs `"{sender_id}=>{receiver_id}"` with the cluster key
/// 2. Initiator sends Hello carrying the signature and its message schemas
/// 3. Responder verifies the signature; a bad signature closes the link
/// 4. Responder compiles field plans from the schemas and answers with
///    [`HelloReply`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Link protocol version
    pub version: u8,

    /// Node id of the sender
    pub sender_id: u32,

    /// Node id the sender believes it is talking to
    pub receiver_id: u32,

    /// HMAC-SHA256 over `"{sender_id}=>{receiver_id}"`
    pub signature: Vec<u8>,

    /// Body layouts of every application message the sender emits
    pub schemas: Vec<MessageSchema>,
}

/// Handshake response
///
/// Carries the responder's own signature (with sender and receiver swapped)
/// so both ends authenticate each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloReply {
    /// Node id of the responder
    pub sender_id: u32,

    /// Node id of the initiator
    pub receiver_id: u32,

    /// Session id chosen by the responder
    pub session_id: u64,

    /// HMAC-SHA256 over `"{sender_id}=>{receiver_id}"`
    pub signature: Vec<u8>,

    /// Body layouts of every application message the responder emits
    pub schemas: Vec<MessageSchema>,
}

/// Graceful disconnect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goodbye {
    /// Reason for closing
    pub reason: String,
}
