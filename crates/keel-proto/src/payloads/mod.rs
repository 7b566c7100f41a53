//! Session payloads.
//!
//! Session opcodes (below [`Opcode::APP_BASE`]) carry CBOR-encoded bodies.
//! [`Payload`] maps between those bodies and typed messages.

pub mod session;

pub use session::{Goodbye, Hello, HelloReply, PROTOCOL_VERSION};

use crate::{
    errors::{ProtocolError, Result},
    opcodes::Opcode,
    rpc::{RpcFlags, RpcFrame},
};

/// A decoded session message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Handshake initiation
    Hello(Hello),
    /// Handshake response
    HelloReply(HelloReply),
    /// Keepalive probe
    Ping,
    /// Keepalive answer
    Pong,
    /// Graceful disconnect
    Goodbye(Goodbye),
}

impl Payload {
    /// Opcode this payload travels under.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Hello(_) => Opcode::HELLO,
            Self::HelloReply(_) => Opcode::HELLO_REPLY,
            Self::Ping => Opcode::PING,
            Self::Pong => Opcode::PONG,
            Self::Goodbye(_) => Opcode::GOODBYE,
        }
    }

    /// Serialize into a frame. Keepalives have empty bodies.
    pub fn to_frame(&self, request_id: u32) -> Result<RpcFrame> {
        let body = match self {
            Self::Hello(p) => encode(p)?,
            Self::HelloReply(p) => encode(p)?,
            Self::Goodbye(p) => encode(p)?,
            Self::Ping | Self::Pong => Vec::new(),
        };
        Ok(RpcFrame::new(self.opcode(), RpcFlags::NO_REPLY, request_id, body))
    }

    /// Parse the body of a session frame.
    pub fn from_frame(frame: &RpcFrame) -> Result<Self> {
        let body = frame.body.as_ref();
        match frame.header.opcode() {
            Opcode::HELLO => Ok(Self::Hello(decode(body)?)),
            Opcode::HELLO_REPLY => Ok(Self::HelloReply(decode(body)?)),
            Opcode::PING => Ok(Self::Ping),
            Opcode::PONG => Ok(Self::Pong),
            Opcode::GOODBYE => Ok(Self::Goodbye(decode(body)?)),
            other => Err(ProtocolError::NotSessionOpcode(other.to_u16())),
        }
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).map_err(|e| ProtocolError::PayloadEncode(e.to_string()))?;
    Ok(out)
}

fn decode<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T> {
    ciborium::de::from_reader(body).map_err(|e| ProtocolError::PayloadDecode(e.to_string()))
}
