//! Opcodes and the opcode registry.
//!
//! Opcodes below [`Opcode::APP_BASE`] belong to the session layer (handshake
//! and keepalive) and carry CBOR payloads. Everything from `APP_BASE` up is
//! an application message whose body is encoded with a field plan.
//!
//! The registry is built once through [`OpcodeRegistryBuilder`] and is
//! immutable afterwards; share it behind an `Arc`.

use std::{collections::HashMap, fmt};

use crate::{
    errors::{ProtocolError, Result},
    schema::ContentTypeId,
};

/// Numeric message tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Opcode(u16);

impl Opcode {
    /// Handshake initiation
    pub const HELLO: Self = Self(0x0001);
    /// Handshake response
    pub const HELLO_REPLY: Self = Self(0x0002);
    /// Keepalive probe
    pub const PING: Self = Self(0x0003);
    /// Keepalive answer
    pub const PONG: Self = Self(0x0004);
    /// Graceful disconnect
    pub const GOODBYE: Self = Self(0x0005);
    /// First application opcode
    pub const APP_BASE: Self = Self(0x0100);

    /// Wrap a raw opcode.
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// Raw value.
    pub const fn to_u16(self) -> u16 {
        self.0
    }

    /// True for handshake and keepalive opcodes.
    pub const fn is_session(self) -> bool {
        self.0 < Self::APP_BASE.0
    }
}

impl fmt::Debug for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::HELLO => f.write_str("Hello"),
            Self::HELLO_REPLY => f.write_str("HelloReply"),
            Self::PING => f.write_str("Ping"),
            Self::PONG => f.write_str("Pong"),
            Self::GOODBYE => f.write_str("Goodbye"),
            Self(raw) => write!(f, "Opcode({raw:#06x})"),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Which sessions may invoke an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Only authenticated inter-node links
    Cluster,
    /// Inter-node links and streaming clients
    Public,
}

/// Registration for one opcode.
#[derive(Debug, Clone)]
pub struct OpcodeEntry<H> {
    /// The opcode
    pub opcode: Opcode,
    /// Content type of the request body
    pub request_type: ContentTypeId,
    /// Content type of the response body
    pub response_type: ContentTypeId,
    /// Who may call it
    pub scope: Scope,
    /// Handler invoked for decoded requests
    pub handler: H,
}

/// Opcodes below this value are resolved through a direct array index.
pub const FAST_PATH_LIMIT: usize = 1024;

/// Collects registrations before the registry is frozen.
#[derive(Debug)]
pub struct OpcodeRegistryBuilder<H> {
    entries: Vec<OpcodeEntry<H>>,
}

impl<H> OpcodeRegistryBuilder<H> {
    /// Empty builder.
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Register `handler` for `opcode`.
    pub fn register(
        mut self,
        opcode: Opcode,
        request_type: ContentTypeId,
        response_type: ContentTypeId,
        scope: Scope,
        handler: H,
    ) -> Result<Self> {
        if self.entries.iter().any(|e| e.opcode == opcode) {
            return Err(ProtocolError::DuplicateOpcode(opcode.to_u16()));
        }
        self.entries.push(OpcodeEntry { opcode, request_type, response_type, scope, handler });
        Ok(self)
    }

    /// Freeze the registrations.
    pub fn build(self) -> OpcodeRegistry<H> {
        let mut fast = Vec::new();
        let mut slow = HashMap::new();

        for (index, entry) in self.entries.iter().enumerate() {
            let raw = usize::from(entry.opcode.to_u16());
            if raw < FAST_PATH_LIMIT {
                if fast.len() <= raw {
                    fast.resize(raw + 1, None);
                }
                fast[raw] = Some(index);
            } else {
                slow.insert(entry.opcode, index);
            }
        }

        OpcodeRegistry { entries: self.entries, fast, slow }
    }
}

impl<H> Default for OpcodeRegistryBuilder<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable opcode -> handler table.
#[derive(Debug)]
pub struct OpcodeRegistry<H> {
    entries: Vec<OpcodeEntry<H>>,
    fast: Vec<Option<usize>>,
    slow: HashMap<Opcode, usize>,
}

impl<H> OpcodeRegistry<H> {
    /// Start a registry.
    pub fn builder() -> OpcodeRegistryBuilder<H> {
        OpcodeRegistryBuilder::new()
    }

    /// Entry registered for `opcode`.
    pub fn get(&self, opcode: Opcode) -> Option<&OpcodeEntry<H>> {
        let raw = usize::from(opcode.to_u16());
        let index = if raw < FAST_PATH_LIMIT {
            self.fast.get(raw).copied().flatten()
        } else {
            self.slow.get(&opcode).copied()
        };
        index.and_then(|i| self.entries.get(i))
    }

    /// Entry for `opcode`, or `UnknownOpcode`.
    pub fn require(&self, opcode: Opcode) -> Result<&OpcodeEntry<H>> {
        self.get(opcode).ok_or(ProtocolError::UnknownOpcode(opcode.to_u16()))
    }

    /// All registrations in insertion order.
    pub fn entries(&self) -> &[OpcodeEntry<H>] {
        &self.entries
    }

    /// Number of registered opcodes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_uses_both_paths() {
        let registry = OpcodeRegistry::builder()
            .register(Opcode::new(0x0100), 1, 2, Scope::Cluster, "small")
            .unwrap()
            .register(Opcode::new(0x9000), 3, 4, Scope::Public, "large")
            .unwrap()
            .build();

        assert_eq!(registry.get(Opcode::new(0x0100)).map(|e| e.handler), Some("small"));
        assert_eq!(registry.get(Opcode::new(0x9000)).map(|e| e.handler), Some("large"));
        assert!(registry.get(Opcode::new(0x0101)).is_none());
        assert!(registry.get(Opcode::new(0x9001)).is_none());
    }

    #[test]
    fn duplicate_registration_fails() {
        let result = OpcodeRegistry::builder()
            .register(Opcode::new(0x0100), 1, 1, Scope::Cluster, ())
            .unwrap()
            .register(Opcode::new(0x0100), 1, 1, Scope::Cluster, ());
        assert!(matches!(result, Err(ProtocolError::DuplicateOpcode(0x0100))));
    }

    #[test]
    fn require_reports_unknown_opcode() {
        let registry: OpcodeRegistry<()> = OpcodeRegistry::builder().build();
        assert_eq!(registry.require(Opcode::new(7)).err(), Some(ProtocolError::UnknownOpcode(7)));
    }

    #[test]
    fn session_range() {
        assert!(Opcode::HELLO.is_session());
        assert!(!Opcode::APP_BASE.is_session());
    }
}
