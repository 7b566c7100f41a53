//! Message schemas, field descriptors and the local content-type registry.
//!
//! A field's type travels as a 16-bit code. Codes below
//! [`CONTENT_REF_BASE`] name builtin primitives; codes at or above it are
//! references to replicated content types (`code - CONTENT_REF_BASE`), encoded
//! on the wire as the referenced object's 64-bit id. Every descriptor also
//! declares its [`WireShape`], which is what lets a receiver walk past a field
//! whose type it has never heard of.
//!
//! Nested records are expressed with structural markers: a descriptor with
//! `descend` set opens a nested record of that content type under the
//! descriptor's name, and a descriptor with `ascend` set closes it. Markers
//! occupy no bytes on the wire.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::errors::{ProtocolError, Result};

/// Identifier of a replicated content type.
pub type ContentTypeId = u16;

/// First type code that refers to a content type.
pub const CONTENT_REF_BASE: u16 = 0x1000;

/// Builtin primitive field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u16)]
pub enum BuiltinType {
    /// One byte, 0 or 1
    Bool = 1,
    /// Unsigned byte
    U8 = 2,
    /// Signed 32-bit
    I32 = 3,
    /// Unsigned 32-bit
    U32 = 4,
    /// Signed 64-bit
    I64 = 5,
    /// Unsigned 64-bit
    U64 = 6,
    /// IEEE-754 double
    F64 = 7,
    /// Length-prefixed UTF-8
    Str = 8,
    /// Length-prefixed bytes
    Bytes = 9,
    /// Milliseconds since the Unix epoch
    Timestamp = 10,
}

impl BuiltinType {
    /// Builtin for a type code, if it is one.
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1 => Self::Bool,
            2 => Self::U8,
            3 => Self::I32,
            4 => Self::U32,
            5 => Self::I64,
            6 => Self::U64,
            7 => Self::F64,
            8 => Self::Str,
            9 => Self::Bytes,
            10 => Self::Timestamp,
            _ => return None,
        })
    }

    /// Type code on the wire.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// How the type is laid out on the wire.
    pub fn shape(self) -> WireShape {
        match self {
            Self::Bool | Self::U8 => WireShape::Fixed(1),
            Self::I32 | Self::U32 => WireShape::Fixed(4),
            Self::I64 | Self::U64 | Self::F64 | Self::Timestamp => WireShape::Fixed(8),
            Self::Str | Self::Bytes => WireShape::Prefixed,
        }
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::U8 => "u8",
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::F64 => "f64",
            Self::Str => "str",
            Self::Bytes => "bytes",
            Self::Timestamp => "timestamp",
        }
    }
}

/// Wire layout of a field, sufficient to skip it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireShape {
    /// Exactly this many bytes
    Fixed(u32),
    /// Big-endian `u32` length followed by that many bytes
    Prefixed,
}

/// Wire shape of a content reference (the object id).
pub const REF_SHAPE: WireShape = WireShape::Fixed(8);

/// One entry of a handshake-supplied field list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// Field name
    pub name: String,
    /// Builtin code or `CONTENT_REF_BASE + content type`
    pub type_code: u16,
    /// Layout on the wire
    pub shape: WireShape,
    /// Opens a nested record of this content type
    pub descend: Option<ContentTypeId>,
    /// Closes the innermost nested record
    pub ascend: bool,
}

impl FieldDescriptor {
    /// Descriptor for a builtin field.
    pub fn builtin(name: impl Into<String>, ty: BuiltinType) -> Self {
        Self { name: name.into(), type_code: ty.code(), shape: ty.shape(), descend: None, ascend: false }
    }

    /// Descriptor for a reference to a content type.
    ///
    /// Ids from `0x10000 - CONTENT_REF_BASE` up have no type code.
    pub fn reference(name: impl Into<String>, content_type: ContentTypeId) -> Result<Self> {
        let type_code = CONTENT_REF_BASE
            .checked_add(content_type)
            .ok_or(ProtocolError::UnreferenceableContentType(content_type))?;
        Ok(Self { name: name.into(), type_code, shape: REF_SHAPE, descend: None, ascend: false })
    }

    /// Marker opening a nested record.
    pub fn descend(name: impl Into<String>, content_type: ContentTypeId) -> Self {
        Self {
            name: name.into(),
            type_code: 0,
            shape: WireShape::Fixed(0),
            descend: Some(content_type),
            ascend: false,
        }
    }

    /// Marker closing a nested record.
    pub fn ascend() -> Self {
        Self { name: String::new(), type_code: 0, shape: WireShape::Fixed(0), descend: None, ascend: true }
    }

    /// True for descend/ascend markers.
    pub fn is_marker(&self) -> bool {
        self.descend.is_some() || self.ascend
    }
}

/// Field list describing the body of one opcode, exchanged at handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSchema {
    /// Opcode whose body this describes
    pub opcode: u16,
    /// Describes the response body rather than the request body
    pub response: bool,
    /// Content type of the body
    pub content_type: ContentTypeId,
    /// Fields in wire order
    pub fields: Vec<FieldDescriptor>,
}

/// Type of a field in a locally registered content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Builtin primitive
    Builtin(BuiltinType),
    /// Reference to another content type
    Ref(ContentTypeId),
    /// Nested record of another content type
    Nested(ContentTypeId),
}

/// A named field of a local content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalField {
    /// Field name
    pub name: String,
    /// Field type
    pub ty: FieldType,
}

/// A content type known to this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    /// Identifier shared across the cluster
    pub id: ContentTypeId,
    /// Display name
    pub name: String,
    /// Fields in wire order
    pub fields: Vec<LocalField>,
}

impl ContentType {
    /// Empty content type.
    pub fn new(id: ContentTypeId, name: impl Into<String>) -> Self {
        Self { id, name: name.into(), fields: Vec::new() }
    }

    /// Add a builtin field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, ty: BuiltinType) -> Self {
        self.fields.push(LocalField { name: name.into(), ty: FieldType::Builtin(ty) });
        self
    }

    /// Add a reference field.
    #[must_use]
    pub fn reference(mut self, name: impl Into<String>, target: ContentTypeId) -> Self {
        self.fields.push(LocalField { name: name.into(), ty: FieldType::Ref(target) });
        self
    }

    /// Add a nested record field.
    #[must_use]
    pub fn nested(mut self, name: impl Into<String>, target: ContentTypeId) -> Self {
        self.fields.push(LocalField { name: name.into(), ty: FieldType::Nested(target) });
        self
    }
}

/// Immutable set of content types known to this node.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    types: HashMap<ContentTypeId, ContentType>,
}

impl SchemaRegistry {
    /// Build a registry; fails if a nested or referenced type is missing.
    pub fn new(types: impl IntoIterator<Item = ContentType>) -> Result<Self> {
        let types: HashMap<_, _> = types.into_iter().map(|t| (t.id, t)).collect();

        for ty in types.values() {
            for field in &ty.fields {
                let target = match field.ty {
                    FieldType::Nested(target) => target,
                    FieldType::Ref(target) if CONTENT_REF_BASE.checked_add(target).is_none() => {
                        return Err(ProtocolError::UnreferenceableContentType(target));
                    },
                    FieldType::Ref(target) => target,
                    FieldType::Builtin(_) => continue,
                };
                if !types.contains_key(&target) {
                    return Err(ProtocolError::UnknownContentType(target));
                }
            }
        }

        Ok(Self { types })
    }

    /// True if `id` is registered.
    pub fn contains(&self, id: ContentTypeId) -> bool {
        self.types.contains_key(&id)
    }

    /// Content type by id.
    pub fn get(&self, id: ContentTypeId) -> Option<&ContentType> {
        self.types.get(&id)
    }

    /// Flatten a local content type into the descriptor list peers receive.
    pub fn describe(&self, id: ContentTypeId) -> Result<Vec<FieldDescriptor>> {
        let mut out = Vec::new();
        self.describe_into(id, &mut out, 0)?;
        Ok(out)
    }

    fn describe_into(&self, id: ContentTypeId, out: &mut Vec<FieldDescriptor>, depth: usize) -> Result<()> {
        // Nested types form a tree; anything deeper than this is a cycle.
        if depth > 32 {
            return Err(ProtocolError::UnbalancedPlan(format!("content type {id} nests too deeply")));
        }
        let ty = self.get(id).ok_or(ProtocolError::UnknownContentType(id))?;

        for field in &ty.fields {
            match field.ty {
                FieldType::Builtin(b) => out.push(FieldDescriptor::builtin(field.name.clone(), b)),
                FieldType::Ref(target) => out.push(FieldDescriptor::reference(field.name.clone(), target)?),
                FieldType::Nested(target) => {
                    out.push(FieldDescriptor::descend(field.name.clone(), target));
                    self.describe_into(target, out, depth + 1)?;
                    out.push(FieldDescriptor::ascend());
                },
            }
        }
        Ok(())
    }

    /// Schema announced to peers for one direction of `opcode`.
    pub fn message_schema(
        &self,
        opcode: u16,
        response: bool,
        content_type: ContentTypeId,
    ) -> Result<MessageSchema> {
        Ok(MessageSchema { opcode, response, content_type, fields: self.describe(content_type)? })
    }
}
