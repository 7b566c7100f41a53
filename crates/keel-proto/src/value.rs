//! Decoded field values.

use bytes::Bytes;

use crate::schema::{BuiltinType, ContentTypeId};

/// Reference to a replicated object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentRef {
    /// Content type of the target
    pub content_type: ContentTypeId,
    /// Object id
    pub id: u64,
}

/// A single field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `bool`
    Bool(bool),
    /// `u8`
    U8(u8),
    /// `i32`
    I32(i32),
    /// `u32`
    U32(u32),
    /// `i64`
    I64(i64),
    /// `u64`
    U64(u64),
    /// `f64`
    F64(f64),
    /// UTF-8 string
    Str(String),
    /// Opaque bytes
    Bytes(Bytes),
    /// Milliseconds since the Unix epoch
    Timestamp(u64),
    /// Reference to another object
    Ref(ContentRef),
    /// Nested record
    Record(Record),
}

impl Value {
    /// Builtin type this value encodes as, if it is a primitive.
    pub fn builtin(&self) -> Option<BuiltinType> {
        Some(match self {
            Self::Bool(_) => BuiltinType::Bool,
            Self::U8(_) => BuiltinType::U8,
            Self::I32(_) => BuiltinType::I32,
            Self::U32(_) => BuiltinType::U32,
            Self::I64(_) => BuiltinType::I64,
            Self::U64(_) => BuiltinType::U64,
            Self::F64(_) => BuiltinType::F64,
            Self::Str(_) => BuiltinType::Str,
            Self::Bytes(_) => BuiltinType::Bytes,
            Self::Timestamp(_) => BuiltinType::Timestamp,
            Self::Ref(_) | Self::Record(_) => return None,
        })
    }

    /// Unsigned integer view of integral values.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::U8(v) => Some(u64::from(v)),
            Self::U32(v) => Some(u64::from(v)),
            Self::U64(v) | Self::Timestamp(v) => Some(v),
            Self::I32(v) => u64::try_from(v).ok(),
            Self::I64(v) => u64::try_from(v).ok(),
            Self::Ref(r) => Some(r.id),
            _ => None,
        }
    }

    /// String view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Byte view of `Bytes` and `Str` values.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            Self::Str(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Boolean view.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Nested record view.
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Self::Record(r) => Some(r),
            _ => None,
        }
    }
}

/// An ordered set of named values of one content type.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    content_type: ContentTypeId,
    fields: Vec<(String, Value)>,
}

impl Record {
    /// Empty record.
    pub fn new(content_type: ContentTypeId) -> Self {
        Self { content_type, fields: Vec::new() }
    }

    /// Content type of this record.
    pub fn content_type(&self) -> ContentTypeId {
        self.content_type
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set(name, value);
        self
    }

    /// Insert or replace a field.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
    }

    /// Field by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_existing_field() {
        let mut record = Record::new(1).with("a", Value::U32(1));
        record.set("a", Value::U32(2));
        assert_eq!(record.len(), 1);
        assert_eq!(record.get("a"), Some(&Value::U32(2)));
    }

    #[test]
    fn negative_integers_have_no_unsigned_view() {
        assert_eq!(Value::I64(-1).as_u64(), None);
        assert_eq!(Value::I32(7).as_u64(), Some(7));
    }
}
