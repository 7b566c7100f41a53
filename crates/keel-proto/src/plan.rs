//! Field plans: schema-tolerant body encode/decode.
//!
//! A [`FieldPlan`] is compiled from a [`MessageSchema`] against the local
//! [`SchemaRegistry`]. Each descriptor becomes one [`PlanStep`]:
//!
//! - a builtin or a reference to a registered content type becomes a
//!   decodable [`PlanStep::Field`];
//! - a field of a type this node does not know becomes a [`PlanStep::Skip`]
//!   that consumes exactly the bytes its declared [`WireShape`] occupies;
//! - descend/ascend markers become [`PlanStep::Descend`]/[`PlanStep::Ascend`]
//!   around a nested record. A nested record of an unknown content type is
//!   skipped as a whole, field by field.
//!
//! Schema skew is therefore never an error: the reader stays aligned and the
//! next known field decodes normally. Only truncated input, invalid UTF-8 and
//! descriptors that contradict a builtin's own layout are rejected.

use std::collections::HashMap;

use bytes::Bytes;

use crate::{
    errors::{ProtocolError, Result},
    opcodes::Opcode,
    schema::{BuiltinType, CONTENT_REF_BASE, ContentTypeId, MessageSchema, REF_SHAPE, SchemaRegistry, WireShape},
    value::{ContentRef, Record, Value},
    writer::{Writer, WriterPool},
};

/// How a known field is read and written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldCodec {
    /// Builtin primitive
    Builtin(BuiltinType),
    /// 64-bit id of an object of this content type
    Ref(ContentTypeId),
}

impl FieldCodec {
    fn shape(self) -> WireShape {
        match self {
            Self::Builtin(ty) => ty.shape(),
            Self::Ref(_) => REF_SHAPE,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Builtin(ty) => ty.name(),
            Self::Ref(_) => "ref",
        }
    }
}

/// One compiled plan entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStep {
    /// Decode into the current record under `name`
    Field {
        /// Field name
        name: String,
        /// Codec
        codec: FieldCodec,
    },
    /// Walk past a field this node cannot interpret
    Skip {
        /// Field name, for diagnostics
        name: String,
        /// Bytes to consume
        shape: WireShape,
    },
    /// Open a nested record stored under `name`
    Descend {
        /// Field name of the nested record
        name: String,
        /// Content type of the nested record
        content_type: ContentTypeId,
    },
    /// Close the innermost nested record
    Ascend,
}

/// Compiled encode/decode plan for one message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPlan {
    content_type: ContentTypeId,
    steps: Vec<PlanStep>,
}

impl FieldPlan {
    /// Compile `schema` against the local registry.
    pub fn build(schema: &MessageSchema, registry: &SchemaRegistry) -> Result<Self> {
        let mut steps = Vec::with_capacity(schema.fields.len());
        // Open nested records we decode, and open ones we are skipping.
        let mut known_depth = 0usize;
        let mut hidden_depth = 0usize;

        for field in &schema.fields {
            if let Some(target) = field.descend {
                if hidden_depth > 0 || !registry.contains(target) {
                    hidden_depth += 1;
                } else {
                    known_depth += 1;
                    steps.push(PlanStep::Descend { name: field.name.clone(), content_type: target });
                }
                continue;
            }

            if field.ascend {
                if hidden_depth > 0 {
                    hidden_depth -= 1;
                } else if known_depth > 0 {
                    known_depth -= 1;
                    steps.push(PlanStep::Ascend);
                } else {
                    return Err(ProtocolError::UnbalancedPlan(format!(
                        "ascend without descend in opcode {:#06x}",
                        schema.opcode
                    )));
                }
                continue;
            }

            let codec = if hidden_depth > 0 { None } else { resolve(field.type_code, field.shape, &field.name, registry)? };
            match codec {
                Some(codec) => steps.push(PlanStep::Field { name: field.name.clone(), codec }),
                None => {
                    tracing::trace!(field = %field.name, type_code = field.type_code, "skipping unknown field type");
                    steps.push(PlanStep::Skip { name: field.name.clone(), shape: field.shape });
                },
            }
        }

        if known_depth + hidden_depth != 0 {
            return Err(ProtocolError::UnbalancedPlan(format!(
                "unterminated descend in opcode {:#06x}",
                schema.opcode
            )));
        }

        Ok(Self { content_type: schema.content_type, steps })
    }

    /// Plan for a locally registered content type.
    pub fn local(registry: &SchemaRegistry, opcode: Opcode, response: bool, content_type: ContentTypeId) -> Result<Self> {
        let schema = registry.message_schema(opcode.to_u16(), response, content_type)?;
        Self::build(&schema, registry)
    }

    /// Content type of the top-level record.
    pub fn content_type(&self) -> ContentTypeId {
        self.content_type
    }

    /// Compiled steps in wire order.
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    /// Number of fields this plan walks past without decoding.
    pub fn skipped_fields(&self) -> usize {
        self.steps.iter().filter(|s| matches!(s, PlanStep::Skip { .. })).count()
    }

    /// Decode a body into a record.
    pub fn decode(&self, body: &Bytes) -> Result<Record> {
        let mut cursor = Cursor { buf: body, pos: 0 };
        let mut parents: Vec<(String, Record)> = Vec::new();
        let mut current = Record::new(self.content_type);

        for step in &self.steps {
            match step {
                PlanStep::Field { name, codec } => {
                    let value = cursor.read_value(name, *codec)?;
                    current.set(name.clone(), value);
                },
                PlanStep::Skip { name, shape } => cursor.skip(name, *shape)?,
                PlanStep::Descend { name, content_type } => {
                    let parent = std::mem::replace(&mut current, Record::new(*content_type));
                    parents.push((name.clone(), parent));
                },
                PlanStep::Ascend => {
                    if let Some((name, parent)) = parents.pop() {
                        let child = std::mem::replace(&mut current, parent);
                        current.set(name, Value::Record(child));
                    }
                },
            }
        }

        if cursor.remaining() > 0 {
            tracing::debug!(trailing = cursor.remaining(), "ignoring trailing body bytes");
        }
        Ok(current)
    }

    /// Encode `record` into `writer`.
    ///
    /// Missing fields and skipped steps are written as zeros (or an empty
    /// prefixed value) so the body keeps the exact layout the plan declares.
    pub fn encode(&self, record: &Record, writer: &mut Writer) -> Result<()> {
        let empty = Record::new(0);
        let mut parents: Vec<&Record> = Vec::new();
        let mut current = record;

        for step in &self.steps {
            match step {
                PlanStep::Field { name, codec } => match current.get(name) {
                    Some(value) => write_value(writer, name, *codec, value)?,
                    None => write_default(writer, codec.shape()),
                },
                PlanStep::Skip { shape, .. } => write_default(writer, *shape),
                PlanStep::Descend { name, .. } => {
                    parents.push(current);
                    current = current.get(name).and_then(Value::as_record).unwrap_or(&empty);
                },
                PlanStep::Ascend => {
                    if let Some(parent) = parents.pop() {
                        current = parent;
                    }
                },
            }
        }
        Ok(())
    }

    /// Encode `record` into a writer drawn from `pool`.
    pub fn write(&self, record: &Record, pool: &WriterPool) -> Result<Writer> {
        let mut writer = pool.acquire();
        self.encode(record, &mut writer)?;
        Ok(writer)
    }
}

fn resolve(type_code: u16, shape: WireShape, name: &str, registry: &SchemaRegistry) -> Result<Option<FieldCodec>> {
    if let Some(ty) = BuiltinType::from_code(type_code) {
        if shape != ty.shape() {
            return Err(ProtocolError::ShapeMismatch { field: name.to_owned(), declared: shape, expected: ty.shape() });
        }
        return Ok(Some(FieldCodec::Builtin(ty)));
    }

    if type_code >= CONTENT_REF_BASE {
        let target = type_code - CONTENT_REF_BASE;
        if registry.contains(target) {
            if shape != REF_SHAPE {
                return Err(ProtocolError::ShapeMismatch { field: name.to_owned(), declared: shape, expected: REF_SHAPE });
            }
            return Ok(Some(FieldCodec::Ref(target)));
        }
    }

    Ok(None)
}

fn write_default(writer: &mut Writer, shape: WireShape) {
    match shape {
        WireShape::Fixed(n) => writer.put_zeros(n as usize),
        WireShape::Prefixed => writer.put_u32(0),
    }
}

fn write_value(writer: &mut Writer, name: &str, codec: FieldCodec, value: &Value) -> Result<()> {
    use BuiltinType as B;

    match (codec, value) {
        (FieldCodec::Builtin(B::Bool), Value::Bool(v)) => writer.put_bool(*v),
        (FieldCodec::Builtin(B::U8), Value::U8(v)) => writer.put_u8(*v),
        (FieldCodec::Builtin(B::I32), Value::I32(v)) => writer.put_i32(*v),
        (FieldCodec::Builtin(B::U32), Value::U32(v)) => writer.put_u32(*v),
        (FieldCodec::Builtin(B::I64), Value::I64(v)) => writer.put_i64(*v),
        (FieldCodec::Builtin(B::U64), Value::U64(v)) => writer.put_u64(*v),
        (FieldCodec::Builtin(B::F64), Value::F64(v)) => writer.put_f64(*v),
        (FieldCodec::Builtin(B::Str), Value::Str(v)) => writer.put_prefixed(v.as_bytes()),
        (FieldCodec::Builtin(B::Bytes), Value::Bytes(v)) => writer.put_prefixed(v),
        (FieldCodec::Builtin(B::Timestamp), Value::Timestamp(v)) => writer.put_u64(*v),
        (FieldCodec::Ref(target), Value::Ref(r)) if r.content_type == target => writer.put_u64(r.id),
        (FieldCodec::Ref(_), Value::U64(id)) => writer.put_u64(*id),
        _ => return Err(ProtocolError::TypeMismatch { field: name.to_owned(), expected: codec.name() }),
    }
    Ok(())
}

struct Cursor<'a> {
    buf: &'a Bytes,
    pos: usize,
}

impl Cursor<'_> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, field: &str, n: usize) -> Result<Bytes> {
        if self.remaining() < n {
            return Err(ProtocolError::Truncated {
                field: field.to_owned(),
                needed: n,
                available: self.remaining(),
            });
        }
        let out = self.buf.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self, field: &str) -> Result<[u8; N]> {
        let bytes = self.take(field, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&bytes);
        Ok(out)
    }

    fn take_prefixed(&mut self, field: &str) -> Result<Bytes> {
        let len = u32::from_be_bytes(self.take_array(field)?) as usize;
        self.take(field, len)
    }

    fn skip(&mut self, field: &str, shape: WireShape) -> Result<()> {
        match shape {
            WireShape::Fixed(n) => self.take(field, n as usize).map(drop),
            WireShape::Prefixed => self.take_prefixed(field).map(drop),
        }
    }

    fn read_value(&mut self, field: &str, codec: FieldCodec) -> Result<Value> {
        use BuiltinType as B;

        let ty = match codec {
            FieldCodec::Ref(content_type) => {
                let id = u64::from_be_bytes(self.take_array(field)?);
                return Ok(Value::Ref(ContentRef { content_type, id }));
            },
            FieldCodec::Builtin(ty) => ty,
        };

        Ok(match ty {
            B::Bool => Value::Bool(self.take_array::<1>(field)?[0] != 0),
            B::U8 => Value::U8(self.take_array::<1>(field)?[0]),
            B::I32 => Value::I32(i32::from_be_bytes(self.take_array(field)?)),
            B::U32 => Value::U32(u32::from_be_bytes(self.take_array(field)?)),
            B::I64 => Value::I64(i64::from_be_bytes(self.take_array(field)?)),
            B::U64 => Value::U64(u64::from_be_bytes(self.take_array(field)?)),
            B::F64 => Value::F64(f64::from_be_bytes(self.take_array(field)?)),
            B::Timestamp => Value::Timestamp(u64::from_be_bytes(self.take_array(field)?)),
            B::Bytes => Value::Bytes(self.take_prefixed(field)?),
            B::Str => {
                let raw = self.take_prefixed(field)?;
                let text = std::str::from_utf8(&raw).map_err(|_| ProtocolError::InvalidUtf8(field.to_owned()))?;
                Value::Str(text.to_owned())
            },
        })
    }
}

/// Key of a plan in a [`PlanSet`]: opcode plus direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlanKey {
    /// Opcode
    pub opcode: Opcode,
    /// True for response bodies
    pub response: bool,
}

/// Every plan negotiated with one peer.
#[derive(Debug, Clone, Default)]
pub struct PlanSet {
    plans: HashMap<PlanKey, FieldPlan>,
}

impl PlanSet {
    /// Compile a peer's handshake schemas against the local registry.
    pub fn negotiate(schemas: &[MessageSchema], registry: &SchemaRegistry) -> Result<Self> {
        let mut plans = HashMap::with_capacity(schemas.len());
        for schema in schemas {
            let plan = FieldPlan::build(schema, registry)?;
            if plan.skipped_fields() > 0 {
                tracing::debug!(
                    opcode = schema.opcode,
                    response = schema.response,
                    skipped = plan.skipped_fields(),
                    "peer schema contains fields unknown locally"
                );
            }
            plans.insert(PlanKey { opcode: Opcode::new(schema.opcode), response: schema.response }, plan);
        }
        Ok(Self { plans })
    }

    /// Plan for one direction of `opcode`.
    pub fn get(&self, opcode: Opcode, response: bool) -> Option<&FieldPlan> {
        self.plans.get(&PlanKey { opcode, response })
    }

    /// Plan for one direction of `opcode`, or `UnknownOpcode`.
    pub fn require(&self, opcode: Opcode, response: bool) -> Result<&FieldPlan> {
        self.get(opcode, response).ok_or(ProtocolError::UnknownOpcode(opcode.to_u16()))
    }

    /// Number of plans.
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    /// True if no plans were negotiated.
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}
