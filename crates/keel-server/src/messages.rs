//! Application messages served by a node.
//!
//! | Opcode | Name          | Scope   | Request                                   | Response            |
//! |--------|---------------|---------|-------------------------------------------|---------------------|
//! | 0x0100 | ReserveId     | Public  | table                                     | id                  |
//! | 0x0101 | AppendChange  | Public  | chain, table, object_id, payload, private | sequence, replicated|
//! | 0x0102 | Replicate     | Cluster | chain, sequence, timestamp, body          | accepted, expected  |
//!
//! Ledger bodies written by `AppendChange` are [`content::CHANGE`] records,
//! encoded with the same field plans as the wire bodies.

use keel_ledger::ChainKind;
use keel_proto::{
    BuiltinType, MessageSchema, Opcode, OpcodeRegistry, Record, Result, SchemaRegistry, Scope,
    Value, schema::ContentType,
};

use crate::handlers::Handler;

/// Reserve the next id of a data table.
pub const RESERVE_ID: Opcode = Opcode::new(0x0100);
/// Append a change record to a chain and replicate it.
pub const APPEND_CHANGE: Opcode = Opcode::new(0x0101);
/// Store a transaction replicated from a peer.
pub const REPLICATE: Opcode = Opcode::new(0x0102);

/// Content type ids.
pub mod content {
    use keel_proto::ContentTypeId;

    /// `ReserveId` request
    pub const RESERVE_ID_REQUEST: ContentTypeId = 1;
    /// `ReserveId` response
    pub const RESERVE_ID_RESPONSE: ContentTypeId = 2;
    /// `AppendChange` request
    pub const APPEND_REQUEST: ContentTypeId = 3;
    /// `AppendChange` response
    pub const APPEND_RESPONSE: ContentTypeId = 4;
    /// `Replicate` request
    pub const REPLICATE_REQUEST: ContentTypeId = 5;
    /// `Replicate` response
    pub const REPLICATE_RESPONSE: ContentTypeId = 6;
    /// Body of a ledger transaction
    pub const CHANGE: ContentTypeId = 7;
}

/// Content types this node understands.
pub fn registry() -> Result<SchemaRegistry> {
    use BuiltinType::{Bool, Bytes, Str, Timestamp, U8, U64};

    SchemaRegistry::new([
        ContentType::new(content::RESERVE_ID_REQUEST, "reserve_id_request").field("table", Str),
        ContentType::new(content::RESERVE_ID_RESPONSE, "reserve_id_response").field("id", U64),
        ContentType::new(content::APPEND_REQUEST, "append_request")
            .field("chain", U8)
            .field("table", Str)
            .field("object_id", U64)
            .field("payload", Bytes)
            .field("private_payload", Bytes),
        ContentType::new(content::APPEND_RESPONSE, "append_response")
            .field("sequence", U64)
            .field("replicated", Bool),
        ContentType::new(content::REPLICATE_REQUEST, "replicate_request")
            .field("chain", U8)
            .field("sequence", U64)
            .field("timestamp", Timestamp)
            .field("body", Bytes),
        ContentType::new(content::REPLICATE_RESPONSE, "replicate_response")
            .field("accepted", Bool)
            .field("expected", U64),
        ContentType::new(content::CHANGE, "change")
            .field("table", Str)
            .field("object_id", U64)
            .field("payload", Bytes),
    ])
}

/// Opcode table of a node.
pub fn handlers() -> Result<OpcodeRegistry<Handler>> {
    Ok(OpcodeRegistry::builder()
        .register(
            RESERVE_ID,
            content::RESERVE_ID_REQUEST,
            content::RESERVE_ID_RESPONSE,
            Scope::Public,
            Handler::ReserveId,
        )?
        .register(APPEND_CHANGE, content::APPEND_REQUEST, content::APPEND_RESPONSE, Scope::Public, Handler::AppendChange)?
        .register(REPLICATE, content::REPLICATE_REQUEST, content::REPLICATE_RESPONSE, Scope::Cluster, Handler::Replicate)?
        .build())
}

/// Request and response layouts announced at handshake.
pub fn announced_schemas(registry: &SchemaRegistry, handlers: &OpcodeRegistry<Handler>) -> Result<Vec<MessageSchema>> {
    let mut schemas = Vec::with_capacity(handlers.len() * 2);
    for entry in handlers.entries() {
        let opcode = entry.opcode.to_u16();
        schemas.push(registry.message_schema(opcode, false, entry.request_type)?);
        schemas.push(registry.message_schema(opcode, true, entry.response_type)?);
    }
    Ok(schemas)
}

/// Ledger body for a change to `object_id` of `table`.
pub fn change(table: &str, object_id: u64, payload: &[u8]) -> Record {
    Record::new(content::CHANGE)
        .with("table", Value::Str(table.to_owned()))
        .with("object_id", Value::U64(object_id))
        .with("payload", Value::Bytes(bytes::Bytes::copy_from_slice(payload)))
}

/// `AppendChange` request. `private_payload` is only stored for private chains.
pub fn append_change(chain: ChainKind, table: &str, object_id: u64, payload: &[u8], private_payload: &[u8]) -> Record {
    Record::new(content::APPEND_REQUEST)
        .with("chain", Value::U8(chain.to_u8()))
        .with("table", Value::Str(table.to_owned()))
        .with("object_id", Value::U64(object_id))
        .with("payload", Value::Bytes(bytes::Bytes::copy_from_slice(payload)))
        .with("private_payload", Value::Bytes(bytes::Bytes::copy_from_slice(private_payload)))
}

/// `ReserveId` request for `table`.
pub fn reserve_id(table: &str) -> Record {
    Record::new(content::RESERVE_ID_REQUEST).with("table", Value::Str(table.to_owned()))
}
