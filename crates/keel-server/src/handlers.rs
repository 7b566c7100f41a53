//! Request handlers.

use std::sync::Arc;

use bytes::Bytes;
use keel_core::Environment;
use keel_ledger::{ChainKind, LedgerError, Transaction};
use keel_proto::{ContentRef, Record, Value};

use crate::{
    error::HandlerError,
    messages::content,
    node::Node,
};

/// What a registered opcode does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    /// Hand out the next id of a data table from this node's stripes
    ReserveId,
    /// Append a change to a chain and replicate it to every connected peer
    AppendChange,
    /// Store a transaction a peer appended
    Replicate,
}

impl Handler {
    /// Run the handler against a decoded request.
    pub async fn call<E: Environment>(self, node: &Arc<Node<E>>, request: &Record) -> Result<Record, HandlerError> {
        match self {
            Self::ReserveId => reserve_id(node, request),
            Self::AppendChange => append_change(node, request).await,
            Self::Replicate => replicate(node, request),
        }
    }
}

fn reserve_id<E: Environment>(node: &Node<E>, request: &Record) -> Result<Record, HandlerError> {
    let table = str_field(request, "table")?;
    let id = node.assigner().assign(table)?;
    Ok(Record::new(content::RESERVE_ID_RESPONSE).with("id", Value::U64(id)))
}

async fn append_change<E: Environment>(node: &Arc<Node<E>>, request: &Record) -> Result<Record, HandlerError> {
    let kind = chain_field(request)?;
    let table = str_field(request, "table")?;
    let object_id = u64_field(request, "object_id")?;
    let timestamp = node.env().wall_clock_millis();

    let public = change_body(node, table, object_id, &bytes_field(request, "payload")?)?;
    let appended = match kind.base() {
        Some(base) => {
            let private = change_body(node, table, object_id, &bytes_field(request, "private_payload")?)?;
            let (shared, sensitive) = node.ledger().append_pair(kind, timestamp, public, private)?;
            vec![(base, shared), (kind, sensitive)]
        },
        None => vec![(kind, node.ledger().append(kind, timestamp, public)?)],
    };

    let sequence = appended.last().map_or(0, |(_, tx)| tx.sequence);
    let object = ContentRef { content_type: content::CHANGE, id: object_id };
    let replicated = node.replicate(appended, timestamp, Some(object)).await;

    Ok(Record::new(content::APPEND_RESPONSE)
        .with("sequence", Value::U64(sequence))
        .with("replicated", Value::Bool(replicated)))
}

/// Encoded change, refused if it could not be replicated in one request.
fn change_body<E: Environment>(node: &Node<E>, table: &str, object_id: u64, payload: &[u8]) -> Result<Bytes, HandlerError> {
    let body = node.encode_change(table, object_id, payload)?;
    let max = node.max_change_body();
    if body.len() > max {
        return Err(HandlerError::ChangeTooLarge { size: body.len(), max });
    }
    Ok(body)
}

fn replicate<E: Environment>(node: &Node<E>, request: &Record) -> Result<Record, HandlerError> {
    let kind = chain_field(request)?;
    let tx = Transaction {
        sequence: u64_field(request, "sequence")?,
        timestamp: u64_field(request, "timestamp")?,
        body: bytes_field(request, "body")?,
    };

    let accepted = match node.ledger().append_replicated(kind, &tx) {
        Ok(_) => true,
        Err(LedgerError::SequenceGap { expected, actual, .. }) => {
            tracing::debug!(chain = ?kind, expected, actual, "replicated transaction ahead of local chain");
            false
        },
        Err(LedgerError::Conflict { sequence, stored, incoming, .. }) => {
            tracing::warn!(chain = ?kind, sequence, stored, incoming, "replicated transaction conflicts with local chain");
            false
        },
        Err(err) => return Err(err.into()),
    };

    Ok(Record::new(content::REPLICATE_RESPONSE)
        .with("accepted", Value::Bool(accepted))
        .with("expected", Value::U64(node.ledger().next_sequence(kind))))
}

fn str_field<'a>(record: &'a Record, name: &'static str) -> Result<&'a str, HandlerError> {
    record.get(name).and_then(Value::as_str).ok_or(HandlerError::MissingField(name))
}

fn u64_field(record: &Record, name: &'static str) -> Result<u64, HandlerError> {
    record.get(name).and_then(Value::as_u64).ok_or(HandlerError::MissingField(name))
}

fn bytes_field(record: &Record, name: &'static str) -> Result<Bytes, HandlerError> {
    match record.get(name) {
        Some(Value::Bytes(bytes)) => Ok(bytes.clone()),
        _ => Err(HandlerError::MissingField(name)),
    }
}

fn chain_field(record: &Record) -> Result<ChainKind, HandlerError> {
    match record.get("chain") {
        Some(&Value::U8(raw)) => ChainKind::from_u8(raw).ok_or(HandlerError::UnknownChain(raw)),
        _ => Err(HandlerError::MissingField("chain")),
    }
}
