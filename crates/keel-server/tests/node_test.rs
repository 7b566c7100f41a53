//! Node tests
//!
//! Request dispatch, ledger appends and streaming sessions against a single
//! node with no peers connected.

use std::{net::Ipv4Addr, path::Path, sync::Arc, time::Duration};

use keel_core::{ClusterMap, ClusterNode, Environment, HandshakeKey, NodeKind};
use keel_ledger::ChainKind;
use keel_proto::{
    MAX_BODY_SIZE, Opcode, Reader, Record, RpcFlags, RpcFrame, RpcTable, StreamOpcode, StreamTable, Value, Writer,
    stream::{write_binary_frame, write_masked_binary_frame},
};
use keel_server::{
    Node, NodeSettings, Origin,
    messages::{self, APPEND_CHANGE, REPLICATE, RESERVE_ID, content},
    run_stream,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

// Test environment using system time and the thread RNG
#[derive(Clone)]
struct TestEnv;

impl Environment for TestEnv {
    fn now(&self) -> std::time::Instant {
        std::time::Instant::now()
    }

    fn wall_clock_millis(&self) -> u64 {
        1_700_000_000_000
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        async move {
            tokio::time::sleep(duration).await;
        }
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        use rand::RngCore;
        rand::thread_rng().fill_bytes(buffer);
    }
}

fn cluster() -> ClusterMap {
    let node = |id: u32, stripes: Vec<u32>| ClusterNode {
        id,
        hostname: format!("keel-{id}"),
        kind: NodeKind::Server,
        port: 7100,
        private_v4: Some(Ipv4Addr::new(10, 0, 0, id as u8)),
        public_v4: None,
        private_v6: None,
        public_v6: None,
        stripes,
    };
    ClusterMap::new(4, vec![node(1, vec![0, 2]), node(2, vec![1, 3])]).unwrap()
}

fn open(dir: &Path) -> Arc<Node<TestEnv>> {
    let key = HandshakeKey::new(&[7u8; 32]).unwrap();
    let mut settings = NodeSettings::new(2, cluster(), key, dir);
    settings.ledger.sync_on_write = false;
    Node::open(settings, TestEnv).unwrap()
}

fn request(node: &Node<TestEnv>, opcode: Opcode, request_id: u32, record: &Record) -> RpcFrame {
    let body = node.local_plans().require(opcode, false).unwrap().write(record, node.writers()).unwrap();
    RpcFrame::new(opcode, RpcFlags::empty(), request_id, body.to_bytes())
}

fn parse(bytes: &[u8]) -> RpcFrame {
    let mut frames = Reader::new(RpcTable::new()).feed(bytes).unwrap();
    assert_eq!(frames.len(), 1);
    frames.remove(0)
}

fn response(node: &Node<TestEnv>, reply: &Writer) -> Record {
    let frame = parse(&reply.to_bytes());
    assert!(frame.header.is_response());
    assert!(
        !frame.header.flags().contains(RpcFlags::ERROR),
        "error response: {}",
        String::from_utf8_lossy(&frame.body)
    );
    node.local_plans().require(frame.header.opcode(), true).unwrap().decode(&frame.body).unwrap()
}

async fn call(node: &Arc<Node<TestEnv>>, opcode: Opcode, record: &Record) -> Record {
    let frame = request(node, opcode, 1, record);
    let reply = node.serve_request(&node.local_plans(), &frame, Origin::Link).await.unwrap();
    response(node, &reply)
}

#[tokio::test]
async fn reserve_id_hands_out_ids_from_own_stripes() {
    let dir = tempfile::tempdir().unwrap();
    let node = open(dir.path());

    let mut ids = Vec::new();
    for _ in 0..4 {
        let record = call(&node, RESERVE_ID, &messages::reserve_id("pages")).await;
        ids.push(record.get("id").and_then(Value::as_u64).unwrap());
    }
    assert_eq!(ids, vec![1, 3, 5, 7]);

    // Tables are independent
    let other = call(&node, RESERVE_ID, &messages::reserve_id("users")).await;
    assert_eq!(other.get("id"), Some(&Value::U64(1)));
}

#[tokio::test]
async fn append_without_peers_counts_as_replicated() {
    let dir = tempfile::tempdir().unwrap();
    let node = open(dir.path());

    let append = messages::append_change(ChainKind::Public, "pages", 5, b"title=Home", b"");
    let record = call(&node, APPEND_CHANGE, &append).await;

    assert_eq!(record.get("sequence"), Some(&Value::U64(1)));
    assert_eq!(record.get("replicated"), Some(&Value::Bool(true)));
    assert_eq!(node.ledger().next_sequence(ChainKind::Public), 2);
    assert_eq!(node.ledger().next_sequence(ChainKind::Private), 1);
}

#[tokio::test]
async fn private_append_writes_both_halves() {
    let dir = tempfile::tempdir().unwrap();
    let node = open(dir.path());

    let append = messages::append_change(ChainKind::Private, "users", 9, b"name=ada", b"email=ada@example.com");
    let record = call(&node, APPEND_CHANGE, &append).await;
    assert_eq!(record.get("sequence"), Some(&Value::U64(1)));

    let public = node.ledger().transactions_after(ChainKind::Public, 0).unwrap();
    let private = node.ledger().transactions_after(ChainKind::Private, 0).unwrap();
    assert_eq!(public.len(), 1);
    assert_eq!(private.len(), 1);
    assert_eq!(public[0].timestamp, private[0].timestamp);
    assert_eq!(public[0].body, node.encode_change("users", 9, b"name=ada").unwrap());
    assert_eq!(private[0].body, node.encode_change("users", 9, b"email=ada@example.com").unwrap());
}

#[tokio::test]
async fn restart_resumes_id_assignment_after_stored_changes() {
    let dir = tempfile::tempdir().unwrap();
    {
        let node = open(dir.path());
        // 13 lives in stripe 1
        let append = messages::append_change(ChainKind::Public, "pages", 13, b"", b"");
        call(&node, APPEND_CHANGE, &append).await;
    }

    let node = open(dir.path());
    let first = call(&node, RESERVE_ID, &messages::reserve_id("pages")).await;
    let second = call(&node, RESERVE_ID, &messages::reserve_id("pages")).await;
    assert_eq!(first.get("id"), Some(&Value::U64(17)));
    assert_eq!(second.get("id"), Some(&Value::U64(3)));
}

#[tokio::test]
async fn change_too_large_to_replicate_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let node = open(dir.path());
    assert!(node.max_change_body() < MAX_BODY_SIZE);

    // The request fits an RPC body, but the change would not once wrapped
    // for replication
    let payload = vec![0u8; MAX_BODY_SIZE - 30];
    let append = messages::append_change(ChainKind::Public, "pages", 5, &payload, b"");
    let frame = request(&node, APPEND_CHANGE, 8, &append);
    assert!(frame.body.len() <= MAX_BODY_SIZE);
    let reply = node.serve_request(&node.local_plans(), &frame, Origin::Stream).await.unwrap();

    let frame = parse(&reply.to_bytes());
    assert!(frame.header.flags().contains(RpcFlags::ERROR));
    assert!(String::from_utf8_lossy(&frame.body).contains("exceeds"));
    assert_eq!(node.ledger().next_sequence(ChainKind::Public), 1);

    // The largest accepted change still makes a valid replication request
    let overhead = node.encode_change("pages", 5, b"").unwrap().len();
    let largest = vec![0u8; node.max_change_body() - overhead];
    let body = node.encode_change("pages", 5, &largest).unwrap();
    let replicate = Record::new(content::REPLICATE_REQUEST)
        .with("chain", Value::U8(ChainKind::Public.to_u8()))
        .with("sequence", Value::U64(1))
        .with("timestamp", Value::Timestamp(1_700_000_000_000))
        .with("body", Value::Bytes(body));
    let encoded = node.local_plans().require(REPLICATE, false).unwrap().write(&replicate, node.writers()).unwrap();
    assert!(encoded.len() <= MAX_BODY_SIZE);
}

#[tokio::test]
async fn replicate_reports_gap_and_accepts_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let node = open(dir.path());

    let replicate = |sequence: u64| {
        Record::new(content::REPLICATE_REQUEST)
            .with("chain", Value::U8(ChainKind::Public.to_u8()))
            .with("sequence", Value::U64(sequence))
            .with("timestamp", Value::Timestamp(1_700_000_000_000))
            .with("body", Value::Bytes(node.encode_change("pages", 1, b"x").unwrap()))
    };

    let ahead = call(&node, REPLICATE, &replicate(2)).await;
    assert_eq!(ahead.get("accepted"), Some(&Value::Bool(false)));
    assert_eq!(ahead.get("expected"), Some(&Value::U64(1)));

    let first = call(&node, REPLICATE, &replicate(1)).await;
    assert_eq!(first.get("accepted"), Some(&Value::Bool(true)));
    assert_eq!(first.get("expected"), Some(&Value::U64(2)));

    // Duplicates are acknowledged without being stored twice
    let again = call(&node, REPLICATE, &replicate(1)).await;
    assert_eq!(again.get("accepted"), Some(&Value::Bool(true)));
    assert_eq!(node.ledger().next_sequence(ChainKind::Public), 2);
}

#[tokio::test]
async fn replicate_refuses_a_different_transaction_at_a_stored_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let node = open(dir.path());

    // Appended locally while the peer appended its own sequence 1
    let append = messages::append_change(ChainKind::Public, "pages", 1, b"local", b"");
    call(&node, APPEND_CHANGE, &append).await;

    let theirs = Record::new(content::REPLICATE_REQUEST)
        .with("chain", Value::U8(ChainKind::Public.to_u8()))
        .with("sequence", Value::U64(1))
        .with("timestamp", Value::Timestamp(1_700_000_000_000))
        .with("body", Value::Bytes(node.encode_change("pages", 3, b"remote").unwrap()));
    let response = call(&node, REPLICATE, &theirs).await;

    assert_eq!(response.get("accepted"), Some(&Value::Bool(false)));
    assert_eq!(response.get("expected"), Some(&Value::U64(2)));
    let stored = node.ledger().transactions_after(ChainKind::Public, 0).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].body, node.encode_change("pages", 1, b"local").unwrap());
}

#[tokio::test]
async fn stream_clients_cannot_call_cluster_opcodes() {
    let dir = tempfile::tempdir().unwrap();
    let node = open(dir.path());

    let record = Record::new(content::REPLICATE_REQUEST).with("chain", Value::U8(0));
    let frame = request(&node, REPLICATE, 4, &record);
    let reply = node.serve_request(&node.local_plans(), &frame, Origin::Stream).await.unwrap();

    let frame = parse(&reply.to_bytes());
    assert_eq!(frame.header.request_id(), 4);
    assert!(frame.header.flags().contains(RpcFlags::RESPONSE | RpcFlags::ERROR));
    assert!(String::from_utf8_lossy(&frame.body).contains("restricted"));
    assert_eq!(node.ledger().next_sequence(ChainKind::Public), 1);
}

#[tokio::test]
async fn unknown_opcode_is_answered_with_error() {
    let dir = tempfile::tempdir().unwrap();
    let node = open(dir.path());

    let frame = RpcFrame::new(Opcode::new(0x0777), RpcFlags::empty(), 3, &b""[..]);
    let reply = node.serve_request(&node.local_plans(), &frame, Origin::Link).await.unwrap();
    let frame = parse(&reply.to_bytes());
    assert!(frame.header.flags().contains(RpcFlags::ERROR));
    assert_eq!(frame.header.request_id(), 3);
}

#[tokio::test]
async fn no_reply_requests_get_no_response() {
    let dir = tempfile::tempdir().unwrap();
    let node = open(dir.path());

    let body = request(&node, RESERVE_ID, 1, &messages::reserve_id("pages")).body;
    let frame = RpcFrame::new(RESERVE_ID, RpcFlags::NO_REPLY, 1, body);
    assert!(node.serve_request(&node.local_plans(), &frame, Origin::Link).await.is_none());

    // The id was still consumed
    let next = call(&node, RESERVE_ID, &messages::reserve_id("pages")).await;
    assert_eq!(next.get("id"), Some(&Value::U64(3)));
}

#[tokio::test]
async fn stream_session_serves_requests_until_close() {
    let dir = tempfile::tempdir().unwrap();
    let node = open(dir.path());
    let (mut client, server) = tokio::io::duplex(4096);
    let session = tokio::spawn(run_stream(Arc::clone(&node), server));

    let rpc = request(&node, RESERVE_ID, 11, &messages::reserve_id("pages")).encode();
    let mut out = node.writers().acquire();
    write_masked_binary_frame(&mut out, &rpc, [0x12, 0x34, 0x56, 0x78]);
    client.write_all(&out.to_bytes()).await.unwrap();
    // Close frame, masked with a zero key
    client.write_all(&[0x88, 0x80, 0, 0, 0, 0]).await.unwrap();

    let mut received = Vec::new();
    client.read_to_end(&mut received).await.unwrap();
    session.await.unwrap().unwrap();

    let frames = Reader::new(StreamTable::new()).feed(&received).unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].opcode, StreamOpcode::Binary);
    assert_eq!(frames[1].opcode, StreamOpcode::Close);

    let reply = parse(&frames[0].payload);
    assert_eq!(reply.header.request_id(), 11);
    let record = node.local_plans().require(RESERVE_ID, true).unwrap().decode(&reply.body).unwrap();
    assert_eq!(record.get("id"), Some(&Value::U64(1)));
}

#[tokio::test]
async fn stream_session_rejects_unsupported_frames() {
    let dir = tempfile::tempdir().unwrap();
    let node = open(dir.path());
    let (mut client, server) = tokio::io::duplex(4096);
    let session = tokio::spawn(run_stream(Arc::clone(&node), server));

    // Text frame (opcode 0x1)
    client.write_all(&[0x81, 0x80, 0, 0, 0, 0]).await.unwrap();

    let mut received = Vec::new();
    client.read_to_end(&mut received).await.unwrap();
    assert!(session.await.unwrap().is_err());

    let frames = Reader::new(StreamTable::new()).feed(&received).unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].opcode, StreamOpcode::Close);
}

#[tokio::test]
async fn stream_session_rejects_unmasked_client_frames() {
    let dir = tempfile::tempdir().unwrap();
    let node = open(dir.path());
    let (mut client, server) = tokio::io::duplex(4096);
    let session = tokio::spawn(run_stream(Arc::clone(&node), server));

    let rpc = request(&node, RESERVE_ID, 5, &messages::reserve_id("pages")).encode();
    let mut out = node.writers().acquire();
    write_binary_frame(&mut out, &rpc);
    client.write_all(&out.to_bytes()).await.unwrap();

    let mut received = Vec::new();
    client.read_to_end(&mut received).await.unwrap();
    assert!(session.await.unwrap().is_err());

    // Only the close frame comes back, and no id was handed out
    let frames = Reader::new(StreamTable::new()).feed(&received).unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].opcode, StreamOpcode::Close);
    let next = call(&node, RESERVE_ID, &messages::reserve_id("pages")).await;
    assert_eq!(next.get("id"), Some(&Value::U64(1)));
}
