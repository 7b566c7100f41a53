//! Outbound calls over authenticated links.
//!
//! Every authenticated link registers a [`PeerClient`] in the node's
//! [`PeerSet`]. A call reserves an id in the link's request table, queues the
//! framed request on the link's writer task, and waits for the receive loop
//! to hand over the matching response. When the link closes its table is
//! drained, which drops every waiting sender and fails the calls with
//! [`CallError::Closed`].
//!
//! A call that times out abandons its id rather than freeing it. The id is
//! only reissued once the late response has been discarded or the link has
//! closed.

use std::{collections::HashMap, sync::Arc, time::Duration};

use keel_core::RequestTable;
use keel_proto::{Opcode, PlanSet, Record, RpcFlags, RpcFrame, Writer, WriterPool, rpc::write_frame};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::CallError;

/// A caller waiting for the response to one request.
#[derive(Debug)]
pub struct PendingCall {
    opcode: Opcode,
    reply: oneshot::Sender<Result<RpcFrame, CallError>>,
}

/// In-flight calls of one link, keyed by request id.
pub type PendingCalls = RequestTable<PendingCall>;

/// Hand a response frame to the call waiting on its request id.
///
/// Responses for unknown or abandoned ids are dropped. A response whose
/// opcode differs from the request's fails that call.
pub fn route_response(requests: &PendingCalls, peer_id: u32, frame: RpcFrame) {
    let request_id = frame.header.request_id();
    let received = frame.header.opcode();
    let Some(call) = requests.complete(request_id) else {
        tracing::debug!(peer = peer_id, request_id, %received, "response for unknown or abandoned request");
        return;
    };

    let result = if call.opcode == received {
        Ok(frame)
    } else {
        tracing::warn!(peer = peer_id, request_id, sent = %call.opcode, %received, "response opcode does not match request");
        Err(CallError::Mismatched { peer: peer_id, sent: call.opcode, received })
    };
    if call.reply.send(result).is_err() {
        tracing::debug!(request_id, "caller gave up before response");
    }
}

/// Everything a [`PeerClient`] shares with its link.
#[derive(Debug)]
pub struct PeerChannels {
    /// Queue of the link's writer task
    pub outbound: mpsc::Sender<Outbound>,
    /// The link's in-flight calls
    pub requests: Arc<PendingCalls>,
    /// Layouts we announced
    pub local: Arc<PlanSet>,
    /// Layouts the peer announced
    pub remote: Arc<PlanSet>,
    /// Pool for request frames
    pub writers: WriterPool,
    /// Wait for a single response
    pub timeout: Duration,
}

/// Work for a link's writer task.
#[derive(Debug)]
pub enum Outbound {
    /// Bytes to put on the wire
    Frame(Writer),
    /// Flush and stop; later sends fail
    Shutdown,
}

/// Handle for calling one peer over one link.
#[derive(Clone)]
pub struct PeerClient {
    peer_id: u32,
    session_id: u64,
    outbound: mpsc::Sender<Outbound>,
    requests: Arc<PendingCalls>,
    /// Layouts we announced; requests are encoded with these
    local: Arc<PlanSet>,
    /// Layouts the peer announced; responses are decoded with these
    remote: Arc<PlanSet>,
    writers: WriterPool,
    timeout: Duration,
}

impl PeerClient {
    pub(crate) fn new(peer_id: u32, session_id: u64, channels: PeerChannels) -> Self {
        let PeerChannels { outbound, requests, local, remote, writers, timeout } = channels;
        Self { peer_id, session_id, outbound, requests, local, remote, writers, timeout }
    }

    /// Node on the other end.
    pub fn peer_id(&self) -> u32 {
        self.peer_id
    }

    /// Session id of the link.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// True once the link's writer has gone away.
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Send `request` under `opcode` and wait for the decoded response.
    pub async fn call(&self, opcode: Opcode, request: &Record) -> Result<Record, CallError> {
        let body = self.local.require(opcode, false)?.write(request, &self.writers)?;

        let (id, response) = loop {
            let (reply, rx) = oneshot::channel();
            if let Some(id) = self.requests.reserve(PendingCall { opcode, reply }) {
                break (id, rx);
            }
            if self.is_closed() {
                return Err(CallError::Closed(self.peer_id));
            }
            tracing::debug!(peer = self.peer_id, "request table full, waiting");
            self.requests.wait_for_capacity().await;
        };

        let mut frame = self.writers.acquire();
        write_frame(&mut frame, opcode, RpcFlags::empty(), id, &body);
        drop(body);
        if self.outbound.send(Outbound::Frame(frame)).await.is_err() {
            self.requests.complete(id);
            return Err(CallError::Closed(self.peer_id));
        }
        tracing::trace!(peer = self.peer_id, %opcode, request_id = id, "call sent");

        let frame = match tokio::time::timeout(self.timeout, response).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(CallError::Closed(self.peer_id)),
            Err(_) => {
                self.requests.abandon(id);
                tracing::debug!(peer = self.peer_id, %opcode, request_id = id, "call timed out, id held for late response");
                return Err(CallError::Timeout { peer: self.peer_id, elapsed_ms: self.timeout.as_millis() as u64 });
            },
        };

        if frame.header.flags().contains(RpcFlags::ERROR) {
            let message = String::from_utf8_lossy(&frame.body).into_owned();
            return Err(CallError::Remote { peer: self.peer_id, message });
        }
        Ok(self.remote.require(opcode, true)?.decode(&frame.body)?)
    }
}

impl std::fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerClient")
            .field("peer_id", &self.peer_id)
            .field("session_id", &self.session_id)
            .field("outstanding", &self.requests.outstanding())
            .finish_non_exhaustive()
    }
}

/// Authenticated links of a node, one per peer.
#[derive(Debug, Default)]
pub struct PeerSet {
    peers: Mutex<HashMap<u32, PeerClient>>,
}

impl PeerSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a link, replacing any older link to the same peer.
    pub fn insert(&self, client: PeerClient) {
        if let Some(old) = self.peers.lock().insert(client.peer_id, client) {
            tracing::debug!(peer = old.peer_id, session_id = old.session_id, "replaced link");
        }
    }

    /// Unregister the link with `session_id`; a newer link to the same peer
    /// stays registered.
    pub fn remove(&self, peer_id: u32, session_id: u64) {
        let mut peers = self.peers.lock();
        if peers.get(&peer_id).is_some_and(|c| c.session_id == session_id) {
            peers.remove(&peer_id);
        }
    }

    /// Link to `peer_id`.
    pub fn get(&self, peer_id: u32) -> Option<PeerClient> {
        self.peers.lock().get(&peer_id).cloned()
    }

    /// Every registered link.
    pub fn snapshot(&self) -> Vec<PeerClient> {
        self.peers.lock().values().cloned().collect()
    }

    /// Number of registered links.
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    /// True if no peer is connected.
    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }
}
