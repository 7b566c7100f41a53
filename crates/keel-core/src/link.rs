//! Inter-node link state machine.
//!
//! This module implements the session layer of a cluster link: the
//! authenticated handshake, schema exchange, heartbeats, timeouts, and
//! graceful shutdown.
//!
//! # Architecture: Action-Based State Machine
//!
//! - Methods accept time as parameter (no stored Environment)
//! - Methods return `Result<Vec<LinkAction>, LinkError>`
//! - The driver executes actions (send payloads, close the socket)
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  start   ┌──────────┐  Hello / HelloReply  ┌───────────────┐
//! │ Init │─────────>│ Pending  │─────────────────────>│ Authenticated │
//! └──────┘          └──────────┘  (signature valid)   └───────────────┘
//!                        │                                    │
//!                        │ Timeout/Bad signature              │ Goodbye/Timeout
//!                        ↓                                    ↓
//!                   ┌────────┐                           ┌────────┐
//!                   │ Closed │<──────────────────────────│ Closed │
//!                   └────────┘                           └────────┘
//! ```
//!
//! # Handshake
//!
//! 1. The initiator sends [`Hello`] signed over `initiator => responder`,
//!    carrying the body layouts of the messages it emits.
//! 2. The responder verifies the signature, compiles the initiator's layouts
//!    into field plans, and answers with [`HelloReply`] signed over
//!    `responder => initiator` with its own layouts.
//! 3. The initiator verifies the reply and compiles the responder's layouts.
//!
//! Either side closes the link on a bad signature.
//!
//! # Timeouts
//!
//! - **Handshake timeout**: 30 seconds to complete Hello/HelloReply
//! - **Idle timeout**: 60 seconds without any activity
//! - **Heartbeat interval**: 20 seconds (sends Ping to keep alive)

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use keel_proto::{
    MessageSchema, Payload, PlanSet, SchemaRegistry,
    payloads::{Goodbye, Hello, HelloReply, PROTOCOL_VERSION},
};

use crate::{auth::HandshakeKey, error::LinkError};

/// Actions returned by the link state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Send this session payload to the peer
    Send(Payload),

    /// The handshake completed; application traffic may flow
    Authenticated {
        /// Authenticated node id of the peer
        peer_id: u32,
        /// Session id chosen by the responder
        session_id: u64,
    },

    /// Close the link with this reason
    Close {
        /// Reason for closing the link
        reason: String,
    },
}

/// Link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Created, handshake not started
    Init,
    /// Handshake in progress
    Pending,
    /// Handshake verified
    Authenticated,
    /// Terminated (graceful or error)
    Closed,
}

/// Which end opened the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// Dialed the peer and sends Hello
    Initiator,
    /// Accepted the connection and answers Hello
    Responder,
}

/// Link configuration
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Timeout for completing handshake
    pub handshake_timeout: Duration,
    /// Idle timeout before disconnecting
    pub idle_timeout: Duration,
    /// Heartbeat interval (should be < idle_timeout / 2)
    pub heartbeat_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(20),
        }
    }
}

/// What a node presents during a handshake. Shared by all its links.
#[derive(Debug, Clone)]
pub struct LinkIdentity {
    /// This node's id
    pub node_id: u32,
    /// Cluster key
    pub key: HandshakeKey,
    /// Content types this node understands
    pub registry: Arc<SchemaRegistry>,
    /// Body layouts this node emits
    pub schemas: Arc<[MessageSchema]>,
}

/// Link state machine
///
/// Pure state machine: no I/O, no stored environment.
#[derive(Debug, Clone)]
pub struct Link {
    role: LinkRole,
    state: LinkState,
    config: LinkConfig,
    identity: LinkIdentity,
    /// Node the initiator dialed; the responder learns it from Hello
    peer_id: Option<u32>,
    /// Session id: chosen up front by the responder, learned by the initiator
    session_id: Option<u64>,
    plans: PlanSet,
    last_activity: Instant,
    last_heartbeat: Option<Instant>,
}

impl Link {
    /// Link that will dial `peer_id`.
    pub fn initiator(identity: LinkIdentity, peer_id: u32, now: Instant, config: LinkConfig) -> Self {
        Self::new(LinkRole::Initiator, identity, Some(peer_id), None, now, config)
    }

    /// Link for an accepted connection; `session_id` goes into the reply.
    pub fn responder(identity: LinkIdentity, session_id: u64, now: Instant, config: LinkConfig) -> Self {
        Self::new(LinkRole::Responder, identity, None, Some(session_id), now, config)
    }

    fn new(
        role: LinkRole,
        identity: LinkIdentity,
        peer_id: Option<u32>,
        session_id: Option<u64>,
        now: Instant,
        config: LinkConfig,
    ) -> Self {
        Self {
            role,
            state: LinkState::Init,
            config,
            identity,
            peer_id,
            session_id,
            plans: PlanSet::default(),
            last_activity: now,
            last_heartbeat: None,
        }
    }

    /// Current state
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Which end of the link this is
    pub fn role(&self) -> LinkRole {
        self.role
    }

    /// Peer node id (known to the initiator from the start, to the responder
    /// after Hello)
    pub fn peer_id(&self) -> Option<u32> {
        self.peer_id
    }

    /// Session id (once authenticated, or the responder's chosen id)
    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    /// Field plans compiled from the peer's layouts.
    pub fn plans(&self) -> &PlanSet {
        &self.plans
    }

    /// Local node id.
    pub fn local_id(&self) -> u32 {
        self.identity.node_id
    }

    /// True once the handshake has verified.
    pub fn is_authenticated(&self) -> bool {
        self.state == LinkState::Authenticated
    }

    /// Begin the handshake.
    ///
    /// The initiator emits Hello; the responder only starts its handshake
    /// clock and waits.
    pub fn start(&mut self, now: Instant) -> Result<Vec<LinkAction>, LinkError> {
        if self.state != LinkState::Init {
            return Err(LinkError::InvalidState { state: self.state, operation: "start".to_string() });
        }

        self.state = LinkState::Pending;
        self.last_activity = now;

        match (self.role, self.peer_id) {
            (LinkRole::Initiator, Some(peer)) => {
                let hello = Hello {
                    version: PROTOCOL_VERSION,
                    sender_id: self.identity.node_id,
                    receiver_id: peer,
                    signature: self.identity.key.sign(self.identity.node_id, peer),
                    schemas: self.identity.schemas.to_vec(),
                };
                Ok(vec![LinkAction::Send(Payload::Hello(hello))])
            },
            _ => Ok(vec![]),
        }
    }

    /// Record activity from application traffic.
    pub fn update_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Handle a session payload from the peer.
    ///
    /// On error the link is already closed; the driver should tear down the
    /// transport.
    pub fn handle_payload(&mut self, payload: &Payload, now: Instant) -> Result<Vec<LinkAction>, LinkError> {
        self.last_activity = now;

        let result = match (self.state, self.role, payload) {
            (LinkState::Pending, LinkRole::Responder, Payload::Hello(hello)) => self.accept_hello(hello),
            (LinkState::Pending, LinkRole::Initiator, Payload::HelloReply(reply)) => self.accept_reply(reply),
            (LinkState::Authenticated, _, Payload::Ping) => Ok(vec![LinkAction::Send(Payload::Pong)]),
            (LinkState::Authenticated, _, Payload::Pong) => Ok(vec![]),
            (LinkState::Pending | LinkState::Authenticated, _, Payload::Goodbye(goodbye)) => {
                self.state = LinkState::Closed;
                Ok(vec![LinkAction::Close { reason: format!("peer closed: {}", goodbye.reason) }])
            },
            (state, _, other) => Err(LinkError::UnexpectedPayload { state, opcode: other.opcode() }),
        };

        if let Err(ref err) = result {
            tracing::warn!(peer = ?self.peer_id, error = %err, "closing link");
            self.state = LinkState::Closed;
        }
        result
    }

    fn accept_hello(&mut self, hello: &Hello) -> Result<Vec<LinkAction>, LinkError> {
        if hello.version != PROTOCOL_VERSION {
            return Err(LinkError::UnsupportedVersion(hello.version));
        }
        if hello.receiver_id != self.identity.node_id {
            return Err(LinkError::WrongPeer { expected: self.identity.node_id, actual: hello.receiver_id });
        }
        if !self.identity.key.verify(hello.sender_id, hello.receiver_id, &hello.signature) {
            return Err(LinkError::BadSignature { sender: hello.sender_id, receiver: hello.receiver_id });
        }

        self.plans = PlanSet::negotiate(&hello.schemas, &self.identity.registry)?;
        self.peer_id = Some(hello.sender_id);
        self.state = LinkState::Authenticated;

        let session_id = self.session_id.unwrap_or_default();
        let me = self.identity.node_id;
        let reply = HelloReply {
            sender_id: me,
            receiver_id: hello.sender_id,
            session_id,
            signature: self.identity.key.sign(me, hello.sender_id),
            schemas: self.identity.schemas.to_vec(),
        };

        tracing::info!(peer = hello.sender_id, session_id, plans = self.plans.len(), "link authenticated");
        Ok(vec![
            LinkAction::Send(Payload::HelloReply(reply)),
            LinkAction::Authenticated { peer_id: hello.sender_id, session_id },
        ])
    }

    fn accept_reply(&mut self, reply: &HelloReply) -> Result<Vec<LinkAction>, LinkError> {
        let expected = self.peer_id.unwrap_or_default();
        if reply.sender_id != expected {
            return Err(LinkError::WrongPeer { expected, actual: reply.sender_id });
        }
        if reply.receiver_id != self.identity.node_id {
            return Err(LinkError::WrongPeer { expected: self.identity.node_id, actual: reply.receiver_id });
        }
        if !self.identity.key.verify(reply.sender_id, reply.receiver_id, &reply.signature) {
            return Err(LinkError::BadSignature { sender: reply.sender_id, receiver: reply.receiver_id });
        }

        self.plans = PlanSet::negotiate(&reply.schemas, &self.identity.registry)?;
        self.session_id = Some(reply.session_id);
        self.state = LinkState::Authenticated;

        tracing::info!(peer = expected, session_id = reply.session_id, "link authenticated");
        Ok(vec![LinkAction::Authenticated { peer_id: expected, session_id: reply.session_id }])
    }

    /// Close the link gracefully, telling the peer why.
    pub fn close(&mut self, reason: impl Into<String>) -> Vec<LinkAction> {
        if self.state == LinkState::Closed {
            return vec![];
        }
        let reason = reason.into();
        let was_open = self.state != LinkState::Init;
        self.state = LinkState::Closed;

        let mut actions = Vec::with_capacity(2);
        if was_open {
            actions.push(LinkAction::Send(Payload::Goodbye(Goodbye { reason: reason.clone() })));
        }
        actions.push(LinkAction::Close { reason });
        actions
    }

    /// Check if the link has timed out
    ///
    /// Returns `Some(elapsed)` if timed out, `None` otherwise
    pub fn check_timeout(&self, now: Instant) -> Option<Duration> {
        let elapsed = now.saturating_duration_since(self.last_activity);

        let timeout = match self.state {
            LinkState::Pending => self.config.handshake_timeout,
            LinkState::Authenticated => self.config.idle_timeout,
            LinkState::Init | LinkState::Closed => return None,
        };

        if elapsed > timeout { Some(elapsed) } else { None }
    }

    /// Tick the state machine - check for timeouts and heartbeats
    ///
    /// Call this periodically (e.g., every 100ms).
    pub fn tick(&mut self, now: Instant) -> Vec<LinkAction> {
        if let Some(elapsed) = self.check_timeout(now) {
            let reason = match self.state {
                LinkState::Pending => format!("handshake timeout after {elapsed:?}"),
                _ => format!("idle timeout after {elapsed:?}"),
            };
            tracing::warn!(peer = ?self.peer_id, %reason, "link timed out");
            self.state = LinkState::Closed;
            return vec![LinkAction::Close { reason }];
        }

        if self.state != LinkState::Authenticated {
            return vec![];
        }

        let due = self
            .last_heartbeat
            .is_none_or(|last| now.saturating_duration_since(last) >= self.config.heartbeat_interval);
        if !due {
            return vec![];
        }

        self.last_heartbeat = Some(now);
        vec![LinkAction::Send(Payload::Ping)]
    }
}

#[cfg(test)]
mod tests {
    use keel_proto::{BuiltinType, Opcode, schema::ContentType};

    use super::*;

    fn identity(node_id: u32, key: &[u8]) -> LinkIdentity {
        let registry =
            SchemaRegistry::new([ContentType::new(1, "reserve").field("table", BuiltinType::Str)]).unwrap();
        let schemas = vec![registry.message_schema(0x0100, false, 1).unwrap()];
        LinkIdentity {
            node_id,
            key: HandshakeKey::new(key).unwrap(),
            registry: Arc::new(registry),
            schemas: schemas.into(),
        }
    }

    fn sent(actions: &[LinkAction]) -> Payload {
        actions
            .iter()
            .find_map(|a| match a {
                LinkAction::Send(p) => Some(p.clone()),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn handshake_authenticates_both_ends() {
        let t0 = Instant::now();
        let mut client = Link::initiator(identity(1, b"k"), 2, t0, LinkConfig::default());
        let mut server = Link::responder(identity(2, b"k"), 77, t0, LinkConfig::default());

        let hello = sent(&client.start(t0).unwrap());
        assert_eq!(client.state(), LinkState::Pending);
        assert!(server.start(t0).unwrap().is_empty());

        let actions = server.handle_payload(&hello, t0).unwrap();
        assert_eq!(server.state(), LinkState::Authenticated);
        assert_eq!(server.peer_id(), Some(1));
        assert!(server.plans().get(Opcode::APP_BASE, false).is_some());
        assert!(actions.contains(&LinkAction::Authenticated { peer_id: 1, session_id: 77 }));

        let actions = client.handle_payload(&sent(&actions), t0).unwrap();
        assert_eq!(actions, vec![LinkAction::Authenticated { peer_id: 2, session_id: 77 }]);
        assert_eq!(client.session_id(), Some(77));
        assert_eq!(client.plans().len(), 1);
    }

    #[test]
    fn bad_signature_closes_link() {
        let t0 = Instant::now();
        let mut client = Link::initiator(identity(1, b"wrong"), 2, t0, LinkConfig::default());
        let mut server = Link::responder(identity(2, b"right"), 1, t0, LinkConfig::default());

        let hello = sent(&client.start(t0).unwrap());
        server.start(t0).unwrap();
        let result = server.handle_payload(&hello, t0);

        assert_eq!(result, Err(LinkError::BadSignature { sender: 1, receiver: 2 }));
        assert_eq!(server.state(), LinkState::Closed);
    }

    #[test]
    fn hello_for_another_node_is_rejected() {
        let t0 = Instant::now();
        let mut client = Link::initiator(identity(1, b"k"), 3, t0, LinkConfig::default());
        let mut server = Link::responder(identity(2, b"k"), 1, t0, LinkConfig::default());

        let hello = sent(&client.start(t0).unwrap());
        server.start(t0).unwrap();
        assert_eq!(server.handle_payload(&hello, t0), Err(LinkError::WrongPeer { expected: 2, actual: 3 }));
    }

    #[test]
    fn application_keepalive_before_handshake_is_unexpected() {
        let t0 = Instant::now();
        let mut server = Link::responder(identity(2, b"k"), 1, t0, LinkConfig::default());
        server.start(t0).unwrap();
        let result = server.handle_payload(&Payload::Ping, t0);
        assert!(matches!(result, Err(LinkError::UnexpectedPayload { state: LinkState::Pending, .. })));
    }

    #[test]
    fn ping_is_answered_with_pong() {
        let t0 = Instant::now();
        let mut client = Link::initiator(identity(1, b"k"), 2, t0, LinkConfig::default());
        let mut server = Link::responder(identity(2, b"k"), 1, t0, LinkConfig::default());
        let hello = sent(&client.start(t0).unwrap());
        server.start(t0).unwrap();
        server.handle_payload(&hello, t0).unwrap();

        let actions = server.handle_payload(&Payload::Ping, t0).unwrap();
        assert_eq!(actions, vec![LinkAction::Send(Payload::Pong)]);
    }

    #[test]
    fn heartbeat_timing() {
        let t0 = Instant::now();
        let mut client = Link::initiator(identity(1, b"k"), 2, t0, LinkConfig::default());
        let mut server = Link::responder(identity(2, b"k"), 1, t0, LinkConfig::default());
        let hello = sent(&client.start(t0).unwrap());
        server.start(t0).unwrap();
        server.handle_payload(&hello, t0).unwrap();

        // First tick after authentication sends a heartbeat
        assert_eq!(server.tick(t0), vec![LinkAction::Send(Payload::Ping)]);

        // Too soon for another
        assert!(server.tick(t0 + Duration::from_secs(1)).is_empty());

        // Past the interval; keep activity fresh so the idle timer doesn't fire
        let t3 = t0 + Duration::from_secs(21);
        server.update_activity(t3);
        assert_eq!(server.tick(t3), vec![LinkAction::Send(Payload::Ping)]);
    }

    #[test]
    fn handshake_timeout() {
        let t0 = Instant::now();
        let mut client = Link::initiator(identity(1, b"k"), 2, t0, LinkConfig::default());
        client.start(t0).unwrap();

        assert!(client.tick(t0 + Duration::from_secs(29)).is_empty());

        let actions = client.tick(t0 + Duration::from_secs(31));
        assert!(matches!(&actions[..], [LinkAction::Close { reason }] if reason.contains("handshake timeout")));
        assert_eq!(client.state(), LinkState::Closed);
    }

    #[test]
    fn graceful_close_sends_goodbye_once() {
        let t0 = Instant::now();
        let mut client = Link::initiator(identity(1, b"k"), 2, t0, LinkConfig::default());
        client.start(t0).unwrap();

        let actions = client.close("shutdown");
        assert_eq!(actions.len(), 2);
        assert!(matches!(&actions[0], LinkAction::Send(Payload::Goodbye(g)) if g.reason == "shutdown"));
        assert!(client.close("again").is_empty());
    }

    #[test]
    fn start_twice_is_invalid() {
        let t0 = Instant::now();
        let mut client = Link::initiator(identity(1, b"k"), 2, t0, LinkConfig::default());
        client.start(t0).unwrap();
        assert!(matches!(client.start(t0), Err(LinkError::InvalidState { state: LinkState::Pending, .. })));
    }
}
