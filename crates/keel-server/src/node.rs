//! A running cluster node.
//!
//! [`Node`] owns everything shared by the connections of one process: the
//! opcode table, the negotiated local layouts, the writer pool, the id
//! assigner, the ledger and the set of authenticated peer links. Listeners
//! and dialers are generic over [`Transport`] so the same node runs over
//! tokio TCP and over the simulated network of the test harness.
//!
//! Links between two nodes are dialed by the node with the lower id; the
//! other node only accepts. Either end may issue calls once authenticated.

use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use keel_core::{Environment, IdAssigner, LinkIdentity, TransactionPool, Transport};
use keel_ledger::{ChainKind, Ledger, Transaction};
use keel_proto::{
    ContentRef, FieldPlan, MAX_BODY_SIZE, OpcodeRegistry, PlanSet, Record, RpcFlags, RpcFrame, Scope, SegmentPool,
    Value, Writer, WriterPool, rpc::write_frame,
};
use tokio::task::JoinSet;

use crate::{
    config::NodeSettings,
    error::{CallError, HandlerError, ServerError},
    handlers::Handler,
    messages::{self, APPEND_CHANGE, REPLICATE, content},
    peer::{PeerClient, PeerSet},
    session::{self, LinkSide},
    stream,
};

/// Where a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Authenticated inter-node link
    Link,
    /// Unauthenticated streaming client
    Stream,
}

/// Shared state of one cluster node.
pub struct Node<E: Environment> {
    env: E,
    settings: NodeSettings,
    identity: LinkIdentity,
    handlers: OpcodeRegistry<Handler>,
    local_plans: Arc<PlanSet>,
    change_plan: FieldPlan,
    max_change_body: usize,
    writers: WriterPool,
    assigner: Arc<IdAssigner>,
    ledger: Ledger,
    transactions: TransactionPool,
    peers: PeerSet,
}

impl<E: Environment> Node<E> {
    /// Load the ledger, seed id assignment from it, and build the node.
    pub fn open(settings: NodeSettings, env: E) -> Result<Arc<Self>, ServerError> {
        let registry = messages::registry()?;
        let handlers = messages::handlers()?;
        let schemas = messages::announced_schemas(&registry, &handlers)?;
        let local_plans = Arc::new(PlanSet::negotiate(&schemas, &registry)?);
        let change_plan = FieldPlan::local(&registry, APPEND_CHANGE, false, content::CHANGE)?;

        let assigner = Arc::new(IdAssigner::for_node(&settings.cluster, settings.node_id)?);
        let ledger = {
            let assigner = Arc::clone(&assigner);
            let plan = change_plan.clone();
            Ledger::load_with(
                &settings.ledger_dir,
                &settings.project,
                settings.ledger.clone(),
                move |kind, tx| observe_change(&assigner, &plan, kind, tx),
                true,
            )?
        };

        let identity = LinkIdentity {
            node_id: settings.node_id,
            key: settings.key.clone(),
            registry: Arc::new(registry),
            schemas: schemas.into(),
        };
        let writers = WriterPool::new(SegmentPool::with_capacity(settings.segment_capacity));
        let max_change_body = max_change_body(&local_plans, &writers)?;

        tracing::info!(
            node_id = settings.node_id,
            project = %settings.project,
            stripes = ?settings.cluster.node(settings.node_id).map(|n| &n.stripes),
            public = ledger.next_sequence(ChainKind::Public) - 1,
            "node ready"
        );

        Ok(Arc::new(Self {
            env,
            settings,
            identity,
            handlers,
            local_plans,
            change_plan,
            max_change_body,
            writers,
            assigner,
            ledger,
            transactions: TransactionPool::new(),
            peers: PeerSet::new(),
        }))
    }

    /// This node's id.
    pub fn node_id(&self) -> u32 {
        self.settings.node_id
    }

    /// Time and randomness source.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Settings the node was opened with.
    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    /// Handshake identity shared by all links.
    pub fn identity(&self) -> &LinkIdentity {
        &self.identity
    }

    /// Layouts this node announced; outgoing bodies use these.
    pub fn local_plans(&self) -> Arc<PlanSet> {
        Arc::clone(&self.local_plans)
    }

    /// Pool for outgoing messages.
    pub fn writers(&self) -> &WriterPool {
        &self.writers
    }

    /// Id assignment over this node's stripes.
    pub fn assigner(&self) -> &IdAssigner {
        &self.assigner
    }

    /// The project's chains.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Completion tokens for replication waits.
    pub fn transactions(&self) -> &TransactionPool {
        &self.transactions
    }

    /// Authenticated peer links.
    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    /// Link to `peer_id`, if authenticated.
    pub fn peer(&self, peer_id: u32) -> Option<PeerClient> {
        self.peers.get(peer_id)
    }

    /// Ledger body for a change record.
    pub fn encode_change(&self, table: &str, object_id: u64, payload: &[u8]) -> Result<Bytes, HandlerError> {
        let record = messages::change(table, object_id, payload);
        Ok(self.change_plan.write(&record, &self.writers)?.to_bytes())
    }

    /// Largest ledger body that still fits in a `Replicate` request.
    pub fn max_change_body(&self) -> usize {
        self.max_change_body
    }

    /// Decode, dispatch and answer one request frame.
    ///
    /// `plans` are the layouts the caller encodes with. Returns the framed
    /// response, or `None` if the caller asked for no reply.
    pub async fn serve_request(self: &Arc<Self>, plans: &PlanSet, frame: &RpcFrame, origin: Origin) -> Option<Writer> {
        let opcode = frame.header.opcode();
        let request_id = frame.header.request_id();
        let result = self.dispatch(plans, frame, origin).await;

        if frame.header.flags().contains(RpcFlags::NO_REPLY) {
            return None;
        }

        let mut out = self.writers.acquire();
        match result {
            Ok(body) => write_frame(&mut out, opcode, RpcFlags::RESPONSE, request_id, &body),
            Err(err) => {
                tracing::warn!(%opcode, request_id, ?origin, error = %err, "request refused");
                RpcFrame::new(opcode, RpcFlags::RESPONSE | RpcFlags::ERROR, request_id, err.to_string().into_bytes())
                    .write_to(&mut out);
            },
        }
        Some(out)
    }

    async fn dispatch(self: &Arc<Self>, plans: &PlanSet, frame: &RpcFrame, origin: Origin) -> Result<Writer, HandlerError> {
        let opcode = frame.header.opcode();
        let entry = self.handlers.require(opcode)?;
        if origin == Origin::Stream && entry.scope == Scope::Cluster {
            return Err(HandlerError::Forbidden(opcode));
        }

        let request = plans.require(opcode, false)?.decode(&frame.body)?;
        tracing::debug!(%opcode, request_id = frame.header.request_id(), ?origin, "dispatching");
        let response = entry.handler.call(self, &request).await?;
        Ok(self.local_plans.require(opcode, true)?.write(&response, &self.writers)?)
    }

    /// Push freshly appended transactions to every connected peer.
    ///
    /// Returns true once every peer has stored them, false if any refused or
    /// the replication timeout elapsed first. Pushes still running at the
    /// timeout carry on in the background.
    pub async fn replicate(self: &Arc<Self>, appended: Vec<(ChainKind, Transaction)>, timestamp: u64, object: Option<ContentRef>) -> bool {
        let peers = self.peers.snapshot();
        if peers.is_empty() {
            return true;
        }

        let (pending, completer) = self.transactions.begin(timestamp, object);
        let sequence = appended.last().map(|(_, tx)| tx.sequence);
        let appended = Arc::new(appended);
        let node = Arc::clone(self);

        tokio::spawn(async move {
            let mut pushes = JoinSet::new();
            for peer in peers {
                let node = Arc::clone(&node);
                let appended = Arc::clone(&appended);
                pushes.spawn(async move {
                    let result = node.push(&peer, &appended).await;
                    if let Err(err) = &result {
                        tracing::warn!(peer = peer.peer_id(), error = %err, "replication failed");
                    }
                    result.is_ok()
                });
            }

            let mut all = true;
            while let Some(joined) = pushes.join_next().await {
                all &= joined.unwrap_or(false);
            }
            completer.done(sequence, all);
        });

        match pending.wait_timeout(self.settings.replication_timeout).await {
            Some(completion) => completion.valid,
            None => {
                tracing::warn!(?sequence, "replication not acknowledged in time");
                false
            },
        }
    }

    /// Store `appended` on one peer, catching it up first if it is behind.
    async fn push(&self, peer: &PeerClient, appended: &[(ChainKind, Transaction)]) -> Result<(), CallError> {
        for (kind, tx) in appended {
            let response = peer.call(REPLICATE, &replicate_request(*kind, tx)).await?;
            if response.get("accepted").and_then(Value::as_bool) == Some(true) {
                continue;
            }

            let expected = response.get("expected").and_then(Value::as_u64).unwrap_or(1);
            if expected > tx.sequence {
                // The peer holds a different transaction at this sequence
                return Err(CallError::Remote {
                    peer: peer.peer_id(),
                    message: format!("conflicting transaction at sequence {} of {kind:?}", tx.sequence),
                });
            }

            let missing = self
                .ledger
                .transactions_after(*kind, expected.saturating_sub(1))
                .map_err(|err| CallError::Remote { peer: peer.peer_id(), message: err.to_string() })?;
            tracing::info!(peer = peer.peer_id(), chain = ?kind, from = expected, count = missing.len(), "catching up peer");

            for earlier in missing.iter().filter(|t| t.sequence <= tx.sequence) {
                let response = peer.call(REPLICATE, &replicate_request(*kind, earlier)).await?;
                if response.get("accepted").and_then(Value::as_bool) != Some(true) {
                    return Err(CallError::Remote {
                        peer: peer.peer_id(),
                        message: format!("refused sequence {} of {kind:?}", earlier.sequence),
                    });
                }
            }
        }
        Ok(())
    }

    /// Accept inter-node links until the transport fails.
    pub async fn serve_links<T: Transport>(self: Arc<Self>, transport: T) -> Result<(), ServerError> {
        tracing::info!(addr = %transport.local_addr()?, "accepting links");
        loop {
            let (stream, remote) = transport.accept().await?;
            tracing::debug!(%remote, "link accepted");
            let node = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = session::run_link(node, stream, LinkSide::Accept).await {
                    tracing::warn!(%remote, error = %err, "link ended with error");
                }
            });
        }
    }

    /// Accept streaming clients until the transport fails.
    pub async fn serve_streams<T: Transport>(self: Arc<Self>, transport: T) -> Result<(), ServerError> {
        tracing::info!(addr = %transport.local_addr()?, "accepting stream clients");
        loop {
            let (socket, remote) = transport.accept().await?;
            let node = Arc::clone(&self);
            tokio::spawn(async move {
                match stream::run_stream(node, socket).await {
                    Ok(()) => tracing::debug!(%remote, "stream client left"),
                    Err(err) => tracing::warn!(%remote, error = %err, "stream client dropped"),
                }
            });
        }
    }

    /// Dial every peer with a higher id and keep the links up.
    pub fn connect_peers<T: Transport>(self: &Arc<Self>, transport: &Arc<T>) {
        let me = self.node_id();
        for peer in self.settings.cluster.peers(me).filter(|p| p.id > me) {
            match peer.rpc_addr() {
                Some(addr) => {
                    tokio::spawn(Arc::clone(self).maintain_link(Arc::clone(transport), peer.id, addr));
                },
                None => tracing::warn!(peer = peer.id, "peer has no address, not dialing"),
            }
        }
    }

    /// Dial `peer_id` at `addr`, redialing whenever the link drops.
    pub async fn maintain_link<T: Transport>(self: Arc<Self>, transport: Arc<T>, peer_id: u32, addr: SocketAddr) {
        loop {
            match transport.connect(addr).await {
                Ok(stream) => match session::run_link(Arc::clone(&self), stream, LinkSide::Dial { peer_id }).await {
                    Ok(()) => tracing::info!(peer_id, "link closed"),
                    Err(err) => tracing::warn!(peer_id, error = %err, "link failed"),
                },
                Err(err) => tracing::debug!(peer_id, %addr, error = %err, "dial failed"),
            }
            self.env.sleep(self.settings.reconnect_delay).await;
        }
    }
}

impl<E: Environment> std::fmt::Debug for Node<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.settings.node_id)
            .field("peers", &self.peers.len())
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

/// `MAX_BODY_SIZE` less what a `Replicate` request adds around a ledger body.
fn max_change_body(plans: &PlanSet, writers: &WriterPool) -> Result<usize, ServerError> {
    let empty = Transaction { sequence: u64::MAX, timestamp: u64::MAX, body: Bytes::new() };
    let overhead = plans.require(REPLICATE, false)?.write(&replicate_request(ChainKind::PrivateHost, &empty), writers)?.len();
    Ok(MAX_BODY_SIZE.saturating_sub(overhead))
}

fn replicate_request(kind: ChainKind, tx: &Transaction) -> Record {
    Record::new(content::REPLICATE_REQUEST)
        .with("chain", Value::U8(kind.to_u8()))
        .with("sequence", Value::U64(tx.sequence))
        .with("timestamp", Value::Timestamp(tx.timestamp))
        .with("body", Value::Bytes(tx.body.clone()))
}

/// Ledger subscriber: every stored change id seeds id assignment.
fn observe_change(assigner: &IdAssigner, plan: &FieldPlan, kind: ChainKind, tx: &Transaction) {
    let Ok(change) = plan.decode(&tx.body) else {
        tracing::debug!(chain = ?kind, sequence = tx.sequence, "transaction is not a change record");
        return;
    };
    match (change.get("table").and_then(Value::as_str), change.get("object_id").and_then(Value::as_u64)) {
        (Some(table), Some(id)) if !table.is_empty() => assigner.observe(table, id),
        _ => {},
    }
}
