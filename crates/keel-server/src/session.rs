//! Inter-node link driver.
//!
//! Runs one [`Link`] state machine over one byte stream:
//!
//! - a single [`Reader`] turns received bytes into RPC frames, in arrival
//!   order;
//! - session opcodes go to the state machine, whose actions are executed
//!   here;
//! - requests are dispatched on their own task so a slow handler never stalls
//!   the receive loop, responses complete waiting calls;
//! - a writer task owns the write half and drains a bounded queue.
//!
//! Whatever ends the link (hang-up, protocol fault, failed handshake, timeout)
//! the peer is unregistered and every in-flight call is failed.

use std::{ops::ControlFlow, sync::Arc, time::Duration};

use keel_core::{Environment, Link, LinkAction, LinkError, RequestTable};
use keel_proto::{Payload, PlanSet, Reader, RpcFrame, RpcTable};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    time::MissedTickBehavior,
};

use crate::{
    error::ServerError,
    node::{Node, Origin},
    peer::{self, Outbound, PeerChannels, PeerClient, PendingCalls},
};

/// Bytes read from the socket per receive.
const READ_BUFFER: usize = 16 * 1024;

/// Frames queued for the writer before senders wait.
const OUTBOUND_QUEUE: usize = 256;

/// How often timeouts and heartbeats are checked.
const TICK: Duration = Duration::from_millis(100);

/// Time the writer gets to flush after the link ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Which end of the link this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSide {
    /// We dialed `peer_id`
    Dial {
        /// Node we expect to answer
        peer_id: u32,
    },
    /// We accepted the connection
    Accept,
}

/// Drive a link over `stream` until it closes.
pub async fn run_link<E, S>(node: Arc<Node<E>>, stream: S, side: LinkSide) -> Result<(), ServerError>
where
    E: Environment,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut read_half, write_half) = tokio::io::split(stream);
    let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE);
    let mut writer = tokio::spawn(write_loop(write_half, queue));

    let now = node.env().now();
    let identity = node.identity().clone();
    let config = node.settings().link.clone();
    let link = match side {
        LinkSide::Dial { peer_id } => Link::initiator(identity, peer_id, now, config),
        LinkSide::Accept => Link::responder(identity, node.env().random_u64(), now, config),
    };

    let mut session = LinkSession {
        requests: Arc::new(RequestTable::new(node.settings().requests.clone())),
        node,
        link,
        outbound: outbound.clone(),
        remote_plans: None,
        registered: None,
    };
    let result = session.run(&mut read_half).await;
    session.finish();
    drop(session);

    let flush = async {
        if outbound.send(Outbound::Shutdown).await.is_err() {
            tracing::trace!("link writer already stopped");
        }
        (&mut writer).await
    };
    let flushed = tokio::time::timeout(FLUSH_TIMEOUT, flush).await;
    match flushed {
        Ok(Ok(Err(err))) => tracing::debug!(error = %err, "link writer failed"),
        Ok(_) => {},
        Err(_) => {
            tracing::debug!("link writer did not flush in time");
            writer.abort();
        },
    }
    result
}

async fn write_loop<W: AsyncWrite + Unpin>(mut sink: W, mut queue: mpsc::Receiver<Outbound>) -> std::io::Result<()> {
    while let Some(item) = queue.recv().await {
        match item {
            Outbound::Frame(frame) => {
                for chunk in frame.chunks() {
                    sink.write_all(chunk).await?;
                }
                // Only flush when nothing else is queued.
                if queue.is_empty() {
                    sink.flush().await?;
                }
            },
            Outbound::Shutdown => break,
        }
    }
    sink.shutdown().await
}

struct LinkSession<E: Environment> {
    node: Arc<Node<E>>,
    link: Link,
    outbound: mpsc::Sender<Outbound>,
    requests: Arc<PendingCalls>,
    /// Peer layouts, set once authenticated
    remote_plans: Option<Arc<PlanSet>>,
    /// `(peer_id, session_id)` registered in the peer set
    registered: Option<(u32, u64)>,
}

impl<E: Environment> LinkSession<E> {
    async fn run<R: AsyncRead + Unpin>(&mut self, read_half: &mut R) -> Result<(), ServerError> {
        let actions = self.link.start(self.node.env().now())?;
        if self.execute(actions).await.is_break() {
            return Ok(());
        }

        let mut reader = Reader::new(RpcTable::new());
        let mut buf = vec![0u8; READ_BUFFER];
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                read = read_half.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        tracing::info!(peer = ?self.link.peer_id(), "peer hung up");
                        return Ok(());
                    }
                    let frames = match reader.feed(&buf[..n]) {
                        Ok(frames) => frames,
                        Err(err) => {
                            self.abort(&err.to_string()).await;
                            return Err(err.into());
                        },
                    };
                    for frame in frames {
                        if self.handle_frame(frame).await?.is_break() {
                            return Ok(());
                        }
                    }
                }
                _ = ticker.tick() => {
                    let actions = self.link.tick(self.node.env().now());
                    if self.execute(actions).await.is_break() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: RpcFrame) -> Result<ControlFlow<()>, ServerError> {
        let now = self.node.env().now();
        let opcode = frame.header.opcode();
        tracing::trace!(%opcode, request_id = frame.header.request_id(), len = frame.body.len(), "frame received");

        if opcode.is_session() {
            let payload = match Payload::from_frame(&frame) {
                Ok(payload) => payload,
                Err(err) => {
                    self.abort(&err.to_string()).await;
                    return Err(err.into());
                },
            };
            let actions = self.link.handle_payload(&payload, now)?;
            return Ok(self.execute(actions).await);
        }

        let Some(plans) = self.remote_plans.clone() else {
            let state = self.link.state();
            self.abort("application frame before handshake").await;
            return Err(LinkError::UnexpectedPayload { state, opcode }.into());
        };
        self.link.update_activity(now);

        if frame.header.is_response() {
            let peer_id = self.registered.map_or(0, |(peer_id, _)| peer_id);
            peer::route_response(&self.requests, peer_id, frame);
            return Ok(ControlFlow::Continue(()));
        }

        let node = Arc::clone(&self.node);
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            if let Some(reply) = node.serve_request(&plans, &frame, Origin::Link).await {
                if outbound.send(Outbound::Frame(reply)).await.is_err() {
                    tracing::debug!(%opcode, "link closed before reply");
                }
            }
        });
        Ok(ControlFlow::Continue(()))
    }

    async fn execute(&mut self, actions: Vec<LinkAction>) -> ControlFlow<()> {
        for action in actions {
            match action {
                LinkAction::Send(payload) => {
                    let frame = match payload.to_frame(0) {
                        Ok(frame) => frame,
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to encode session payload");
                            return ControlFlow::Break(());
                        },
                    };
                    let mut out = self.node.writers().acquire();
                    frame.write_to(&mut out);
                    if self.outbound.send(Outbound::Frame(out)).await.is_err() {
                        return ControlFlow::Break(());
                    }
                },
                LinkAction::Authenticated { peer_id, session_id } => self.register(peer_id, session_id),
                LinkAction::Close { reason } => {
                    tracing::info!(peer = ?self.link.peer_id(), %reason, "closing link");
                    return ControlFlow::Break(());
                },
            }
        }
        ControlFlow::Continue(())
    }

    async fn abort(&mut self, reason: &str) {
        tracing::warn!(peer = ?self.link.peer_id(), reason, "protocol fault");
        let actions = self.link.close(reason);
        if self.execute(actions).await.is_break() {
            tracing::debug!(peer = ?self.link.peer_id(), "link writer gone while closing");
        }
    }

    fn register(&mut self, peer_id: u32, session_id: u64) {
        let plans = Arc::new(self.link.plans().clone());
        self.remote_plans = Some(Arc::clone(&plans));

        self.node.peers().insert(PeerClient::new(peer_id, session_id, PeerChannels {
            outbound: self.outbound.clone(),
            requests: Arc::clone(&self.requests),
            local: self.node.local_plans(),
            remote: plans,
            writers: self.node.writers().clone(),
            timeout: self.node.settings().call_timeout,
        }));
        self.registered = Some((peer_id, session_id));
    }

    fn finish(&mut self) {
        if let Some((peer_id, session_id)) = self.registered.take() {
            self.node.peers().remove(peer_id, session_id);
        }
        let abandoned = self.requests.drain();
        if !abandoned.is_empty() {
            tracing::info!(peer = ?self.link.peer_id(), calls = abandoned.len(), "failing calls on closed link");
        }
    }
}
