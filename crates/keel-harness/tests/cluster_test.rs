//! Cluster integration tests.
//!
//! Two complete nodes on simulated hosts:
//! - Link handshake and calls in both directions of registration
//! - Handshake failure with mismatched keys
//! - Replication of appended changes, including catch-up of a lagging peer
//! - Replication under partition
//! - Conflicting appends made while unlinked

use std::{path::PathBuf, sync::Arc, time::Duration};

use keel_core::HandshakeKey;
use keel_harness::{SimEnv, SimNode, SimNodeConfig, sim_node};
use keel_ledger::ChainKind;
use keel_proto::{Reader, Record, RpcFlags, RpcFrame, RpcTable, Value};
use keel_server::{
    Node, Origin,
    messages::{self, APPEND_CHANGE, RESERVE_ID},
};
use parking_lot::Mutex;
use tempfile::TempDir;

type Slot = Arc<Mutex<Option<Arc<Node<SimEnv>>>>>;

struct Fixture {
    _dirs: Vec<TempDir>,
    configs: Vec<SimNodeConfig>,
}

impl Fixture {
    fn new(keys: [[u8; 32]; 2]) -> Self {
        let cluster = sim_node::cluster(4, &[&[0, 2], &[1, 3]]).unwrap();
        let dirs: Vec<TempDir> = (0..2).map(|_| tempfile::tempdir().unwrap()).collect();
        let configs = dirs
            .iter()
            .zip(keys)
            .zip(1u32..)
            .map(|((dir, key), node_id)| SimNodeConfig {
                node_id,
                cluster: cluster.clone(),
                key: HandshakeKey::new(&key).unwrap(),
                ledger_dir: PathBuf::from(dir.path()),
                seed: u64::from(node_id),
                replication_timeout: Duration::from_secs(1),
            })
            .collect();
        Self { _dirs: dirs, configs }
    }

    fn shared_key() -> Self {
        Self::new([[9u8; 32]; 2])
    }

    fn config(&self, node_id: u32) -> SimNodeConfig {
        self.configs[node_id as usize - 1].clone()
    }
}

fn sim() -> turmoil::Sim<'static> {
    turmoil::Builder::new().simulation_duration(Duration::from_secs(60)).build()
}

/// Run node 2 on its own host for the rest of the simulation.
fn host_node2(sim: &mut turmoil::Sim<'_>, config: SimNodeConfig, slot: Slot) {
    sim.host(sim_node::host_name(2), move || {
        let config = config.clone();
        let slot = Arc::clone(&slot);
        async move {
            let node = SimNode::start(&config).await?;
            *slot.lock() = Some(Arc::clone(node.node()));
            std::future::pending::<()>().await;
            Ok(())
        }
    });
}

fn node2(slot: &Slot) -> Arc<Node<SimEnv>> {
    slot.lock().clone().unwrap()
}

async fn started_node2(slot: &Slot) -> Arc<Node<SimEnv>> {
    loop {
        if let Some(node) = slot.lock().clone() {
            return node;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn append(node: &Arc<Node<SimEnv>>, object_id: u64) -> Record {
    let record = messages::append_change(ChainKind::Public, "pages", object_id, b"title=Home", b"");
    let body = node.local_plans().require(APPEND_CHANGE, false).unwrap().write(&record, node.writers()).unwrap();
    let frame = RpcFrame::new(APPEND_CHANGE, RpcFlags::empty(), 1, body.to_bytes());

    let reply = node.serve_request(&node.local_plans(), &frame, Origin::Link).await.unwrap();
    let mut frames = Reader::new(RpcTable::new()).feed(&reply.to_bytes()).unwrap();
    let reply = frames.remove(0);
    assert!(!reply.header.flags().contains(RpcFlags::ERROR));
    node.local_plans().require(APPEND_CHANGE, true).unwrap().decode(&reply.body).unwrap()
}

#[test]
fn linked_nodes_serve_calls() -> turmoil::Result {
    let fixture = Fixture::shared_key();
    let slot = Slot::default();
    let mut sim = sim();
    host_node2(&mut sim, fixture.config(2), Arc::clone(&slot));

    let config = fixture.config(1);
    sim.client(sim_node::host_name(1), async move {
        let node = SimNode::start(&config).await?;
        node.dial_peers();
        assert!(node.wait_for_peer(2, Duration::from_secs(5)).await);

        // Node 2 owns stripes 1 and 3
        let peer = node.node().peer(2).unwrap();
        let first = peer.call(RESERVE_ID, &messages::reserve_id("pages")).await?;
        let second = peer.call(RESERVE_ID, &messages::reserve_id("pages")).await?;
        assert_eq!(first.get("id"), Some(&Value::U64(1)));
        assert_eq!(second.get("id"), Some(&Value::U64(3)));

        // The accepting side registered the link too and can call back
        let back = node2(&slot).peer(1).unwrap();
        let id = back.call(RESERVE_ID, &messages::reserve_id("pages")).await?;
        assert_eq!(id.get("id"), Some(&Value::U64(0)));
        Ok(())
    });

    sim.run()
}

#[test]
fn mismatched_keys_never_authenticate() -> turmoil::Result {
    let fixture = Fixture::new([[1u8; 32], [2u8; 32]]);
    let slot = Slot::default();
    let mut sim = sim();
    host_node2(&mut sim, fixture.config(2), Arc::clone(&slot));

    let config = fixture.config(1);
    sim.client(sim_node::host_name(1), async move {
        let node = SimNode::start(&config).await?;
        node.dial_peers();

        assert!(!node.wait_for_peer(2, Duration::from_secs(3)).await);
        assert!(node2(&slot).peer(1).is_none());
        Ok(())
    });

    sim.run()
}

#[test]
fn appended_changes_reach_the_peer() -> turmoil::Result {
    let fixture = Fixture::shared_key();
    let slot = Slot::default();
    let mut sim = sim();
    host_node2(&mut sim, fixture.config(2), Arc::clone(&slot));

    let config = fixture.config(1);
    sim.client(sim_node::host_name(1), async move {
        let node = SimNode::start(&config).await?;
        node.dial_peers();
        assert!(node.wait_for_peer(2, Duration::from_secs(5)).await);

        let record = append(node.node(), 5).await;
        assert_eq!(record.get("replicated"), Some(&Value::Bool(true)));

        let peer = node2(&slot);
        assert_eq!(peer.ledger().next_sequence(ChainKind::Public), 2);
        let stored = peer.ledger().transactions_after(ChainKind::Public, 0)?;
        assert_eq!(stored[0].body, node.node().encode_change("pages", 5, b"title=Home")?);

        // The replicated id seeds the peer's own assignment
        assert_eq!(peer.assigner().assign("pages")?, 9);
        Ok(())
    });

    sim.run()
}

#[test]
fn lagging_peer_is_caught_up() -> turmoil::Result {
    let fixture = Fixture::shared_key();
    let slot = Slot::default();
    let mut sim = sim();
    host_node2(&mut sim, fixture.config(2), Arc::clone(&slot));

    let config = fixture.config(1);
    sim.client(sim_node::host_name(1), async move {
        let node = SimNode::start(&config).await?;

        // No link yet: nothing to wait for
        for object_id in [2, 4] {
            let record = append(node.node(), object_id).await;
            assert_eq!(record.get("replicated"), Some(&Value::Bool(true)));
        }

        node.dial_peers();
        assert!(node.wait_for_peer(2, Duration::from_secs(5)).await);

        let record = append(node.node(), 6).await;
        assert_eq!(record.get("sequence"), Some(&Value::U64(3)));
        assert_eq!(record.get("replicated"), Some(&Value::Bool(true)));

        let stored = node2(&slot).ledger().transactions_after(ChainKind::Public, 0)?;
        let sequences: Vec<u64> = stored.iter().map(|tx| tx.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        Ok(())
    });

    sim.run()
}

#[test]
fn diverged_chains_are_not_counted_as_replicated() -> turmoil::Result {
    let fixture = Fixture::shared_key();
    let slot = Slot::default();
    let mut sim = sim();
    host_node2(&mut sim, fixture.config(2), Arc::clone(&slot));

    let config = fixture.config(1);
    sim.client(sim_node::host_name(1), async move {
        let node = SimNode::start(&config).await?;
        let peer = started_node2(&slot).await;

        // Both append while unlinked
        append(node.node(), 2).await;
        append(&peer, 1).await;
        append(&peer, 3).await;

        node.dial_peers();
        assert!(node.wait_for_peer(2, Duration::from_secs(5)).await);

        let record = append(node.node(), 4).await;
        assert_eq!(record.get("sequence"), Some(&Value::U64(2)));
        assert_eq!(record.get("replicated"), Some(&Value::Bool(false)));

        // The peer kept its own chain
        let stored = peer.ledger().transactions_after(ChainKind::Public, 0)?;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].body, peer.encode_change("pages", 3, b"title=Home")?);
        Ok(())
    });

    sim.run()
}

#[test]
fn partitioned_peer_is_not_counted_as_replicated() -> turmoil::Result {
    let fixture = Fixture::shared_key();
    let slot = Slot::default();
    let mut sim = sim();
    host_node2(&mut sim, fixture.config(2), Arc::clone(&slot));

    let config = fixture.config(1);
    sim.client(sim_node::host_name(1), async move {
        let node = SimNode::start(&config).await?;
        node.dial_peers();
        assert!(node.wait_for_peer(2, Duration::from_secs(5)).await);

        turmoil::partition(sim_node::host_name(1), sim_node::host_name(2));
        let record = append(node.node(), 8).await;
        assert_eq!(record.get("sequence"), Some(&Value::U64(1)));
        assert_eq!(record.get("replicated"), Some(&Value::Bool(false)));

        // Stored locally regardless
        assert_eq!(node.node().ledger().next_sequence(ChainKind::Public), 2);
        turmoil::repair(sim_node::host_name(1), sim_node::host_name(2));
        Ok(())
    });

    sim.run()
}
