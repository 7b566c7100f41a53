//! Keel core logic
//!
//! Protocol logic for inter-node links and the coordination primitives built
//! on top of them, decoupled from sockets and the runtime.
//!
//! # Architecture
//!
//! The link is a deterministic state machine: time is passed in, and every
//! transition returns declarative [`link::LinkAction`]s that a driver (the
//! server, or the simulation harness) executes. Shared structures that must
//! be touched from many tasks ([`requests::RequestTable`],
//! [`pending::TransactionPool`], [`stripe::IdAssigner`]) each guard their
//! state with one independent mutex and never take another lock while
//! holding it.
//!
//! # Components
//!
//! - [`link`]: Link state machine (authenticated handshake, heartbeat, timeout)
//! - [`auth`]: Handshake signatures
//! - [`requests`]: Request-id correlation table
//! - [`pending`]: Pooled completion tokens
//! - [`cluster`]: Cluster membership and stripe ownership
//! - [`stripe`]: Coordination-free id assignment
//! - [`mod@env`]: Environment abstraction (time, RNG)
//! - [`transport`]: Transport abstraction (streams)
//! - [`error`]: Error types

pub mod auth;
pub mod cluster;
pub mod env;
pub mod error;
pub mod link;
pub mod pending;
pub mod requests;
pub mod stripe;
pub mod transport;

pub use auth::HandshakeKey;
pub use cluster::{ClusterMap, ClusterNode, NodeKind};
pub use env::Environment;
pub use error::{ClusterError, KeyError, LinkError};
pub use link::{Link, LinkAction, LinkConfig, LinkIdentity, LinkRole, LinkState};
pub use pending::{Completer, Completion, PendingTransaction, TransactionPool};
pub use requests::{RequestId, RequestTable, RequestTableConfig};
pub use stripe::{IdAssigner, StripeTable};
pub use transport::Transport;
