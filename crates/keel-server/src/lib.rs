//! Keel cluster node.
//!
//! A node accepts authenticated links from other nodes and streaming
//! connections from clients, assigns ids from the stripes it owns, and
//! appends change records to the project's chains, replicating each append
//! to every connected peer.
//!
//! The binary in `main.rs` wires these pieces to tokio TCP; the test harness
//! wires the same [`Node`] to a simulated network.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod messages;
pub mod node;
pub mod peer;
pub mod session;
pub mod stream;
pub mod system;

pub use config::{Args, NodeSettings};
pub use error::{CallError, HandlerError, ServerError};
pub use handlers::Handler;
pub use node::{Node, Origin};
pub use peer::{PeerClient, PeerSet};
pub use session::{LinkSide, run_link};
pub use stream::run_stream;
pub use system::{SystemEnv, TcpTransport};
