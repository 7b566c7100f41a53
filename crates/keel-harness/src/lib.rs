//! Deterministic simulation harness for Keel clusters.
//!
//! Turmoil-based implementations of the Environment and Transport traits, and
//! helpers that start complete nodes on simulated hosts so link, replication
//! and partition behaviour can be tested reproducibly.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod sim_env;
pub mod sim_node;
pub mod sim_transport;

pub use sim_env::SimEnv;
pub use sim_node::{SimNode, SimNodeConfig};
pub use sim_transport::SimTransport;
