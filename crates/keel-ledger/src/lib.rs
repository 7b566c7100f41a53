//! Append-only replicated chains.
//!
//! A project owns four chains, each stored as one append-only file:
//!
//! | Chain         | File                         | Base chain    |
//! |---------------|------------------------------|---------------|
//! | `Public`      | `<project>public.lbc`        |               |
//! | `Private`     | `<project>private.lbc`       | `Public`      |
//! | `PublicHost`  | `<project>publichost.lbc`    |               |
//! | `PrivateHost` | `<project>privatehost.lbc`   | `PublicHost`  |
//!
//! [`Ledger::load`] replays every stored transaction through one callback in
//! append order and optionally keeps that callback subscribed to every future
//! append. Records are framed by the same phase reader that parses network
//! frames, which is also what lets [`ChainTail`] follow a file another process
//! is appending to.
//!
//! Ordering holds per chain only; there is no cross-chain order.

pub mod chain;
pub mod error;
pub mod ledger;
pub mod record;
pub mod tail;

pub use chain::ChainKind;
pub use error::LedgerError;
pub use ledger::{Ledger, LedgerConfig};
pub use record::{RecordHeader, RecordTable, Transaction};
pub use tail::ChainTail;
