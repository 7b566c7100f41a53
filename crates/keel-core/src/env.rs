//! Environment abstraction.
//!
//! Drivers obtain time and randomness through [`Environment`] so the same
//! code runs against the system clock in production and against simulated
//! time in the turmoil harness.

use std::{
    future::Future,
    time::{Duration, Instant},
};

/// Source of time and randomness.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Monotonic now.
    fn now(&self) -> Instant;

    /// Milliseconds since the Unix epoch, for ledger timestamps.
    fn wall_clock_millis(&self) -> u64;

    /// Suspend for `duration`.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;

    /// Fill `buf` with random bytes.
    fn random_bytes(&self, buf: &mut [u8]);

    /// Random `u64`, used for session ids.
    fn random_u64(&self) -> u64 {
        let mut raw = [0u8; 8];
        self.random_bytes(&mut raw);
        u64::from_le_bytes(raw)
    }
}
