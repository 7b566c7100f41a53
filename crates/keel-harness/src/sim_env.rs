//! Simulated environment.
//!
//! Time comes from the tokio clock turmoil drives, randomness from a seeded
//! ChaCha generator shared by every clone.

use std::{sync::Arc, time::Duration};

use keel_core::Environment;
use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::time::Instant;

/// Wall clock reading at simulation start (2024-01-01T00:00:00Z).
const EPOCH_MILLIS: u64 = 1_704_067_200_000;

/// Deterministic [`Environment`] for turmoil hosts.
#[derive(Clone)]
pub struct SimEnv {
    rng: Arc<Mutex<ChaCha8Rng>>,
    origin: Instant,
}

impl SimEnv {
    /// Environment seeded with 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment whose random stream is fixed by `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self { rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))), origin: Instant::now() }
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimEnv").field("elapsed", &self.origin.elapsed()).finish_non_exhaustive()
    }
}

impl Environment for SimEnv {
    fn now(&self) -> std::time::Instant {
        Instant::now().into_std()
    }

    fn wall_clock_millis(&self) -> u64 {
        EPOCH_MILLIS + self.origin.elapsed().as_millis() as u64
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buf: &mut [u8]) {
        self.rng.lock().fill_bytes(buf);
    }
}
