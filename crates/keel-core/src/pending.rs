//! Pooled completion tokens for distributed steps.
//!
//! A [`PendingTransaction`] is a `Future` that resolves when some other task
//! (usually the receive loop of a peer link) calls [`Completer::done`]. Token
//! cells live in a [`TransactionPool`] arena and are reused: dropping the
//! future resets its cell and bumps the cell's generation before the slot
//! index goes back on the free stack, so a completer left over from an
//! earlier use can never fire into a later one.
//!
//! `done` fires at most once per use regardless of how many completer clones
//! race, and may be called from any thread.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
    time::Duration,
};

use keel_proto::ContentRef;
use parking_lot::Mutex;

/// Result delivered to the waiting task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Timestamp of the awaited operation
    pub timestamp: u64,
    /// Object the operation concerns
    pub object: Option<ContentRef>,
    /// Id discovered by the operation, if any
    pub result_id: Option<u64>,
    /// False if the operation was rejected
    pub valid: bool,
}

#[derive(Default)]
struct TokenState {
    generation: u64,
    done: bool,
    timestamp: u64,
    object: Option<ContentRef>,
    result_id: Option<u64>,
    valid: bool,
    waker: Option<Waker>,
}

impl TokenState {
    fn reset(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.done = false;
        self.timestamp = 0;
        self.object = None;
        self.result_id = None;
        self.valid = false;
        self.waker = None;
    }

    fn completion(&self) -> Completion {
        Completion { timestamp: self.timestamp, object: self.object, result_id: self.result_id, valid: self.valid }
    }
}

type Cell = Arc<Mutex<TokenState>>;

#[derive(Default)]
struct Arena {
    cells: Vec<Cell>,
    free: Vec<usize>,
}

/// Free list of token cells.
#[derive(Clone, Default)]
pub struct TransactionPool {
    arena: Arc<Mutex<Arena>>,
}

impl TransactionPool {
    /// Empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting on an operation stamped `timestamp` concerning `object`.
    pub fn begin(&self, timestamp: u64, object: Option<ContentRef>) -> (PendingTransaction, Completer) {
        let (slot, cell) = {
            let mut arena = self.arena.lock();
            match arena.free.pop() {
                Some(slot) => (slot, Arc::clone(&arena.cells[slot])),
                None => {
                    let cell: Cell = Arc::default();
                    arena.cells.push(Arc::clone(&cell));
                    (arena.cells.len() - 1, cell)
                },
            }
        };

        let generation = {
            let mut state = cell.lock();
            state.timestamp = timestamp;
            state.object = object;
            state.generation
        };

        let pending = PendingTransaction { cell: Arc::clone(&cell), slot, generation, pool: Arc::clone(&self.arena) };
        (pending, Completer { cell, generation })
    }

    /// `(allocated, idle)` token counts.
    pub fn stats(&self) -> (usize, usize) {
        let arena = self.arena.lock();
        (arena.cells.len(), arena.free.len())
    }
}

impl fmt::Debug for TransactionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (allocated, idle) = self.stats();
        f.debug_struct("TransactionPool").field("allocated", &allocated).field("idle", &idle).finish()
    }
}

/// Awaitable side of a completion token.
///
/// Dropping it (after completion or not) returns the token to its pool.
pub struct PendingTransaction {
    cell: Cell,
    slot: usize,
    generation: u64,
    pool: Arc<Mutex<Arena>>,
}

impl PendingTransaction {
    /// Timestamp of the awaited operation.
    pub fn timestamp(&self) -> u64 {
        self.cell.lock().timestamp
    }

    /// Object the operation concerns.
    pub fn object(&self) -> Option<ContentRef> {
        self.cell.lock().object
    }

    /// True once `done` has been called.
    pub fn is_done(&self) -> bool {
        self.cell.lock().done
    }

    /// Wait at most `timeout`; `None` if it elapsed first.
    ///
    /// Either way the token goes back to the pool.
    pub async fn wait_timeout(mut self, timeout: Duration) -> Option<Completion> {
        tokio::time::timeout(timeout, &mut self).await.ok()
    }
}

impl Future for PendingTransaction {
    type Output = Completion;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Completion> {
        let mut state = self.cell.lock();
        if state.done {
            return Poll::Ready(state.completion());
        }
        if state.waker.as_ref().is_none_or(|w| !w.will_wake(cx.waker())) {
            state.waker = Some(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl Drop for PendingTransaction {
    fn drop(&mut self) {
        {
            let mut state = self.cell.lock();
            if state.generation == self.generation {
                state.reset();
            }
        }
        self.pool.lock().free.push(self.slot);
    }
}

impl fmt::Debug for PendingTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTransaction")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Signalling side of a completion token. Cheap to clone and `Send`.
#[derive(Clone)]
pub struct Completer {
    cell: Cell,
    generation: u64,
}

impl Completer {
    /// Complete the operation.
    ///
    /// Returns false if the token was already completed or has since been
    /// recycled; in both cases nothing is delivered.
    pub fn done(&self, result_id: Option<u64>, valid: bool) -> bool {
        let waker = {
            let mut state = self.cell.lock();
            if state.generation != self.generation || state.done {
                return false;
            }
            state.done = true;
            state.result_id = result_id;
            state.valid = valid;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }
}

impl fmt::Debug for Completer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer").field("generation", &self.generation).finish_non_exhaustive()
    }
}
