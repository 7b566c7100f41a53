//! Request correlation table.
//!
//! Each link owns one [`RequestTable`] mapping in-flight request ids to the
//! caller waiting for the response. Ids come from a bounded space: the table
//! starts small, doubles when every id is outstanding, and stops growing at
//! [`RequestTableConfig::max_capacity`]. Once saturated, [`RequestTable::reserve`]
//! returns `None` and callers back off until [`RequestTable::wait_for_capacity`]
//! resolves.
//!
//! An id is never issued twice while it is outstanding: it only re-enters the
//! free stack through [`RequestTable::complete`] or [`RequestTable::drain`].
//! A caller that stops waiting calls [`RequestTable::abandon`] instead, which
//! keeps the id reserved until the late response arrives or the link closes,
//! so that response cannot be mistaken for the answer to a newer request.

use std::pin::pin;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Correlation id carried in the RPC header.
pub type RequestId = u32;

/// Request table sizing.
#[derive(Debug, Clone)]
pub struct RequestTableConfig {
    /// Ids available before the first growth
    pub initial_capacity: usize,
    /// Hard cap on outstanding requests
    pub max_capacity: usize,
}

impl Default for RequestTableConfig {
    fn default() -> Self {
        Self { initial_capacity: 16, max_capacity: 1000 }
    }
}

enum Entry<T> {
    Free,
    Pending(T),
    /// Caller gave up; the id stays taken until its response shows up
    Abandoned,
}

struct Slots<T> {
    entries: Vec<Entry<T>>,
    free: Vec<RequestId>,
    outstanding: usize,
    saturated: bool,
}

impl<T> Slots<T> {
    /// Extend the id space; false if already at the cap.
    fn grow(&mut self, initial: usize, max: usize) -> bool {
        let current = self.entries.len();
        let target = if current == 0 { initial.max(1) } else { current.saturating_mul(2) }.min(max);
        if target <= current {
            return false;
        }

        self.entries.resize_with(target, || Entry::Free);
        // Highest ids go in first so the lowest free id pops next.
        self.free.extend((current..target).rev().map(|id| id as RequestId));
        true
    }
}

/// Bounded id -> pending-call table for one link.
pub struct RequestTable<T> {
    config: RequestTableConfig,
    slots: Mutex<Slots<T>>,
    capacity: Notify,
}

impl<T> RequestTable<T> {
    /// Empty table; no ids are allocated until the first reserve.
    pub fn new(config: RequestTableConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(Slots { entries: Vec::new(), free: Vec::new(), outstanding: 0, saturated: false }),
            capacity: Notify::new(),
        }
    }

    /// Store `pending` under a fresh id.
    ///
    /// Returns `None` when the table is full and may not grow further.
    pub fn reserve(&self, pending: T) -> Option<RequestId> {
        let mut slots = self.slots.lock();

        if slots.free.is_empty() && !slots.grow(self.config.initial_capacity, self.config.max_capacity) {
            if !slots.saturated {
                tracing::debug!(max = self.config.max_capacity, "request table saturated");
            }
            slots.saturated = true;
            return None;
        }

        let id = slots.free.pop()?;
        slots.entries[id as usize] = Entry::Pending(pending);
        slots.outstanding += 1;
        Some(id)
    }

    /// Remove and return the call waiting on `id`, freeing the id.
    ///
    /// Unknown or already-completed ids return `None`. An abandoned id is
    /// freed and also returns `None`.
    pub fn complete(&self, id: RequestId) -> Option<T> {
        let mut slots = self.slots.lock();
        let entry = slots.entries.get_mut(id as usize)?;
        let pending = match std::mem::replace(entry, Entry::Free) {
            Entry::Pending(pending) => Some(pending),
            Entry::Abandoned => {
                tracing::trace!(id, "released abandoned request id");
                None
            },
            Entry::Free => return None,
        };

        slots.free.push(id);
        slots.outstanding -= 1;
        let was_saturated = std::mem::take(&mut slots.saturated);
        drop(slots);

        if was_saturated {
            self.capacity.notify_waiters();
        }
        pending
    }

    /// Take back the call waiting on `id` without freeing the id.
    ///
    /// The id is released by the [`complete`](Self::complete) of its late
    /// response, or by [`drain`](Self::drain).
    pub fn abandon(&self, id: RequestId) -> Option<T> {
        let mut slots = self.slots.lock();
        let entry = slots.entries.get_mut(id as usize)?;
        match std::mem::replace(entry, Entry::Abandoned) {
            Entry::Pending(pending) => Some(pending),
            previous => {
                *entry = previous;
                None
            },
        }
    }

    /// Remove every in-flight call, in id order, and release abandoned ids.
    pub fn drain(&self) -> Vec<(RequestId, T)> {
        let mut slots = self.slots.lock();
        let drained: Vec<(RequestId, T)> = slots
            .entries
            .iter_mut()
            .enumerate()
            .filter_map(|(id, entry)| match std::mem::replace(entry, Entry::Free) {
                Entry::Pending(pending) => Some((id as RequestId, pending)),
                Entry::Free | Entry::Abandoned => None,
            })
            .collect();

        let len = slots.entries.len();
        slots.free.clear();
        slots.free.extend((0..len).rev().map(|id| id as RequestId));
        slots.outstanding = 0;
        slots.saturated = false;
        drop(slots);

        self.capacity.notify_waiters();
        drained
    }

    /// Resolves once an id can be reserved.
    pub async fn wait_for_capacity(&self) {
        loop {
            let mut notified = pin!(self.capacity.notified());
            notified.as_mut().enable();
            if self.has_capacity() {
                return;
            }
            notified.await;
        }
    }

    /// True if `reserve` would currently succeed.
    pub fn has_capacity(&self) -> bool {
        let slots = self.slots.lock();
        !slots.free.is_empty() || slots.entries.len() < self.config.max_capacity
    }

    /// Ids currently taken, abandoned ones included.
    pub fn outstanding(&self) -> usize {
        self.slots.lock().outstanding
    }

    /// Ids held only because a late response may still arrive.
    pub fn abandoned(&self) -> usize {
        self.slots.lock().entries.iter().filter(|e| matches!(e, Entry::Abandoned)).count()
    }

    /// Size of the id space allocated so far.
    pub fn capacity(&self) -> usize {
        self.slots.lock().entries.len()
    }
}

impl<T> Default for RequestTable<T> {
    fn default() -> Self {
        Self::new(RequestTableConfig::default())
    }
}

impl<T> std::fmt::Debug for RequestTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.slots.lock();
        f.debug_struct("RequestTable")
            .field("capacity", &slots.entries.len())
            .field("outstanding", &slots.outstanding)
            .field("saturated", &slots.saturated)
            .finish()
    }
}
