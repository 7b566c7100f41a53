//! Fixed-size pooled byte segments.
//!
//! A [`SegmentPool`] hands out [`Segment`]s of one fixed capacity. Released
//! buffers are parked in a dense arena and their slot indices pushed onto a
//! LIFO free stack, so acquire and release are O(1) under a single pool-wide
//! mutex and the most recently used (cache-warm) buffer is reused first.
//!
//! A segment returns to its pool when dropped. Ownership makes the "one
//! writer at a time" rule structural: a segment can only be filled through
//! `&mut`, and a released segment no longer exists.

use std::{fmt, sync::Arc};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

/// Capacity used by [`SegmentPool::new`].
pub const DEFAULT_SEGMENT_CAPACITY: usize = 4096;

/// Pool of fixed-capacity segments. Cloning shares the pool.
#[derive(Clone)]
pub struct SegmentPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    capacity: usize,
    arena: Mutex<Arena>,
}

/// Parked buffers indexed by slot, plus the stack of slots holding one.
#[derive(Default)]
struct Arena {
    slots: Vec<Option<Box<[u8]>>>,
    free: Vec<usize>,
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Segments ever allocated by this pool
    pub allocated: usize,
    /// Segments parked on the free stack
    pub idle: usize,
    /// Segments currently owned by callers
    pub leased: usize,
}

impl SegmentPool {
    /// Pool of [`DEFAULT_SEGMENT_CAPACITY`]-byte segments.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SEGMENT_CAPACITY)
    }

    /// Pool whose segments hold `capacity` bytes (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                capacity: capacity.max(1),
                arena: Mutex::new(Arena::default()),
            }),
        }
    }

    /// Capacity of every segment in this pool.
    pub fn segment_capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Pop a parked segment, or allocate a new one if none is free.
    pub fn acquire(&self) -> Segment {
        let mut arena = self.shared.arena.lock();

        while let Some(slot) = arena.free.pop() {
            if let Some(buf) = arena.slots.get_mut(slot).and_then(Option::take) {
                return Segment { slot, buf, len: 0, pool: Arc::clone(&self.shared) };
            }
        }

        let slot = arena.slots.len();
        arena.slots.push(None);
        drop(arena);

        tracing::trace!(slot, capacity = self.shared.capacity, "allocated segment");
        let buf = vec![0u8; self.shared.capacity].into_boxed_slice();
        Segment { slot, buf, len: 0, pool: Arc::clone(&self.shared) }
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> PoolStats {
        let arena = self.shared.arena.lock();
        let allocated = arena.slots.len();
        let idle = arena.free.len();
        PoolStats { allocated, idle, leased: allocated - idle }
    }
}

impl Default for SegmentPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SegmentPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentPool")
            .field("capacity", &self.shared.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PoolShared {
    fn park(&self, slot: usize, buf: Box<[u8]>) {
        let mut arena = self.arena.lock();
        if let Some(entry) = arena.slots.get_mut(slot) {
            *entry = Some(buf);
            arena.free.push(slot);
        }
    }
}

/// A fixed-capacity byte block with a fill offset.
///
/// Invariant: `len() <= capacity()`.
pub struct Segment {
    slot: usize,
    buf: Box<[u8]>,
    len: usize,
    pool: Arc<PoolShared>,
}

impl Segment {
    /// Bytes written so far (the fill offset).
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total capacity.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Free space after the fill offset.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.len
    }

    /// Arena slot this segment occupies in its pool.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// The written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Append as much of `bytes` as fits; returns how many were copied.
    pub fn put(&mut self, bytes: &[u8]) -> usize {
        let count = bytes.len().min(self.remaining());
        self.buf[self.len..self.len + count].copy_from_slice(&bytes[..count]);
        self.len += count;
        count
    }

    /// Return the segment to its pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.park(self.slot, buf);
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("slot", &self.slot)
            .field("len", &self.len)
            .field("capacity", &self.buf.len())
            .finish()
    }
}

/// An ordered chain of segments forming one logical byte sequence.
///
/// Position in the chain is the next-segment link: segment `i + 1` continues
/// exactly where segment `i` filled up.
pub struct SegmentChain {
    pool: SegmentPool,
    segments: Vec<Segment>,
}

impl SegmentChain {
    /// Empty chain drawing from `pool`.
    pub fn new(pool: SegmentPool) -> Self {
        Self { pool, segments: Vec::new() }
    }

    pub(crate) fn from_parts(pool: SegmentPool, segments: Vec<Segment>) -> Self {
        Self { pool, segments }
    }

    pub(crate) fn into_parts(self) -> Vec<Segment> {
        self.segments
    }

    /// Append `bytes` at the fill offset of the last segment.
    ///
    /// When the tail runs out of room it is filled completely and as many new
    /// segments as needed are acquired and chained after it. Returns the last
    /// segment of the resulting chain.
    pub fn copy_into(&mut self, bytes: &[u8]) -> &Segment {
        let mut rest = bytes;
        let mut tail = match self.segments.pop() {
            Some(segment) => segment,
            None => self.pool.acquire(),
        };

        loop {
            let written = tail.put(rest);
            rest = &rest[written..];
            if rest.is_empty() {
                break;
            }
            self.segments.push(tail);
            tail = self.pool.acquire();
        }

        self.segments.push(tail);
        &self.segments[self.segments.len() - 1]
    }

    /// Total bytes across all segments.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    /// True if no bytes have been written.
    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(Segment::is_empty)
    }

    /// Number of segments in the chain.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Segments in chain order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Written bytes of each segment, in order.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.segments.iter().map(Segment::as_slice)
    }

    /// Copy the whole chain into one contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.len());
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }

    /// Release every segment back to the pool.
    pub fn clear(&mut self) {
        self.segments.clear();
    }

    /// Pool this chain draws from.
    pub fn pool(&self) -> &SegmentPool {
        &self.pool
    }
}

impl fmt::Debug for SegmentChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentChain")
            .field("len", &self.len())
            .field("segments", &self.segments.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn acquire_reuses_most_recent_release() {
        let pool = SegmentPool::with_capacity(16);
        let a = pool.acquire();
        let b = pool.acquire();
        let (slot_a, slot_b) = (a.slot(), b.slot());
        assert_ne!(slot_a, slot_b);

        a.release();
        b.release();

        // LIFO: last released comes back first
        assert_eq!(pool.acquire().slot(), slot_b);
        assert_eq!(pool.stats().allocated, 2);
    }

    #[test]
    fn released_segment_comes_back_empty() {
        let pool = SegmentPool::with_capacity(8);
        let mut seg = pool.acquire();
        seg.put(b"abc");
        seg.release();

        let seg = pool.acquire();
        assert!(seg.is_empty());
        assert_eq!(seg.remaining(), 8);
    }

    #[test]
    fn put_stops_at_capacity() {
        let pool = SegmentPool::with_capacity(4);
        let mut seg = pool.acquire();
        assert_eq!(seg.put(b"abcdef"), 4);
        assert_eq!(seg.as_slice(), b"abcd");
        assert_eq!(seg.put(b"x"), 0);
        assert!(seg.len() <= seg.capacity());
    }

    #[test]
    fn copy_into_fills_tail_before_chaining() {
        let pool = SegmentPool::with_capacity(4);
        let mut chain = SegmentChain::new(pool.clone());
        chain.copy_into(b"ab");
        let last = chain.copy_into(b"cdefgh");

        // "ab" + "cd" fill the first segment
        assert_eq!(last.as_slice(), b"efgh");
        assert_eq!(chain.segment_count(), 2);
        assert_eq!(chain.to_bytes().as_ref(), b"abcdefgh");
    }

    #[test]
    fn stats_track_leases() {
        let pool = SegmentPool::with_capacity(4);
        let mut chain = SegmentChain::new(pool.clone());
        chain.copy_into(&[7u8; 10]);
        assert_eq!(pool.stats(), PoolStats { allocated: 3, idle: 0, leased: 3 });

        chain.clear();
        assert_eq!(pool.stats(), PoolStats { allocated: 3, idle: 3, leased: 0 });
    }

    proptest! {
        #[test]
        fn chained_copy_round_trips(
            capacity in 1usize..64,
            data in proptest::collection::vec(any::<u8>(), 1..2048),
        ) {
            let pool = SegmentPool::with_capacity(capacity);
            let mut chain = SegmentChain::new(pool);
            chain.copy_into(&data);

            let bytes = chain.to_bytes();
            prop_assert_eq!(bytes.as_ref(), data.as_slice());
            prop_assert_eq!(chain.segment_count(), data.len().div_ceil(capacity));
        }

        #[test]
        fn split_appends_match_single_append(
            data in proptest::collection::vec(any::<u8>(), 0..512),
            split in 0usize..512,
        ) {
            let split = split.min(data.len());
            let pool = SegmentPool::with_capacity(13);
            let mut chain = SegmentChain::new(pool);
            chain.copy_into(&data[..split]);
            chain.copy_into(&data[split..]);

            let bytes = chain.to_bytes();
            prop_assert_eq!(bytes.as_ref(), data.as_slice());
        }
    }
}
