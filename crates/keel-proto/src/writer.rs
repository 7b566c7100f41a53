//! Pooled message writers.
//!
//! A [`Writer`] serializes one outgoing message into a [`SegmentChain`].
//! Writers obtained from a [`WriterPool`] go back to it when dropped: the
//! chain's segments are released to the segment pool (resetting the cursor)
//! before the writer's storage is parked, so a recycled writer always starts
//! empty. Numeric fields are big-endian.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::segment::{Segment, SegmentChain, SegmentPool};

/// Chainable cursor over pooled segments.
pub struct Writer {
    chain: SegmentChain,
    lease: Option<Lease>,
}

struct Lease {
    slot: usize,
    pool: Arc<WriterShared>,
}

impl Writer {
    /// Unpooled writer drawing segments from `segments`.
    pub fn new(segments: SegmentPool) -> Self {
        Self { chain: SegmentChain::new(segments), lease: None }
    }

    /// Bytes written (the cursor).
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// True if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Underlying segment chain.
    pub fn chain(&self) -> &SegmentChain {
        &self.chain
    }

    /// Written bytes, one slice per segment.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.chain.chunks()
    }

    /// Copy the message into one contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        self.chain.to_bytes()
    }

    /// Clear the cursor and release all segments.
    pub fn reset(&mut self) {
        self.chain.clear();
    }

    /// Append raw bytes.
    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.chain.copy_into(bytes);
    }

    /// Append a `u32` length prefix followed by `bytes`.
    pub fn put_prefixed(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.put_slice(bytes);
    }

    /// Append one byte.
    pub fn put_u8(&mut self, value: u8) {
        self.put_slice(&[value]);
    }

    /// Append a boolean as one byte.
    pub fn put_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    /// Append a big-endian `u16`.
    pub fn put_u16(&mut self, value: u16) {
        self.put_slice(&value.to_be_bytes());
    }

    /// Append a big-endian `u32`.
    pub fn put_u32(&mut self, value: u32) {
        self.put_slice(&value.to_be_bytes());
    }

    /// Append a big-endian `i32`.
    pub fn put_i32(&mut self, value: i32) {
        self.put_slice(&value.to_be_bytes());
    }

    /// Append a big-endian `u64`.
    pub fn put_u64(&mut self, value: u64) {
        self.put_slice(&value.to_be_bytes());
    }

    /// Append a big-endian `i64`.
    pub fn put_i64(&mut self, value: i64) {
        self.put_slice(&value.to_be_bytes());
    }

    /// Append an IEEE-754 `f64`, big-endian.
    pub fn put_f64(&mut self, value: f64) {
        self.put_slice(&value.to_be_bytes());
    }

    /// Append `n` zero bytes.
    pub fn put_zeros(&mut self, n: usize) {
        const ZEROS: [u8; 64] = [0; 64];
        let mut left = n;
        while left > 0 {
            let step = left.min(ZEROS.len());
            self.put_slice(&ZEROS[..step]);
            left -= step;
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            self.chain.clear();
            let segments = self.chain.pool().clone();
            let chain = std::mem::replace(&mut self.chain, SegmentChain::new(segments));
            lease.pool.park(lease.slot, chain.into_parts());
        }
    }
}

impl fmt::Debug for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer")
            .field("len", &self.len())
            .field("pooled", &self.lease.is_some())
            .finish()
    }
}

/// Recycles [`Writer`]s the same way [`SegmentPool`] recycles segments.
#[derive(Clone)]
pub struct WriterPool {
    segments: SegmentPool,
    shared: Arc<WriterShared>,
}

struct WriterShared {
    arena: Mutex<WriterArena>,
}

/// Parked (always empty) segment vectors indexed by slot.
#[derive(Default)]
struct WriterArena {
    slots: Vec<Option<Vec<Segment>>>,
    free: Vec<usize>,
}

impl WriterShared {
    fn park(&self, slot: usize, storage: Vec<Segment>) {
        let mut arena = self.arena.lock();
        if let Some(entry) = arena.slots.get_mut(slot) {
            *entry = Some(storage);
            arena.free.push(slot);
        }
    }
}

impl WriterPool {
    /// Pool of writers drawing from `segments`.
    pub fn new(segments: SegmentPool) -> Self {
        Self { segments, shared: Arc::new(WriterShared { arena: Mutex::new(WriterArena::default()) }) }
    }

    /// Take a reset writer, reusing parked storage when available.
    pub fn acquire(&self) -> Writer {
        let mut arena = self.shared.arena.lock();

        while let Some(slot) = arena.free.pop() {
            if let Some(storage) = arena.slots.get_mut(slot).and_then(Option::take) {
                drop(arena);
                return Writer {
                    chain: SegmentChain::from_parts(self.segments.clone(), storage),
                    lease: Some(Lease { slot, pool: Arc::clone(&self.shared) }),
                };
            }
        }

        let slot = arena.slots.len();
        arena.slots.push(None);
        drop(arena);

        Writer {
            chain: SegmentChain::new(self.segments.clone()),
            lease: Some(Lease { slot, pool: Arc::clone(&self.shared) }),
        }
    }

    /// Return a writer to the pool.
    ///
    /// Equivalent to dropping it; taking ownership guarantees the writer is
    /// no longer referenced.
    pub fn release(&self, writer: Writer) {
        drop(writer);
    }

    /// Segment pool backing these writers.
    pub fn segments(&self) -> &SegmentPool {
        &self.segments
    }

    /// `(allocated, idle)` writer counts.
    pub fn stats(&self) -> (usize, usize) {
        let arena = self.shared.arena.lock();
        (arena.slots.len(), arena.free.len())
    }
}

impl fmt::Debug for WriterPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (allocated, idle) = self.stats();
        f.debug_struct("WriterPool").field("allocated", &allocated).field("idle", &idle).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_fields_are_big_endian() {
        let mut writer = Writer::new(SegmentPool::with_capacity(3));
        writer.put_u16(0x0102);
        writer.put_u32(0x0304_0506);
        writer.put_bool(true);

        assert_eq!(writer.to_bytes().as_ref(), &[1, 2, 3, 4, 5, 6, 1]);
        assert_eq!(writer.chain().segment_count(), 3);
    }

    #[test]
    fn prefixed_writes_length_first() {
        let mut writer = Writer::new(SegmentPool::new());
        writer.put_prefixed(b"hi");
        assert_eq!(writer.to_bytes().as_ref(), &[0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn recycled_writer_starts_empty() {
        let segments = SegmentPool::with_capacity(8);
        let pool = WriterPool::new(segments.clone());

        let mut writer = pool.acquire();
        writer.put_slice(&[1u8; 20]);
        assert_eq!(segments.stats().leased, 3);
        pool.release(writer);

        assert_eq!(segments.stats().leased, 0);
        assert_eq!(pool.stats(), (1, 1));

        let writer = pool.acquire();
        assert!(writer.is_empty());
        assert_eq!(pool.stats(), (1, 0));
    }

    #[test]
    fn zeros_span_segments() {
        let mut writer = Writer::new(SegmentPool::with_capacity(50));
        writer.put_zeros(130);
        assert_eq!(writer.len(), 130);
        assert!(writer.chunks().all(|c| c.iter().all(|b| *b == 0)));
    }
}
