//! Resumable phase-driven reader.
//!
//! A protocol describes its framing as a [`PhaseTable`]: a set of phases,
//! each of which consumes an exact number of bytes and names the next phase
//! and how many bytes that one needs. [`Reader`] is the generic driver: it
//! buffers whatever arrives, runs phases while enough bytes are buffered,
//! and returns as soon as it is starved. Parse state lives entirely in the
//! reader (phase, bytes required, partial buffer), so a frame may straddle
//! any number of non-blocking receives.
//!
//! ```text
//!   feed(bytes) ──> [ buffer ] ──(len >= need)──> table.step(phase, need bytes)
//!                        ^                               │
//!                        └──── phase = next, need = n ───┘
//! ```

use std::fmt;

use bytes::{Bytes, BytesMut};

/// Outcome of running one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step<P, O> {
    /// Phase to run next
    pub next: P,
    /// Bytes the next phase consumes
    pub need: usize,
    /// Completed message, if this phase finished one
    pub emit: Option<O>,
}

impl<P, O> Step<P, O> {
    /// Continue to `next`, which needs `need` bytes.
    pub fn advance(next: P, need: usize) -> Self {
        Self { next, need, emit: None }
    }

    /// Emit `output` and continue to `next`.
    pub fn emit(next: P, need: usize, output: O) -> Self {
        Self { next, need, emit: Some(output) }
    }
}

/// A protocol's ordered table of parse phases.
///
/// Implementations must make progress: a phase that needs zero bytes must not
/// lead back to itself with zero bytes again.
pub trait PhaseTable {
    /// Phase tag.
    type Phase: Copy + Eq + fmt::Debug;
    /// Message produced when a frame completes.
    type Output;
    /// Error that aborts parsing.
    type Error;

    /// Phase a fresh reader starts in, and the bytes it needs.
    fn initial(&self) -> (Self::Phase, usize);

    /// Run `phase` over exactly the bytes it declared.
    fn step(
        &mut self,
        phase: Self::Phase,
        bytes: Bytes,
    ) -> Result<Step<Self::Phase, Self::Output>, Self::Error>;
}

/// Incremental parser state for one byte stream.
///
/// After `feed` returns an error the stream is desynchronized and the reader
/// must be discarded along with its connection.
pub struct Reader<T: PhaseTable> {
    table: T,
    phase: T::Phase,
    need: usize,
    buffer: BytesMut,
}

impl<T: PhaseTable> Reader<T> {
    /// Reader positioned at the table's initial phase.
    pub fn new(table: T) -> Self {
        let (phase, need) = table.initial();
        Self { table, phase, need, buffer: BytesMut::new() }
    }

    /// Current phase.
    pub fn phase(&self) -> T::Phase {
        self.phase
    }

    /// Bytes the current phase consumes in total.
    pub fn phase_size(&self) -> usize {
        self.need
    }

    /// Bytes still missing before the current phase can run.
    pub fn needed(&self) -> usize {
        self.need.saturating_sub(self.buffer.len())
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// The phase table.
    pub fn table(&self) -> &T {
        &self.table
    }

    /// Buffer `bytes` and collect every message they complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<T::Output>, T::Error> {
        let mut out = Vec::new();
        self.feed_with(bytes, |message| out.push(message))?;
        Ok(out)
    }

    /// Buffer `bytes`, handing each completed message to `sink` in order.
    pub fn feed_with(
        &mut self,
        bytes: &[u8],
        mut sink: impl FnMut(T::Output),
    ) -> Result<(), T::Error> {
        self.buffer.extend_from_slice(bytes);

        while self.buffer.len() >= self.need {
            let chunk = self.buffer.split_to(self.need).freeze();
            let step = self.table.step(self.phase, chunk)?;
            self.phase = step.next;
            self.need = step.need;
            if let Some(message) = step.emit {
                sink(message);
            }
        }

        Ok(())
    }
}

impl<T: PhaseTable> fmt::Debug for Reader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("phase", &self.phase)
            .field("need", &self.need)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One-byte length prefix followed by that many bytes.
    struct LengthPrefixed;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Phase {
        Len,
        Body,
    }

    impl PhaseTable for LengthPrefixed {
        type Phase = Phase;
        type Output = Bytes;
        type Error = ();

        fn initial(&self) -> (Phase, usize) {
            (Phase::Len, 1)
        }

        fn step(&mut self, phase: Phase, bytes: Bytes) -> Result<Step<Phase, Bytes>, ()> {
            match phase {
                Phase::Len if bytes[0] == 0 => Ok(Step::emit(Phase::Len, 1, Bytes::new())),
                Phase::Len => Ok(Step::advance(Phase::Body, usize::from(bytes[0]))),
                Phase::Body => Ok(Step::emit(Phase::Len, 1, bytes)),
            }
        }
    }

    #[test]
    fn starved_reader_resumes_on_next_feed() {
        let mut reader = Reader::new(LengthPrefixed);
        assert!(reader.feed(&[3, b'a']).unwrap().is_empty());
        assert_eq!(reader.phase(), Phase::Body);
        assert_eq!(reader.needed(), 2);

        let out = reader.feed(&[b'b', b'c', 1]).unwrap();
        assert_eq!(out, vec![Bytes::from_static(b"abc")]);
        assert_eq!(reader.phase(), Phase::Body);
    }

    #[test]
    fn several_messages_in_one_feed() {
        let mut reader = Reader::new(LengthPrefixed);
        let out = reader.feed(&[1, b'x', 0, 2, b'y', b'z']).unwrap();
        assert_eq!(out.len(), 3);
        assert!(out[1].is_empty());
        assert_eq!(reader.phase(), Phase::Len);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn byte_at_a_time_matches_bulk() {
        let input = [2, 1, 2, 3, 9, 8, 7, 0, 1, 5];
        let bulk = Reader::new(LengthPrefixed).feed(&input).unwrap();

        let mut reader = Reader::new(LengthPrefixed);
        let mut trickled = Vec::new();
        for b in input {
            trickled.extend(reader.feed(&[b]).unwrap());
        }
        assert_eq!(bulk, trickled);
    }
}
