//! Following a chain file appended by another process.
//!
//! [`ChainTail`] remembers how far it has read and feeds whatever has been
//! appended since through the record phase table. A record that is only
//! partly written when polled stays buffered in the reader and completes on
//! a later poll.

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use keel_proto::Reader;

use crate::{
    chain::ChainKind,
    error::LedgerError,
    record::{RecordTable, Transaction},
};

/// Incremental reader over one chain file.
#[derive(Debug)]
pub struct ChainTail {
    kind: ChainKind,
    path: PathBuf,
    /// Bytes of the file already handed to the reader
    read_to: u64,
    reader: Reader<RecordTable>,
}

impl ChainTail {
    /// Tail `path` from the beginning.
    pub fn new(kind: ChainKind, path: impl AsRef<Path>) -> Self {
        Self::from_offset(kind, path, 0)
    }

    /// Tail `path` from a record boundary at `offset`.
    pub fn from_offset(kind: ChainKind, path: impl AsRef<Path>, offset: u64) -> Self {
        Self {
            kind,
            path: path.as_ref().to_path_buf(),
            read_to: offset,
            reader: Reader::new(RecordTable::new(kind, offset)),
        }
    }

    /// Chain being followed.
    pub fn kind(&self) -> ChainKind {
        self.kind
    }

    /// File offset just past the last complete record returned.
    pub fn offset(&self) -> u64 {
        self.reader.table().offset()
    }

    /// Bytes of an incomplete trailing record held back.
    pub fn pending_bytes(&self) -> usize {
        self.reader.buffered()
    }

    /// Read everything appended since the last poll.
    ///
    /// A missing file is treated as empty.
    pub fn poll(&mut self) -> Result<Vec<Transaction>, LedgerError> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LedgerError::Io { path: self.path.clone(), source: e }),
        };
        file.seek(SeekFrom::Start(self.read_to)).map_err(LedgerError::io(&self.path))?;

        let mut fresh = Vec::new();
        file.read_to_end(&mut fresh).map_err(LedgerError::io(&self.path))?;
        self.read_to += fresh.len() as u64;

        let out = self.reader.feed(&fresh)?;
        if !out.is_empty() {
            tracing::trace!(chain = ?self.kind, records = out.len(), offset = self.offset(), "tail advanced");
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::OpenOptions, io::Write};

    use bytes::Bytes;
    use proptest::prelude::*;

    use super::*;

    fn tx(sequence: u64, body: Vec<u8>) -> Transaction {
        Transaction { sequence, timestamp: 0, body: Bytes::from(body) }
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut tail = ChainTail::new(ChainKind::Public, dir.path().join("nope.lbc"));
        assert!(tail.poll().unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn partial_writes_complete_on_later_polls(
            bodies in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..80), 1..6),
            cut in 1usize..40,
        ) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("tpublic.lbc");
            let txs: Vec<Transaction> =
                bodies.into_iter().enumerate().map(|(i, b)| tx(i as u64 + 1, b)).collect();
            let wire: Vec<u8> = txs.iter().flat_map(|t| t.encode().unwrap().to_vec()).collect();

            let mut file = OpenOptions::new().create(true).append(true).open(&path).unwrap();
            let mut tail = ChainTail::new(ChainKind::Public, &path);
            let mut seen = Vec::new();
            for chunk in wire.chunks(cut) {
                file.write_all(chunk).unwrap();
                seen.extend(tail.poll().unwrap());
            }

            prop_assert_eq!(seen, txs);
            prop_assert_eq!(tail.pending_bytes(), 0);
            prop_assert_eq!(tail.offset(), wire.len() as u64);
        }
    }
}
