//! A project's four chains.
//!
//! # Lifecycle
//!
//! 1. [`Ledger::load`] creates the directory and the four chain files if
//!    needed, then replays each chain through the callback, chain by chain,
//!    in append order. Any storage fault aborts the load.
//! 2. With `run_for_future`, the same callback is invoked after every
//!    successful append, while the chain's lock is held, so subscribers see
//!    each chain in exactly its on-disk order.
//!
//! The callback must not append to the ledger itself.
//!
//! # Failed writes
//!
//! A write that fails part way is truncated back to the last whole record
//! before the error is returned. If the truncation fails too, the chain is
//! poisoned and refuses appends until the ledger is reloaded.

use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use keel_proto::{MAX_BODY_SIZE, Reader};
use parking_lot::Mutex;

use crate::{
    chain::ChainKind,
    error::LedgerError,
    record::{RecordTable, Transaction},
};

/// Replay read size.
const READ_CHUNK: usize = 64 * 1024;

/// Ledger configuration
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// `fsync` each record before acknowledging it
    pub sync_on_write: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { sync_on_write: true }
    }
}

type Subscriber = Arc<dyn Fn(ChainKind, &Transaction) + Send + Sync>;

struct ChainFile {
    kind: ChainKind,
    path: PathBuf,
    file: File,
    next_sequence: u64,
    len: u64,
    /// Body checksum of every stored transaction, by sequence - 1
    crcs: Vec<u32>,
    poisoned: bool,
}

impl ChainFile {
    fn open(kind: ChainKind, path: PathBuf, on_transaction: &dyn Fn(ChainKind, &Transaction)) -> Result<Self, LedgerError> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(LedgerError::io(&path))?;

        let mut reader = Reader::new(RecordTable::new(kind, 0));
        let mut buf = vec![0u8; READ_CHUNK];
        let mut next_sequence = 1u64;
        let mut crcs = Vec::new();

        loop {
            let n = file.read(&mut buf).map_err(LedgerError::io(&path))?;
            if n == 0 {
                break;
            }
            for tx in reader.feed(&buf[..n])? {
                if tx.sequence != next_sequence {
                    return Err(LedgerError::SequenceGap { chain: kind, expected: next_sequence, actual: tx.sequence });
                }
                next_sequence += 1;
                crcs.push(crc32fast::hash(&tx.body));
                on_transaction(kind, &tx);
            }
        }

        let len = reader.table().offset();
        if reader.buffered() > 0 {
            return Err(LedgerError::TruncatedTail { chain: kind, offset: len, partial: reader.buffered() });
        }

        tracing::info!(chain = ?kind, path = %path.display(), transactions = next_sequence - 1, bytes = len, "chain replayed");
        Ok(Self { kind, path, file, next_sequence, len, crcs, poisoned: false })
    }

    fn check_writable(&self, body: &[u8]) -> Result<(), LedgerError> {
        if self.poisoned {
            return Err(LedgerError::Poisoned(self.kind));
        }
        if body.len() > MAX_BODY_SIZE {
            return Err(LedgerError::RecordTooLarge { chain: self.kind, offset: self.len, len: body.len() as u64 });
        }
        Ok(())
    }

    /// Checksum of the stored transaction at `sequence`.
    fn stored_crc(&self, sequence: u64) -> Option<u32> {
        let index = usize::try_from(sequence.checked_sub(1)?).ok()?;
        self.crcs.get(index).copied()
    }

    fn write(&mut self, tx: &Transaction, sync: bool) -> Result<(), LedgerError> {
        self.check_writable(&tx.body)?;
        let encoded = tx.encode().ok_or(LedgerError::RecordTooLarge {
            chain: self.kind,
            offset: self.len,
            len: tx.body.len() as u64,
        })?;

        if let Err(err) = self.persist(&encoded, sync) {
            self.rollback();
            return Err(err);
        }

        self.next_sequence += 1;
        self.len += encoded.len() as u64;
        self.crcs.push(crc32fast::hash(&tx.body));
        tracing::debug!(chain = ?self.kind, sequence = tx.sequence, len = tx.body.len(), "appended");
        Ok(())
    }

    fn persist(&mut self, encoded: &[u8], sync: bool) -> Result<(), LedgerError> {
        self.file.write_all(encoded).map_err(LedgerError::io(&self.path))?;
        if sync {
            self.file.sync_data().map_err(LedgerError::io(&self.path))?;
        }
        Ok(())
    }

    /// Drop whatever a failed write left past the last whole record.
    fn rollback(&mut self) {
        match self.file.set_len(self.len) {
            Ok(()) => tracing::warn!(chain = ?self.kind, len = self.len, "rolled back failed append"),
            Err(err) => {
                tracing::error!(chain = ?self.kind, path = %self.path.display(), error = %err, "rollback failed, chain poisoned");
                self.poisoned = true;
            },
        }
    }
}

/// The four chains of one project.
pub struct Ledger {
    dir: PathBuf,
    project: String,
    config: LedgerConfig,
    chains: [Mutex<ChainFile>; 4],
    subscriber: Option<Subscriber>,
}

impl Ledger {
    /// Open or create the project's chains, replaying existing transactions.
    pub fn load<F>(dir: impl AsRef<Path>, project: &str, on_transaction: F, run_for_future: bool) -> Result<Self, LedgerError>
    where
        F: Fn(ChainKind, &Transaction) + Send + Sync + 'static,
    {
        Self::load_with(dir, project, LedgerConfig::default(), on_transaction, run_for_future)
    }

    /// [`Ledger::load`] with explicit configuration.
    pub fn load_with<F>(
        dir: impl AsRef<Path>,
        project: &str,
        config: LedgerConfig,
        on_transaction: F,
        run_for_future: bool,
    ) -> Result<Self, LedgerError>
    where
        F: Fn(ChainKind, &Transaction) + Send + Sync + 'static,
    {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(LedgerError::io(&dir))?;

        let open = |kind: ChainKind| ChainFile::open(kind, kind.path(&dir, project), &on_transaction).map(Mutex::new);
        let chains = [
            open(ChainKind::Public)?,
            open(ChainKind::Private)?,
            open(ChainKind::PublicHost)?,
            open(ChainKind::PrivateHost)?,
        ];

        let subscriber: Option<Subscriber> = if run_for_future { Some(Arc::new(on_transaction)) } else { None };
        Ok(Self { dir, project: project.to_owned(), config, chains, subscriber })
    }

    fn chain(&self, kind: ChainKind) -> &Mutex<ChainFile> {
        &self.chains[kind.index()]
    }

    fn commit(&self, chain: &mut ChainFile, tx: &Transaction) -> Result<(), LedgerError> {
        chain.write(tx, self.config.sync_on_write)?;
        if let Some(subscriber) = &self.subscriber {
            subscriber(chain.kind, tx);
        }
        Ok(())
    }

    /// Append a locally originated transaction.
    pub fn append(&self, kind: ChainKind, timestamp: u64, body: impl Into<Bytes>) -> Result<Transaction, LedgerError> {
        let mut chain = self.chain(kind).lock();
        let tx = Transaction { sequence: chain.next_sequence, timestamp, body: body.into() };
        self.commit(&mut chain, &tx)?;
        Ok(tx)
    }

    /// Append a transaction received from a peer.
    ///
    /// Returns `false` for a sequence already stored with the same body (a
    /// duplicate delivery), `Conflict` if that sequence holds a different
    /// body, and `SequenceGap` if earlier transactions are missing.
    pub fn append_replicated(&self, kind: ChainKind, tx: &Transaction) -> Result<bool, LedgerError> {
        let mut chain = self.chain(kind).lock();
        if tx.sequence < chain.next_sequence {
            let incoming = crc32fast::hash(&tx.body);
            return match chain.stored_crc(tx.sequence) {
                Some(stored) if stored == incoming => {
                    tracing::trace!(chain = ?kind, sequence = tx.sequence, "duplicate replicated transaction");
                    Ok(false)
                },
                Some(stored) => Err(LedgerError::Conflict { chain: kind, sequence: tx.sequence, stored, incoming }),
                None => Err(LedgerError::SequenceGap { chain: kind, expected: chain.next_sequence, actual: tx.sequence }),
            };
        }
        if tx.sequence > chain.next_sequence {
            return Err(LedgerError::SequenceGap { chain: kind, expected: chain.next_sequence, actual: tx.sequence });
        }
        self.commit(&mut chain, tx)?;
        Ok(true)
    }

    /// Append the shared half to `kind`'s base chain and the sensitive half
    /// to `kind`.
    ///
    /// The two files cannot be written atomically. Both locks are held and
    /// both halves are checked before anything is written, then the shared
    /// half goes first. A crash or write failure in between leaves a base
    /// chain record with no sensitive counterpart, which still replays: the
    /// shared half never depends on the sensitive one.
    pub fn append_pair(
        &self,
        kind: ChainKind,
        timestamp: u64,
        public: impl Into<Bytes>,
        private: impl Into<Bytes>,
    ) -> Result<(Transaction, Transaction), LedgerError> {
        let base = kind.base().ok_or(LedgerError::NoBaseChain(kind))?;
        let (public, private) = (public.into(), private.into());

        let mut base_chain = self.chain(base).lock();
        let mut chain = self.chain(kind).lock();
        base_chain.check_writable(&public)?;
        chain.check_writable(&private)?;

        let shared = Transaction { sequence: base_chain.next_sequence, timestamp, body: public };
        self.commit(&mut base_chain, &shared)?;
        let sensitive = Transaction { sequence: chain.next_sequence, timestamp, body: private };
        self.commit(&mut chain, &sensitive)?;
        Ok((shared, sensitive))
    }

    /// Stored transactions of `kind` with a sequence above `after`.
    ///
    /// Used to catch up a peer that reported a gap.
    pub fn transactions_after(&self, kind: ChainKind, after: u64) -> Result<Vec<Transaction>, LedgerError> {
        // Hold the chain lock so no append lands mid-read.
        let chain = self.chain(kind).lock();
        let mut file = File::open(&chain.path).map_err(LedgerError::io(&chain.path))?;
        let mut reader = Reader::new(RecordTable::new(kind, 0));
        let mut buf = vec![0u8; READ_CHUNK];
        let mut out = Vec::new();

        loop {
            let n = file.read(&mut buf).map_err(LedgerError::io(&chain.path))?;
            if n == 0 {
                break;
            }
            out.extend(reader.feed(&buf[..n])?.into_iter().filter(|tx| tx.sequence > after));
        }
        Ok(out)
    }

    /// Sequence the next append to `kind` receives.
    pub fn next_sequence(&self, kind: ChainKind) -> u64 {
        self.chain(kind).lock().next_sequence
    }

    /// Size in bytes of `kind`'s file.
    pub fn chain_len(&self, kind: ChainKind) -> u64 {
        self.chain(kind).lock().len
    }

    /// Path of `kind`'s file.
    pub fn path(&self, kind: ChainKind) -> PathBuf {
        kind.path(&self.dir, &self.project)
    }

    /// Project name.
    pub fn project(&self) -> &str {
        &self.project
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("dir", &self.dir)
            .field("project", &self.project)
            .field("subscribed", &self.subscriber.is_some())
            .finish_non_exhaustive()
    }
}
