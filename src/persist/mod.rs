//! Persistence client
//!
//! Client contract for the appliance's durable key-entry store, plus the
//! in-memory implementation used by the daemon in simulation and by tests.
//! The store itself (format, replication) is an external collaborator; only
//! its client discipline is modeled:
//!
//! - at most one open transaction per caller; `begin` while one is open
//!   returns Busy and the caller retries on a later tick
//! - a Busy result always means "retry later", never "queue work inside the
//!   existing call"

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Storage region an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PersistSector {
    /// Terminal upgrade completion reasons
    FupCompletionLog,
    /// Device-type policy learned at first boot
    DevicePolicy,
}

/// Handle to a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub u64);

/// Handle to an open transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnId(pub u64);

/// Client interface to the durable store. All operations are non-blocking;
/// `Error::Busy` means retry on a later tick.
pub trait PersistClient: Send {
    /// Open a transaction. Busy while another one is open.
    fn begin(&mut self) -> Result<TxnId>;

    /// Stage a new entry inside the transaction.
    fn write_entry(&mut self, txn: TxnId, sector: PersistSector, bytes: &[u8]) -> Result<EntryId>;

    /// Stage a rewrite of an existing entry.
    fn modify_entry(&mut self, txn: TxnId, entry: EntryId, bytes: &[u8]) -> Result<()>;

    /// Stage deletion of an entry.
    fn delete_entry(&mut self, txn: TxnId, entry: EntryId) -> Result<()>;

    /// Commit the transaction durably.
    fn commit(&mut self, txn: TxnId) -> Result<()>;

    /// Discard the transaction.
    fn abort(&mut self, txn: TxnId);

    /// Convenience: write one entry inside an implicit transaction.
    fn write_single(&mut self, sector: PersistSector, bytes: &[u8]) -> Result<EntryId> {
        let txn = self.begin()?;
        let entry = match self.write_entry(txn, sector, bytes) {
            Ok(entry) => entry,
            Err(err) => {
                self.abort(txn);
                return Err(err);
            }
        };
        self.commit(txn)?;
        Ok(entry)
    }

    /// All committed entries of a sector, for startup restore.
    fn read_sector(&self, sector: PersistSector) -> Vec<(EntryId, Vec<u8>)>;
}

// =============================================================================
// In-memory store
// =============================================================================

#[derive(Debug, Clone)]
enum StagedOp {
    Write(PersistSector, EntryId, Vec<u8>),
    Modify(EntryId, Vec<u8>),
    Delete(EntryId),
}

/// In-memory persistence, used in simulation and tests.
#[derive(Debug, Default)]
pub struct InMemoryPersist {
    entries: BTreeMap<EntryId, (PersistSector, Vec<u8>)>,
    open_txn: Option<TxnId>,
    staged: Vec<StagedOp>,
    next_entry: u64,
    next_txn: u64,
}

impl InMemoryPersist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed entries across all sectors.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn check_txn(&self, txn: TxnId) -> Result<()> {
        if self.open_txn == Some(txn) {
            Ok(())
        } else {
            Err(Error::Persistence(format!("transaction {:?} not open", txn)))
        }
    }
}

impl PersistClient for InMemoryPersist {
    fn begin(&mut self) -> Result<TxnId> {
        if self.open_txn.is_some() {
            return Err(Error::Busy("persistence transaction already open".into()));
        }
        self.next_txn += 1;
        let txn = TxnId(self.next_txn);
        self.open_txn = Some(txn);
        Ok(txn)
    }

    fn write_entry(&mut self, txn: TxnId, sector: PersistSector, bytes: &[u8]) -> Result<EntryId> {
        self.check_txn(txn)?;
        self.next_entry += 1;
        let entry = EntryId(self.next_entry);
        self.staged.push(StagedOp::Write(sector, entry, bytes.to_vec()));
        Ok(entry)
    }

    fn modify_entry(&mut self, txn: TxnId, entry: EntryId, bytes: &[u8]) -> Result<()> {
        self.check_txn(txn)?;
        if !self.entries.contains_key(&entry)
            && !self
                .staged
                .iter()
                .any(|op| matches!(op, StagedOp::Write(_, e, _) if *e == entry))
        {
            return Err(Error::Persistence(format!("no entry {:?}", entry)));
        }
        self.staged.push(StagedOp::Modify(entry, bytes.to_vec()));
        Ok(())
    }

    fn delete_entry(&mut self, txn: TxnId, entry: EntryId) -> Result<()> {
        self.check_txn(txn)?;
        self.staged.push(StagedOp::Delete(entry));
        Ok(())
    }

    fn commit(&mut self, txn: TxnId) -> Result<()> {
        self.check_txn(txn)?;
        for op in self.staged.drain(..) {
            match op {
                StagedOp::Write(sector, entry, bytes) => {
                    self.entries.insert(entry, (sector, bytes));
                }
                StagedOp::Modify(entry, bytes) => {
                    if let Some((_, stored)) = self.entries.get_mut(&entry) {
                        *stored = bytes;
                    }
                }
                StagedOp::Delete(entry) => {
                    self.entries.remove(&entry);
                }
            }
        }
        self.open_txn = None;
        debug!(txn = txn.0, "persistence transaction committed");
        Ok(())
    }

    fn abort(&mut self, txn: TxnId) {
        if self.open_txn == Some(txn) {
            self.staged.clear();
            self.open_txn = None;
            debug!(txn = txn.0, "persistence transaction aborted");
        }
    }

    fn read_sector(&self, sector: PersistSector) -> Vec<(EntryId, Vec<u8>)> {
        self.entries
            .iter()
            .filter(|(_, (s, _))| *s == sector)
            .map(|(id, (_, bytes))| (*id, bytes.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_single_entry_roundtrip() {
        let mut store = InMemoryPersist::new();
        let entry = store
            .write_single(PersistSector::DevicePolicy, b"octane")
            .unwrap();

        let read = store.read_sector(PersistSector::DevicePolicy);
        assert_eq!(read, vec![(entry, b"octane".to_vec())]);
        assert!(store.read_sector(PersistSector::FupCompletionLog).is_empty());
    }

    #[test]
    fn test_second_begin_is_busy() {
        let mut store = InMemoryPersist::new();
        let txn = store.begin().unwrap();
        assert_matches!(store.begin(), Err(Error::Busy(_)));
        store.abort(txn);
        assert!(store.begin().is_ok());
    }

    #[test]
    fn test_abort_discards_staged_writes() {
        let mut store = InMemoryPersist::new();
        let txn = store.begin().unwrap();
        store
            .write_entry(txn, PersistSector::FupCompletionLog, b"fail")
            .unwrap();
        store.abort(txn);
        assert_eq!(store.entry_count(), 0);
    }

    #[test]
    fn test_modify_and_delete_inside_txn() {
        let mut store = InMemoryPersist::new();
        let a = store
            .write_single(PersistSector::FupCompletionLog, b"one")
            .unwrap();
        let b = store
            .write_single(PersistSector::FupCompletionLog, b"two")
            .unwrap();

        let txn = store.begin().unwrap();
        store.modify_entry(txn, a, b"one-v2").unwrap();
        store.delete_entry(txn, b).unwrap();
        store.commit(txn).unwrap();

        let read = store.read_sector(PersistSector::FupCompletionLog);
        assert_eq!(read, vec![(a, b"one-v2".to_vec())]);
    }

    #[test]
    fn test_stale_txn_rejected() {
        let mut store = InMemoryPersist::new();
        let txn = store.begin().unwrap();
        store.commit(txn).unwrap();
        assert_matches!(
            store.write_entry(txn, PersistSector::DevicePolicy, b"x"),
            Err(Error::Persistence(_))
        );
    }
}
