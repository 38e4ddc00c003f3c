//! Transaction Table (spec §3.5, §4.6): the in-memory registry of
//! active transactions, each owning its held-lock list exclusively
//! (spec §3.6).

use std::collections::HashMap;
use std::sync::Mutex;

use numstore_common::{Lsn, NumStoreError, Result, TxState, Txid};
use numstore_wal::{RecordBody, WalWriter};
use tracing::debug;

use crate::lock::{LockResource, LockTable};

/// One active (or recently finished) transaction's bookkeeping.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub txid: Txid,
    pub state: TxState,
    pub last_lsn: Lsn,
    pub undo_next_lsn: Lsn,
    pub held_locks: Vec<LockResource>,
}

impl Transaction {
    pub fn debug_dump(&self) -> String {
        format!(
            "txn {} state={} last_lsn={} undo_next_lsn={} held_locks={:?}",
            self.txid, self.state, self.last_lsn, self.undo_next_lsn, self.held_locks
        )
    }
}

#[derive(Default)]
pub struct TransactionTable {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_txid: Txid,
    txns: HashMap<Txid, Transaction>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_txid: 1,
                txns: HashMap::new(),
            }),
        }
    }

    /// `begin()` (spec §4.6): assign the next txid, write `BEGIN`, and
    /// register the transaction as `RUNNING`.
    pub fn begin(&self, wal: &WalWriter) -> Result<Txid> {
        let mut inner = self.inner.lock().unwrap();
        let txid = inner.next_txid;
        inner.next_txid += 1;

        let lsn = wal.append(txid, 0, RecordBody::Begin)?;
        inner.txns.insert(
            txid,
            Transaction {
                txid,
                state: TxState::Running,
                last_lsn: lsn,
                undo_next_lsn: lsn,
                held_locks: Vec::new(),
            },
        );
        debug!(txid, lsn, "transaction begun");
        Ok(txid)
    }

    pub fn get(&self, txid: Txid) -> Result<Transaction> {
        self.inner
            .lock()
            .unwrap()
            .txns
            .get(&txid)
            .cloned()
            .ok_or_else(|| NumStoreError::NotFound(format!("transaction {txid}")))
    }

    /// Record a new `last_lsn`/`undo_next_lsn` after an UPDATE/CLR.
    pub fn advance(&self, txid: Txid, lsn: Lsn) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let txn = inner
            .txns
            .get_mut(&txid)
            .ok_or_else(|| NumStoreError::NotFound(format!("transaction {txid}")))?;
        txn.last_lsn = lsn;
        txn.undo_next_lsn = lsn;
        Ok(())
    }

    pub fn add_held_lock(&self, txid: Txid, resource: LockResource) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let txn = inner
            .txns
            .get_mut(&txid)
            .ok_or_else(|| NumStoreError::NotFound(format!("transaction {txid}")))?;
        if !txn.held_locks.contains(&resource) {
            txn.held_locks.push(resource);
        }
        Ok(())
    }

    /// `commit(tx)` (spec §4.6): write `COMMIT`, force the WAL up to
    /// it, release locks, write `END`, and transition to `DONE`.
    pub fn commit(&self, txid: Txid, wal: &WalWriter, locks: &LockTable) -> Result<()> {
        let prev = {
            let mut inner = self.inner.lock().unwrap();
            let txn = inner
                .txns
                .get_mut(&txid)
                .ok_or_else(|| NumStoreError::NotFound(format!("transaction {txid}")))?;
            txn.state = TxState::Committed;
            txn.last_lsn
        };
        let commit_lsn = wal.append(txid, prev, RecordBody::Commit)?;
        wal.force(commit_lsn)?;

        let held = self.get(txid)?.held_locks;
        locks.release_all(txid, &held);

        let end_lsn = wal.append(txid, commit_lsn, RecordBody::End)?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(txn) = inner.txns.get_mut(&txid) {
            txn.state = TxState::Done;
            txn.last_lsn = end_lsn;
        }
        debug!(txid, commit_lsn, "transaction committed");
        Ok(())
    }

    /// Mark a transaction `CandidateForUndo` (the caller then performs
    /// the actual byte-level undo via `numstore-storage::recovery`).
    pub fn mark_for_undo(&self, txid: Txid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let txn = inner
            .txns
            .get_mut(&txid)
            .ok_or_else(|| NumStoreError::NotFound(format!("transaction {txid}")))?;
        txn.state = TxState::CandidateForUndo;
        Ok(())
    }

    /// Finalize an aborted transaction: write `END`, release locks,
    /// transition to `DONE`, and drop it from the table.
    pub fn finish_abort(&self, txid: Txid, wal: &WalWriter, locks: &LockTable) -> Result<()> {
        let (prev, held) = {
            let inner = self.inner.lock().unwrap();
            let txn = inner
                .txns
                .get(&txid)
                .ok_or_else(|| NumStoreError::NotFound(format!("transaction {txid}")))?;
            (txn.last_lsn, txn.held_locks.clone())
        };
        let end_lsn = wal.append(txid, prev, RecordBody::End)?;
        locks.release_all(txid, &held);

        let mut inner = self.inner.lock().unwrap();
        if let Some(txn) = inner.txns.get_mut(&txid) {
            txn.state = TxState::Done;
            txn.last_lsn = end_lsn;
        }
        Ok(())
    }

    /// Every currently tracked transaction, for checkpoint snapshots
    /// and the recovery analysis pass.
    pub fn snapshot(&self) -> Vec<Transaction> {
        self.inner.lock().unwrap().txns.values().cloned().collect()
    }

    pub fn debug_dump(&self) -> String {
        self.inner
            .lock()
            .unwrap()
            .txns
            .values()
            .map(|t| t.debug_dump())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_wal(dir: &std::path::Path) -> WalWriter {
        WalWriter::open(dir, "wal", 1 << 20).unwrap()
    }

    #[test]
    fn begin_registers_running_transaction() {
        let dir = TempDir::new().unwrap();
        let wal = open_wal(dir.path());
        let tt = TransactionTable::new();

        let txid = tt.begin(&wal).unwrap();
        let txn = tt.get(txid).unwrap();
        assert_eq!(txn.state, TxState::Running);
    }

    #[test]
    fn commit_releases_locks_and_marks_done() {
        let dir = TempDir::new().unwrap();
        let wal = open_wal(dir.path());
        let tt = TransactionTable::new();
        let locks = LockTable::new();

        let txid = tt.begin(&wal).unwrap();
        locks.lock(LockResource::Rptree(1), crate::lock::LockMode::Exclusive, txid).unwrap();
        tt.add_held_lock(txid, LockResource::Rptree(1)).unwrap();

        tt.commit(txid, &wal, &locks).unwrap();
        assert_eq!(tt.get(txid).unwrap().state, TxState::Done);

        // Lock released: another txn can now take it.
        locks.lock(LockResource::Rptree(1), crate::lock::LockMode::Exclusive, 999).unwrap();
    }
}
