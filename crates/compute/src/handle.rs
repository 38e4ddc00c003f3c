use std::path::Path;

use numstore_common::{BSize, Lsn, Pgno, Result, Stride, Txid};
use numstore_storage::{EngineConfig, StorageEngine};

/// A handle on an open NumStore file (spec §4.9's `open`/`close`).
///
/// Every mutator below takes an explicit transaction; `*_auto` variants
/// are the thin begin+commit wrapper the spec calls out for callers who
/// don't need multi-operation atomicity. `read` takes no transaction at
/// all — it wraps an implicit begin+commit internally so it still goes
/// through the lock table under strict two-phase locking.
pub struct NumStore {
    engine: StorageEngine,
}

impl NumStore {
    /// `open(db_path, wal_path?)`: opens or creates the DB file,
    /// running recovery (§4.8) if the WAL wasn't empty. The WAL lives
    /// alongside the DB file under `db_path`; there is no separate
    /// `wal_path` parameter since both pager and WAL are instance data
    /// of one [`StorageEngine`] rooted at a single directory.
    pub fn open(db_path: &Path) -> Result<Self> {
        Self::open_with_config(db_path, EngineConfig::default())
    }

    pub fn open_with_config(db_path: &Path, config: EngineConfig) -> Result<Self> {
        Ok(Self { engine: StorageEngine::open(db_path, config)? })
    }

    /// `close(handle)`: force the WAL, flush every dirty page.
    pub fn close(self) -> Result<()> {
        self.engine.close()
    }

    pub fn begin_txn(&self) -> Result<Txid> {
        self.engine.begin_txn()
    }

    pub fn commit(&self, tx: Txid) -> Result<()> {
        self.engine.commit(tx)
    }

    pub fn rollback(&self, tx: Txid) -> Result<()> {
        self.engine.rollback(tx)
    }

    /// `new(tx) -> root_pgno`.
    pub fn new_array(&self, tx: Txid) -> Result<Pgno> {
        self.engine.array_new(tx)
    }

    pub fn new_array_auto(&self) -> Result<Pgno> {
        self.auto(|engine, tx| engine.array_new(tx))
    }

    /// `delete(tx, root_pgno)`.
    pub fn delete(&self, tx: Txid, root: Pgno) -> Result<()> {
        self.engine.array_delete(tx, root)
    }

    pub fn delete_auto(&self, root: Pgno) -> Result<()> {
        self.auto(|engine, tx| engine.array_delete(tx, root))
    }

    /// `size(root_pgno) -> bytes`. Not transactional: a plain structural
    /// read of the root's cumulative byte count.
    pub fn size(&self, root: Pgno) -> Result<BSize> {
        self.engine.array_size(root)
    }

    /// `insert(tx, root_pgno, src, byte_offset, elem_size, nelem)`.
    /// `elem_size`/`nelem` only matter for validating `src.len()` at the
    /// call site; the RPT itself inserts a flat byte range.
    pub fn insert(&self, tx: Txid, root: Pgno, byte_offset: BSize, src: &[u8]) -> Result<Pgno> {
        self.engine.array_insert(tx, root, byte_offset, src)
    }

    pub fn insert_auto(&self, root: Pgno, byte_offset: BSize, src: &[u8]) -> Result<Pgno> {
        self.auto(|engine, tx| engine.array_insert(tx, root, byte_offset, src))
    }

    /// `write(tx, root_pgno, src, elem_size, stride)`.
    pub fn write(&self, tx: Txid, root: Pgno, src: &[u8], elem_size: u32, stride: &Stride) -> Result<u64> {
        self.engine.array_write(tx, root, src, elem_size, stride)
    }

    pub fn write_auto(&self, root: Pgno, src: &[u8], elem_size: u32, stride: &Stride) -> Result<u64> {
        self.auto(|engine, tx| engine.array_write(tx, root, src, elem_size, stride))
    }

    /// `read(root_pgno, dst, elem_size, stride) -> bytes_actually_read`.
    /// Takes no caller transaction (spec §4.9): runs under its own
    /// short-lived begin+commit so the read still takes an `S` lock and
    /// is released promptly rather than held for the caller's lifetime.
    pub fn read(&self, root: Pgno, dst: &mut [u8], elem_size: u32, stride: &Stride) -> Result<u64> {
        self.auto(|engine, tx| engine.array_read(tx, root, dst, elem_size, stride))
    }

    /// `remove(tx, root_pgno, dst?, elem_size, stride)`.
    pub fn remove(&self, tx: Txid, root: Pgno, elem_size: u32, stride: &Stride) -> Result<(Pgno, Vec<u8>)> {
        self.engine.array_remove(tx, root, elem_size, stride)
    }

    pub fn remove_auto(&self, root: Pgno, elem_size: u32, stride: &Stride) -> Result<(Pgno, Vec<u8>)> {
        self.auto(|engine, tx| engine.array_remove(tx, root, elem_size, stride))
    }

    pub fn checkpoint(&self) -> Result<Lsn> {
        self.engine.checkpoint()
    }

    /// Run `f` inside a fresh transaction, committing on success and
    /// rolling back on failure.
    fn auto<T>(&self, f: impl FnOnce(&StorageEngine, Txid) -> Result<T>) -> Result<T> {
        let tx = self.engine.begin_txn()?;
        match f(&self.engine, tx) {
            Ok(value) => {
                self.engine.commit(tx)?;
                Ok(value)
            }
            Err(err) => {
                let _ = self.engine.rollback(tx);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn auto_insert_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = NumStore::open(dir.path()).unwrap();

        let root = store.new_array_auto().unwrap();
        let root = store.insert_auto(root, 0, &[10, 20, 30]).unwrap();
        assert_eq!(store.size(root).unwrap(), 3);

        let mut dst = vec![0u8; 3];
        let stride = Stride { start: 0, step: 1, nelems: 3 };
        let n = store.read(root, &mut dst, 1, &stride).unwrap();
        assert_eq!(n, 3);
        assert_eq!(dst, vec![10, 20, 30]);
    }

    #[test]
    fn explicit_transaction_spans_multiple_operations() {
        let dir = TempDir::new().unwrap();
        let store = NumStore::open(dir.path()).unwrap();

        let tx = store.begin_txn().unwrap();
        let root = store.new_array(tx).unwrap();
        let root = store.insert(tx, root, 0, &[1, 2, 3, 4]).unwrap();
        let stride = Stride { start: 0, step: 2, nelems: 2 };
        let (root, removed) = store.remove(tx, root, 1, &stride).unwrap();
        store.commit(tx).unwrap();

        assert_eq!(removed, vec![1, 3]);
        assert_eq!(store.size(root).unwrap(), 2);
    }

    #[test]
    fn failed_auto_operation_rolls_back() {
        let dir = TempDir::new().unwrap();
        let store = NumStore::open(dir.path()).unwrap();

        let root = store.new_array_auto().unwrap();
        let stride = Stride { start: 0, step: 1, nelems: 1 };
        // Removing from an empty array is an out-of-range stride.
        let result = store.remove_auto(root, 1, &stride);
        assert!(result.is_err());
        assert_eq!(store.size(root).unwrap(), 0);
    }

    #[test]
    fn reopen_after_close_preserves_committed_data() {
        let dir = TempDir::new().unwrap();
        let root = {
            let store = NumStore::open(dir.path()).unwrap();
            let root = store.new_array_auto().unwrap();
            let root = store.insert_auto(root, 0, &[7, 8, 9]).unwrap();
            store.close().unwrap();
            root
        };

        let store = NumStore::open(dir.path()).unwrap();
        assert_eq!(store.size(root).unwrap(), 3);
    }
}
