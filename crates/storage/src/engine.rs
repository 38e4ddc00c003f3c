//! The storage engine (spec §4.9): ties the pager, WAL, lock table,
//! transaction table, RPT, and recovery together into the public
//! open/close/begin/commit/rollback and per-array surface.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use numstore_common::{BSize, Lsn, Pgno, Result, Stride, Txid, PGNO_HEADER};
use numstore_pagestore::page::{self, leaf};
use numstore_pagestore::BufferPool;
use numstore_wal::{CheckpointBody, RecordBody, SegmentManager, WalReader, WalWriter};
use tracing::info;

use crate::config::EngineConfig;
use crate::lock::{LockMode, LockResource, LockTable};
use crate::recovery;
use crate::rpt;
use crate::txn::TransactionTable;

const WAL_BASENAME: &str = "wal";
const DB_FILENAME: &str = "db.bin";

/// A system-internal pseudo-transaction id, used for operations (the
/// checkpoint's brief DB-level read lock) that aren't scoped to any
/// caller transaction. Real transactions start at 1 ([`TransactionTable::begin`]).
const SYSTEM_TXID: Txid = 0;

pub struct StorageEngine {
    base_dir: PathBuf,
    config: EngineConfig,
    pool: Arc<BufferPool>,
    wal: Arc<WalWriter>,
    locks: LockTable,
    txns: TransactionTable,
}

impl StorageEngine {
    /// `open()` (spec §4.9): open or create the DB file and WAL,
    /// running ARIES recovery (§4.8) whenever the file already existed.
    pub fn open(base_dir: &Path, config: EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(base_dir)?;

        let resume_lsn = highest_existing_lsn(base_dir, WAL_BASENAME, config.wal_segment_bytes)?;
        let wal = Arc::new(WalWriter::resume_after(base_dir, WAL_BASENAME, config.wal_segment_bytes, resume_lsn)?);
        let pool = BufferPool::open(base_dir, DB_FILENAME, Arc::clone(&wal), config.buffer_pool_frames)?;

        if pool.page_count() == 0 {
            let handle = pool.allocate_page()?;
            let mut buf = page::zeroed_page();
            page::root::init(&mut buf);
            handle.write_whole(&buf, SYSTEM_TXID, 0)?;
            drop(handle);
            pool.flush_page(PGNO_HEADER)?;
            info!(path = %base_dir.display(), "initialized fresh NumStore file");
        } else {
            let analysis = recovery::recover(&pool, &wal, base_dir, WAL_BASENAME, config.wal_segment_bytes)?;
            info!(redo_start_lsn = analysis.redo_start_lsn, losers = analysis.losers().len(), "recovery complete");
        }

        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            config,
            pool,
            wal,
            locks: LockTable::new(),
            txns: TransactionTable::new(),
        })
    }

    /// `close()`: force the WAL and flush every dirty page.
    pub fn close(&self) -> Result<()> {
        self.wal.force_all()?;
        self.pool.flush_all()?;
        Ok(())
    }

    pub fn begin_txn(&self) -> Result<Txid> {
        self.txns.begin(&self.wal)
    }

    pub fn commit(&self, txid: Txid) -> Result<()> {
        self.txns.commit(txid, &self.wal, &self.locks)
    }

    /// `rollback(tx)` (spec §4.6, §4.8.4): undo every UPDATE this
    /// transaction made, then finish it off like an abort.
    pub fn rollback(&self, txid: Txid) -> Result<()> {
        self.txns.mark_for_undo(txid)?;
        let txn = self.txns.get(txid)?;
        recovery::rollback_to_savepoint(
            &self.pool,
            &self.wal,
            &self.base_dir,
            WAL_BASENAME,
            self.config.wal_segment_bytes,
            txid,
            txn.last_lsn,
            0,
        )?;
        self.txns.finish_abort(txid, &self.wal, &self.locks)
    }

    fn min_fill_bytes(&self) -> usize {
        self.config.min_fill_bytes(leaf::CAPACITY)
    }

    fn lock_rptree(&self, txid: Txid, root: Pgno, mode: LockMode) -> Result<()> {
        self.locks.lock(LockResource::Rptree(root), mode, txid)?;
        self.txns.add_held_lock(txid, LockResource::Rptree(root))
    }

    /// `new(tx)` (spec §4.9): allocate a fresh, empty array and return
    /// its root page.
    pub fn array_new(&self, txid: Txid) -> Result<Pgno> {
        self.locks.lock(LockResource::Root, LockMode::Exclusive, txid)?;
        self.txns.add_held_lock(txid, LockResource::Root)?;
        let last_lsn = self.txns.get(txid)?.last_lsn;
        let (root, lsn) = rpt::create_empty(&self.pool, txid, last_lsn)?;
        self.txns.advance(txid, lsn)?;
        Ok(root)
    }

    /// `delete(tx, root)`: empty the array, freeing every leaf/internal
    /// page back to the free list (out-of-scope: reclaiming the root
    /// page number itself into a name directory, since §4.9 explicitly
    /// leaves name-to-root mapping out of scope).
    pub fn array_delete(&self, txid: Txid, root: Pgno) -> Result<()> {
        self.lock_rptree(txid, root, LockMode::Exclusive)?;
        let total = rpt::size(&self.pool, root)?;
        if total > 0 {
            let last_lsn = self.txns.get(txid)?.last_lsn;
            let stride = Stride { start: 0, step: 1, nelems: total };
            let outcome = rpt::remove(&self.pool, root, &stride, 1, txid, last_lsn, self.min_fill_bytes())?;
            self.txns.advance(txid, outcome.last_lsn)?;
        }
        Ok(())
    }

    pub fn array_size(&self, root: Pgno) -> Result<BSize> {
        rpt::size(&self.pool, root)
    }

    /// Walk `root` and check every §4.7/§8.1 structural invariant
    /// (leaf link order, cumulative byte sums, fill ratios, fan-out).
    /// Exposed for embedders who want to self-check a tree, e.g. after
    /// a crash test.
    pub fn validate_array(&self, root: Pgno) -> Result<()> {
        rpt::validate::validate_tree(&self.pool, root, self.min_fill_bytes())
    }

    /// True if `root` is currently an internal (non-leaf) page, i.e.
    /// the array has split at least once.
    pub fn array_root_is_internal(&self, root: Pgno) -> Result<bool> {
        let handle = self.pool.get_shared(root)?;
        let buf = handle.read_whole()?;
        Ok(page::page_type(&buf) == page::PAGE_TYPE_RPT_INTERNAL)
    }

    /// `insert(tx, root, src, byte_offset, elem_size, nelem)`. Returns
    /// the array's root page, which may change if the insert split the
    /// tree all the way to a new root.
    pub fn array_insert(&self, txid: Txid, root: Pgno, byte_offset: BSize, src: &[u8]) -> Result<Pgno> {
        self.lock_rptree(txid, root, LockMode::Exclusive)?;
        let last_lsn = self.txns.get(txid)?.last_lsn;
        let outcome = rpt::insert(&self.pool, root, byte_offset, src, txid, last_lsn)?;
        self.txns.advance(txid, outcome.last_lsn)?;
        Ok(outcome.new_root)
    }

    pub fn array_write(&self, txid: Txid, root: Pgno, src: &[u8], elem_size: u32, stride: &Stride) -> Result<u64> {
        self.lock_rptree(txid, root, LockMode::Exclusive)?;
        let last_lsn = self.txns.get(txid)?.last_lsn;
        let (written, lsn) = rpt::write_stride(&self.pool, root, src, elem_size, stride, txid, last_lsn)?;
        self.txns.advance(txid, lsn)?;
        Ok(written)
    }

    /// `read(root, dst, elem_size, stride)`: read-only, takes only a
    /// shared lock, and may run outside any caller transaction.
    pub fn array_read(&self, txid: Txid, root: Pgno, dst: &mut [u8], elem_size: u32, stride: &Stride) -> Result<u64> {
        self.locks.lock(LockResource::Rptree(root), LockMode::Shared, txid)?;
        self.txns.add_held_lock(txid, LockResource::Rptree(root))?;
        rpt::read_stride(&self.pool, root, dst, elem_size, stride)
    }

    /// `remove(tx, root, dst?, elem_size, stride)`. Returns the array's
    /// (possibly new) root and the removed bytes in stride order.
    pub fn array_remove(&self, txid: Txid, root: Pgno, elem_size: u32, stride: &Stride) -> Result<(Pgno, Vec<u8>)> {
        self.lock_rptree(txid, root, LockMode::Exclusive)?;
        let last_lsn = self.txns.get(txid)?.last_lsn;
        let outcome = rpt::remove(&self.pool, root, stride, elem_size, txid, last_lsn, self.min_fill_bytes())?;
        self.txns.advance(txid, outcome.last_lsn)?;
        Ok((outcome.new_root, outcome.removed))
    }

    /// `checkpoint()` (spec §4.8.1): a fuzzy checkpoint — snapshot the
    /// DPT/TT, force a `CHECKPOINT` record, then point page 0's master
    /// LSN at it. Active transactions are never paused for this.
    pub fn checkpoint(&self) -> Result<Lsn> {
        self.locks.lock(LockResource::Db, LockMode::Shared, SYSTEM_TXID)?;
        let dpt = self.pool.dpt_snapshot();
        let tt = self
            .txns
            .snapshot()
            .into_iter()
            .map(|t| (t.txid, t.last_lsn, t.undo_next_lsn))
            .collect();
        let lsn = self.wal.append(
            SYSTEM_TXID,
            0,
            RecordBody::Checkpoint(CheckpointBody {
                dpt_snapshot: dpt,
                tt_snapshot: tt,
            }),
        )?;
        self.wal.force(lsn)?;

        let header = self.pool.get_exclusive(PGNO_HEADER)?;
        let mut buf = header.read_whole()?;
        page::root::set_master_lsn(&mut buf, lsn);
        header.write_whole(&buf, SYSTEM_TXID, lsn)?;
        self.locks.release_all(SYSTEM_TXID, &[LockResource::Db]);
        Ok(lsn)
    }
}

/// Scan the existing WAL segments (if any) for the highest LSN
/// present, so reopening a non-empty log continues LSN assignment
/// correctly instead of restarting at 1 and colliding with old records.
fn highest_existing_lsn(base_dir: &Path, basename: &str, max_segment_bytes: u64) -> Result<Lsn> {
    let segments = SegmentManager::open(base_dir, basename, max_segment_bytes)?;
    let mut reader = WalReader::new(segments);
    let records = reader.scan_forward()?;
    Ok(records.iter().map(|r| r.lsn).max().unwrap_or(0))
}
