//! The pager: a buffer pool of fixed-size page frames, page-in/page-out
//! against the DB file, WAL-before-data writes, and clock eviction
//! (spec §4.1–§4.2).

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use numstore_common::{file_pool::page_to_addr, FileId, FilePool, Lsn, NumStoreError, Pgno, Result, PAGE_SIZE};
use numstore_wal::{RecordBody, UpdateBody, WalWriter};
use tracing::{debug, trace};

use crate::dpt::DirtyPageTable;
use crate::page::{self, PageBuf};

const DB_FILE_ID: FileId = FileId(0);

struct Frame {
    pgno: Option<Pgno>,
    page: PageBuf,
    pin_count: u32,
    dirty: bool,
    accessed: bool,
}

impl Frame {
    fn empty() -> Self {
        Self {
            pgno: None,
            page: page::zeroed_page(),
            pin_count: 0,
            dirty: false,
            accessed: false,
        }
    }
}

struct Inner {
    files: FilePool,
    wal: Arc<WalWriter>,
    dpt: DirtyPageTable,
    frames: Vec<Frame>,
    index: HashMap<Pgno, usize>,
    clock: usize,
    next_pgno: Pgno,
}

/// Shared owner of every in-memory page frame (spec §3.6). Always held
/// behind an `Arc` so [`PageHandle`]s can release themselves on drop.
pub struct BufferPool {
    inner: Mutex<Inner>,
}

impl BufferPool {
    pub fn open(base_dir: &Path, db_filename: &str, wal: Arc<WalWriter>, num_frames: usize) -> Result<Arc<Self>> {
        let mut files = FilePool::new(base_dir, 4);
        files.register(DB_FILE_ID, db_filename);
        let existing_len = files.file_len(DB_FILE_ID)?;
        let next_pgno = (existing_len / PAGE_SIZE as u64) as Pgno;

        Ok(Arc::new(Self {
            inner: Mutex::new(Inner {
                files,
                wal,
                dpt: DirtyPageTable::new(),
                frames: (0..num_frames).map(|_| Frame::empty()).collect(),
                index: HashMap::new(),
                clock: 0,
                next_pgno,
            }),
        }))
    }

    pub fn page_count(&self) -> Pgno {
        self.inner.lock().unwrap().next_pgno
    }

    /// Allocate a fresh page at the end of the file, zeroed, and pin it
    /// exclusively. The caller is responsible for initializing its
    /// layout (leaf/internal/tombstone) before releasing the handle.
    pub fn allocate_page(self: &Arc<Self>) -> Result<PageHandle> {
        let pgno = {
            let mut inner = self.inner.lock().unwrap();
            let pgno = inner.next_pgno;
            inner.next_pgno += 1;
            inner.files.set_len(DB_FILE_ID, page_to_addr(pgno + 1))?;
            pgno
        };
        self.get_exclusive(pgno)
    }

    pub fn get_shared(self: &Arc<Self>, pgno: Pgno) -> Result<PageHandle> {
        self.pin(pgno)
    }

    /// Exclusive acquire (spec §4.2): the caller must already hold the
    /// corresponding lock-table `X` lock; this call only manages the
    /// in-memory frame.
    pub fn get_exclusive(self: &Arc<Self>, pgno: Pgno) -> Result<PageHandle> {
        self.pin(pgno)
    }

    fn pin(self: &Arc<Self>, pgno: Pgno) -> Result<PageHandle> {
        let mut inner = self.inner.lock().unwrap();
        let idx = if let Some(&idx) = inner.index.get(&pgno) {
            idx
        } else {
            load_page(&mut inner, pgno)?
        };
        inner.frames[idx].pin_count += 1;
        inner.frames[idx].accessed = true;
        Ok(PageHandle {
            pool: Arc::clone(self),
            pgno,
        })
    }

    fn release(&self, pgno: Pgno) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&idx) = inner.index.get(&pgno) {
            inner.frames[idx].pin_count = inner.frames[idx].pin_count.saturating_sub(1);
        }
    }

    fn read_range(&self, pgno: Pgno, offset: usize, len: usize) -> Result<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let idx = *inner
            .index
            .get(&pgno)
            .ok_or_else(|| NumStoreError::invariant(format!("page {pgno} not pinned")))?;
        Ok(inner.frames[idx].page[offset..offset + len].to_vec())
    }

    fn read_whole(&self, pgno: Pgno) -> Result<PageBuf> {
        let inner = self.inner.lock().unwrap();
        let idx = *inner
            .index
            .get(&pgno)
            .ok_or_else(|| NumStoreError::invariant(format!("page {pgno} not pinned")))?;
        Ok(inner.frames[idx].page.clone())
    }

    /// The WAL-before-data write protocol of spec §4.2, steps 2-5: build
    /// the before/after images, append an `UPDATE` record, apply the
    /// after-image, and track dirtiness. Returns the new LSN; the
    /// caller (which owns the Transaction Table) is responsible for
    /// step 6, updating `txn.last_lsn`.
    fn write_range(&self, pgno: Pgno, offset: usize, after: &[u8], txid: u64, prev_lsn: Lsn) -> Result<Lsn> {
        let mut inner = self.inner.lock().unwrap();
        let idx = *inner
            .index
            .get(&pgno)
            .ok_or_else(|| NumStoreError::invariant(format!("page {pgno} not pinned")))?;

        let before = inner.frames[idx].page[offset..offset + after.len()].to_vec();
        let was_clean = !inner.frames[idx].dirty;

        let lsn = inner.wal.append(
            txid,
            prev_lsn,
            RecordBody::Update(UpdateBody {
                page_id: pgno,
                page_offset: offset as u32,
                before_image: before,
                after_image: after.to_vec(),
            }),
        )?;

        inner.frames[idx].page[offset..offset + after.len()].copy_from_slice(after);
        page::set_page_lsn(&mut *inner.frames[idx].page, lsn);
        inner.frames[idx].dirty = true;
        if was_clean {
            inner.dpt.add(pgno, lsn);
        }
        trace!(pgno, lsn, offset, len = after.len(), "pager applied write");
        Ok(lsn)
    }

    /// Apply a redo/undo image directly, bypassing WAL append (used by
    /// recovery, which is replaying records that are already durable).
    /// Returns `false` if the page's `page_lsn` already dominates
    /// `at_lsn` (already applied, per the idempotence rule of §4.8.3).
    pub fn apply_logged_image(self: &Arc<Self>, pgno: Pgno, offset: usize, image: &[u8], at_lsn: Lsn) -> Result<bool> {
        let handle = self.get_exclusive(pgno)?;
        let mut inner = self.inner.lock().unwrap();
        let idx = *inner.index.get(&pgno).unwrap();
        if page::page_lsn(&*inner.frames[idx].page) >= at_lsn {
            drop(inner);
            drop(handle);
            return Ok(false);
        }
        inner.frames[idx].page[offset..offset + image.len()].copy_from_slice(image);
        page::set_page_lsn(&mut *inner.frames[idx].page, at_lsn);
        inner.frames[idx].dirty = true;
        let was_tracked = inner.dpt.contains(pgno);
        if !was_tracked {
            inner.dpt.add(pgno, at_lsn);
        }
        drop(inner);
        drop(handle);
        Ok(true)
    }

    pub fn dpt_snapshot(&self) -> Vec<(Pgno, Lsn)> {
        self.inner.lock().unwrap().dpt.serialize()
    }

    pub fn dpt_min_rec_lsn(&self) -> Option<Lsn> {
        self.inner.lock().unwrap().dpt.min_rec_lsn()
    }

    pub fn seed_dpt(&self, snapshot: &[(Pgno, Lsn)]) {
        let mut inner = self.inner.lock().unwrap();
        for &(pgno, lsn) in snapshot {
            inner.dpt.add(pgno, lsn);
        }
    }

    /// Flush one dirty page: force the WAL up to its `page_lsn`, write
    /// the page image, clear `DIRTY`, and remove it from the DPT.
    pub fn flush_page(&self, pgno: Pgno) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let idx = match inner.index.get(&pgno) {
            Some(&idx) => idx,
            None => return Ok(()),
        };
        if !inner.frames[idx].dirty {
            return Ok(());
        }
        let lsn = page::page_lsn(&*inner.frames[idx].page);
        inner.wal.force(lsn)?;
        let bytes = inner.frames[idx].page.clone();
        inner.files.pwrite(DB_FILE_ID, &*bytes, page_to_addr(pgno))?;
        inner.frames[idx].dirty = false;
        inner.dpt.remove(pgno);
        Ok(())
    }

    /// Flush every dirty frame (used by `close()`).
    pub fn flush_all(&self) -> Result<()> {
        let pgnos: Vec<Pgno> = {
            let inner = self.inner.lock().unwrap();
            inner.frames.iter().filter_map(|f| f.pgno).collect()
        };
        for pgno in pgnos {
            self.flush_page(pgno)?;
        }
        self.inner.lock().unwrap().files.sync(DB_FILE_ID)?;
        Ok(())
    }
}

/// Pick a victim frame and evict it, writing it back if dirty. Called
/// with the pool already locked, when no free frame exists for `pgno`.
fn load_page(inner: &mut Inner, pgno: Pgno) -> Result<usize> {
    let idx = if inner.index.len() < inner.frames.len() {
        inner.frames.iter().position(|f| f.pgno.is_none()).unwrap()
    } else {
        evict(inner)?
    };

    let mut buf = page::zeroed_page();
    let addr = page_to_addr(pgno);
    if addr + PAGE_SIZE as u64 <= inner.files.file_len(DB_FILE_ID)? {
        inner.files.pread(DB_FILE_ID, &mut *buf, addr)?;
    }
    inner.frames[idx] = Frame {
        pgno: Some(pgno),
        page: buf,
        pin_count: 0,
        dirty: false,
        accessed: false,
    };
    inner.index.insert(pgno, idx);
    Ok(idx)
}

fn evict(inner: &mut Inner) -> Result<usize> {
    loop {
        let idx = inner.clock;
        inner.clock = (inner.clock + 1) % inner.frames.len();
        let frame = &mut inner.frames[idx];
        if frame.pin_count > 0 {
            continue;
        }
        if frame.accessed {
            frame.accessed = false;
            continue;
        }
        let pgno = frame.pgno.expect("indexed frame must hold a page");
        if frame.dirty {
            let lsn = page::page_lsn(&*frame.page);
            inner.wal.force(lsn)?;
            let bytes = frame.page.clone();
            inner.files.pwrite(DB_FILE_ID, &*bytes, page_to_addr(pgno))?;
            inner.dpt.remove(pgno);
            debug!(pgno, lsn, "pager evicted dirty frame after forcing wal");
        }
        inner.index.remove(&pgno);
        return Ok(idx);
    }
}

/// A pinned handle over one page, valid for the lifetime of one
/// operation. Releases its pin automatically on drop (spec §3.6).
pub struct PageHandle {
    pool: Arc<BufferPool>,
    pgno: Pgno,
}

impl PageHandle {
    pub fn pgno(&self) -> Pgno {
        self.pgno
    }

    pub fn read_range(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.pool.read_range(self.pgno, offset, len)
    }

    pub fn read_whole(&self) -> Result<PageBuf> {
        self.pool.read_whole(self.pgno)
    }

    /// Apply the full write protocol for one contiguous byte range.
    /// Returns the assigned LSN; caller updates the transaction's
    /// `last_lsn` with it.
    pub fn write_range(&self, offset: usize, after_image: &[u8], txid: u64, prev_lsn: Lsn) -> Result<Lsn> {
        self.pool.write_range(self.pgno, offset, after_image, txid, prev_lsn)
    }

    /// Write the entire page body in one WAL record; used when
    /// initializing a freshly allocated page (leaf/internal/tombstone).
    pub fn write_whole(&self, after: &PageBuf, txid: u64, prev_lsn: Lsn) -> Result<Lsn> {
        self.pool.write_range(self.pgno, 0, &after[..], txid, prev_lsn)
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.pool.release(self.pgno);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_pool(dir: &Path) -> Arc<BufferPool> {
        let wal = Arc::new(WalWriter::open(dir, "wal", 1 << 20).unwrap());
        BufferPool::open(dir, "db.bin", wal, 4).unwrap()
    }

    #[test]
    fn allocate_then_write_then_read_back() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(dir.path());

        let handle = pool.allocate_page().unwrap();
        let pgno = handle.pgno();
        handle.write_range(0, &[1, 2, 3, 4], 1, 0).unwrap();
        assert_eq!(handle.read_range(0, 4).unwrap(), vec![1, 2, 3, 4]);
        drop(handle);

        let handle2 = pool.get_shared(pgno).unwrap();
        assert_eq!(handle2.read_range(0, 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn dirty_page_tracked_until_flushed() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(dir.path());

        let handle = pool.allocate_page().unwrap();
        let pgno = handle.pgno();
        handle.write_range(0, &[9], 1, 0).unwrap();
        drop(handle);

        assert!(pool.dpt_snapshot().iter().any(|&(p, _)| p == pgno));
        pool.flush_page(pgno).unwrap();
        assert!(pool.dpt_snapshot().iter().all(|&(p, _)| p != pgno));
    }

    #[test]
    fn eviction_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(dir.path());

        let mut pgnos = Vec::new();
        for i in 0..8u8 {
            let handle = pool.allocate_page().unwrap();
            pgnos.push(handle.pgno());
            handle.write_range(0, &[i], 1, 0).unwrap();
        }

        for (i, &pgno) in pgnos.iter().enumerate() {
            let handle = pool.get_shared(pgno).unwrap();
            assert_eq!(handle.read_range(0, 1).unwrap(), vec![i as u8]);
        }
    }
}
