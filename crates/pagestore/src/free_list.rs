//! Free-list page allocation (spec §4.7.5): page 0 holds the head of a
//! singly-linked list of `TOMBSTONE` pages available for reuse;
//! allocating pops the head, freeing pushes a new head.

use std::sync::Arc;

use numstore_common::{Lsn, NumStoreError, Pgno, Result, PGNO_HEADER, PGNO_NULL};

use crate::buffer_pool::{BufferPool, PageHandle};
use crate::page;

/// Allocate a page, preferring a reused tombstone over extending the
/// file. Returns the pinned exclusive handle over the new page, plus
/// the LSN of the header-page write if the free-list head moved (the
/// caller chains its next WAL record's `prev_lsn` off of it).
pub fn allocate_page(pool: &Arc<BufferPool>, txid: u64, header_prev_lsn: Lsn) -> Result<(PageHandle, Option<Lsn>)> {
    let header = pool.get_exclusive(PGNO_HEADER)?;
    let header_buf = header.read_whole()?;
    let head = page::root::first_tombstone(&header_buf);

    if head == PGNO_NULL {
        drop(header);
        let fresh = pool.allocate_page()?;
        return Ok((fresh, None));
    }

    let reused = pool.get_exclusive(head)?;
    let reused_buf = reused.read_whole()?;
    let next = page::free_list_next(&reused_buf);

    let mut new_header = header_buf.clone();
    page::root::set_first_tombstone(&mut new_header, next);
    let header_lsn = header.write_whole(&new_header, txid, header_prev_lsn)?;

    Ok((reused, Some(header_lsn)))
}

/// Tombstone `pgno` and push it onto the head of the free list. Returns
/// the LSN of the header-page write (the last record in this
/// operation's chain).
pub fn free_page(pool: &Arc<BufferPool>, pgno: Pgno, txid: u64, prev_lsn: Lsn) -> Result<Lsn> {
    let header = pool.get_exclusive(PGNO_HEADER)?;
    let header_buf = header.read_whole()?;
    let old_head = page::root::first_tombstone(&header_buf);

    let freed = pool.get_exclusive(pgno)?;
    let mut tomb_buf = page::zeroed_page();
    page::tombstone::init(&mut tomb_buf, old_head);
    let freed_lsn = freed.write_whole(&tomb_buf, txid, prev_lsn)?;

    let mut new_header = header_buf.clone();
    page::root::set_first_tombstone(&mut new_header, pgno);
    header.write_whole(&new_header, txid, freed_lsn)
}

/// Walk the free list from page 0 and confirm every linked page is
/// tagged `TOMBSTONE` and the chain terminates at `PGNO_NULL`. Grounded
/// on the original free-list validator; used by crash-recovery tests.
pub fn validate(pool: &Arc<BufferPool>) -> Result<()> {
    let header = pool.get_shared(PGNO_HEADER)?;
    let header_buf = header.read_whole()?;
    let mut cursor = page::root::first_tombstone(&header_buf);
    drop(header);

    let mut seen = std::collections::HashSet::new();
    while cursor != PGNO_NULL {
        if !seen.insert(cursor) {
            return Err(NumStoreError::Corrupt(format!("free list cycles back to page {cursor}")));
        }
        let handle = pool.get_shared(cursor)?;
        let buf = handle.read_whole()?;
        if page::page_type(&buf) != page::PAGE_TYPE_TOMBSTONE {
            return Err(NumStoreError::Corrupt(format!(
                "free list entry {cursor} is not tagged TOMBSTONE"
            )));
        }
        cursor = page::free_list_next(&buf);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use numstore_wal::WalWriter;
    use tempfile::TempDir;

    fn open_pool(dir: &std::path::Path) -> Arc<BufferPool> {
        let wal = Arc::new(WalWriter::open(dir, "wal", 1 << 20).unwrap());
        BufferPool::open(dir, "db.bin", wal, 8).unwrap()
    }

    #[test]
    fn free_then_allocate_reuses_the_page() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(dir.path());

        let handle = pool.allocate_page().unwrap();
        let pgno = handle.pgno();
        drop(handle);

        free_page(&pool, pgno, 1, 0).unwrap();
        validate(&pool).unwrap();

        let (reused, _) = allocate_page(&pool, 1, 0).unwrap();
        assert_eq!(reused.pgno(), pgno);
    }

    #[test]
    fn allocate_extends_file_when_list_is_empty() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(dir.path());
        let before = pool.page_count();
        let (handle, moved) = allocate_page(&pool, 1, 0).unwrap();
        assert!(moved.is_none());
        assert_eq!(handle.pgno(), before);
    }
}
