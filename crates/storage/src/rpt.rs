//! Range-partitioned tree (spec §4.7): a B+-tree-like structure keyed
//! by cumulative byte offset instead of a user key. The cursor model of
//! §4.7.1 is collapsed to synchronous blocking functions per the
//! resolution of §9's open question (option a) — each public operation
//! runs to completion on the caller's thread rather than pausing
//! between pages.

use std::sync::Arc;

use numstore_common::{BSize, Lsn, NumStoreError, Pgno, Result, Stride, Txid, PGNO_NULL};
use numstore_pagestore::free_list;
use numstore_pagestore::page::{self, internal, leaf};
use numstore_pagestore::BufferPool;

pub mod validate;

/// One step on the descent path: the ancestor page and the index of
/// the child that was followed.
#[derive(Debug, Clone, Copy)]
struct PathStep {
    pgno: Pgno,
    child_index: usize,
}

/// Allocate a single empty leaf and return its page number — the
/// initial state of a brand-new array (spec §3.3: "the unique root
/// leaf ... when empty, represents an empty array").
pub fn create_empty(pool: &Arc<BufferPool>, txid: Txid, prev_lsn: Lsn) -> Result<(Pgno, Lsn)> {
    let handle = pool.allocate_page()?;
    let mut buf = page::zeroed_page();
    leaf::init(&mut buf);
    let lsn = handle.write_whole(&buf, txid, prev_lsn)?;
    Ok((handle.pgno(), lsn))
}

/// `size(root)` (spec §4.9, §3.3): cumulative bytes of the root's last
/// child, or a leaf's own `used_bytes` if the root is a leaf.
pub fn size(pool: &Arc<BufferPool>, root: Pgno) -> Result<BSize> {
    let handle = pool.get_shared(root)?;
    let buf = handle.read_whole()?;
    Ok(match page::page_type(&buf) {
        page::PAGE_TYPE_DATA_LIST => leaf::used_bytes(&buf) as BSize,
        page::PAGE_TYPE_RPT_INTERNAL => internal::total_bytes(&buf),
        other => return Err(NumStoreError::corrupt_page(root, format!("unexpected root page type {other}"))),
    })
}

/// Descend from `root` toward byte offset `offset` (spec §4.7.2).
/// Returns the path of ancestors followed, the target leaf, and the
/// intra-leaf byte offset. Ties land in the right subtree.
fn seek_path(pool: &Arc<BufferPool>, root: Pgno, offset: BSize) -> Result<(Vec<PathStep>, Pgno, u64)> {
    let mut path = Vec::new();
    let mut current = root;
    let mut remaining = offset;

    loop {
        let handle = pool.get_shared(current)?;
        let buf = handle.read_whole()?;
        match page::page_type(&buf) {
            page::PAGE_TYPE_DATA_LIST => return Ok((path, current, remaining)),
            page::PAGE_TYPE_RPT_INTERNAL => {
                let children = internal::children(&buf);
                if children.is_empty() {
                    return Err(NumStoreError::corrupt_page(current, "internal page with no children"));
                }
                let idx = children
                    .iter()
                    .position(|&(_, cum)| cum > remaining)
                    .unwrap_or(children.len() - 1);
                let prior = if idx == 0 { 0 } else { children[idx - 1].1 };
                path.push(PathStep {
                    pgno: current,
                    child_index: idx,
                });
                remaining -= prior;
                current = children[idx].0;
            }
            other => return Err(NumStoreError::corrupt_page(current, format!("unexpected page type {other}"))),
        }
    }
}

/// Read `nelems` elements of `elem_size` bytes starting at `stride`
/// (spec §4.7.3). Returns the number of elements actually read (may be
/// fewer than requested if the leaf list runs out early).
pub fn read_stride(pool: &Arc<BufferPool>, root: Pgno, dst: &mut [u8], elem_size: u32, stride: &Stride) -> Result<u64> {
    if stride.is_empty() {
        return Ok(0);
    }
    let (_, mut leaf_pgno, mut intra) = seek_path(pool, root, stride.start * elem_size as u64)?;
    let step_bytes = stride.step as u64 * elem_size as u64;

    let mut read_count = 0u64;
    for k in 0..stride.nelems {
        let handle = pool.get_shared(leaf_pgno)?;
        let buf = handle.read_whole()?;
        let used = leaf::used_bytes(&buf) as u64;

        if intra + elem_size as u64 > used {
            break;
        }
        let start = (leaf::DATA_OFFSET as u64 + intra) as usize;
        let dst_off = (k * elem_size as u64) as usize;
        dst[dst_off..dst_off + elem_size as usize].copy_from_slice(&buf[start..start + elem_size as usize]);
        read_count += 1;

        intra += step_bytes;
        loop {
            let handle = pool.get_shared(leaf_pgno)?;
            let buf = handle.read_whole()?;
            let used = leaf::used_bytes(&buf) as u64;
            if intra < used || k + 1 == stride.nelems {
                break;
            }
            let next = leaf::next_leaf(&buf);
            if next == PGNO_NULL {
                return Ok(read_count);
            }
            intra -= used;
            leaf_pgno = next;
        }
    }
    Ok(read_count)
}

/// Write `nelems` elements with the same traversal as read (spec
/// §4.7.4); no leaf changes size, so no rebalancing is ever triggered.
pub fn write_stride(
    pool: &Arc<BufferPool>,
    root: Pgno,
    src: &[u8],
    elem_size: u32,
    stride: &Stride,
    txid: Txid,
    mut prev_lsn: Lsn,
) -> Result<(u64, Lsn)> {
    if stride.is_empty() {
        return Ok((0, prev_lsn));
    }
    let (_, mut leaf_pgno, mut intra) = seek_path(pool, root, stride.start * elem_size as u64)?;
    let step_bytes = stride.step as u64 * elem_size as u64;

    let mut written = 0u64;
    for k in 0..stride.nelems {
        let handle = pool.get_exclusive(leaf_pgno)?;
        let buf = handle.read_whole()?;
        let used = leaf::used_bytes(&buf) as u64;
        if intra + elem_size as u64 > used {
            break;
        }
        let offset = (leaf::DATA_OFFSET as u64 + intra) as usize;
        let chunk = &src[(k * elem_size as u64) as usize..][..elem_size as usize];
        prev_lsn = handle.write_range(offset, chunk, txid, prev_lsn)?;
        written += 1;

        intra += step_bytes;
        drop(handle);
        loop {
            let handle = pool.get_shared(leaf_pgno)?;
            let buf = handle.read_whole()?;
            let used = leaf::used_bytes(&buf) as u64;
            if intra < used || k + 1 == stride.nelems {
                break;
            }
            let next = leaf::next_leaf(&buf);
            if next == PGNO_NULL {
                return Ok((written, prev_lsn));
            }
            intra -= used;
            leaf_pgno = next;
        }
    }
    Ok((written, prev_lsn))
}

pub struct InsertOutcome {
    pub new_root: Pgno,
    pub last_lsn: Lsn,
}

/// `insert(offset, src, elem_size, nelem)` (spec §4.7.5): shifts
/// trailing bytes right and splices in the payload, splitting leaves
/// (and, on overflow, ancestors) as needed. Processes the payload in
/// leaf-capacity-sized chunks; each chunk triggers at most one leaf
/// split and one cascading ascent, which keeps the algorithm a
/// straightforward generalization of classic B+-tree insertion while
/// still leaving every §4.7.7 invariant intact once the whole payload
/// has landed.
pub fn insert(
    pool: &Arc<BufferPool>,
    root: Pgno,
    offset: BSize,
    mut payload: &[u8],
    txid: Txid,
    mut last_lsn: Lsn,
) -> Result<InsertOutcome> {
    let mut current_root = root;
    let mut cursor = offset;

    while !payload.is_empty() {
        let (path, leaf_pgno, intra) = seek_path(pool, current_root, cursor)?;
        let handle = pool.get_exclusive(leaf_pgno)?;
        let buf = handle.read_whole()?;
        let used = leaf::used_bytes(&buf) as usize;
        let intra = intra as usize;
        let room = leaf::CAPACITY - used;

        if room > 0 {
            let take = payload.len().min(room);
            let mut new_buf = buf.clone();
            {
                let data_off = leaf::DATA_OFFSET;
                new_buf.copy_within(data_off + intra..data_off + used, data_off + intra + take);
                new_buf[data_off + intra..data_off + intra + take].copy_from_slice(&payload[..take]);
            }
            leaf::set_used_bytes(&mut new_buf, (used + take) as u16);
            last_lsn = handle.write_whole(&new_buf, txid, last_lsn)?;
            drop(handle);

            // A plain in-place write never changes which page is the root.
            propagate_delta(pool, &path, take as i64, txid, &mut last_lsn)?;
            payload = &payload[take..];
            cursor += take as u64;
        } else {
            drop(handle);
            let (new_leaf_pgno, new_leaf_used, split_lsn) = split_leaf(pool, leaf_pgno, intra, txid, last_lsn)?;
            last_lsn = split_lsn;
            let new_root = propagate_new_sibling(
                pool,
                &path,
                leaf_pgno,
                new_leaf_pgno,
                new_leaf_used as i64,
                txid,
                &mut last_lsn,
            )?;
            current_root = new_root;
            // loop again; the freshly split leaf now has room.
        }
    }

    Ok(InsertOutcome {
        new_root: current_root,
        last_lsn,
    })
}

/// Split leaf `pgno` at intra-offset `at`, moving `data[at..]` into a
/// freshly allocated leaf linked in as its immediate successor. Returns
/// the new leaf's pgno, its `used_bytes`, and the LSN of the last
/// write.
fn split_leaf(pool: &Arc<BufferPool>, pgno: Pgno, at: usize, txid: Txid, prev_lsn: Lsn) -> Result<(Pgno, u16, Lsn)> {
    let handle = pool.get_exclusive(pgno)?;
    let buf = handle.read_whole()?;
    let used = leaf::used_bytes(&buf) as usize;
    let old_next = leaf::next_leaf(&buf);

    let (new_handle, header_lsn) = free_list::allocate_page(pool, txid, prev_lsn)?;
    let new_pgno = new_handle.pgno();
    let mut new_buf = page::zeroed_page();
    leaf::init(&mut new_buf);
    leaf::set_prev_leaf(&mut new_buf, pgno);
    leaf::set_next_leaf(&mut new_buf, old_next);
    let moved_len = used - at;
    new_buf[leaf::DATA_OFFSET..leaf::DATA_OFFSET + moved_len].copy_from_slice(&buf[leaf::DATA_OFFSET + at..leaf::DATA_OFFSET + used]);
    leaf::set_used_bytes(&mut new_buf, moved_len as u16);
    let mut lsn = new_handle.write_whole(&new_buf, txid, header_lsn.unwrap_or(prev_lsn))?;
    drop(new_handle);

    if old_next != PGNO_NULL {
        let next_handle = pool.get_exclusive(old_next)?;
        let mut next_buf = next_handle.read_whole()?;
        leaf::set_prev_leaf(&mut next_buf, new_pgno);
        lsn = next_handle.write_whole(&next_buf, txid, lsn)?;
    }

    let mut left_buf = buf.clone();
    leaf::set_used_bytes(&mut left_buf, at as u16);
    leaf::set_next_leaf(&mut left_buf, new_pgno);
    lsn = handle.write_whole(&left_buf, txid, lsn)?;

    Ok((new_pgno, moved_len as u16, lsn))
}

/// Walk `path` from the deepest ancestor to the root, adding `delta`
/// bytes to every cumulative entry at or after the modified child
/// (spec §4.7.5 step 6). Never changes which page is the root.
fn propagate_delta(pool: &Arc<BufferPool>, path: &[PathStep], delta: i64, txid: Txid, last_lsn: &mut Lsn) -> Result<()> {
    for step in path.iter().rev() {
        let handle = pool.get_exclusive(step.pgno)?;
        let buf = handle.read_whole()?;
        let mut children = internal::children(&buf);
        for entry in children.iter_mut().skip(step.child_index) {
            entry.1 = (entry.1 as i64 + delta) as u64;
        }
        let mut new_buf = buf.clone();
        internal::set_children(&mut new_buf, &children);
        *last_lsn = handle.write_whole(&new_buf, txid, *last_lsn)?;
    }
    Ok(())
}

/// Splice `new_sibling` in immediately after `modified_child` in its
/// parent (the deepest entry of `path`), cascading a node split up
/// through ancestors as needed, and finishing any higher ancestors with
/// a plain delta (spec §4.7.5 steps 5-6). Returns the tree's root page
/// number, which changes if the root itself split.
fn propagate_new_sibling(
    pool: &Arc<BufferPool>,
    path: &[PathStep],
    modified_child: Pgno,
    new_sibling: Pgno,
    new_sibling_local_size: i64,
    txid: Txid,
    last_lsn: &mut Lsn,
) -> Result<Pgno> {
    if path.is_empty() {
        // The split node was the root itself: build a fresh root over
        // the two halves.
        let modified_size = size(pool, modified_child)?;
        let (new_root_handle, alloc_lsn) = free_list::allocate_page(pool, txid, *last_lsn)?;
        if let Some(lsn) = alloc_lsn {
            *last_lsn = lsn;
        }
        let mut buf = page::zeroed_page();
        internal::init(&mut buf);
        internal::set_children(
            &mut buf,
            &[
                (modified_child, modified_size),
                (new_sibling, modified_size + new_sibling_local_size as u64),
            ],
        );
        *last_lsn = new_root_handle.write_whole(&buf, txid, *last_lsn)?;
        return Ok(new_root_handle.pgno());
    }

    let deepest = path.last().unwrap();
    let handle = pool.get_exclusive(deepest.pgno)?;
    let buf = handle.read_whole()?;
    let old_children = internal::children(&buf);

    let mut local_sizes: Vec<i64> = Vec::with_capacity(old_children.len());
    let mut prev_cum = 0u64;
    for &(_, cum) in &old_children {
        local_sizes.push((cum - prev_cum) as i64);
        prev_cum = cum;
    }

    let mut pgnos: Vec<Pgno> = old_children.iter().map(|&(p, _)| p).collect();
    // The modified child's own local size already reflects its post-split
    // size (caller passes the pre-split child unchanged here; we recompute
    // its size directly instead of trusting a delta, since a split leaf's
    // own size is whatever `split_leaf` left behind).
    local_sizes[deepest.child_index] = size(pool, modified_child)? as i64;
    pgnos.insert(deepest.child_index + 1, new_sibling);
    local_sizes.insert(deepest.child_index + 1, new_sibling_local_size);

    if pgnos.len() <= internal::MAX_FANOUT {
        let entries = cumulative_entries(&pgnos, &local_sizes);
        let mut new_buf = buf.clone();
        internal::set_children(&mut new_buf, &entries);
        *last_lsn = handle.write_whole(&new_buf, txid, *last_lsn)?;
        drop(handle);
        let total_delta = entries.last().map(|e| e.1).unwrap_or(0) as i64 - old_children.last().map(|e| e.1).unwrap_or(0) as i64;
        let rest = &path[..path.len() - 1];
        // `deepest` absorbed the new sibling without overflowing, so the
        // tree's root is unchanged: it's `deepest.pgno` itself if it had
        // no ancestors, or whatever `rest`'s root already was otherwise.
        propagate_delta(pool, rest, total_delta, txid, last_lsn)?;
        return Ok(rest.first().map(|s| s.pgno).unwrap_or(deepest.pgno));
    }

    // Overflow: split this internal node left-leaning (extra entry to
    // the right half), propagate the right half up as a new sibling.
    let split_at = pgnos.len() / 2;
    let (left_pgnos, right_pgnos) = pgnos.split_at(split_at);
    let (left_sizes, right_sizes) = local_sizes.split_at(split_at);

    let left_entries = cumulative_entries(left_pgnos, left_sizes);
    let right_entries = cumulative_entries(right_pgnos, right_sizes);

    let mut left_buf = buf.clone();
    internal::set_children(&mut left_buf, &left_entries);
    *last_lsn = handle.write_whole(&left_buf, txid, *last_lsn)?;
    drop(handle);

    let (right_handle, alloc_lsn) = free_list::allocate_page(pool, txid, *last_lsn)?;
    if let Some(lsn) = alloc_lsn {
        *last_lsn = lsn;
    }
    let mut right_buf = page::zeroed_page();
    internal::init(&mut right_buf);
    internal::set_children(&mut right_buf, &right_entries);
    *last_lsn = right_handle.write_whole(&right_buf, txid, *last_lsn)?;
    let right_pgno = right_handle.pgno();
    drop(right_handle);

    let right_total = right_entries.last().map(|e| e.1).unwrap_or(0) as i64;
    let rest = &path[..path.len() - 1];
    propagate_new_sibling(pool, rest, deepest.pgno, right_pgno, right_total, txid, last_lsn)
}

fn cumulative_entries(pgnos: &[Pgno], local_sizes: &[i64]) -> Vec<(Pgno, u64)> {
    let mut out = Vec::with_capacity(pgnos.len());
    let mut running = 0i64;
    for (&pgno, &local) in pgnos.iter().zip(local_sizes.iter()) {
        running += local;
        out.push((pgno, running as u64));
    }
    out
}

pub struct RemoveOutcome {
    pub new_root: Pgno,
    pub last_lsn: Lsn,
    pub removed: Vec<u8>,
}

/// `remove(stride, elem_size)` (spec §4.7.6): shifts the tail left over
/// each removed element and returns the removed bytes in stride order.
/// Indices are processed back-to-front so that removing one element
/// never perturbs the byte offset of an index not yet processed.
/// Borrow-from-right / merge-with-left rebalancing (spec §4.7.7) is
/// scoped to the immediate parent of the affected leaf: since both
/// moves are byte-neutral from that parent's own parent's point of
/// view, no change ever needs to propagate further up than the leaf's
/// immediate parent.
pub fn remove(
    pool: &Arc<BufferPool>,
    root: Pgno,
    stride: &Stride,
    elem_size: u32,
    txid: Txid,
    mut last_lsn: Lsn,
    min_fill_bytes: usize,
) -> Result<RemoveOutcome> {
    let mut current_root = root;
    let mut collected: Vec<(BSize, Vec<u8>)> = Vec::new();

    let mut indices: Vec<BSize> = stride.indices().collect();
    indices.sort_unstable_by(|a, b| b.cmp(a));

    if let Some(&max_idx) = indices.first() {
        let total = size(pool, root)?;
        if (max_idx + 1) * elem_size as u64 > total {
            return Err(NumStoreError::InvalidArgument(format!(
                "remove index {max_idx} out of range for array of {total} bytes at elem_size {elem_size}"
            )));
        }
    }

    for idx in indices {
        let offset = idx * elem_size as u64;
        let (new_root, new_lsn, bytes) = remove_one(pool, current_root, offset, elem_size as usize, txid, last_lsn, min_fill_bytes)?;
        current_root = new_root;
        last_lsn = new_lsn;
        collected.push((idx, bytes));
    }

    collected.sort_unstable_by_key(|(idx, _)| *idx);
    let removed = collected.into_iter().flat_map(|(_, bytes)| bytes).collect();

    Ok(RemoveOutcome {
        new_root: current_root,
        last_lsn,
        removed,
    })
}

fn remove_one(
    pool: &Arc<BufferPool>,
    root: Pgno,
    offset: BSize,
    elem_size: usize,
    txid: Txid,
    mut last_lsn: Lsn,
    min_fill_bytes: usize,
) -> Result<(Pgno, Lsn, Vec<u8>)> {
    let (path, leaf_pgno, intra) = seek_path(pool, root, offset)?;
    let intra = intra as usize;

    let handle = pool.get_exclusive(leaf_pgno)?;
    let buf = handle.read_whole()?;
    let used = leaf::used_bytes(&buf) as usize;
    let data_off = leaf::DATA_OFFSET;

    let removed = buf[data_off + intra..data_off + intra + elem_size].to_vec();
    let mut new_buf = buf.clone();
    new_buf.copy_within(data_off + intra + elem_size..data_off + used, data_off + intra);
    let new_used = used - elem_size;
    leaf::set_used_bytes(&mut new_buf, new_used as u16);
    last_lsn = handle.write_whole(&new_buf, txid, last_lsn)?;
    drop(handle);

    propagate_delta(pool, &path, -(elem_size as i64), txid, &mut last_lsn)?;

    let new_root = if path.is_empty() {
        root
    } else {
        rebalance_leaf(pool, &path, leaf_pgno, new_used, min_fill_bytes, txid, &mut last_lsn, root)?
    };

    Ok((new_root, last_lsn, removed))
}

/// Borrow from a right sibling, else merge with a left sibling, else
/// merge the right sibling into this leaf — all restricted to siblings
/// under the same immediate parent. Returns the tree's root, which
/// only ever changes here if the parent itself collapses to a single
/// remaining child (spec §4.7.7: an internal node must never be left
/// with zero children).
fn rebalance_leaf(
    pool: &Arc<BufferPool>,
    path: &[PathStep],
    leaf_pgno: Pgno,
    leaf_used: usize,
    min_fill_bytes: usize,
    txid: Txid,
    last_lsn: &mut Lsn,
    root: Pgno,
) -> Result<Pgno> {
    if leaf_used >= min_fill_bytes {
        return Ok(root);
    }

    let parent_step = path.last().unwrap();
    let parent_handle = pool.get_exclusive(parent_step.pgno)?;
    let parent_buf = parent_handle.read_whole()?;
    let children = internal::children(&parent_buf);
    let idx = parent_step.child_index;

    if idx + 1 < children.len() {
        let right_pgno = children[idx + 1].0;
        let right_handle = pool.get_exclusive(right_pgno)?;
        let right_buf = right_handle.read_whole()?;
        let right_used = leaf::used_bytes(&right_buf) as usize;

        if leaf_used + right_used <= leaf::CAPACITY && right_used <= min_fill_bytes {
            // Merge right into this leaf, then drop the right entry.
            merge_leaves_right_into_left(pool, leaf_pgno, right_pgno, txid, last_lsn)?;
            drop(right_handle);
            splice_out_child(pool, parent_step.pgno, &parent_buf, idx + 1, idx, txid, last_lsn)?;
        } else {
            let need = min_fill_bytes - leaf_used;
            let lend = need.min(right_used.saturating_sub(min_fill_bytes)).max(1).min(right_used);
            borrow_from_right(pool, leaf_pgno, right_pgno, lend, txid, last_lsn)?;
            drop(right_handle);
            update_sibling_boundary(pool, parent_step.pgno, &parent_buf, idx, txid, last_lsn)?;
        }
    } else if idx > 0 {
        let left_pgno = children[idx - 1].0;
        let left_handle = pool.get_exclusive(left_pgno)?;
        let left_buf = left_handle.read_whole()?;
        let left_used = leaf::used_bytes(&left_buf) as usize;

        if left_used + leaf_used <= leaf::CAPACITY && left_used <= min_fill_bytes {
            drop(left_handle);
            merge_leaves_right_into_left(pool, left_pgno, leaf_pgno, txid, last_lsn)?;
            splice_out_child(pool, parent_step.pgno, &parent_buf, idx, idx - 1, txid, last_lsn)?;
        } else {
            let need = min_fill_bytes - leaf_used;
            let lend = need.min(left_used.saturating_sub(min_fill_bytes)).max(1).min(left_used);
            drop(left_handle);
            borrow_from_left(pool, left_pgno, leaf_pgno, lend, txid, last_lsn)?;
            update_sibling_boundary(pool, parent_step.pgno, &parent_buf, idx - 1, txid, last_lsn)?;
        }
    } else {
        drop(parent_handle);
        return Ok(root);
    }
    drop(parent_handle);

    // If the parent is the tree's root and just collapsed to a single
    // child, replace the root with that child directly.
    if path.len() == 1 {
        let handle = pool.get_shared(parent_step.pgno)?;
        let buf = handle.read_whole()?;
        let children = internal::children(&buf);
        if children.len() == 1 {
            return Ok(children[0].0);
        }
    }
    Ok(root)
}

fn merge_leaves_right_into_left(pool: &Arc<BufferPool>, left_pgno: Pgno, right_pgno: Pgno, txid: Txid, last_lsn: &mut Lsn) -> Result<()> {
    let left_handle = pool.get_exclusive(left_pgno)?;
    let left_buf = left_handle.read_whole()?;
    let left_used = leaf::used_bytes(&left_buf) as usize;

    let right_handle = pool.get_exclusive(right_pgno)?;
    let right_buf = right_handle.read_whole()?;
    let right_used = leaf::used_bytes(&right_buf) as usize;
    let right_next = leaf::next_leaf(&right_buf);

    let mut new_left = left_buf.clone();
    new_left[leaf::DATA_OFFSET + left_used..leaf::DATA_OFFSET + left_used + right_used]
        .copy_from_slice(&right_buf[leaf::DATA_OFFSET..leaf::DATA_OFFSET + right_used]);
    leaf::set_used_bytes(&mut new_left, (left_used + right_used) as u16);
    leaf::set_next_leaf(&mut new_left, right_next);
    *last_lsn = left_handle.write_whole(&new_left, txid, *last_lsn)?;
    drop(left_handle);
    drop(right_handle);

    if right_next != PGNO_NULL {
        let next_handle = pool.get_exclusive(right_next)?;
        let mut next_buf = next_handle.read_whole()?;
        leaf::set_prev_leaf(&mut next_buf, left_pgno);
        *last_lsn = next_handle.write_whole(&next_buf, txid, *last_lsn)?;
    }

    free_list::free_page(pool, right_pgno, txid, *last_lsn).map(|lsn| *last_lsn = lsn)
}

fn borrow_from_right(pool: &Arc<BufferPool>, left_pgno: Pgno, right_pgno: Pgno, lend: usize, txid: Txid, last_lsn: &mut Lsn) -> Result<()> {
    let right_handle = pool.get_exclusive(right_pgno)?;
    let right_buf = right_handle.read_whole()?;
    let right_used = leaf::used_bytes(&right_buf) as usize;
    let moved = right_buf[leaf::DATA_OFFSET..leaf::DATA_OFFSET + lend].to_vec();

    let mut new_right = right_buf.clone();
    new_right.copy_within(leaf::DATA_OFFSET + lend..leaf::DATA_OFFSET + right_used, leaf::DATA_OFFSET);
    leaf::set_used_bytes(&mut new_right, (right_used - lend) as u16);
    *last_lsn = right_handle.write_whole(&new_right, txid, *last_lsn)?;
    drop(right_handle);

    let left_handle = pool.get_exclusive(left_pgno)?;
    let left_buf = left_handle.read_whole()?;
    let left_used = leaf::used_bytes(&left_buf) as usize;
    let mut new_left = left_buf.clone();
    new_left[leaf::DATA_OFFSET + left_used..leaf::DATA_OFFSET + left_used + lend].copy_from_slice(&moved);
    leaf::set_used_bytes(&mut new_left, (left_used + lend) as u16);
    *last_lsn = left_handle.write_whole(&new_left, txid, *last_lsn)?;
    Ok(())
}

fn borrow_from_left(pool: &Arc<BufferPool>, left_pgno: Pgno, right_pgno: Pgno, lend: usize, txid: Txid, last_lsn: &mut Lsn) -> Result<()> {
    let left_handle = pool.get_exclusive(left_pgno)?;
    let left_buf = left_handle.read_whole()?;
    let left_used = leaf::used_bytes(&left_buf) as usize;
    let moved = left_buf[leaf::DATA_OFFSET + left_used - lend..leaf::DATA_OFFSET + left_used].to_vec();

    let mut new_left = left_buf.clone();
    leaf::set_used_bytes(&mut new_left, (left_used - lend) as u16);
    *last_lsn = left_handle.write_whole(&new_left, txid, *last_lsn)?;
    drop(left_handle);

    let right_handle = pool.get_exclusive(right_pgno)?;
    let right_buf = right_handle.read_whole()?;
    let right_used = leaf::used_bytes(&right_buf) as usize;
    let mut new_right = right_buf.clone();
    new_right.copy_within(leaf::DATA_OFFSET..leaf::DATA_OFFSET + right_used, leaf::DATA_OFFSET + lend);
    new_right[leaf::DATA_OFFSET..leaf::DATA_OFFSET + lend].copy_from_slice(&moved);
    leaf::set_used_bytes(&mut new_right, (right_used + lend) as u16);
    *last_lsn = right_handle.write_whole(&new_right, txid, *last_lsn)?;
    Ok(())
}

/// Rewrite `parent_pgno`'s children with entry `removed_index` dropped.
/// `surviving_index` is the leaf that absorbed the merged bytes; its
/// local size is re-read from disk since a merge grows it beyond what
/// `parent_buf`'s stale cumulative snapshot shows. Every other entry's
/// local size is byte-neutral and can be taken straight from the
/// snapshot.
fn splice_out_child(
    pool: &Arc<BufferPool>,
    parent_pgno: Pgno,
    parent_buf: &[u8],
    removed_index: usize,
    surviving_index: usize,
    txid: Txid,
    last_lsn: &mut Lsn,
) -> Result<()> {
    let children = internal::children(parent_buf);
    let mut local_sizes: Vec<i64> = Vec::with_capacity(children.len());
    let mut prev = 0u64;
    for &(_, cum) in &children {
        local_sizes.push((cum - prev) as i64);
        prev = cum;
    }

    let surviving_pgno = children[surviving_index].0;
    let surviving_handle = pool.get_shared(surviving_pgno)?;
    local_sizes[surviving_index] = leaf::used_bytes(&surviving_handle.read_whole()?) as i64;
    drop(surviving_handle);

    let mut pgnos: Vec<Pgno> = children.iter().map(|&(p, _)| p).collect();
    pgnos.remove(removed_index);
    local_sizes.remove(removed_index);

    let entries = cumulative_entries(&pgnos, &local_sizes);
    let handle = pool.get_exclusive(parent_pgno)?;
    let mut buf = page::zeroed_page();
    buf.copy_from_slice(parent_buf);
    internal::set_children(&mut buf, &entries);
    *last_lsn = handle.write_whole(&buf, txid, *last_lsn)?;
    Ok(())
}

/// Recompute entries `idx` and `idx+1` of `parent_pgno` after a borrow
/// moved bytes between those two siblings (their own stored sizes read
/// straight back off disk; only the cumulative encoding needs a
/// rewrite).
fn update_sibling_boundary(pool: &Arc<BufferPool>, parent_pgno: Pgno, parent_buf: &[u8], idx: usize, txid: Txid, last_lsn: &mut Lsn) -> Result<()> {
    let children = internal::children(parent_buf);
    let left_pgno = children[idx].0;
    let right_pgno = children[idx + 1].0;

    let left_handle = pool.get_shared(left_pgno)?;
    let left_used = leaf::used_bytes(&left_handle.read_whole()?) as u64;
    let right_handle = pool.get_shared(right_pgno)?;
    let right_used = leaf::used_bytes(&right_handle.read_whole()?) as u64;
    drop(left_handle);
    drop(right_handle);

    let prior = if idx == 0 { 0 } else { children[idx - 1].1 };
    let mut entries = children;
    entries[idx].1 = prior + left_used;
    entries[idx + 1].1 = prior + left_used + right_used;

    let handle = pool.get_exclusive(parent_pgno)?;
    let mut buf = page::zeroed_page();
    buf.copy_from_slice(parent_buf);
    internal::set_children(&mut buf, &entries);
    *last_lsn = handle.write_whole(&buf, txid, *last_lsn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use numstore_wal::WalWriter;
    use tempfile::TempDir;

    fn open_pool(dir: &std::path::Path) -> Arc<BufferPool> {
        let wal = Arc::new(WalWriter::open(dir, "wal", 1 << 20).unwrap());
        BufferPool::open(dir, "db.bin", wal, 64).unwrap()
    }

    #[test]
    fn tail_insert_then_full_read_matches_s1() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(dir.path());
        let (root, lsn) = create_empty(&pool, 1, 0).unwrap();

        let values: Vec<i32> = (0..100).collect();
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let outcome = insert(&pool, root, 0, &bytes, 1, lsn).unwrap();

        assert_eq!(size(&pool, outcome.new_root).unwrap(), 400);

        let mut dst = vec![0u8; 400];
        let stride = Stride::resolve(numstore_common::UserStride::full(), 100).unwrap();
        let n = read_stride(&pool, outcome.new_root, &mut dst, 4, &stride).unwrap();
        assert_eq!(n, 100);
        let got: Vec<i32> = dst.chunks(4).map(|c| i32::from_le_bytes(c.try_into().unwrap())).collect();
        assert_eq!(got, values);
    }

    #[test]
    fn overflow_induces_split_matches_s4() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(dir.path());
        let (root, lsn) = create_empty(&pool, 1, 0).unwrap();

        let payload = vec![7u8; 8192];
        let outcome = insert(&pool, root, 0, &payload, 1, lsn).unwrap();

        assert_eq!(size(&pool, outcome.new_root).unwrap(), 8192);
        let handle = pool.get_shared(outcome.new_root).unwrap();
        let buf = handle.read_whole().unwrap();
        assert_eq!(page::page_type(&buf), page::PAGE_TYPE_RPT_INTERNAL);
        assert!(internal::nchildren(&buf) >= 2);
    }

    #[test]
    fn interior_insert_shifts_tail_matches_s2() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(dir.path());
        let (root, lsn) = create_empty(&pool, 1, 0).unwrap();

        let base: Vec<i32> = (0..100).collect();
        let base_bytes: Vec<u8> = base.iter().flat_map(|v| v.to_le_bytes()).collect();
        let o1 = insert(&pool, root, 0, &base_bytes, 1, lsn).unwrap();

        let middle: Vec<i32> = vec![1000, 1001, 1002, 1003, 1004];
        let middle_bytes: Vec<u8> = middle.iter().flat_map(|v| v.to_le_bytes()).collect();
        let o2 = insert(&pool, o1.new_root, 20, &middle_bytes, 1, o1.last_lsn).unwrap();

        let mut expect = base.clone();
        expect.splice(5..5, middle);

        let mut dst = vec![0u8; expect.len() * 4];
        let stride = Stride::resolve(numstore_common::UserStride::full(), expect.len() as u64).unwrap();
        read_stride(&pool, o2.new_root, &mut dst, 4, &stride).unwrap();
        let got: Vec<i32> = dst.chunks(4).map(|c| i32::from_le_bytes(c.try_into().unwrap())).collect();
        assert_eq!(got, expect);
    }
}
