//! Dirty Page Table (spec §4.5): the set of pages modified in memory
//! but not yet durably reflected on disk, with the earliest LSN that
//! made each one dirty.

use std::collections::BTreeMap;

use numstore_common::{Lsn, Pgno};

#[derive(Debug, Default)]
pub struct DirtyPageTable {
    entries: BTreeMap<Pgno, Lsn>,
}

impl DirtyPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `pgno` was dirtied at `lsn`. No-op if already present
    /// — `rec_lsn` always stays the *earliest* dirtying LSN.
    pub fn add(&mut self, pgno: Pgno, lsn: Lsn) {
        self.entries.entry(pgno).or_insert(lsn);
    }

    /// Update an existing entry (asserts the page is already tracked).
    pub fn update(&mut self, pgno: Pgno, new_lsn: Lsn) {
        let entry = self
            .entries
            .get_mut(&pgno)
            .expect("update() on a page absent from the dirty page table");
        *entry = new_lsn;
    }

    /// Drop a page once it has been flushed to disk.
    pub fn remove(&mut self, pgno: Pgno) {
        self.entries.remove(&pgno);
    }

    pub fn contains(&self, pgno: Pgno) -> bool {
        self.entries.contains_key(&pgno)
    }

    pub fn rec_lsn(&self, pgno: Pgno) -> Option<Lsn> {
        self.entries.get(&pgno).copied()
    }

    /// The redo starting point at checkpoint time: the smallest
    /// `rec_lsn` across every tracked page.
    pub fn min_rec_lsn(&self) -> Option<Lsn> {
        self.entries.values().copied().min()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Snapshot for a `CHECKPOINT` WAL record payload.
    pub fn serialize(&self) -> Vec<(Pgno, Lsn)> {
        self.entries.iter().map(|(&p, &l)| (p, l)).collect()
    }

    pub fn deserialize(snapshot: &[(Pgno, Lsn)]) -> Self {
        Self {
            entries: snapshot.iter().copied().collect(),
        }
    }

    /// Merge another (analysis-time) DPT into this one, keeping the
    /// earlier `rec_lsn` wherever both sides track the same page.
    pub fn merge_into(&mut self, other: &DirtyPageTable) {
        for (&pgno, &lsn) in &other.entries {
            match self.entries.get(&pgno) {
                Some(&existing) if existing <= lsn => {}
                _ => {
                    self.entries.insert(pgno, lsn);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_keeps_earliest_lsn() {
        let mut dpt = DirtyPageTable::new();
        dpt.add(1, 10);
        dpt.add(1, 5);
        assert_eq!(dpt.rec_lsn(1), Some(10));
    }

    #[test]
    fn min_rec_lsn_is_the_redo_start_point() {
        let mut dpt = DirtyPageTable::new();
        dpt.add(1, 20);
        dpt.add(2, 5);
        dpt.add(3, 15);
        assert_eq!(dpt.min_rec_lsn(), Some(5));
    }

    #[test]
    fn serialize_deserialize_roundtrips() {
        let mut dpt = DirtyPageTable::new();
        dpt.add(4, 8);
        dpt.add(9, 1);
        let snapshot = dpt.serialize();
        let restored = DirtyPageTable::deserialize(&snapshot);
        assert_eq!(restored.rec_lsn(4), Some(8));
        assert_eq!(restored.rec_lsn(9), Some(1));
    }

    #[test]
    fn merge_into_prefers_earlier_lsn() {
        let mut a = DirtyPageTable::new();
        a.add(1, 50);
        let mut b = DirtyPageTable::new();
        b.add(1, 10);
        b.add(2, 30);
        a.merge_into(&b);
        assert_eq!(a.rec_lsn(1), Some(10));
        assert_eq!(a.rec_lsn(2), Some(30));
    }
}
