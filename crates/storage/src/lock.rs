//! Hierarchical shared/exclusive lock table (spec §4.4). Resources are
//! identified structurally by `(kind, data)`; a condition variable per
//! resource parks waiters when a request conflicts with the current
//! holders.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use numstore_common::{NumStoreError, Pgno, Result, Txid};
use tracing::{debug, warn};

/// Hierarchical lock resources (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockResource {
    Db,
    Root,
    Vhp,
    Var(Pgno),
    Rptree(Pgno),
    Tombstone(Pgno),
}

impl fmt::Display for LockResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockResource::Db => write!(f, "DB"),
            LockResource::Root => write!(f, "ROOT"),
            LockResource::Vhp => write!(f, "VHP"),
            LockResource::Var(p) => write!(f, "VAR({p})"),
            LockResource::Rptree(p) => write!(f, "RPTREE({p})"),
            LockResource::Tombstone(p) => write!(f, "TMBST({p})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    fn compatible_with(self, other: LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }
}

struct Waiter {
    txid: Txid,
    mode: LockMode,
}

#[derive(Default)]
struct ResourceState {
    holders: Vec<(Txid, LockMode)>,
    queue: VecDeque<Waiter>,
}

impl ResourceState {
    fn grantable(&self, mode: LockMode, txid: Txid) -> bool {
        let conflicts_with_holders = self
            .holders
            .iter()
            .any(|&(holder_txid, held_mode)| holder_txid != txid && !held_mode.compatible_with(mode));
        if conflicts_with_holders {
            return false;
        }
        // FIFO fairness: a queued request blocks later-arriving compatible
        // requests from jumping ahead of it.
        !self.queue.iter().any(|w| w.txid != txid)
    }
}

/// Wait-timeout deadlock handling (spec §4.4, §5): if a lock cannot be
/// granted within this window, the request fails with `ERR_DEADLOCK`
/// rather than parking forever.
const DEADLOCK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct LockTable {
    state: Mutex<HashMap<LockResource, ResourceState>>,
    cv: Condvar,
    deadlock_timeout: Duration,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTable {
    pub fn new() -> Self {
        Self::with_timeout(DEADLOCK_TIMEOUT)
    }

    pub fn with_timeout(deadlock_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            cv: Condvar::new(),
            deadlock_timeout,
        }
    }

    /// Acquire `mode` on `resource` for `txid`, blocking (with a
    /// deadlock wait-timeout) until granted or conflict resolves.
    pub fn lock(&self, resource: LockResource, mode: LockMode, txid: Txid) -> Result<()> {
        let mut table = self.state.lock().unwrap();
        let entry = table.entry(resource).or_default();

        if let Some(pos) = entry.holders.iter().position(|&(t, _)| t == txid) {
            if entry.holders[pos].1 == mode || mode == LockMode::Shared {
                return Ok(());
            }
            drop(table);
            return self.upgrade(resource, LockMode::Exclusive, txid);
        }

        if entry.grantable(mode, txid) {
            entry.holders.push((txid, mode));
            debug!(resource = %resource, txid, mode = ?mode, "lock granted immediately");
            return Ok(());
        }

        entry.queue.push_back(Waiter { txid, mode });
        warn!(resource = %resource, txid, mode = ?mode, "lock request queued, waiting");

        let deadline = Instant::now() + self.deadlock_timeout;
        loop {
            let entry = table.get(&resource).unwrap();
            let at_head = entry.queue.front().map(|w| w.txid) == Some(txid);
            if at_head && entry.grantable(mode, txid) {
                let mut entry = table.remove(&resource).unwrap();
                entry.queue.pop_front();
                entry.holders.push((txid, mode));
                table.insert(resource, entry);
                debug!(resource = %resource, txid, mode = ?mode, "lock granted after wait");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                if let Some(entry) = table.get_mut(&resource) {
                    entry.queue.retain(|w| w.txid != txid);
                }
                warn!(resource = %resource, txid, "lock wait timed out, reporting deadlock");
                return Err(NumStoreError::Deadlock { txid });
            }

            let (guard, timeout) = self
                .cv
                .wait_timeout(table, deadline.saturating_duration_since(now))
                .unwrap();
            table = guard;
            let _ = timeout;
        }
    }

    /// Upgrade a held lock to `new_mode`; an upgrading holder has
    /// priority over fresh conflicting requests (spec §4.4).
    pub fn upgrade(&self, resource: LockResource, new_mode: LockMode, txid: Txid) -> Result<()> {
        let mut table = self.state.lock().unwrap();
        let deadline = Instant::now() + self.deadlock_timeout;
        loop {
            let entry = table.entry(resource).or_default();
            let others_conflict = entry
                .holders
                .iter()
                .any(|&(t, m)| t != txid && !m.compatible_with(new_mode));
            if !others_conflict {
                if let Some(slot) = entry.holders.iter_mut().find(|(t, _)| *t == txid) {
                    slot.1 = new_mode;
                } else {
                    entry.holders.push((txid, new_mode));
                }
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(NumStoreError::Deadlock { txid });
            }
            let (guard, _) = self
                .cv
                .wait_timeout(table, deadline.saturating_duration_since(now))
                .unwrap();
            table = guard;
        }
    }

    /// Release every lock `txid` holds, waking waiters whose head
    /// request is now compatible.
    pub fn release_all(&self, txid: Txid, held: &[LockResource]) {
        let mut table = self.state.lock().unwrap();
        for &resource in held {
            if let Some(entry) = table.get_mut(&resource) {
                entry.holders.retain(|&(t, _)| t != txid);
            }
        }
        drop(table);
        self.cv.notify_all();
    }

    /// Diagnostic dump of every resource's holders and waiters,
    /// supplementing the original lock table's debug trace.
    pub fn debug_dump(&self) -> String {
        let table = self.state.lock().unwrap();
        let mut out = String::new();
        for (resource, state) in table.iter() {
            out.push_str(&format!(
                "{resource}: holders={:?} waiting={:?}\n",
                state.holders,
                state.queue.iter().map(|w| (w.txid, w.mode)).collect::<Vec<_>>()
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn shared_locks_are_compatible() {
        let lt = LockTable::new();
        lt.lock(LockResource::Db, LockMode::Shared, 1).unwrap();
        lt.lock(LockResource::Db, LockMode::Shared, 2).unwrap();
    }

    #[test]
    fn exclusive_excludes_everyone_else() {
        let lt = Arc::new(LockTable::new());
        lt.lock(LockResource::Rptree(5), LockMode::Exclusive, 1).unwrap();

        let lt2 = Arc::clone(&lt);
        let handle = thread::spawn(move || lt2.lock(LockResource::Rptree(5), LockMode::Shared, 2));

        thread::sleep(Duration::from_millis(50));
        lt.release_all(1, &[LockResource::Rptree(5)]);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn same_txn_reacquiring_shared_is_a_no_op() {
        let lt = LockTable::new();
        lt.lock(LockResource::Var(1), LockMode::Shared, 9).unwrap();
        lt.lock(LockResource::Var(1), LockMode::Shared, 9).unwrap();
    }

    #[test]
    fn conflicting_lock_times_out_with_deadlock() {
        let lt = LockTable::with_timeout(Duration::from_millis(50));
        lt.lock(LockResource::Root, LockMode::Exclusive, 1).unwrap();
        let err = lt.lock(LockResource::Root, LockMode::Exclusive, 2).unwrap_err();
        assert!(matches!(err, NumStoreError::Deadlock { txid: 2 }));
    }
}
