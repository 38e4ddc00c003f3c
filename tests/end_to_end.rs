//! End-to-end scenarios driven through the public `numstore-compute`
//! façade rather than `numstore-storage` directly (spec §8.2 S5-S7),
//! replacing the teacher's phase1/phase2 integration suite.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use numstore_common::Stride;
use numstore_compute::NumStore;
use tempfile::TempDir;

#[test]
fn crash_mid_transaction_then_reopen_loses_uncommitted_insert() {
    let dir = TempDir::new().unwrap();

    let root = {
        let store = NumStore::open(dir.path()).unwrap();
        let tx = store.begin_txn().unwrap();
        let root = store.new_array(tx).unwrap();
        let root = store.insert(tx, root, 0, &[1; 4096]).unwrap();
        // Crash: no commit, no close().
        root
    };

    let store = NumStore::open(dir.path()).unwrap();
    assert_eq!(store.size(root).unwrap(), 0);
}

#[test]
fn commit_then_crash_then_reopen_keeps_committed_insert() {
    let dir = TempDir::new().unwrap();

    let (root, payload) = {
        let store = NumStore::open(dir.path()).unwrap();
        let payload = vec![0x42u8; 4096];
        let root = store.new_array_auto().unwrap();
        let root = store.insert_auto(root, 0, &payload).unwrap();
        // Crash after the auto-commit wrapper returned: no close().
        (root, payload)
    };

    let store = NumStore::open(dir.path()).unwrap();
    assert_eq!(store.size(root).unwrap(), payload.len() as u64);

    let mut dst = vec![0u8; payload.len()];
    let stride = Stride { start: 0, step: 1, nelems: payload.len() as u64 };
    let n = store.read(root, &mut dst, 1, &stride).unwrap();
    assert_eq!(n, payload.len() as u64);
    assert_eq!(dst, payload);
}

#[test]
fn cross_transaction_deadlock_leaves_one_survivor() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(NumStore::open(dir.path()).unwrap());

    let root_a = store.new_array_auto().unwrap();
    let root_b = store.new_array_auto().unwrap();

    let t1 = store.begin_txn().unwrap();
    let t2 = store.begin_txn().unwrap();

    store.insert(t1, root_a, 0, &[1]).unwrap();
    store.insert(t2, root_b, 0, &[2]).unwrap();

    let store2 = Arc::clone(&store);
    let t2_handle = thread::spawn(move || store2.insert(t2, root_a, 0, &[3]));

    thread::sleep(Duration::from_millis(100));
    let t1_result = store.insert(t1, root_b, 0, &[4]);
    let t2_result = t2_handle.join().unwrap();

    let failures = [t1_result.is_err(), t2_result.is_err()];
    assert_eq!(failures.iter().filter(|&&f| f).count(), 1);

    let (survivor, loser) = if t1_result.is_ok() { (t1, t2) } else { (t2, t1) };
    store.commit(survivor).unwrap();
    let _ = store.rollback(loser);
}
