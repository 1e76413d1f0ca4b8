//! Transaction id manager scenarios, driven through `Database`.

use murocore::storage::page::PAGE_SIZE;
use murocore::tidm::SUPER_XID;
use murocore::{Database, Options};
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

const BUDGET: u64 = 11 * PAGE_SIZE as u64;

fn opts() -> Options {
    Options { memory_budget: BUDGET }
}

#[test]
fn super_xid_is_always_committed() {
    let dir = tempdir().unwrap();
    let db = Database::create(dir.path().join("t"), opts()).unwrap();
    assert!(db.is_committed(SUPER_XID).unwrap());
    assert!(!db.is_active(SUPER_XID).unwrap());
    assert!(!db.is_aborted(SUPER_XID).unwrap());
}

#[test]
fn xid_state_survives_a_clean_close_and_reopen() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("t");
    {
        let mut db = Database::create(&base, opts()).unwrap();
        let xid = db.begin().unwrap();
        assert_eq!(xid, 1);
        db.commit(xid).unwrap();
        db.close().unwrap();
    }

    let mut db = Database::open(&base, opts()).unwrap();
    assert!(db.is_committed(1).unwrap());
    db.close().unwrap();
}

#[test]
fn concurrent_begin_assigns_the_full_contiguous_range() {
    let dir = tempdir().unwrap();
    let db = Arc::new(Database::create(dir.path().join("t"), opts()).unwrap());

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let db = db.clone();
            thread::spawn(move || db.begin().unwrap())
        })
        .collect();

    let mut xids: Vec<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    xids.sort_unstable();
    let expected: Vec<i64> = (1..=100).collect();
    assert_eq!(xids, expected);
}

#[test]
fn commit_and_abort_are_independent_per_xid() {
    let dir = tempdir().unwrap();
    let db = Database::create(dir.path().join("t"), opts()).unwrap();
    let x1 = db.begin().unwrap();
    let x2 = db.begin().unwrap();

    db.commit(x1).unwrap();
    db.abort(x2).unwrap();

    assert!(db.is_committed(x1).unwrap());
    assert!(!db.is_aborted(x1).unwrap());
    assert!(db.is_aborted(x2).unwrap());
    assert!(!db.is_committed(x2).unwrap());
}
