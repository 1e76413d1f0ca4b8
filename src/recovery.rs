//! Crash recovery: replays the write-ahead log against the heap file on
//! open after an unclean shutdown.
//!
//! Four passes over the log, in order:
//!   1. Rewind and find the highest page number referenced by any record;
//!      truncate/extend the heap file to exactly that many pages, since
//!      anything beyond it was never actually touched.
//!   2. REDO every insert/update belonging to a transaction that is *not*
//!      active (committed or aborted) — both outcomes already survived,
//!      so their effects must be on disk.
//!   3. UNDO every insert/update belonging to a transaction that is
//!      *still* active — it never committed, so its effects are rolled
//!      back, replayed in reverse order.
//!   4. Mark every still-active transaction aborted.

use std::collections::HashMap;

use crate::error::Result;
use crate::storage::page::PageNo;
use crate::storage::page_cache::PageCache;
use crate::storage::record_store::INVALID;
use crate::tidm::{Tidm, Xid};
use crate::wal::record::{self, LogRecord};
use crate::wal::Wal;

/// Replay `wal` against `pc`, consulting `tidm` for transaction status.
/// Leaves the log positioned at its end and every formerly-active
/// transaction marked aborted.
pub fn recover(pc: &PageCache, wal: &Wal, tidm: &Tidm) -> Result<()> {
    eprintln!("Recovering...");

    let max_pgno = scan_max_pgno(wal)?.max(1);
    eprintln!("Truncate to {max_pgno} pages.");
    pc.truncate_by_pgno(max_pgno)?;

    let mut active: HashMap<Xid, Vec<LogRecord>> = HashMap::new();
    wal.rewind();
    while let Some(payload) = wal.next()? {
        let rec = record::decode(&payload)?;
        let xid = rec.xid();
        if tidm.is_active(xid)? {
            active.entry(xid).or_default().push(rec);
        } else {
            redo(pc, &rec)?;
        }
    }
    eprintln!("Redo Transactions Over.");

    for (xid, records) in active {
        for rec in records.into_iter().rev() {
            undo(pc, &rec)?;
        }
        tidm.abort(xid)?;
    }
    eprintln!("Undo Transactions Over");

    eprintln!("Recovery Over.");
    Ok(())
}

fn scan_max_pgno(wal: &Wal) -> Result<PageNo> {
    let mut max_pgno: PageNo = 0;
    wal.rewind();
    while let Some(payload) = wal.next()? {
        let rec = record::decode(&payload)?;
        max_pgno = max_pgno.max(rec.pgno());
    }
    wal.rewind();
    Ok(max_pgno)
}

fn redo(pc: &PageCache, rec: &LogRecord) -> Result<()> {
    match rec {
        LogRecord::Insert { pgno, offset, raw, .. } => {
            let pin = pc.get_page(*pgno)?;
            pin.recover_write(*offset, raw);
            pin.set_dirty(true);
        }
        LogRecord::Update {
            pgno,
            offset,
            new_raw,
            ..
        } => {
            let pin = pc.get_page(*pgno)?;
            pin.recover_write(*offset, new_raw);
            pin.set_dirty(true);
        }
    }
    Ok(())
}

fn undo(pc: &PageCache, rec: &LogRecord) -> Result<()> {
    match rec {
        LogRecord::Insert { pgno, offset, raw, .. } => {
            let pin = pc.get_page(*pgno)?;
            // Re-apply the full raw frame with its validity byte flipped,
            // not just the leading byte: if the page was never flushed
            // before the crash, the size header and payload on disk are
            // still zeroed and must be reconstructed too.
            let mut invalidated = raw.clone();
            invalidated[0] = INVALID;
            pin.recover_write(*offset, &invalidated);
            pin.set_dirty(true);
        }
        LogRecord::Update {
            pgno,
            offset,
            old_raw,
            ..
        } => {
            let pin = pc.get_page(*pgno)?;
            pin.recover_write(*offset, old_raw);
            pin.set_dirty(true);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::free_space_index::FreeSpaceIndex;
    use crate::storage::page::PAGE_SIZE;
    use crate::storage::record_store::RecordStore;
    use std::sync::Arc;
    use tempfile::tempdir;

    const BUDGET: u64 = 11 * PAGE_SIZE as u64;

    #[test]
    fn redo_replays_committed_inserts_after_a_simulated_crash() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("t");

        let committed_uid;
        {
            let tidm = Tidm::create(&base).unwrap();
            let pc = PageCache::create(&base, BUDGET).unwrap();
            let wal = Arc::new(Wal::create(&base).unwrap());
            let fsi = FreeSpaceIndex::new();
            let rs = RecordStore::new(pc.clone(), wal.clone(), fsi, 0);

            let xid = tidm.begin().unwrap();
            committed_uid = rs.insert(xid, b"durable!!!").unwrap();
            tidm.commit(xid).unwrap();
            // Simulate a crash: the WAL is fsynced but we never call
            // pc.close(), so the page's dirty write is not guaranteed to
            // have made it to the heap file.
            wal.close().unwrap();
            tidm.close().unwrap();
        }

        let tidm = Tidm::open(&base).unwrap();
        let pc = PageCache::open(&base, BUDGET).unwrap();
        let wal = Wal::open(&base).unwrap();
        recover(&pc, &wal, &tidm).unwrap();

        let (pgno, offset) = crate::storage::decode_uid(committed_uid);
        let pin = pc.get_page(pgno).unwrap();
        let raw = pin.read_at(offset as usize, 3 + 10);
        assert_eq!(raw[0], 0);
        assert_eq!(&raw[3..], b"durable!!!");
    }

    #[test]
    fn undo_reverts_inserts_from_a_transaction_that_never_committed() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("t");

        let abandoned_uid;
        let abandoned_xid;
        {
            let tidm = Tidm::create(&base).unwrap();
            let pc = PageCache::create(&base, BUDGET).unwrap();
            let wal = Arc::new(Wal::create(&base).unwrap());
            let fsi = FreeSpaceIndex::new();
            let rs = RecordStore::new(pc.clone(), wal.clone(), fsi, 0);

            abandoned_xid = tidm.begin().unwrap();
            abandoned_uid = rs.insert(abandoned_xid, b"never made it").unwrap();
            // No commit: the transaction is still active when the
            // process goes away.
            wal.close().unwrap();
            tidm.close().unwrap();
        }

        let tidm = Tidm::open(&base).unwrap();
        let pc = PageCache::open(&base, BUDGET).unwrap();
        let wal = Wal::open(&base).unwrap();
        recover(&pc, &wal, &tidm).unwrap();

        assert!(tidm.is_aborted(abandoned_xid).unwrap());

        let (pgno, offset) = crate::storage::decode_uid(abandoned_uid);
        let pin = pc.get_page(pgno).unwrap();
        let raw = pin.read_at(offset as usize, 3 + "never made it".len());
        assert_eq!(raw[0], 1, "insert from an unfinished transaction must be invalidated");
        assert_eq!(
            &raw[3..],
            b"never made it",
            "undo must re-apply the full raw frame, not just the validity byte, so the \
             size header and payload are reconstructed even if the page was never flushed"
        );
    }

    #[test]
    fn recovery_with_an_empty_wal_keeps_the_sentinel_page() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("t");
        {
            let pc = PageCache::create(&base, BUDGET).unwrap();
            let blank = crate::storage::page::Page::new_empty(0).snapshot();
            pc.new_page(&blank).unwrap();
            Wal::create(&base).unwrap().close().unwrap();
        }
        let tidm = Tidm::create(&base).unwrap();
        let pc = PageCache::open(&base, BUDGET).unwrap();
        let wal = Wal::open(&base).unwrap();

        recover(&pc, &wal, &tidm).unwrap();

        assert_eq!(pc.page_count(), 1, "truncation must never drop below page 1");
    }
}
