//! murocore: paged heap storage, write-ahead logging and crash recovery for
//! a teaching-grade relational database backend.
//!
//! This crate is the data-management core consumed by the higher layers of
//! a database (MVCC, B+trees, SQL, wire protocol): transaction id lifecycle
//! (`tidm`), a bounded reference-counted page cache over a fixed-size-page
//! heap file (`storage::page_cache`), sub-page record placement with
//! before/after-image capture (`storage::record_store`), a checksummed
//! append-only write-ahead log (`wal`), REDO/UNDO crash recovery
//! (`recovery`), and a free-space index for allocation (`storage::
//! free_space_index`). [`Database`] wires all of these into a single
//! `create`/`open`/`close` handle.

pub mod cache;
pub mod concurrency;
pub mod error;
pub mod pathutil;
pub mod recovery;
pub mod storage;
pub mod tidm;
pub mod wal;

use std::path::Path;
use std::sync::Arc;

use rand::RngCore;

use crate::concurrency::FileLock;
use crate::error::Result;
use crate::storage::free_space_index::FreeSpaceIndex;
use crate::storage::page::{Page, MARK_LEN, SENTINEL_PAGE_NO};
use crate::storage::page_cache::PageCache;
use crate::storage::record_store::{RecordHandle, RecordStore};
use crate::storage::Uid;
use crate::tidm::{Tidm, Xid};
use crate::wal::Wal;

/// Configuration accepted by [`Database::create`] and [`Database::open`].
///
/// `memory_budget` is the total buffer-pool budget in bytes; it is divided
/// by [`storage::page::PAGE_SIZE`] to get the page cache's capacity, which
/// must be at least [`storage::page_cache::MEM_MIN_LIM`] pages.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub memory_budget: u64,
}

/// Top-level database handle: bundles the transaction id manager, the page
/// cache, the write-ahead log and the record store behind one
/// `create`/`open`/`close` lifecycle.
pub struct Database {
    lock: FileLock,
    tidm: Tidm,
    pc: PageCache,
    wal: Arc<Wal>,
    rs: RecordStore,
}

fn random_mark() -> [u8; MARK_LEN] {
    let mut mark = [0u8; MARK_LEN];
    rand::thread_rng().fill_bytes(&mut mark);
    mark
}

impl Database {
    /// Create a new database at `base` (`<base>.db`, `<base>.log`,
    /// `<base>.xid`). Fails if any of those files already exist.
    pub fn create<P: AsRef<Path>>(base: P, opts: Options) -> Result<Self> {
        let base = base.as_ref();
        let lock = FileLock::acquire(base)?;
        let tidm = Tidm::create(base)?;
        let pc = PageCache::create(base, opts.memory_budget)?;
        let wal = Arc::new(Wal::create(base)?);

        let blank = Page::new_empty(0).snapshot();
        let sentinel_pgno = pc.new_page(&blank)?;
        debug_assert_eq!(sentinel_pgno, SENTINEL_PAGE_NO);
        {
            let sentinel = pc.get_page(SENTINEL_PAGE_NO)?;
            sentinel.set_open_mark(&random_mark());
            sentinel.set_dirty(true);
            pc.flush_page(sentinel.page_ref())?;
            sentinel.set_dirty(false);
        }

        let fsi = FreeSpaceIndex::new();
        let rs = RecordStore::new(pc.clone(), wal.clone(), fsi, 0);

        Ok(Database { lock, tidm, pc, wal, rs })
    }

    /// Open an existing database at `base`. Runs crash recovery if the
    /// sentinel page's open-mark and close-mark disagree, i.e. the prior
    /// process did not reach a clean [`Database::close`].
    pub fn open<P: AsRef<Path>>(base: P, opts: Options) -> Result<Self> {
        let base = base.as_ref();
        let lock = FileLock::acquire(base)?;
        let tidm = Tidm::open(base)?;
        let pc = PageCache::open(base, opts.memory_budget)?;
        let wal = Wal::open(base)?;

        {
            let sentinel = pc.get_page(SENTINEL_PAGE_NO)?;
            let clean = sentinel.open_mark() == sentinel.close_mark();
            if !clean {
                recovery::recover(&pc, &wal, &tidm)?;
            }
            sentinel.set_open_mark(&random_mark());
            sentinel.set_dirty(true);
            pc.flush_page(sentinel.page_ref())?;
            sentinel.set_dirty(false);
        }

        let fsi = FreeSpaceIndex::new();
        fsi.fill(&pc)?;

        let wal = Arc::new(wal);
        let rs = RecordStore::new(pc.clone(), wal.clone(), fsi, 0);

        Ok(Database { lock, tidm, pc, wal, rs })
    }

    /// Begin a new transaction.
    pub fn begin(&self) -> Result<Xid> {
        self.tidm.begin()
    }

    pub fn commit(&self, xid: Xid) -> Result<()> {
        self.tidm.commit(xid)
    }

    pub fn abort(&self, xid: Xid) -> Result<()> {
        self.tidm.abort(xid)
    }

    pub fn is_active(&self, xid: Xid) -> Result<bool> {
        self.tidm.is_active(xid)
    }

    pub fn is_committed(&self, xid: Xid) -> Result<bool> {
        self.tidm.is_committed(xid)
    }

    pub fn is_aborted(&self, xid: Xid) -> Result<bool> {
        self.tidm.is_aborted(xid)
    }

    /// Insert `data` as a new record under `xid`, returning its uid.
    pub fn insert(&self, xid: Xid, data: &[u8]) -> Result<Uid> {
        self.rs.insert(xid, data)
    }

    /// Fetch a record handle for `uid`, or `None` if it has been deleted.
    pub fn read(&self, uid: Uid) -> Result<Option<RecordHandle>> {
        self.rs.read(uid)
    }

    /// Direct access to the transaction id manager, for callers that need
    /// the full TIDM surface.
    pub fn tidm(&self) -> &Tidm {
        &self.tidm
    }

    /// Direct access to the record store.
    pub fn record_store(&self) -> &RecordStore {
        &self.rs
    }

    /// Direct access to the page cache.
    pub fn page_cache(&self) -> &PageCache {
        &self.pc
    }

    /// Flush all dirty pages, stamp the sentinel page's close-mark to match
    /// its open-mark (recording a clean shutdown), and release the
    /// file handles. A `Database` that is dropped without calling `close`
    /// looks unclean on the next `open` and triggers recovery.
    pub fn close(&mut self) -> Result<()> {
        {
            let sentinel = self.pc.get_page(SENTINEL_PAGE_NO)?;
            let mark = sentinel.open_mark();
            sentinel.set_close_mark(&mark);
            sentinel.set_dirty(true);
            self.pc.flush_page(sentinel.page_ref())?;
            sentinel.set_dirty(false);
        }
        self.pc.close()?;
        self.wal.close()?;
        self.tidm.close()?;
        Ok(())
    }
}
