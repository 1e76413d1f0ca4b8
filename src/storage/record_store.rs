//! Record store: framed records placed inside heap pages, addressed by
//! `uid`. Layers the free-space index and the write-ahead log on top of
//! the page cache to give `Insert`/`Read`/`Update` their durability and
//! crash-recovery guarantees.
//!
//! A record's on-disk frame is `[valid:1][size:2 BE][payload:size]`. The
//! valid byte is `0` for a live record and `1` once it has been deleted;
//! `Read` treats an invalid record as not found.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::cache::ResourceCache;
use crate::error::{Error, Result};
use crate::tidm::Xid;
use crate::wal::{record, Wal};

use super::free_space_index::FreeSpaceIndex;
use super::page::{Page, PageNo, HEADER_SIZE, PAGE_SIZE};
use super::page_cache::{PageCache, PagePin};
use super::{decode_uid, encode_uid, Uid};

pub(crate) const VALID: u8 = 0;
pub(crate) const INVALID: u8 = 1;
const RECORD_HEADER_LEN: usize = 3; // valid:1 + size:2
const MAX_RETRIES: u32 = 5;

struct RsInner {
    pc: PageCache,
    wal: Arc<Wal>,
    fsi: FreeSpaceIndex,
    cache: ResourceCache<Uid, Arc<RecordInner>>,
}

/// Cheaply cloneable handle onto the record store; clones share the same
/// underlying cache and free-space index.
#[derive(Clone)]
pub struct RecordStore {
    inner: Arc<RsInner>,
}

struct RecordInner {
    offset: u32,
    // Kept alive for as long as the record stays in the cache, so the
    // page it lives on cannot be evicted out from under it. Dropped (and
    // so released) only when the record cache's own refcount hits zero.
    pin: PagePin,
    raw: Mutex<Vec<u8>>,
    lock: RecordLock,
}

impl RecordInner {
    fn pgno(&self) -> PageNo {
        self.pin.pgno()
    }

    fn uid(&self) -> Uid {
        encode_uid(self.pgno(), self.offset)
    }
}

/// Readers-writer gate for a single record's `raw` buffer: any number of
/// concurrent readers, or exactly one writer, never both. A mutation spans
/// several calls (`before` ... `set_data` ... `after`/`unbefore`), which a
/// borrowed `parking_lot::RwLock` guard can't outlive, so the gate tracks
/// its state explicitly behind a plain `Mutex` instead.
struct RecordLock {
    state: Mutex<LockState>,
    unblocked: Condvar,
}

enum LockState {
    Idle,
    Reading(u32),
    Writing,
}

impl RecordLock {
    fn new() -> Self {
        RecordLock {
            state: Mutex::new(LockState::Idle),
            unblocked: Condvar::new(),
        }
    }

    /// Block while a writer is in flight, then register as a reader.
    fn acquire_read(&self) {
        let mut state = self.state.lock();
        loop {
            match *state {
                LockState::Writing => self.unblocked.wait(&mut state),
                LockState::Idle => {
                    *state = LockState::Reading(1);
                    return;
                }
                LockState::Reading(n) => {
                    *state = LockState::Reading(n + 1);
                    return;
                }
            }
        }
    }

    fn release_read(&self) {
        let mut state = self.state.lock();
        match *state {
            LockState::Reading(1) => {
                *state = LockState::Idle;
                self.unblocked.notify_all();
            }
            LockState::Reading(n) => *state = LockState::Reading(n - 1),
            _ => unreachable!("release_read called without a held read permit"),
        }
    }

    /// Block until no readers and no other writer are active, then take
    /// exclusive ownership. Released only by `release_write`.
    fn acquire_write(&self) {
        let mut state = self.state.lock();
        loop {
            match *state {
                LockState::Idle => {
                    *state = LockState::Writing;
                    return;
                }
                LockState::Reading(_) | LockState::Writing => self.unblocked.wait(&mut state),
            }
        }
    }

    fn release_write(&self) {
        let mut state = self.state.lock();
        *state = LockState::Idle;
        self.unblocked.notify_all();
    }
}

impl RecordStore {
    /// Wrap an already-open page cache, WAL and free-space index.
    /// `record_cache_capacity == 0` means unbounded.
    pub fn new(pc: PageCache, wal: Arc<Wal>, fsi: FreeSpaceIndex, record_cache_capacity: usize) -> Self {
        let loader_pc = pc.clone();
        let cache = ResourceCache::new(
            record_cache_capacity,
            move |uid: &Uid| -> Result<Arc<RecordInner>> {
                let (pgno, offset) = decode_uid(*uid);
                let pin = loader_pc.get_page(pgno)?;
                let header = pin.read_at(offset as usize, RECORD_HEADER_LEN);
                let size = u16::from_be_bytes([header[1], header[2]]) as usize;
                let raw = pin.read_at(offset as usize, RECORD_HEADER_LEN + size);
                Ok(Arc::new(RecordInner {
                    offset,
                    pin,
                    raw: Mutex::new(raw),
                    lock: RecordLock::new(),
                }))
            },
            |_uid: &Uid, _inner: &Arc<RecordInner>| Ok(()),
        );
        RecordStore {
            inner: Arc::new(RsInner { pc, wal, fsi, cache }),
        }
    }

    /// Insert `data` under `xid`, returning its uid. Retries against the
    /// free-space index up to `MAX_RETRIES` times, allocating a fresh page
    /// on each miss, before giving up with `DatabaseBusy`.
    pub fn insert(&self, xid: Xid, data: &[u8]) -> Result<Uid> {
        let framed_len = RECORD_HEADER_LEN + data.len();
        if framed_len > PAGE_SIZE - HEADER_SIZE {
            return Err(Error::DataTooLarge);
        }

        let mut chosen = None;
        for _ in 0..MAX_RETRIES {
            if let Some(pi) = self.inner.fsi.select(framed_len) {
                chosen = Some(pi);
                break;
            }
            let blank = Page::new_empty(0).snapshot();
            let new_pgno = self.inner.pc.new_page(&blank)?;
            self.inner.fsi.add(new_pgno, PAGE_SIZE - HEADER_SIZE);
        }
        let pi = chosen.ok_or(Error::DatabaseBusy)?;

        let pin = self.inner.pc.get_page(pi.pgno)?;
        // Whatever happens below, the page goes back into the index with
        // its current free space so other inserters can still reach it.
        let _reinsert = ReinsertGuard {
            fsi: &self.inner.fsi,
            pgno: pi.pgno,
            pin: &pin,
        };

        let mut framed = Vec::with_capacity(framed_len);
        framed.push(VALID);
        framed.extend_from_slice(&(data.len() as u16).to_be_bytes());
        framed.extend_from_slice(data);

        let offset = pin.fso() as u32;
        let log = record::encode_insert(xid, pi.pgno, offset, &framed);
        self.inner.wal.log(&log)?;

        let written_offset = pin.append(&framed);
        debug_assert_eq!(written_offset, offset);
        pin.set_dirty(true);

        Ok(encode_uid(pi.pgno, offset))
    }

    /// Fetch a record handle for `uid`, or `None` if it has been deleted.
    pub fn read(&self, uid: Uid) -> Result<Option<RecordHandle>> {
        let inner = self.inner.cache.get(uid)?;
        inner.lock.acquire_read();
        let valid = inner.raw.lock()[0] == VALID;
        inner.lock.release_read();
        if !valid {
            self.inner.cache.release(&uid)?;
            return Ok(None);
        }
        Ok(Some(RecordHandle {
            uid,
            inner,
            store: self.clone(),
        }))
    }
}

struct ReinsertGuard<'a> {
    fsi: &'a FreeSpaceIndex,
    pgno: PageNo,
    pin: &'a PagePin,
}

impl Drop for ReinsertGuard<'_> {
    fn drop(&mut self) {
        self.fsi.add(self.pgno, self.pin.free_space());
    }
}

/// An owned handle onto a live record. Releases its reference on the
/// record cache (and, transitively, the underlying page's pin) when
/// dropped.
pub struct RecordHandle {
    uid: Uid,
    inner: Arc<RecordInner>,
    store: RecordStore,
}

impl RecordHandle {
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// The record's current payload, excluding the valid/size header.
    /// Excludes any mutation still in flight under a `BeforeGuard`: this
    /// blocks until the writer calls `after`/`unbefore`, so the bytes
    /// returned are always either the old or the new image, never a
    /// half-applied one.
    pub fn data(&self) -> Vec<u8> {
        self.inner.lock.acquire_read();
        let data = self.inner.raw.lock()[RECORD_HEADER_LEN..].to_vec();
        self.inner.lock.release_read();
        data
    }

    /// Mark the record deleted in place and forget it. The byte flip is
    /// not itself logged here; callers that need crash-safe deletes wrap
    /// this in the same before/after protocol as `Update`.
    pub fn invalidate(&self) {
        self.inner.lock.acquire_write();
        self.inner.raw.lock()[0] = INVALID;
        self.inner.lock.release_write();
    }

    /// Begin a mutation: take the record's exclusive lock, mark its page
    /// dirty, and snapshot the current bytes as the before-image. Blocks
    /// until every in-flight reader has finished and any other mutation
    /// in flight on this record has resolved.
    pub fn before(&self) -> BeforeGuard {
        self.inner.lock.acquire_write();

        self.inner.pin.set_dirty(true);
        let old_raw = self.inner.raw.lock().clone();
        BeforeGuard {
            inner: self.inner.clone(),
            old_raw,
            store: self.store.clone(),
        }
    }
}

impl Drop for RecordHandle {
    fn drop(&mut self) {
        let _ = self.store.inner.cache.release(&self.uid);
    }
}

/// A mutation in flight on a record. Must be resolved by calling either
/// `after` (commit the new bytes, writing an update log record) or
/// `unbefore` (discard the mutation and restore the before-image).
pub struct BeforeGuard {
    inner: Arc<RecordInner>,
    old_raw: Vec<u8>,
    store: RecordStore,
}

impl BeforeGuard {
    pub fn data(&self) -> Vec<u8> {
        self.inner.raw.lock()[RECORD_HEADER_LEN..].to_vec()
    }

    /// Replace the record's payload. The new payload must be the same
    /// length as the old one: records never change size in place.
    pub fn set_data(&mut self, payload: &[u8]) {
        let mut raw = self.inner.raw.lock();
        let current_len = raw.len() - RECORD_HEADER_LEN;
        assert_eq!(
            payload.len(),
            current_len,
            "update payload must match the record's existing length"
        );
        raw[RECORD_HEADER_LEN..].copy_from_slice(payload);
    }

    /// Commit the mutation under `xid`: write an update log record, flush
    /// the new bytes through to the page, and release the record's lock.
    pub fn after(self, xid: Xid) -> Result<()> {
        let new_raw = self.inner.raw.lock().clone();
        let log = record::encode_update(xid, self.inner.uid(), &self.old_raw, &new_raw);
        self.store.inner.wal.log(&log)?;

        self.inner.pin.write_at(self.inner.offset as usize, &new_raw);
        self.inner.pin.set_dirty(true);

        self.inner.lock.release_write();
        Ok(())
    }

    /// Abandon the mutation, restoring the pre-`before` bytes and
    /// releasing the record's lock without logging anything.
    pub fn unbefore(self) {
        *self.inner.raw.lock() = self.old_raw;
        self.inner.lock.release_write();
    }
}
