//! Fixed-size heap page.
//!
//! Layout:
//!   [FSO (2 bytes, big-endian)] [page body ...]
//!
//! `FSO` (free-space offset) is the first byte position not yet allocated;
//! bytes `[FSO, PAGE_SIZE)` are free. Page 1 is the sentinel page: it
//! additionally carries an open-mark and a close-mark at fixed offsets
//! within its body, used to detect an unclean shutdown (see
//! `murocore::recovery`). Mutation is guarded by `data`'s own mutex so a
//! reader never observes a torn write; pin/unpin bookkeeping lives in the
//! owning cache, not on the page itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

pub const PAGE_SIZE: usize = 8192;
pub type PageNo = i64;

pub const HEADER_SIZE: usize = 2;

/// Sentinel page (page 1) open/close mark offsets, in the body following
/// the FSO header.
pub const SENTINEL_PAGE_NO: PageNo = 1;
pub const MARK_LEN: usize = 8;
pub const OPEN_MARK_OFFSET: usize = HEADER_SIZE;
pub const CLOSE_MARK_OFFSET: usize = OPEN_MARK_OFFSET + MARK_LEN;

pub struct Page {
    pgno: PageNo,
    data: Mutex<Box<[u8]>>,
    dirty: AtomicBool,
}

pub type PageRef = Arc<Page>;

impl Page {
    /// A freshly allocated, all-zero page with FSO set just past the header.
    pub fn new_empty(pgno: PageNo) -> PageRef {
        let mut buf = vec![0u8; PAGE_SIZE].into_boxed_slice();
        buf[0..HEADER_SIZE].copy_from_slice(&(HEADER_SIZE as u16).to_be_bytes());
        Arc::new(Page {
            pgno,
            data: Mutex::new(buf),
            dirty: AtomicBool::new(false),
        })
    }

    /// Wrap raw bytes read back from disk. `raw` must be exactly
    /// `PAGE_SIZE` bytes.
    pub fn from_raw(pgno: PageNo, raw: Vec<u8>) -> PageRef {
        debug_assert_eq!(raw.len(), PAGE_SIZE);
        Arc::new(Page {
            pgno,
            data: Mutex::new(raw.into_boxed_slice()),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn pgno(&self) -> PageNo {
        self.pgno
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::SeqCst);
    }

    pub fn fso(&self) -> u16 {
        let guard = self.data.lock();
        u16::from_be_bytes(guard[0..HEADER_SIZE].try_into().unwrap())
    }

    pub fn set_fso(&self, fso: u16) {
        let mut guard = self.data.lock();
        guard[0..HEADER_SIZE].copy_from_slice(&fso.to_be_bytes());
    }

    pub fn free_space(&self) -> usize {
        PAGE_SIZE - self.fso() as usize
    }

    /// Entire page image, suitable for writing back to disk.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().to_vec()
    }

    pub fn read_at(&self, offset: usize, len: usize) -> Vec<u8> {
        let guard = self.data.lock();
        guard[offset..offset + len].to_vec()
    }

    pub fn write_at(&self, offset: usize, bytes: &[u8]) {
        let mut guard = self.data.lock();
        guard[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Append `framed` at the current FSO, advance FSO by its length, and
    /// return the offset it was written at.
    pub fn append(&self, framed: &[u8]) -> u32 {
        let mut guard = self.data.lock();
        let fso = u16::from_be_bytes(guard[0..HEADER_SIZE].try_into().unwrap());
        let offset = fso as usize;
        guard[offset..offset + framed.len()].copy_from_slice(framed);
        let new_fso = offset + framed.len();
        guard[0..HEADER_SIZE].copy_from_slice(&(new_fso as u16).to_be_bytes());
        offset as u32
    }

    /// Write `raw` at a fixed offset during recovery, bypassing normal
    /// allocation. Advances FSO if the write extends past it.
    pub fn recover_write(&self, offset: u32, raw: &[u8]) {
        let mut guard = self.data.lock();
        let offset = offset as usize;
        guard[offset..offset + raw.len()].copy_from_slice(raw);
        let fso = u16::from_be_bytes(guard[0..HEADER_SIZE].try_into().unwrap());
        let end = (offset + raw.len()) as u16;
        if end > fso {
            guard[0..HEADER_SIZE].copy_from_slice(&end.to_be_bytes());
        }
    }

    pub fn open_mark(&self) -> [u8; MARK_LEN] {
        let guard = self.data.lock();
        guard[OPEN_MARK_OFFSET..OPEN_MARK_OFFSET + MARK_LEN]
            .try_into()
            .unwrap()
    }

    pub fn close_mark(&self) -> [u8; MARK_LEN] {
        let guard = self.data.lock();
        guard[CLOSE_MARK_OFFSET..CLOSE_MARK_OFFSET + MARK_LEN]
            .try_into()
            .unwrap()
    }

    pub fn set_open_mark(&self, mark: &[u8; MARK_LEN]) {
        let mut guard = self.data.lock();
        guard[OPEN_MARK_OFFSET..OPEN_MARK_OFFSET + MARK_LEN].copy_from_slice(mark);
    }

    pub fn set_close_mark(&self, mark: &[u8; MARK_LEN]) {
        let mut guard = self.data.lock();
        guard[CLOSE_MARK_OFFSET..CLOSE_MARK_OFFSET + MARK_LEN].copy_from_slice(mark);
    }
}
