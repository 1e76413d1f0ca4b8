//! Transaction ID Manager: a flat `.xid` file tracking the status of every
//! transaction ever begun.
//!
//! Layout: an 8-byte little-endian counter header followed by one status
//! byte per transaction, indexed from xid 1. xid 0 is the super transaction
//! and is always committed without occupying a slot.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::pathutil::with_suffix;

pub const XID_SUFFIX: &str = "xid";

const LEN_XID_HEADER: u64 = 8;
const XID_FIELD_SIZE: u64 = 1;

const TRAN_ACTIVE: u8 = 0;
const TRAN_COMMITTED: u8 = 1;
const TRAN_ABORTED: u8 = 2;

/// Transaction identifier. `SUPER_XID` (0) is always committed and never
/// occupies a slot in the file.
pub type Xid = i64;

pub const SUPER_XID: Xid = 0;

pub struct Tidm {
    file: File,
    path: PathBuf,
    counter: Mutex<Xid>,
}

impl Tidm {
    pub fn create<P: AsRef<Path>>(base: P) -> Result<Self> {
        let path = with_suffix(base.as_ref(), XID_SUFFIX);
        if path.exists() {
            return Err(Error::FileExists);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all_at(&[0u8; LEN_XID_HEADER as usize], 0)?;
        file.sync_all()?;
        Ok(Tidm {
            file,
            path,
            counter: Mutex::new(0),
        })
    }

    pub fn open<P: AsRef<Path>>(base: P) -> Result<Self> {
        let path = with_suffix(base.as_ref(), XID_SUFFIX);
        if !path.exists() {
            return Err(Error::FileNotExists);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => Error::FileUnreadable,
                _ => Error::Io(e),
            })?;
        let counter = Self::check_xid_counter(&file)?;
        Ok(Tidm {
            file,
            path,
            counter: Mutex::new(counter),
        })
    }

    fn check_xid_counter(file: &File) -> Result<Xid> {
        let len = file.metadata()?.len();
        if len < LEN_XID_HEADER {
            return Err(Error::BadXidFile("missing header".into()));
        }
        let mut header = [0u8; 8];
        file.read_exact_at(&mut header, 0)?;
        let counter = i64::from_le_bytes(header);
        let expected = LEN_XID_HEADER + (counter.max(0) as u64) * XID_FIELD_SIZE;
        if len != expected {
            return Err(Error::BadXidFile(format!(
                "expected length {expected}, found {len}"
            )));
        }
        Ok(counter)
    }

    fn xid_position(xid: Xid) -> u64 {
        LEN_XID_HEADER + (xid as u64 - 1) * XID_FIELD_SIZE
    }

    fn update_xid(&self, xid: Xid, status: u8) -> Result<()> {
        let offset = Self::xid_position(xid);
        self.file.write_all_at(&[status], offset)?;
        self.file.sync_all()?;
        Ok(())
    }

    fn incr_counter(&self, counter: &mut Xid) -> Result<()> {
        *counter += 1;
        self.file.write_all_at(&counter.to_le_bytes(), 0)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Begin a new transaction, returning its xid.
    pub fn begin(&self) -> Result<Xid> {
        let mut counter = self.counter.lock();
        let new_xid = *counter + 1;
        self.update_xid(new_xid, TRAN_ACTIVE)?;
        self.incr_counter(&mut counter)?;
        Ok(new_xid)
    }

    pub fn commit(&self, xid: Xid) -> Result<()> {
        if xid == SUPER_XID {
            return Ok(());
        }
        self.update_xid(xid, TRAN_COMMITTED)
    }

    pub fn abort(&self, xid: Xid) -> Result<()> {
        if xid == SUPER_XID {
            return Ok(());
        }
        self.update_xid(xid, TRAN_ABORTED)
    }

    fn check_xid(&self, xid: Xid, status: u8) -> Result<bool> {
        let offset = Self::xid_position(xid);
        let mut buf = [0u8; 1];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf[0] == status)
    }

    pub fn is_active(&self, xid: Xid) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(false);
        }
        self.check_xid(xid, TRAN_ACTIVE)
    }

    pub fn is_committed(&self, xid: Xid) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(true);
        }
        self.check_xid(xid, TRAN_COMMITTED)
    }

    pub fn is_aborted(&self, xid: Xid) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(false);
        }
        self.check_xid(xid, TRAN_ABORTED)
    }

    /// Highest xid ever begun.
    pub fn max_xid(&self) -> Xid {
        *self.counter.lock()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn super_xid_is_always_committed_and_never_active_or_aborted() {
        let dir = tempdir().unwrap();
        let tidm = Tidm::create(dir.path().join("t")).unwrap();
        assert!(tidm.is_committed(SUPER_XID).unwrap());
        assert!(!tidm.is_active(SUPER_XID).unwrap());
        assert!(!tidm.is_aborted(SUPER_XID).unwrap());
    }

    #[test]
    fn begin_commit_abort_round_trip_and_persistence() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("t");
        {
            let tidm = Tidm::create(&base).unwrap();
            let x1 = tidm.begin().unwrap();
            let x2 = tidm.begin().unwrap();
            tidm.commit(x1).unwrap();
            tidm.abort(x2).unwrap();
            assert!(tidm.is_committed(x1).unwrap());
            assert!(tidm.is_aborted(x2).unwrap());
            tidm.close().unwrap();
        }
        let reopened = Tidm::open(&base).unwrap();
        assert!(reopened.is_committed(1).unwrap());
        assert!(reopened.is_aborted(2).unwrap());
        assert_eq!(reopened.max_xid(), 2);
    }

    #[test]
    fn create_twice_fails_with_file_exists() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("t");
        Tidm::create(&base).unwrap();
        match Tidm::create(&base) {
            Err(Error::FileExists) => {}
            other => panic!("expected FileExists, got {other:?}"),
        }
    }

    #[test]
    fn open_missing_fails_with_file_not_exists() {
        let dir = tempdir().unwrap();
        match Tidm::open(dir.path().join("missing")) {
            Err(Error::FileNotExists) => {}
            other => panic!("expected FileNotExists, got {other:?}"),
        }
    }

    #[test]
    fn concurrent_begin_assigns_distinct_xids() {
        let dir = tempdir().unwrap();
        let tidm = Arc::new(Tidm::create(dir.path().join("t")).unwrap());
        let mut handles = Vec::new();
        for _ in 0..100 {
            let t = tidm.clone();
            handles.push(std::thread::spawn(move || t.begin().unwrap()));
        }
        let mut xids: Vec<Xid> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        xids.sort_unstable();
        xids.dedup();
        assert_eq!(xids.len(), 100);
        assert_eq!(tidm.max_xid(), 100);
    }
}
