//! Process-level exclusive file lock guarding a `Database`'s on-disk files.
//!
//! This is additive: GoDB relies on `O_CREATE|O_EXCL` at create time and
//! otherwise assumes single-process access. Taking an advisory lock on
//! `<base>.lock` for the lifetime of the `Database` handle turns that
//! assumption into an enforced one.

use std::fs::{File, OpenOptions};
use std::path::Path;

use fs4::fs_std::FileExt;

use crate::error::{Error, Result};
use crate::pathutil::with_suffix;

pub const LOCK_SUFFIX: &str = "lock";

pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Open (creating if necessary) `<base>.lock` and take an exclusive,
    /// non-blocking advisory lock on it.
    pub fn acquire(base: &Path) -> Result<Self> {
        let path = with_suffix(base, LOCK_SUFFIX);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|e| Error::Lock(format!("{path:?}: {e}")))?;
        Ok(FileLock { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs4::fs_std::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_lock_on_same_base_fails_while_first_is_held() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("t");
        let _first = FileLock::acquire(&base).unwrap();
        assert!(FileLock::acquire(&base).is_err());
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("t");
        {
            let _first = FileLock::acquire(&base).unwrap();
        }
        let _second = FileLock::acquire(&base).unwrap();
    }
}
