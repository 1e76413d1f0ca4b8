//! Shared helper for deriving the `<base>.db` / `.log` / `.xid` file paths
//! from a single user-supplied base path.

use std::path::{Path, PathBuf};

pub fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut s = base.as_os_str().to_owned();
    s.push(".");
    s.push(suffix);
    PathBuf::from(s)
}
