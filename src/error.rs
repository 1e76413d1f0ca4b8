use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file already exists")]
    FileExists,

    #[error("file does not exist")]
    FileNotExists,

    #[error("file cannot be opened for read/write")]
    FileUnreadable,

    #[error("bad XID file: {0}")]
    BadXidFile(String),

    #[error("bad log file: {0}")]
    BadLogFile(String),

    #[error("cache is full")]
    CacheFull,

    #[error("memory budget too small: need capacity for at least {min} pages, got {got}")]
    MemTooSmall { min: usize, got: usize },

    #[error("data too large to fit in an empty page")]
    DataTooLarge,

    #[error("database is busy")]
    DatabaseBusy,

    #[error("failed to acquire database file lock: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, Error>;
