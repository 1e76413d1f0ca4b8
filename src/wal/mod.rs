//! Write-ahead log: an append-only framed file with a rolling checksum
//! header and torn-tail detection at open.
//!
//! File layout: `[rolling_checksum:4 BE][frame]*` where each frame is
//! `[size:4 BE][checksum:4 BE][payload:size]`. `checksum` is
//! `fold(0, payload)`; the header's rolling checksum is the fold of every
//! frame's `checksum` value, in order, from the start of the file.

pub mod record;

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::pathutil::with_suffix;

pub const LOG_SUFFIX: &str = "log";
const HEADER_LEN: u64 = 4;
const FRAME_PREFIX_LEN: u64 = 8; // size:4 + checksum:4
const SEED: u32 = 13331;

fn fold(mut acc: u32, bytes: &[u8]) -> u32 {
    for &b in bytes {
        acc = acc.wrapping_mul(SEED).wrapping_add(b as u32);
    }
    acc
}

struct State {
    position: u64,
    file_len: u64,
    rolling: u32,
}

pub struct Wal {
    file: File,
    state: Mutex<State>,
}

impl Wal {
    pub fn create<P: AsRef<Path>>(base: P) -> Result<Self> {
        let path = with_suffix(base.as_ref(), LOG_SUFFIX);
        if path.exists() {
            return Err(Error::FileExists);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all_at(&0u32.to_be_bytes(), 0)?;
        file.sync_all()?;
        Ok(Wal {
            file,
            state: Mutex::new(State {
                position: HEADER_LEN,
                file_len: HEADER_LEN,
                rolling: 0,
            }),
        })
    }

    pub fn open<P: AsRef<Path>>(base: P) -> Result<Self> {
        let path = with_suffix(base.as_ref(), LOG_SUFFIX);
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
        let file_len = file.metadata()?.len();
        if file_len < HEADER_LEN {
            return Err(Error::BadLogFile("missing checksum header".into()));
        }
        let mut header = [0u8; 4];
        file.read_exact_at(&mut header, 0)?;
        let stored_checksum = u32::from_be_bytes(header);

        let (scanned_to, rolling) = Self::scan(&file, file_len)?;

        if scanned_to == file_len {
            if rolling != stored_checksum {
                return Err(Error::BadLogFile(
                    "rolling checksum does not match header".into(),
                ));
            }
        } else {
            file.set_len(scanned_to)?;
            file.write_all_at(&rolling.to_be_bytes(), 0)?;
            file.sync_all()?;
        }

        Ok(Wal {
            file,
            state: Mutex::new(State {
                position: HEADER_LEN,
                file_len: scanned_to,
                rolling,
            }),
        })
    }

    /// Scan every well-formed frame from the start of the log, returning
    /// the byte offset just past the last valid frame and the rolling
    /// checksum accumulated over them.
    fn scan(file: &File, file_len: u64) -> Result<(u64, u32)> {
        let mut position = HEADER_LEN;
        let mut rolling = 0u32;
        loop {
            if position + FRAME_PREFIX_LEN > file_len {
                break;
            }
            let mut prefix = [0u8; 8];
            file.read_exact_at(&mut prefix, position)?;
            let size = u32::from_be_bytes(prefix[0..4].try_into().unwrap()) as u64;
            let checksum = u32::from_be_bytes(prefix[4..8].try_into().unwrap());
            if position + FRAME_PREFIX_LEN + size > file_len {
                break;
            }
            let mut payload = vec![0u8; size as usize];
            file.read_exact_at(&mut payload, position + FRAME_PREFIX_LEN)?;
            if fold(0, &payload) != checksum {
                break;
            }
            rolling = fold(rolling, &checksum.to_be_bytes());
            position += FRAME_PREFIX_LEN + size;
        }
        Ok((position, rolling))
    }

    /// Append a framed payload, updating and fsyncing the rolling checksum
    /// header.
    pub fn log(&self, payload: &[u8]) -> Result<()> {
        let checksum = fold(0, payload);
        let mut frame = Vec::with_capacity(FRAME_PREFIX_LEN as usize + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&checksum.to_be_bytes());
        frame.extend_from_slice(payload);

        let mut state = self.state.lock();
        let offset = state.file_len;
        self.file.write_all_at(&frame, offset)?;
        state.file_len += frame.len() as u64;
        state.rolling = fold(state.rolling, &checksum.to_be_bytes());
        self.file.write_all_at(&state.rolling.to_be_bytes(), 0)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Position the read cursor just past the checksum header.
    pub fn rewind(&self) {
        self.state.lock().position = HEADER_LEN;
    }

    /// Read the next frame's payload, advancing the cursor. Returns `None`
    /// at a clean EOF, a short frame, or a checksum mismatch.
    pub fn next(&self) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        if state.position + FRAME_PREFIX_LEN > state.file_len {
            return Ok(None);
        }
        let mut prefix = [0u8; 8];
        self.file.read_exact_at(&mut prefix, state.position)?;
        let size = u32::from_be_bytes(prefix[0..4].try_into().unwrap()) as u64;
        let checksum = u32::from_be_bytes(prefix[4..8].try_into().unwrap());
        if state.position + FRAME_PREFIX_LEN + size > state.file_len {
            return Ok(None);
        }
        let mut payload = vec![0u8; size as usize];
        self.file
            .read_exact_at(&mut payload, state.position + FRAME_PREFIX_LEN)?;
        if fold(0, &payload) != checksum {
            return Ok(None);
        }
        state.position += FRAME_PREFIX_LEN + size;
        Ok(Some(payload))
    }

    /// Shrink the file to `offset` bytes.
    pub fn truncate(&self, offset: u64) -> Result<()> {
        let mut state = self.state.lock();
        self.file.set_len(offset)?;
        state.file_len = offset;
        if state.position > offset {
            state.position = offset;
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
