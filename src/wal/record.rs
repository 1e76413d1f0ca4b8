//! Encoding and decoding of write-ahead log payloads.
//!
//! Two payload kinds, distinguished by their first byte:
//!   Insert: `[type=0:1][xid:8][page_no:4][offset:2][record_raw:variable]`
//!   Update: `[type=1:1][xid:8][uid:8][old_raw:L][new_raw:L]`

use crate::error::{Error, Result};
use crate::storage::page::PageNo;
use crate::storage::{decode_uid, encode_uid, Uid};
use crate::tidm::Xid;

pub const LOG_TYPE_INSERT: u8 = 0;
pub const LOG_TYPE_UPDATE: u8 = 1;

const OF_TYPE: usize = 0;
const OF_XID: usize = OF_TYPE + 1;

const OF_INSERT_PGNO: usize = OF_XID + 8;
const OF_INSERT_OFFSET: usize = OF_INSERT_PGNO + 4;
const OF_INSERT_RAW: usize = OF_INSERT_OFFSET + 2;

const OF_UPDATE_UID: usize = OF_XID + 8;
const OF_UPDATE_RAW: usize = OF_UPDATE_UID + 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Insert {
        xid: Xid,
        pgno: PageNo,
        offset: u32,
        raw: Vec<u8>,
    },
    Update {
        xid: Xid,
        pgno: PageNo,
        offset: u32,
        old_raw: Vec<u8>,
        new_raw: Vec<u8>,
    },
}

impl LogRecord {
    pub fn xid(&self) -> Xid {
        match self {
            LogRecord::Insert { xid, .. } => *xid,
            LogRecord::Update { xid, .. } => *xid,
        }
    }

    pub fn pgno(&self) -> PageNo {
        match self {
            LogRecord::Insert { pgno, .. } => *pgno,
            LogRecord::Update { pgno, .. } => *pgno,
        }
    }
}

pub fn encode_insert(xid: Xid, pgno: PageNo, offset: u32, raw: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(OF_INSERT_RAW + raw.len());
    buf.push(LOG_TYPE_INSERT);
    buf.extend_from_slice(&xid.to_be_bytes());
    buf.extend_from_slice(&(pgno as u32).to_be_bytes());
    buf.extend_from_slice(&(offset as u16).to_be_bytes());
    buf.extend_from_slice(raw);
    buf
}

pub fn encode_update(xid: Xid, uid: Uid, old_raw: &[u8], new_raw: &[u8]) -> Vec<u8> {
    debug_assert_eq!(old_raw.len(), new_raw.len());
    let mut buf = Vec::with_capacity(OF_UPDATE_RAW + old_raw.len() + new_raw.len());
    buf.push(LOG_TYPE_UPDATE);
    buf.extend_from_slice(&xid.to_be_bytes());
    buf.extend_from_slice(&uid.to_be_bytes());
    buf.extend_from_slice(old_raw);
    buf.extend_from_slice(new_raw);
    buf
}

pub fn is_insert_log(payload: &[u8]) -> bool {
    payload.first() == Some(&LOG_TYPE_INSERT)
}

pub fn decode(payload: &[u8]) -> Result<LogRecord> {
    if payload.len() <= OF_XID {
        return Err(Error::BadLogFile("log record shorter than header".into()));
    }
    let xid = Xid::from_be_bytes(payload[OF_XID..OF_XID + 8].try_into().unwrap());
    match payload[OF_TYPE] {
        LOG_TYPE_INSERT => {
            if payload.len() < OF_INSERT_RAW {
                return Err(Error::BadLogFile("truncated insert log record".into()));
            }
            let pgno =
                u32::from_be_bytes(payload[OF_INSERT_PGNO..OF_INSERT_OFFSET].try_into().unwrap())
                    as PageNo;
            let offset = u16::from_be_bytes(
                payload[OF_INSERT_OFFSET..OF_INSERT_RAW].try_into().unwrap(),
            ) as u32;
            Ok(LogRecord::Insert {
                xid,
                pgno,
                offset,
                raw: payload[OF_INSERT_RAW..].to_vec(),
            })
        }
        LOG_TYPE_UPDATE => {
            if payload.len() < OF_UPDATE_RAW {
                return Err(Error::BadLogFile("truncated update log record".into()));
            }
            let uid = Uid::from_be_bytes(
                payload[OF_UPDATE_UID..OF_UPDATE_RAW].try_into().unwrap(),
            );
            let (pgno, offset) = decode_uid(uid);
            let body = &payload[OF_UPDATE_RAW..];
            if body.len() % 2 != 0 {
                return Err(Error::BadLogFile(
                    "update log record body has odd length".into(),
                ));
            }
            let half = body.len() / 2;
            Ok(LogRecord::Update {
                xid,
                pgno,
                offset,
                old_raw: body[..half].to_vec(),
                new_raw: body[half..].to_vec(),
            })
        }
        other => Err(Error::BadLogFile(format!("unknown log record type {other}"))),
    }
}

/// Recompute the uid a given insert/update log record addresses, for
/// callers that want the packed form rather than `(pgno, offset)`.
pub fn record_uid(record: &LogRecord) -> Uid {
    match record {
        LogRecord::Insert { pgno, offset, .. } => encode_uid(*pgno, *offset),
        LogRecord::Update { pgno, offset, .. } => encode_uid(*pgno, *offset),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_round_trips() {
        let raw = b"hello".to_vec();
        let encoded = encode_insert(7, 3, 42, &raw);
        assert!(is_insert_log(&encoded));
        match decode(&encoded).unwrap() {
            LogRecord::Insert {
                xid,
                pgno,
                offset,
                raw: decoded_raw,
            } => {
                assert_eq!(xid, 7);
                assert_eq!(pgno, 3);
                assert_eq!(offset, 42);
                assert_eq!(decoded_raw, raw);
            }
            other => panic!("expected Insert, got {other:?}"),
        }
    }

    #[test]
    fn update_round_trips() {
        let old_raw = vec![1, 2, 3, 4];
        let new_raw = vec![5, 6, 7, 8];
        let uid = encode_uid(9, 100);
        let encoded = encode_update(3, uid, &old_raw, &new_raw);
        assert!(!is_insert_log(&encoded));
        match decode(&encoded).unwrap() {
            LogRecord::Update {
                xid,
                pgno,
                offset,
                old_raw: o,
                new_raw: n,
            } => {
                assert_eq!(xid, 3);
                assert_eq!(pgno, 9);
                assert_eq!(offset, 100);
                assert_eq!(o, old_raw);
                assert_eq!(n, new_raw);
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }
}
