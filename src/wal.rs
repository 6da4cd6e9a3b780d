//! Write-Ahead Log
//!
//! Each secondary index owns one append-only log file. A mutation is appended
//! and fsynced here before the in-memory posting changes, so replaying the
//! log on open reconstructs exactly the acknowledged index state.
//!
//! ## Record layout
//!
//! `u32 length | i64 timestamp_ns | u8 op | value-bytes | key-bytes`
//!
//! `length` covers everything after itself. Length and timestamp are
//! little-endian; the value payload carries its own typed encoding
//! (see [`IndexValue`]). A short or unparseable tail record is treated as an
//! uncommitted write and dropped at replay.

use crate::error::{CacheError, Result};
use crate::value::IndexValue;
use crate::IndexOp;
use bytes::{Buf, BufMut, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// One replayed log record.
#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry {
    pub timestamp_ns: i64,
    pub op: IndexOp,
    pub value: IndexValue,
    pub key: String,
}

pub struct Wal {
    file: File,
    path: PathBuf,
}

impl Wal {
    /// Opens (creating if absent) the log file in append mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { file, path })
    }

    /// Appends one record and fsyncs before returning. A failure here means
    /// the caller must not apply the corresponding in-memory change.
    pub fn append(&mut self, op: IndexOp, value: &IndexValue, key: &str) -> Result<()> {
        let timestamp_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)?
            .as_nanos() as i64;

        let mut body = BytesMut::with_capacity(8 + 1 + value.encoded_len() + key.len());
        body.put_i64_le(timestamp_ns);
        body.put_u8(op as u8);
        value.encode(&mut body);
        body.put_slice(key.as_bytes());

        let mut record = BytesMut::with_capacity(4 + body.len());
        record.put_u32_le(body.len() as u32);
        record.extend_from_slice(&body);

        self.file
            .write_all(&record)
            .map_err(CacheError::Durability)?;
        self.file.sync_all().map_err(CacheError::Durability)?;

        Ok(())
    }

    /// Replays every intact record in write order. Replay stops cleanly at
    /// EOF or at the first short/corrupt tail record.
    pub fn read_all(&self) -> Result<Vec<WalEntry>> {
        let mut file = File::open(&self.path)?;
        let mut entries = Vec::new();

        loop {
            match read_record(&mut file) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => break,
                Err(CacheError::Corruption(msg)) => {
                    tracing::warn!("dropping corrupt WAL tail at {:?}: {}", self.path, msg);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(entries)
    }

    /// Truncates the log to zero length. Called after a successful snapshot.
    pub fn reset(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Current on-disk size in bytes.
    pub fn size(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }
}

#[cfg(test)]
impl Wal {
    /// Swaps the handle for a read-only one so every later append fails,
    /// simulating a durability failure.
    pub(crate) fn poison(&mut self) {
        self.file = File::open(&self.path).unwrap();
    }
}

fn read_record(file: &mut File) -> Result<Option<WalEntry>> {
    let mut len_buf = [0u8; 4];
    match file.read_exact(&mut len_buf) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let length = u32::from_le_bytes(len_buf) as usize;

    if length < 9 {
        return Err(CacheError::Corruption(format!(
            "record length {} shorter than fixed header",
            length
        )));
    }

    let mut body = vec![0u8; length];
    match file.read_exact(&mut body) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(CacheError::Corruption("short tail record".into()));
        }
        Err(e) => return Err(e.into()),
    }

    let mut buf = &body[..];
    let timestamp_ns = buf.get_i64_le();
    let op_byte = buf.get_u8();
    let op = IndexOp::from_u8(op_byte)
        .ok_or_else(|| CacheError::Corruption(format!("invalid op byte: {}", op_byte)))?;
    let value = IndexValue::decode(&mut buf)?;
    let key = String::from_utf8(buf.to_vec())
        .map_err(|e| CacheError::Corruption(format!("invalid UTF-8 in key: {}", e)))?;

    Ok(Some(WalEntry {
        timestamp_ns,
        op,
        value,
        key,
    }))
}
