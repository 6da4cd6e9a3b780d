//! Index snapshots
//!
//! A snapshot is a whole-postings dump that supersedes every WAL record
//! written before it. Writes are atomic: the new file is written to a temp
//! path, fsynced, renamed over the old snapshot, and the directory is
//! fsynced, so a crash mid-checkpoint leaves either the old snapshot with the
//! old WAL or the new snapshot with an empty WAL.
//!
//! File layout: `magic "TPSN" | u8 version | u32 crc32(body) | body`, where
//! the body is a bucket count followed by `{value, key-count, keys}` groups.

use crate::error::{CacheError, Result};
use crate::value::IndexValue;
use bytes::{Buf, BufMut, BytesMut};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

const MAGIC: [u8; 4] = *b"TPSN";
const VERSION: u8 = 1;

pub type Postings = HashMap<IndexValue, HashSet<String>>;

pub struct Snapshot {
    path: PathBuf,
}

impl Snapshot {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Atomically replaces the snapshot with the given postings.
    pub fn write(&self, postings: &Postings) -> Result<()> {
        let mut body = BytesMut::new();
        body.put_u32_le(postings.len() as u32);
        for (value, keys) in postings {
            value.encode(&mut body);
            body.put_u32_le(keys.len() as u32);
            for key in keys {
                body.put_u32_le(key.len() as u32);
                body.put_slice(key.as_bytes());
            }
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        let checksum = hasher.finalize();

        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = File::create(&tmp_path).map_err(CacheError::Durability)?;
        tmp.write_all(&MAGIC).map_err(CacheError::Durability)?;
        tmp.write_all(&[VERSION]).map_err(CacheError::Durability)?;
        tmp.write_all(&checksum.to_le_bytes())
            .map_err(CacheError::Durability)?;
        tmp.write_all(&body).map_err(CacheError::Durability)?;
        tmp.sync_all().map_err(CacheError::Durability)?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path).map_err(CacheError::Durability)?;
        if let Some(parent) = self.path.parent() {
            File::open(parent)
                .and_then(|dir| dir.sync_all())
                .map_err(CacheError::Durability)?;
        }

        Ok(())
    }

    /// Loads the snapshot. `Ok(None)` on first run (no file yet); a
    /// magic/version/checksum mismatch or a short file is `Corruption`, which
    /// the index treats as "start empty and replay the WAL".
    pub fn load(&self) -> Result<Option<Postings>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if raw.len() < MAGIC.len() + 1 + 4 {
            return Err(CacheError::Corruption("snapshot header too short".into()));
        }
        if raw[..4] != MAGIC {
            return Err(CacheError::Corruption("bad snapshot magic".into()));
        }
        if raw[4] != VERSION {
            return Err(CacheError::Corruption(format!(
                "unsupported snapshot version: {}",
                raw[4]
            )));
        }

        let expected = u32::from_le_bytes([raw[5], raw[6], raw[7], raw[8]]);
        let body = &raw[9..];
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(body);
        if hasher.finalize() != expected {
            return Err(CacheError::Corruption("snapshot checksum mismatch".into()));
        }

        let mut buf = body;
        if buf.remaining() < 4 {
            return Err(CacheError::Corruption("snapshot body too short".into()));
        }
        let bucket_count = buf.get_u32_le() as usize;
        let mut postings = Postings::with_capacity(bucket_count);

        for _ in 0..bucket_count {
            let value = IndexValue::decode(&mut buf)?;
            if buf.remaining() < 4 {
                return Err(CacheError::Corruption("truncated posting bucket".into()));
            }
            let key_count = buf.get_u32_le() as usize;
            let mut keys = HashSet::with_capacity(key_count);
            for _ in 0..key_count {
                if buf.remaining() < 4 {
                    return Err(CacheError::Corruption("truncated key length".into()));
                }
                let len = buf.get_u32_le() as usize;
                if buf.remaining() < len {
                    return Err(CacheError::Corruption("truncated key bytes".into()));
                }
                let mut bytes = vec![0u8; len];
                buf.copy_to_slice(&mut bytes);
                let key = String::from_utf8(bytes)
                    .map_err(|e| CacheError::Corruption(format!("invalid UTF-8 key: {}", e)))?;
                keys.insert(key);
            }
            postings.insert(value, keys);
        }

        Ok(Some(postings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_postings() -> Postings {
        let mut postings = Postings::new();
        postings.insert(
            IndexValue::Str("x".into()),
            ["a".to_string(), "b".to_string()].into_iter().collect(),
        );
        postings.insert(IndexValue::Int(9), ["c".to_string()].into_iter().collect());
        postings.insert(
            IndexValue::Float(1.5),
            ["d".to_string()].into_iter().collect(),
        );
        postings
    }

    #[test]
    fn test_write_then_load() {
        let dir = tempdir().unwrap();
        let snapshot = Snapshot::new(dir.path().join("data.db"));

        let postings = sample_postings();
        snapshot.write(&postings).unwrap();

        let loaded = snapshot.load().unwrap().unwrap();
        assert_eq!(loaded, postings);
    }

    #[test]
    fn test_absent_snapshot_is_none() {
        let dir = tempdir().unwrap();
        let snapshot = Snapshot::new(dir.path().join("data.db"));
        assert!(snapshot.load().unwrap().is_none());
    }

    #[test]
    fn test_write_replaces_previous() {
        let dir = tempdir().unwrap();
        let snapshot = Snapshot::new(dir.path().join("data.db"));

        snapshot.write(&sample_postings()).unwrap();

        let mut second = Postings::new();
        second.insert(
            IndexValue::Str("only".into()),
            ["k".to_string()].into_iter().collect(),
        );
        snapshot.write(&second).unwrap();

        assert_eq!(snapshot.load().unwrap().unwrap(), second);
        // No temp file left behind after the rename.
        assert!(!dir.path().join("data.tmp").exists());
    }

    #[test]
    fn test_bad_magic_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        fs::write(&path, b"NOPE\x01\x00\x00\x00\x00\x00\x00\x00\x00").unwrap();

        let snapshot = Snapshot::new(&path);
        assert!(matches!(
            snapshot.load(),
            Err(CacheError::Corruption(_))
        ));
    }

    #[test]
    fn test_flipped_byte_fails_checksum() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        let snapshot = Snapshot::new(&path);
        snapshot.write(&sample_postings()).unwrap();

        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        fs::write(&path, raw).unwrap();

        assert!(matches!(
            snapshot.load(),
            Err(CacheError::Corruption(_))
        ));
    }

    #[test]
    fn test_truncated_body_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        let snapshot = Snapshot::new(&path);
        snapshot.write(&sample_postings()).unwrap();

        let raw = fs::read(&path).unwrap();
        fs::write(&path, &raw[..raw.len() / 2]).unwrap();

        assert!(matches!(
            snapshot.load(),
            Err(CacheError::Corruption(_))
        ));
    }
}
