//! Secondary index
//!
//! One index maps an indexed value to the set of keys carrying it. Every
//! mutation is appended to the index's WAL (and fsynced) before the
//! in-memory posting changes; a checkpoint dumps the whole postings map to
//! the snapshot file and truncates the WAL. Recovery on open is snapshot
//! first, then WAL replay in write order.
//!
//! The postings map and the WAL handle live under one writer lock so the
//! on-disk record order always matches the in-memory apply order.

use crate::error::{CacheError, Result};
use crate::snapshot::{Postings, Snapshot};
use crate::value::IndexValue;
use crate::wal::{Wal, WalEntry};
use crate::IndexOp;
use parking_lot::RwLock;
use std::path::Path;

pub struct Index {
    inner: RwLock<IndexInner>,
    snapshot: Snapshot,
}

struct IndexInner {
    postings: Postings,
    wal: Wal,
}

impl Index {
    /// Opens the index rooted at `dir`, creating it on first use, and
    /// recovers in-memory postings from the snapshot plus the WAL.
    ///
    /// A corrupt snapshot degrades to empty postings: everything the
    /// snapshot would have held is gone, but WAL records written since the
    /// last checkpoint still replay.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let wal = Wal::open(dir.join("wal.log"))?;
        let snapshot = Snapshot::new(dir.join("data.db"));

        let mut postings = match snapshot.load() {
            Ok(Some(postings)) => postings,
            Ok(None) => Postings::new(),
            Err(CacheError::Corruption(msg)) => {
                tracing::warn!("discarding corrupt snapshot in {:?}: {}", dir, msg);
                Postings::new()
            }
            Err(e) => return Err(e),
        };

        let entries = wal.read_all()?;
        let replayed = entries.len();
        for entry in entries {
            apply(&mut postings, entry);
        }
        if replayed > 0 {
            tracing::debug!("replayed {} WAL records for index in {:?}", replayed, dir);
        }

        Ok(Self {
            inner: RwLock::new(IndexInner { postings, wal }),
            snapshot,
        })
    }

    /// Records `key` under `value`. The WAL append must complete before the
    /// posting becomes visible to readers.
    pub fn add(&self, value: IndexValue, key: &str) -> Result<()> {
        let mut inner = self.inner.write();
        inner.wal.append(IndexOp::Add, &value, key)?;
        inner
            .postings
            .entry(value)
            .or_default()
            .insert(key.to_string());
        Ok(())
    }

    /// Removes `key` from the bucket for `value`, pruning the bucket when it
    /// empties.
    pub fn remove(&self, value: &IndexValue, key: &str) -> Result<()> {
        let mut inner = self.inner.write();
        inner.wal.append(IndexOp::Remove, value, key)?;
        if let Some(bucket) = inner.postings.get_mut(value) {
            bucket.remove(key);
            if bucket.is_empty() {
                inner.postings.remove(value);
            }
        }
        Ok(())
    }

    /// Point-in-time copy of the bucket for `value`. Order is unspecified.
    pub fn query(&self, value: &IndexValue) -> Vec<String> {
        let inner = self.inner.read();
        match inner.postings.get(value) {
            Some(bucket) => bucket.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Writes a snapshot of the current postings and truncates the WAL.
    ///
    /// The snapshot lands atomically before the truncation, so a crash
    /// between the two steps only leaves redundant WAL records, and
    /// replaying them over the new snapshot converges to the same state.
    pub fn checkpoint(&self) -> Result<()> {
        let mut inner = self.inner.write();
        self.snapshot.write(&inner.postings)?;
        inner.wal.reset()
    }

    /// On-disk WAL size in bytes.
    pub fn wal_size(&self) -> Result<u64> {
        self.inner.read().wal.size()
    }
}

#[cfg(test)]
impl Index {
    /// Makes every later WAL append on this index fail.
    pub(crate) fn poison_wal(&self) {
        self.inner.write().wal.poison();
    }
}

fn apply(postings: &mut Postings, entry: WalEntry) {
    match entry.op {
        IndexOp::Add => {
            postings.entry(entry.value).or_default().insert(entry.key);
        }
        IndexOp::Remove => {
            if let Some(bucket) = postings.get_mut(&entry.value) {
                bucket.remove(&entry.key);
                if bucket.is_empty() {
                    postings.remove(&entry.value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_add_and_query() {
        let dir = tempdir().unwrap();
        let index = Index::open(dir.path()).unwrap();

        index.add(IndexValue::Str("x".into()), "a").unwrap();
        index.add(IndexValue::Str("x".into()), "b").unwrap();
        index.add(IndexValue::Str("y".into()), "c").unwrap();

        let mut keys = index.query(&IndexValue::Str("x".into()));
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(index.query(&IndexValue::Str("y".into())), vec!["c"]);
        assert!(index.query(&IndexValue::Str("z".into())).is_empty());
    }

    #[test]
    fn test_remove_prunes_empty_bucket() {
        let dir = tempdir().unwrap();
        let index = Index::open(dir.path()).unwrap();

        index.add(IndexValue::Int(5), "only").unwrap();
        index.remove(&IndexValue::Int(5), "only").unwrap();

        assert!(index.query(&IndexValue::Int(5)).is_empty());
    }

    #[test]
    fn test_mutations_hit_the_wal_first() {
        let dir = tempdir().unwrap();
        let index = Index::open(dir.path()).unwrap();

        index.add(IndexValue::Str("v".into()), "k").unwrap();
        assert!(index.wal_size().unwrap() > 0);
    }

    #[test]
    fn test_recovery_from_wal_alone() {
        let dir = tempdir().unwrap();

        {
            let index = Index::open(dir.path()).unwrap();
            index.add(IndexValue::Str("x".into()), "a").unwrap();
            index.add(IndexValue::Str("x".into()), "b").unwrap();
            index.remove(&IndexValue::Str("x".into()), "a").unwrap();
        }

        let index = Index::open(dir.path()).unwrap();
        assert_eq!(index.query(&IndexValue::Str("x".into())), vec!["b"]);
    }

    #[test]
    fn test_checkpoint_truncates_wal_and_recovers() {
        let dir = tempdir().unwrap();

        {
            let index = Index::open(dir.path()).unwrap();
            index.add(IndexValue::Int(1), "a").unwrap();
            index.add(IndexValue::Int(2), "b").unwrap();
            index.checkpoint().unwrap();
            assert_eq!(index.wal_size().unwrap(), 0);
        }

        let index = Index::open(dir.path()).unwrap();
        assert_eq!(index.query(&IndexValue::Int(1)), vec!["a"]);
        assert_eq!(index.query(&IndexValue::Int(2)), vec!["b"]);
    }

    #[test]
    fn test_typed_values_survive_recovery() {
        let dir = tempdir().unwrap();

        {
            let index = Index::open(dir.path()).unwrap();
            index.add(IndexValue::Int(1), "int-key").unwrap();
            index.add(IndexValue::Str("1".into()), "str-key").unwrap();
        }

        let index = Index::open(dir.path()).unwrap();
        assert_eq!(index.query(&IndexValue::Int(1)), vec!["int-key"]);
        assert_eq!(index.query(&IndexValue::Str("1".into())), vec!["str-key"]);
    }

    #[test]
    fn test_failed_append_leaves_postings_unchanged() {
        let dir = tempdir().unwrap();
        let index = Index::open(dir.path()).unwrap();

        index.add(IndexValue::Str("x".into()), "a").unwrap();
        index.poison_wal();

        assert!(index.add(IndexValue::Str("x".into()), "b").is_err());
        assert!(index.remove(&IndexValue::Str("x".into()), "a").is_err());

        // Neither failed mutation became visible.
        assert_eq!(index.query(&IndexValue::Str("x".into())), vec!["a"]);
    }

    #[test]
    fn test_corrupt_snapshot_degrades_to_wal_replay() {
        let dir = tempdir().unwrap();

        {
            let index = Index::open(dir.path()).unwrap();
            index.add(IndexValue::Str("old".into()), "a").unwrap();
            index.checkpoint().unwrap();
            index.add(IndexValue::Str("new".into()), "b").unwrap();
        }

        // Clobber the snapshot; the post-checkpoint WAL record must survive.
        std::fs::write(dir.path().join("data.db"), b"garbage").unwrap();

        let index = Index::open(dir.path()).unwrap();
        assert!(index.query(&IndexValue::Str("old".into())).is_empty());
        assert_eq!(index.query(&IndexValue::Str("new".into())), vec!["b"]);
    }
}
