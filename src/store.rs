//! Cache store
//!
//! Owns the primary keyspace, the expiration queue, and the registry of
//! secondary indexes, and runs the background sweeper. Reads are in-memory;
//! index mutations go through each index's WAL before becoming visible.

use crate::error::{CacheError, Result};
use crate::expiration::ExpiryQueue;
use crate::index::Index;
use crate::stats::{StatsSnapshot, StoreStats};
use crate::value::IndexValue;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Shard count for the per-key critical-section locks.
const KEY_LOCK_SHARDS: usize = 64;

/// A stored value with its expiry and the index postings it contributes to.
#[derive(Debug, Clone)]
pub struct Item {
    pub value: JsonValue,
    pub expires_at_ms: u64,
    pub indexes: HashMap<String, IndexValue>,
}

impl Item {
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    /// Sweeper wake-up period.
    pub sweep_interval: Duration,
    /// How often the sweeper thread also checkpoints every index.
    pub checkpoint_interval: Duration,
    /// Shared secret the dispatch layer enforces. Not checked in the core.
    pub password: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("tidepool-data"),
            sweep_interval: Duration::from_secs(1),
            checkpoint_interval: Duration::from_secs(60),
            password: None,
        }
    }
}

pub struct Store {
    inner: Arc<StoreInner>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    sweeper: Mutex<Option<thread::JoinHandle<()>>>,
}

struct StoreInner {
    data: DashMap<String, Item>,
    key_locks: Box<[Mutex<()>]>,
    indexes: RwLock<HashMap<String, Arc<Index>>>,
    expiry: Mutex<ExpiryQueue>,
    stats: StoreStats,
    data_dir: PathBuf,
    password: Option<String>,
    checkpoint_interval: Duration,
}

impl Store {
    /// Opens the store, recovering every index that already exists under the
    /// data directory, and starts the sweeper.
    pub fn open(config: StoreConfig) -> Result<Store> {
        std::fs::create_dir_all(&config.data_dir)?;

        let mut indexes = HashMap::new();
        for entry in std::fs::read_dir(&config.data_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(field) = entry.file_name().to_str() {
                    let index = Index::open(entry.path())?;
                    indexes.insert(field.to_string(), Arc::new(index));
                }
            }
        }
        if !indexes.is_empty() {
            tracing::info!(
                "recovered {} secondary indexes from {:?}",
                indexes.len(),
                config.data_dir
            );
        }

        let key_locks = (0..KEY_LOCK_SHARDS)
            .map(|_| Mutex::new(()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let inner = Arc::new(StoreInner {
            data: DashMap::new(),
            key_locks,
            indexes: RwLock::new(indexes),
            expiry: Mutex::new(ExpiryQueue::new()),
            stats: StoreStats::new(),
            data_dir: config.data_dir,
            password: config.password,
            checkpoint_interval: config.checkpoint_interval,
        });

        let (shutdown_tx, shutdown_rx) = bounded(1);
        let sweeper = spawn_sweeper(Arc::clone(&inner), config.sweep_interval, shutdown_rx);

        Ok(Store {
            inner,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Installs `value` under `key` with the given TTL and index memberships.
    ///
    /// An existing item is replaced whole (last writer wins). The posting
    /// changes — the symmetric difference of the old and new index maps —
    /// are durably written first, each through the owning index's WAL; only
    /// once they all succeed is the Item committed to the primary map. A
    /// durability failure partway rolls back the postings already applied
    /// and leaves the previous item fully intact.
    pub fn set(
        &self,
        key: &str,
        value: JsonValue,
        ttl: Duration,
        indexes: &HashMap<String, JsonValue>,
    ) -> Result<()> {
        // Validate everything before touching any state.
        let mut typed = HashMap::with_capacity(indexes.len());
        for (field, raw) in indexes {
            validate_field_name(field)?;
            typed.insert(field.clone(), IndexValue::from_json(raw)?);
        }

        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let expires_at_ms = now_ms().saturating_add(ttl_ms);

        let _guard = self.inner.key_lock(key).lock();

        let old_indexes = self
            .inner
            .data
            .get(key)
            .map(|entry| entry.indexes.clone())
            .unwrap_or_default();

        self.inner.reconcile_postings(key, &old_indexes, &typed)?;

        self.inner.data.insert(
            key.to_string(),
            Item {
                value,
                expires_at_ms,
                indexes: typed,
            },
        );
        self.inner.expiry.lock().push(key.to_string(), expires_at_ms);
        self.inner.stats.record_set();
        Ok(())
    }

    /// Returns the live value under `key`, lazily deleting it when expired.
    /// Lazy expiry is authoritative; the sweeper only gets there first.
    pub fn get(&self, key: &str) -> Option<JsonValue> {
        let now = now_ms();
        let found = self
            .inner
            .data
            .get(key)
            .map(|entry| (entry.value.clone(), entry.expires_at_ms));

        match found {
            None => {
                self.inner.stats.record_miss();
                None
            }
            Some((value, expires_at_ms)) if now < expires_at_ms => {
                self.inner.stats.record_hit();
                Some(value)
            }
            Some(_) => {
                // The item stays logically expired even if posting removal
                // fails, so this read must not surface durability errors.
                if let Err(e) = self.inner.remove_expired(key, now) {
                    tracing::warn!("lazy expiry of {:?} failed: {}", key, e);
                }
                self.inner.stats.record_miss();
                None
            }
        }
    }

    /// Removes `key` and its postings. Absent keys are a successful no-op.
    ///
    /// The postings are durably removed before the item leaves the primary
    /// map, so a durability failure reports an error with the item still
    /// fully live and indexed.
    pub fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.inner.key_lock(key).lock();
        let Some(old_indexes) = self
            .inner
            .data
            .get(key)
            .map(|entry| entry.indexes.clone())
        else {
            return Ok(());
        };

        self.inner
            .reconcile_postings(key, &old_indexes, &HashMap::new())?;

        self.inner.data.remove(key);
        self.inner.stats.record_delete();
        Ok(())
    }

    /// Keys currently in the posting bucket `(field, value)`; empty for an
    /// unknown field. A point-in-time copy in unspecified order.
    pub fn query(&self, field: &str, value: &IndexValue) -> Vec<String> {
        self.inner.stats.record_query();
        match self.inner.index(field) {
            Some(index) => index.query(value),
            None => Vec::new(),
        }
    }

    /// Snapshots every index and truncates its WAL.
    pub fn checkpoint_all(&self) -> Result<()> {
        self.inner.checkpoint_all()
    }

    /// Stops the sweeper and runs a final checkpoint on every index.
    /// Idempotent; later calls only re-checkpoint.
    pub fn shutdown(&self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.sweeper.lock().take() {
            let _ = handle.join();
        }
        self.inner.checkpoint_all()
    }

    /// Shared secret for the dispatch layer to enforce, if configured.
    pub fn password(&self) -> Option<&str> {
        self.inner.password.as_deref()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot(self.inner.data.len())
    }

    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

impl StoreInner {
    fn key_lock(&self, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.key_locks[hasher.finish() as usize % self.key_locks.len()]
    }

    fn index(&self, field: &str) -> Option<Arc<Index>> {
        self.indexes.read().get(field).cloned()
    }

    /// Lazy index creation. The registry is double-checked under the writer
    /// lock and republished atomically, so concurrent writers observe either
    /// the old registry or the new one, never a half-built index.
    fn index_or_create(&self, field: &str) -> Result<Arc<Index>> {
        if let Some(index) = self.index(field) {
            return Ok(index);
        }

        let mut registry = self.indexes.write();
        if let Some(index) = registry.get(field) {
            return Ok(Arc::clone(index));
        }

        let index = Arc::new(Index::open(self.data_dir.join(field))?);
        registry.insert(field.to_string(), Arc::clone(&index));
        tracing::debug!("created index for field {:?}", field);
        Ok(index)
    }

    /// Applies the posting changes that take `old` to `new` for `key`, each
    /// through the owning index's WAL. If any write fails, the changes
    /// already applied are undone in reverse order, so the caller can leave
    /// the primary map untouched and report the pre-operation state.
    fn reconcile_postings(
        &self,
        key: &str,
        old: &HashMap<String, IndexValue>,
        new: &HashMap<String, IndexValue>,
    ) -> Result<()> {
        let mut applied: Vec<(Arc<Index>, IndexValue, bool)> = Vec::new();

        if let Err(e) = self.apply_posting_diff(key, old, new, &mut applied) {
            for (index, value, was_add) in applied.into_iter().rev() {
                let undone = if was_add {
                    index.remove(&value, key)
                } else {
                    index.add(value.clone(), key)
                };
                if let Err(undo_err) = undone {
                    tracing::warn!("posting rollback for {:?} failed: {}", key, undo_err);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    fn apply_posting_diff(
        &self,
        key: &str,
        old: &HashMap<String, IndexValue>,
        new: &HashMap<String, IndexValue>,
        applied: &mut Vec<(Arc<Index>, IndexValue, bool)>,
    ) -> Result<()> {
        for (field, old_value) in old {
            if new.get(field) != Some(old_value) {
                if let Some(index) = self.index(field) {
                    index.remove(old_value, key)?;
                    applied.push((index, old_value.clone(), false));
                }
            }
        }
        for (field, new_value) in new {
            if old.get(field) != Some(new_value) {
                let index = self.index_or_create(field)?;
                index.add(new_value.clone(), key)?;
                applied.push((index, new_value.clone(), true));
            }
        }
        Ok(())
    }

    /// Removes `key` only if it is still expired at `now_ms`, then drops its
    /// postings. The re-check under the key lock is what makes stale
    /// expiration-queue entries harmless: a rewritten key with a later
    /// expiry is left alone.
    ///
    /// Unlike `delete`, the item comes out of the map first: it is logically
    /// expired regardless of whether the posting removals succeed, and
    /// postings are allowed to lag behind dead keys.
    fn remove_expired(&self, key: &str, now_ms: u64) -> Result<bool> {
        let _guard = self.key_lock(key).lock();
        if let Some((_, item)) = self
            .data
            .remove_if(key, |_, item| item.is_expired(now_ms))
        {
            self.remove_postings(key, &item.indexes)?;
            self.stats.record_expired();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn remove_postings(&self, key: &str, indexes: &HashMap<String, IndexValue>) -> Result<()> {
        for (field, value) in indexes {
            if let Some(index) = self.index(field) {
                index.remove(value, key)?;
            }
        }
        Ok(())
    }

    /// One sweep pass: drain due queue entries, deleting each key whose item
    /// is genuinely expired. The queue lock is held only long enough to pop
    /// a single entry, so writers are never blocked for a whole sweep.
    fn sweep_expired(&self) -> usize {
        let now = now_ms();
        let mut removed = 0;

        loop {
            let entry = { self.expiry.lock().pop_due(now) };
            let Some(entry) = entry else { break };

            match self.remove_expired(&entry.key, now) {
                Ok(true) => removed += 1,
                Ok(false) => {} // stale entry: key deleted or rewritten
                Err(e) => tracing::warn!("sweeping {:?} failed: {}", entry.key, e),
            }
        }

        removed
    }

    fn checkpoint_all(&self) -> Result<()> {
        let indexes: Vec<(String, Arc<Index>)> = self
            .indexes
            .read()
            .iter()
            .map(|(field, index)| (field.clone(), Arc::clone(index)))
            .collect();

        for (field, index) in indexes {
            index.checkpoint()?;
            tracing::debug!("checkpointed index {:?}", field);
        }
        Ok(())
    }
}

fn spawn_sweeper(
    inner: Arc<StoreInner>,
    period: Duration,
    shutdown_rx: Receiver<()>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        tracing::debug!("sweeper started, period {:?}", period);
        let mut last_checkpoint = Instant::now();

        loop {
            match shutdown_rx.recv_timeout(period) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            let removed = inner.sweep_expired();
            if removed > 0 {
                tracing::debug!("sweeper removed {} expired items", removed);
            }

            if last_checkpoint.elapsed() >= inner.checkpoint_interval {
                last_checkpoint = Instant::now();
                if let Err(e) = inner.checkpoint_all() {
                    tracing::warn!("periodic checkpoint failed: {}", e);
                }
            }
        }

        tracing::debug!("sweeper stopped");
    })
}

/// Current wall-clock time in Unix milliseconds.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as u64
}

fn validate_field_name(field: &str) -> Result<()> {
    let ok = !field.is_empty()
        && field.len() <= 255
        && !field.starts_with('.')
        && !field.contains("..")
        && !field
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0');
    if ok {
        Ok(())
    } else {
        Err(CacheError::InvalidInput(format!(
            "invalid index field name: {:?}",
            field
        )))
    }
}
