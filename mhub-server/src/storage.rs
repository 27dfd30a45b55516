//! Key/value persistence (§4.4).
//!
//! `Storage` is the abstract sink every persistent node writes its snapshot
//! through. `FileStorage` is the on-disk implementation (one JSON file per
//! key, atomic replace via write-temp-then-rename). `ThrottledStorage`
//! coalesces repeated saves to the same key into at most one write per
//! interval.
//!
//! Grounded on the teacher's `persistent_storage.rs` for the async,
//! `Arc`-shared, `Result`-propagating shape of a storage backend, but without
//! its sled/bincode machinery: this broker's storage contract is a flat
//! per-key JSON sink, not a sequence-numbered message log, so plain
//! `tokio::fs` plus `serde_json` is the whole backend.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mhub_core::error::{Error, Result};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::sleep;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn save(&self, key: &str, value: Value) -> Result<()>;
    async fn load(&self, key: &str) -> Result<Option<Value>>;
}

/// Writes `<root>/<key>.json`, replacing atomically (write to a temp file in
/// the same directory, then rename over the target).
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn save(&self, key: &str, value: Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::storage(format!("failed to create storage root: {e}")))?;

        let final_path = self.path_for(key);
        let tmp_path = self.root.join(format!("{key}.json.tmp"));
        let bytes = serde_json::to_vec_pretty(&value)
            .map_err(|e| Error::storage(format!("failed to encode value for {key}: {e}")))?;

        tokio::fs::write(&tmp_path, bytes)
            .await
            .map_err(|e| Error::storage(format!("failed to write {key}: {e}")))?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| Error::storage(format!("failed to replace {key}: {e}")))?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::storage(format!("failed to decode {key}: {e}")))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage(format!("failed to read {key}: {e}"))),
        }
    }
}

struct PendingWrite {
    latest: Value,
    /// Set whenever a newer value arrives while the writer task holds it;
    /// cleared at the start of each write attempt. The writer keeps going
    /// as long as this is still set once its current write completes.
    dirty: bool,
}

/// Coalesces repeated `save` calls for the same key into at most one
/// scheduled write per `interval` (default 100ms), always writing the
/// latest value. If a write is already underway when a newer value arrives,
/// that newer value is written once the in-flight write completes. `load`
/// bypasses coalescing and always reads through to the inner storage.
pub struct ThrottledStorage<S: Storage + 'static> {
    inner: Arc<S>,
    interval: Duration,
    pending: Arc<Mutex<HashMap<String, PendingWrite>>>,
}

impl<S: Storage + 'static> ThrottledStorage<S> {
    pub fn new(inner: S, interval: Duration) -> Self {
        Self {
            inner: Arc::new(inner),
            interval,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_default_interval(inner: S) -> Self {
        Self::new(inner, Duration::from_millis(100))
    }
}

#[async_trait]
impl<S: Storage + 'static> Storage for ThrottledStorage<S> {
    async fn save(&self, key: &str, value: Value) -> Result<()> {
        let mut pending = self.pending.lock().await;
        if let Some(entry) = pending.get_mut(key) {
            entry.latest = value;
            entry.dirty = true;
            return Ok(());
        }
        pending.insert(
            key.to_string(),
            PendingWrite {
                latest: value,
                dirty: false,
            },
        );
        drop(pending);

        let inner = self.inner.clone();
        let pending_map = self.pending.clone();
        let interval = self.interval;
        let key = key.to_string();

        tokio::spawn(async move {
            loop {
                let to_write = {
                    let mut guard = pending_map.lock().await;
                    match guard.get_mut(&key) {
                        Some(entry) => {
                            entry.dirty = false;
                            entry.latest.clone()
                        }
                        None => return,
                    }
                };

                if let Err(e) = inner.save(&key, to_write).await {
                    tracing::error!(%key, error = %e, "snapshot write failed");
                }
                sleep(interval).await;

                let mut guard = pending_map.lock().await;
                let still_dirty = guard.get(&key).map(|entry| entry.dirty).unwrap_or(false);
                if !still_dirty {
                    guard.remove(&key);
                    return;
                }
            }
        });

        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Value>> {
        self.inner.load(key).await
    }
}
