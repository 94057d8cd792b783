//! Offline cache of undelivered events
//!
//! A single storage key holds a JSON array of [`SerializedEvent`]s that could
//! not be confirmed delivered. Writes append to whatever is already cached;
//! the key is removed only after its contents were handed back to the queue.
//!
//! The cache is a best-effort safety net. Callers in [`crate::tracker`] log
//! failures; a batch that cannot be written stays in the in-memory queue.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::event::SerializedEvent;
use crate::storage::SharedStorage;

/// Storage key of the offline cache
pub const OFFLINE_CACHE_KEY: &str = "beacon_offline_events";

/// Typed view over the offline cache key
///
/// Read-modify-write cycles are serialized within one process; separate
/// processes sharing the same storage overwrite each other.
#[derive(Clone)]
pub struct OfflineCache {
    storage: SharedStorage,
    write_lock: Arc<Mutex<()>>,
}

impl OfflineCache {
    pub fn new(storage: SharedStorage) -> Self {
        Self {
            storage,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Name of the backing storage
    pub fn backend(&self) -> &'static str {
        self.storage.name()
    }

    /// Read every cached event, oldest first
    pub async fn load(&self) -> Result<Vec<SerializedEvent>> {
        match self.storage.get(OFFLINE_CACHE_KEY).await? {
            Some(raw) if !raw.trim().is_empty() => Ok(serde_json::from_str(&raw)?),
            _ => Ok(Vec::new()),
        }
    }

    /// Append a batch after the events already cached
    ///
    /// Returns the number of events now cached. A blob that is not valid JSON
    /// is replaced; a failed read leaves the cache untouched and errors.
    pub async fn append(&self, batch: &[SerializedEvent]) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        if batch.is_empty() {
            return Ok(self.load().await?.len());
        }

        let mut events = match self.load().await {
            Ok(events) => events,
            Err(Error::Json(e)) => {
                // A corrupt blob would otherwise block every future write
                tracing::warn!(error = %e, "Discarding unreadable offline cache");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        events.extend_from_slice(batch);

        self.storage
            .set(OFFLINE_CACHE_KEY, &serde_json::to_string(&events)?)
            .await?;
        Ok(events.len())
    }

    /// Hand every cached event to `restore`, then remove the key
    ///
    /// Returns the number of events handed over. Nothing is removed when the
    /// cache is empty or unreadable.
    pub async fn drain_with<F>(&self, restore: F) -> Result<usize>
    where
        F: FnOnce(Vec<SerializedEvent>),
    {
        let _guard = self.write_lock.lock().await;
        let events = self.load().await?;
        if events.is_empty() {
            return Ok(0);
        }

        let count = events.len();
        restore(events);
        self.storage.remove(OFFLINE_CACHE_KEY).await?;
        Ok(count)
    }

    /// Remove the cache key
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.storage.remove(OFFLINE_CACHE_KEY).await
    }
}
