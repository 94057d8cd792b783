//! Key/value persistence for the offline cache
//!
//! A [`Storage`] holds string values under string keys. Two backends exist:
//!
//! - [`SqliteStorage`]: one SQLite table, durable across restarts
//! - [`FileStorage`]: one JSON-encoded file per key under a cache directory
//!
//! The backend is chosen once, by [`open`], when the tracker is built.

mod file;
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::Result;

pub use file::FileStorage;
pub use sqlite::SqliteStorage;

/// Uniform string key/value interface over a persistence backend
#[async_trait]
pub trait Storage: Send + Sync {
    /// Short backend name for logs and status output
    fn name(&self) -> &'static str;

    /// Read a value, `None` when the key is absent
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a key; deleting an absent key is not an error
    async fn remove(&self, key: &str) -> Result<()>;

    /// Delete every key owned by this backend
    async fn clear(&self) -> Result<()>;
}

/// Shared storage handle
pub type SharedStorage = Arc<dyn Storage>;

/// Open the backend selected by `config`
///
/// `auto` prefers SQLite and falls back to the file store when the database
/// cannot be opened (read-only data dir, locked file, ...).
pub fn open(config: &StorageConfig) -> Result<SharedStorage> {
    match config.backend {
        StorageBackend::Sqlite => Ok(Arc::new(SqliteStorage::open(&config.database_path())?)),
        StorageBackend::File => Ok(Arc::new(FileStorage::new(config.cache_dir()))),
        StorageBackend::Auto => match SqliteStorage::open(&config.database_path()) {
            Ok(storage) => Ok(Arc::new(storage)),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    cache_dir = %config.cache_dir().display(),
                    "SQLite storage unavailable, falling back to file storage"
                );
                Ok(Arc::new(FileStorage::new(config.cache_dir())))
            }
        },
    }
}
