//! Application-facing handle
//!
//! [`Beacon`] is what an application keeps around: `init`, `track`, `flush`,
//! `identify`, `destroy`. It holds at most one active [`Tracker`]. Handles are
//! plain values passed to whoever needs them, so independent handles (one per
//! test, say) never share state.

use serde_json::{Map, Value};

use crate::config::TrackerConfig;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::tracker::{Tracker, TrackerBuilder};

/// Lifecycle of a [`Beacon`] handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Initialized,
    Destroyed,
}

enum Slot {
    Uninitialized,
    Initialized(Tracker),
    Destroyed,
}

/// Handle exposing the tracking lifecycle
pub struct Beacon {
    slot: Slot,
}

impl Default for Beacon {
    fn default() -> Self {
        Self::new()
    }
}

impl Beacon {
    /// Create an uninitialized handle
    pub fn new() -> Self {
        Self {
            slot: Slot::Uninitialized,
        }
    }

    /// Start a tracker with `config`
    ///
    /// Fails on invalid configuration or when a tracker is already active.
    /// A destroyed handle may be initialized again; it gets a new session.
    pub fn init(&mut self, config: TrackerConfig) -> Result<()> {
        self.init_with(Tracker::builder(config))
    }

    /// Start a tracker from a customized builder
    pub fn init_with(&mut self, builder: TrackerBuilder) -> Result<()> {
        if matches!(self.slot, Slot::Initialized(_)) {
            return Err(Error::AlreadyInitialized);
        }
        self.slot = Slot::Initialized(builder.build()?);
        Ok(())
    }

    pub fn lifecycle(&self) -> Lifecycle {
        match self.slot {
            Slot::Uninitialized => Lifecycle::Uninitialized,
            Slot::Initialized(_) => Lifecycle::Initialized,
            Slot::Destroyed => Lifecycle::Destroyed,
        }
    }

    /// The active tracker
    pub fn tracker(&self) -> Result<&Tracker> {
        match &self.slot {
            Slot::Initialized(tracker) => Ok(tracker),
            _ => Err(Error::NotInitialized),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.tracker().ok().map(Tracker::session_id)
    }

    pub fn track(&self, event: Event) {
        match self.tracker() {
            Ok(tracker) => tracker.track(event),
            Err(_) => tracing::warn!(event_type = event.kind(), "track() before init(), dropping event"),
        }
    }

    pub async fn flush(&self) {
        match self.tracker() {
            Ok(tracker) => tracker.flush().await,
            Err(_) => tracing::debug!("flush() before init(), nothing to do"),
        }
    }

    pub fn identify(&self, user_id: impl Into<String>, traits: Map<String, Value>) {
        match self.tracker() {
            Ok(tracker) => tracker.identify(user_id, traits),
            Err(_) => tracing::warn!("identify() before init(), ignoring"),
        }
    }

    /// Destroy the active tracker (final flush first)
    pub async fn destroy(&mut self) {
        match std::mem::replace(&mut self.slot, Slot::Destroyed) {
            Slot::Initialized(tracker) => tracker.destroy().await,
            Slot::Uninitialized => self.slot = Slot::Uninitialized,
            Slot::Destroyed => {}
        }
    }
}

/// Create a handle and start its tracker
pub fn init(config: TrackerConfig) -> Result<Beacon> {
    let mut beacon = Beacon::new();
    beacon.init(config)?;
    Ok(beacon)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StorageBackend, StorageConfig};
    use tempfile::TempDir;

    fn builder(dir: &TempDir) -> TrackerBuilder {
        let config = TrackerConfig {
            endpoint: "http://127.0.0.1:9/events".to_string(),
            ..TrackerConfig::new("bk_test", "proj")
        };
        Tracker::builder(config).storage_config(StorageConfig {
            backend: StorageBackend::File,
            database_path: None,
            cache_dir: Some(dir.path().to_path_buf()),
        })
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let dir = TempDir::new().unwrap();
        let mut beacon = Beacon::new();
        assert_eq!(beacon.lifecycle(), Lifecycle::Uninitialized);
        assert!(beacon.session_id().is_none());

        beacon.init_with(builder(&dir)).unwrap();
        assert_eq!(beacon.lifecycle(), Lifecycle::Initialized);
        let first_session = beacon.session_id().unwrap().to_string();

        assert!(matches!(
            beacon.init_with(builder(&dir)),
            Err(Error::AlreadyInitialized)
        ));

        beacon.destroy().await;
        assert_eq!(beacon.lifecycle(), Lifecycle::Destroyed);
        assert!(matches!(beacon.tracker(), Err(Error::NotInitialized)));

        beacon.init_with(builder(&dir)).unwrap();
        assert_ne!(beacon.session_id().unwrap(), first_session);
        beacon.destroy().await;
    }

    #[tokio::test]
    async fn test_calls_before_init_are_ignored() {
        let mut beacon = Beacon::default();
        beacon.track(Event::PageViewed(crate::event::PageViewed {
            path: "/".to_string(),
            title: None,
            referrer: None,
        }));
        beacon.identify("u-1", Map::new());
        beacon.flush().await;
        beacon.destroy().await;
        assert_eq!(beacon.lifecycle(), Lifecycle::Uninitialized);
    }

    #[tokio::test]
    async fn test_init_rejects_missing_credentials() {
        let mut beacon = Beacon::new();
        let result = beacon.init(TrackerConfig::new("", ""));
        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(beacon.lifecycle(), Lifecycle::Uninitialized);
    }
}
