//! Tracker: the orchestrator behind `track()`
//!
//! A [`Tracker`] validates its configuration, owns the session id, and wires
//! the pipeline:
//!
//! ```text
//! track() → SerializedEvent → Queue ──flush──→ Dispatcher ─online──→ sign → Transport
//!                                                  │                           │
//!                                               offline                  retries exhausted
//!                                                  ▼                           ▼
//!                                             OfflineCache ◀───────────────────┘
//! ```
//!
//! Cached events come back when connectivity returns (or when the next
//! tracker starts online): they are re-enqueued in order and the cache key is
//! removed.
//!
//! Only construction can fail. `track`, `flush`, `identify` and `destroy`
//! report problems through `tracing` and never return errors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{Config, StorageConfig, TrackerConfig};
use crate::connectivity::{spawn_probe, Connectivity, ConnectivityMonitor};
use crate::error::{Error, Result};
use crate::event::{Event, EventContext, EventsPayload, SerializedEvent, UserIdentified};
use crate::offline::OfflineCache;
use crate::queue::{BatchSink, Queue};
use crate::signer::Signer;
use crate::storage::{self, SharedStorage};
use crate::transport::{Backoff, SignedBatch, Transport};

/// Builder for [`Tracker`]
pub struct TrackerBuilder {
    config: TrackerConfig,
    storage_config: StorageConfig,
    storage: Option<SharedStorage>,
    signer: Signer,
    backoff: Backoff,
    connectivity: Option<ConnectivityMonitor>,
    probe_interval: Option<Duration>,
}

impl TrackerBuilder {
    fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            storage_config: StorageConfig::default(),
            storage: None,
            signer: Signer::for_target(),
            backoff: Backoff::default(),
            connectivity: None,
            probe_interval: None,
        }
    }

    /// Select the offline cache backend from configuration
    pub fn storage_config(mut self, storage_config: StorageConfig) -> Self {
        self.storage_config = storage_config;
        self
    }

    /// Use an already opened storage backend
    pub fn storage(mut self, storage: SharedStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn signer(mut self, signer: Signer) -> Self {
        self.signer = signer;
        self
    }

    /// Override the retry delay schedule
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Subscribe to platform connectivity notifications
    pub fn connectivity(mut self, monitor: ConnectivityMonitor) -> Self {
        self.connectivity = Some(monitor);
        self
    }

    /// Poll the endpoint for reachability every `interval`
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = Some(interval);
        self
    }

    /// Validate the configuration and start the tracker
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Tracker> {
        self.config.validate()?;

        let runtime = Handle::try_current().map_err(|_| {
            Error::Config("tracker must be created inside a tokio runtime".to_string())
        })?;

        let storage = match self.storage {
            Some(storage) => storage,
            None => storage::open(&self.storage_config)?,
        };
        let transport = Transport::new(&self.config)?.with_backoff(self.backoff);

        let monitor = match (self.connectivity, self.probe_interval) {
            (Some(monitor), _) => Some(monitor),
            (None, Some(_)) => Some(ConnectivityMonitor::default()),
            (None, None) => None,
        };
        let online = monitor
            .as_ref()
            .map(|m| m.current().is_online())
            .unwrap_or(true);

        let dispatcher = Arc::new(Dispatcher {
            api_key: self.config.api_key.clone(),
            signer: self.signer,
            transport: transport.clone(),
            cache: OfflineCache::new(storage),
            online: AtomicBool::new(online),
        });
        let queue = Queue::new(
            self.config.batch_size,
            self.config.flush_interval(),
            dispatcher.clone(),
            runtime.clone(),
        );

        let inner = Arc::new(TrackerInner {
            session_id: new_session_id(),
            config: self.config,
            dispatcher,
            queue,
            user_id: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            startup: Mutex::new(None),
        });

        let mut tasks = Vec::new();
        if let Some(monitor) = &monitor {
            tasks.push(spawn_listener(
                Arc::downgrade(&inner),
                monitor.subscribe(),
                &runtime,
            ));
            if let Some(interval) = self.probe_interval {
                let _guard = runtime.enter();
                tasks.push(spawn_probe(monitor.clone(), transport, interval));
            }
        }
        inner.lock_tasks().extend(tasks);
        if online {
            let startup = inner.clone();
            *inner.lock_startup() = Some(runtime.spawn(async move {
                startup.restore_offline_events().await;
            }));
        }

        tracing::info!(
            session_id = %inner.session_id,
            project_id = %inner.config.project_id,
            environment = inner.config.environment.as_str(),
            storage = inner.dispatcher.cache.backend(),
            online,
            "Tracker initialized"
        );

        Ok(Tracker { inner })
    }
}

/// Handle to a running tracker; clones share the same session and queue
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    session_id: String,
    config: TrackerConfig,
    dispatcher: Arc<Dispatcher>,
    queue: Queue,
    user_id: Mutex<Option<String>>,
    destroyed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    startup: Mutex<Option<JoinHandle<()>>>,
}

impl Tracker {
    pub fn builder(config: TrackerConfig) -> TrackerBuilder {
        TrackerBuilder::new(config)
    }

    /// Build a tracker with default collaborators
    pub fn new(config: TrackerConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Build a tracker from the loaded configuration file
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut builder = Self::builder(config.tracker.clone())
            .storage_config(config.storage.clone());
        if let Some(interval) = config.connectivity.probe_interval() {
            builder = builder.probe_interval(interval);
        }
        builder.build()
    }

    /// Record an event
    pub fn track(&self, event: Event) {
        self.inner.track(event, None);
    }

    /// Record an event with a caller-measured latency
    pub fn track_with_latency(&self, event: Event, latency: Duration) {
        self.inner.track(event, Some(latency));
    }

    /// Attach `user_id` to every later event and record a `user_identified` event
    pub fn identify(&self, user_id: impl Into<String>, traits: Map<String, Value>) {
        if self.is_destroyed() {
            tracing::warn!("identify() called on a destroyed tracker, ignoring");
            return;
        }

        let user_id = user_id.into();
        *self
            .inner
            .user_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(user_id.clone());
        self.track(Event::UserIdentified(UserIdentified { user_id, traits }));
    }

    /// Hand the current batch to delivery now
    pub async fn flush(&self) {
        match self.inner.queue.flush().await {
            Ok(0) => {}
            Ok(n) => tracing::debug!(events = n, "Manual flush complete"),
            Err(e) => tracing::warn!(error = %e, "Manual flush failed, events requeued"),
        }
    }

    /// Apply a connectivity change directly
    ///
    /// Trackers built with a [`ConnectivityMonitor`] receive these
    /// automatically.
    pub async fn set_connectivity(&self, connectivity: Connectivity) {
        self.inner.handle_connectivity(connectivity).await;
    }

    /// Final flush, then release timers and background tasks
    ///
    /// Startup recovery is allowed to finish first so restored events take
    /// part in the final flush. Returns once every batch already handed to
    /// delivery has been sent or written to the offline cache. Calling this
    /// twice is a no-op.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        let startup = self.inner.lock_startup().take();
        if let Some(startup) = startup {
            if let Err(e) = startup.await {
                tracing::warn!(error = %e, "Startup recovery did not complete");
            }
        }
        self.inner.abort_tasks();

        self.flush().await;
        self.inner.queue.wait_idle().await;
        self.inner.queue.clear();

        tracing::info!(session_id = %self.inner.session_id, "Tracker destroyed");
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    pub fn is_online(&self) -> bool {
        self.inner.dispatcher.online.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Events waiting in memory
    pub fn pending(&self) -> usize {
        self.inner.queue.size()
    }

    /// The offline cache this tracker persists to
    pub fn offline_cache(&self) -> &OfflineCache {
        &self.inner.dispatcher.cache
    }
}

impl TrackerInner {
    fn track(&self, event: Event, latency: Option<Duration>) {
        if self.destroyed.load(Ordering::SeqCst) {
            tracing::warn!(event_type = event.kind(), "track() called on a destroyed tracker, dropping event");
            return;
        }

        let user_id = self
            .user_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let ctx = EventContext {
            session_id: &self.session_id,
            user_id: user_id.as_deref(),
            tracked_at: Utc::now(),
        };

        match SerializedEvent::from_event(&event, &ctx) {
            Ok(mut serialized) => {
                serialized.latency = latency.map(latency_millis);
                tracing::trace!(event_type = event.kind(), "Event tracked");
                self.queue.enqueue(serialized);
            }
            Err(e) => {
                tracing::error!(error = %e, event_type = event.kind(), "Failed to build event, dropping it");
            }
        }
    }

    async fn handle_connectivity(&self, connectivity: Connectivity) {
        let was_online = self
            .dispatcher
            .online
            .swap(connectivity.is_online(), Ordering::SeqCst);

        match (was_online, connectivity) {
            (false, Connectivity::Online) => {
                tracing::info!("Back online, restoring offline events");
                self.restore_offline_events().await;
            }
            (true, Connectivity::Offline) => {
                tracing::info!("Went offline, batches will go to the offline cache");
            }
            _ => {}
        }
    }

    /// Re-enqueue every cached event in order, then clear the cache key
    async fn restore_offline_events(&self) -> usize {
        let queue = &self.queue;
        match self
            .dispatcher
            .cache
            .drain_with(|events| events.into_iter().for_each(|e| queue.enqueue(e)))
            .await
        {
            Ok(0) => 0,
            Ok(restored) => {
                tracing::info!(events = restored, "Restored events from offline cache");
                restored
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to restore offline cache");
                0
            }
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_startup(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.startup
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn abort_tasks(&self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }
}

impl Drop for TrackerInner {
    fn drop(&mut self) {
        self.abort_tasks();
        if let Some(startup) = self.lock_startup().take() {
            startup.abort();
        }
    }
}

/// The queue's sink: delivers online, persists offline
struct Dispatcher {
    api_key: String,
    signer: Signer,
    transport: Transport,
    cache: OfflineCache,
    online: AtomicBool,
}

impl Dispatcher {
    fn sign(&self, batch: &[SerializedEvent]) -> Result<SignedBatch> {
        let body = EventsPayload::encode(batch)?;
        let signature = self.signer.sign(body.as_bytes(), self.api_key.as_bytes());
        Ok(SignedBatch {
            body,
            signature,
            timestamp: Utc::now().timestamp(),
            len: batch.len(),
        })
    }

    async fn persist(&self, batch: &[SerializedEvent]) -> Result<()> {
        let cached = self.cache.append(batch).await?;
        tracing::info!(events = batch.len(), cached, "Batch written to offline cache");
        Ok(())
    }
}

#[async_trait]
impl BatchSink for Dispatcher {
    async fn on_flush(&self, batch: &[SerializedEvent]) -> Result<()> {
        if !self.online.load(Ordering::SeqCst) {
            return self.persist(batch).await.map_err(|e| {
                tracing::error!(error = %e, events = batch.len(), "Failed to persist offline batch");
                e
            });
        }

        let signed = self.sign(batch)?;
        match self.transport.send(&signed).await {
            Ok(()) => Ok(()),
            Err(send_err) => match self.persist(batch).await {
                Ok(()) => Ok(()),
                Err(store_err) => {
                    tracing::error!(
                        error = %store_err,
                        events = batch.len(),
                        "Failed to persist undelivered batch, keeping it in memory"
                    );
                    Err(send_err)
                }
            },
        }
    }
}

fn spawn_listener(
    tracker: Weak<TrackerInner>,
    mut rx: watch::Receiver<Connectivity>,
    runtime: &Handle,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        while rx.changed().await.is_ok() {
            let connectivity = *rx.borrow_and_update();
            let Some(tracker) = tracker.upgrade() else {
                break;
            };
            tracker.handle_connectivity(connectivity).await;
        }
    })
}

/// Whole milliseconds, saturating at `u64::MAX`
fn latency_millis(latency: Duration) -> u64 {
    u64::try_from(latency.as_millis()).unwrap_or(u64::MAX)
}

/// `<unix millis>-<9 random base-16 chars>`
fn new_session_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp_millis(), &suffix[..9])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_format() {
        let id = new_session_id();
        let (millis, suffix) = id.split_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), 9);
        assert_ne!(new_session_id(), id);
    }

    #[test]
    fn test_latency_millis_saturates() {
        assert_eq!(latency_millis(Duration::from_micros(1_500)), 1);
        assert_eq!(latency_millis(Duration::from_secs(2)), 2_000);
        assert_eq!(latency_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_build_outside_runtime_fails() {
        let result = Tracker::new(TrackerConfig::new("key", "proj"));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let result = Tracker::new(TrackerConfig::new("", "proj"));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
