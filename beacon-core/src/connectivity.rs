//! Connectivity notifications
//!
//! A [`ConnectivityMonitor`] is the platform's "online/offline" signal. The
//! embedding application publishes changes into it (from an OS network
//! callback, a UI toggle, ...) and every tracker subscribed to it reacts.
//! Trackers built without a monitor never change connectivity on their own.
//!
//! [`spawn_probe`] is an optional publisher that polls the ingestion endpoint.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::transport::Transport;

/// Connectivity as last reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(&self) -> bool {
        matches!(self, Connectivity::Online)
    }
}

impl From<bool> for Connectivity {
    fn from(online: bool) -> Self {
        if online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        }
    }
}

/// Broadcasts connectivity changes to subscribed trackers
#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<Connectivity>>,
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Publish a connectivity state; repeated identical states are not re-sent
    pub fn set(&self, connectivity: Connectivity) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == connectivity {
                false
            } else {
                *current = connectivity;
                true
            }
        });
        if changed {
            tracing::info!(?connectivity, "Connectivity changed");
        }
    }

    pub fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(Connectivity::Online)
    }
}

/// Poll the endpoint every `interval` and publish the result to `monitor`
///
/// The task runs until aborted.
pub fn spawn_probe(
    monitor: ConnectivityMonitor,
    transport: Transport,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reachable = transport.health_check().await;
            tracing::trace!(reachable, endpoint = %transport.endpoint(), "Connectivity probe");
            monitor.set(Connectivity::from(reachable));
        }
    })
}
