//! # beacon-core
//!
//! Client-side event tracking core for beacon.
//!
//! This library provides:
//! - Typed application events and their wire format
//! - Batching with size and time based flush triggers
//! - Signed delivery to an ingestion endpoint with exponential backoff
//! - An offline cache (SQLite or files) so undelivered events survive
//!   network failures, offline periods and restarts
//! - Configuration management and logging infrastructure
//!
//! Delivery is at-least-once: the ingestion endpoint should tolerate
//! duplicate events.
//!
//! ## Example
//!
//! ```rust,no_run
//! use beacon_core::event::{Event, ProductViewed};
//! use beacon_core::TrackerConfig;
//!
//! # async fn run() -> beacon_core::Result<()> {
//! let mut beacon = beacon_core::init(TrackerConfig::new("bk_live_xxxx", "shop"))?;
//!
//! beacon.track(Event::ProductViewed(ProductViewed {
//!     product_id: "sku-1".to_string(),
//!     name: "Mug".to_string(),
//!     price: 12.5,
//!     category: None,
//! }));
//!
//! beacon.destroy().await;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::{Config, Environment, TrackerConfig};
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use error::{Error, Result};
pub use event::{Event, SerializedEvent};
pub use facade::{init, Beacon, Lifecycle};
pub use tracker::{Tracker, TrackerBuilder};

// Public modules
pub mod config;
pub mod connectivity;
pub mod error;
pub mod event;
pub mod facade;
pub mod logging;
pub mod offline;
pub mod queue;
pub mod signer;
pub mod storage;
pub mod tracker;
pub mod transport;
