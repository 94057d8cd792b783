//! Typed application events and their wire form
//!
//! Applications report [`Event`] values. Each variant carries a fixed payload
//! struct, so the mapping from event type to payload shape is checked by the
//! compiler. At `track()` time an event is turned into a [`SerializedEvent`],
//! which is what the queue, the offline cache and the ingestion endpoint see:
//!
//! ```json
//! {
//!   "type": "product_viewed",
//!   "data": { "productId": "sku-1", "name": "Mug", "price": 12.5,
//!             "sessionId": "1718000000000-k3j9x0a1b", "timestamp": 1718000000123 },
//!   "timestamp": 1718000000123,
//!   "sdkVersion": "0.1.0"
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Version stamped on every serialized event
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A discrete occurrence reported by the embedding application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    UserSignup(UserSignup),
    UserLogin(UserLogin),
    UserIdentified(UserIdentified),
    PageViewed(PageViewed),
    ProductViewed(ProductViewed),
    ProductAddedToCart(ProductAddedToCart),
    CheckoutStarted(CheckoutStarted),
    OrderCreated(OrderCreated),
    PaymentFailed(PaymentFailed),
    SubscriptionStarted(SubscriptionStarted),
    ErrorOccurred(ErrorOccurred),
}

impl Event {
    /// Wire name of the event type
    pub fn kind(&self) -> &'static str {
        match self {
            Event::UserSignup(_) => "user_signup",
            Event::UserLogin(_) => "user_login",
            Event::UserIdentified(_) => "user_identified",
            Event::PageViewed(_) => "page_viewed",
            Event::ProductViewed(_) => "product_viewed",
            Event::ProductAddedToCart(_) => "product_added_to_cart",
            Event::CheckoutStarted(_) => "checkout_started",
            Event::OrderCreated(_) => "order_created",
            Event::PaymentFailed(_) => "payment_failed",
            Event::SubscriptionStarted(_) => "subscription_started",
            Event::ErrorOccurred(_) => "error_occurred",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSignup {
    pub user_id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLogin {
    pub user_id: String,
    /// Login method (password, oauth, magic_link, ...)
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentified {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub traits: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageViewed {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductViewed {
    pub product_id: String,
    pub name: String,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductAddedToCart {
    pub product_id: String,
    pub quantity: u32,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutStarted {
    pub cart_id: String,
    pub item_count: u32,
    pub total: f64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: String,
    pub total: f64,
    pub currency: String,
    pub item_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentFailed {
    pub order_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStarted {
    pub plan: String,
    pub amount: f64,
    /// Billing interval (month, year)
    pub interval: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorOccurred {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Metadata merged into every event payload at `track()` time
#[derive(Debug, Clone)]
pub struct EventContext<'a> {
    pub session_id: &'a str,
    pub user_id: Option<&'a str>,
    pub tracked_at: DateTime<Utc>,
}

/// Wire and storage form of an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedEvent {
    /// Event type (user_signup, order_created, ...)
    #[serde(rename = "type")]
    pub event_type: String,

    /// Event payload plus `sessionId` and `timestamp`
    pub data: Value,

    /// Unix milliseconds at `track()` time
    pub timestamp: i64,

    pub sdk_version: String,

    /// Caller-measured latency in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<u64>,
}

impl SerializedEvent {
    /// Build the wire form of `event`, stamping session and time metadata
    pub fn from_event(event: &Event, ctx: &EventContext<'_>) -> Result<Self> {
        let timestamp = ctx.tracked_at.timestamp_millis();

        let mut envelope = serde_json::to_value(event)?;
        let mut data = envelope
            .get_mut("data")
            .map(Value::take)
            .unwrap_or_else(|| Value::Object(Map::new()));

        let fields = data.as_object_mut().ok_or_else(|| {
            <serde_json::Error as serde::ser::Error>::custom(format!(
                "{} payload is not an object",
                event.kind()
            ))
        })?;
        fields.insert(
            "sessionId".to_string(),
            Value::String(ctx.session_id.to_string()),
        );
        fields.insert("timestamp".to_string(), Value::from(timestamp));
        if let Some(user_id) = ctx.user_id {
            fields
                .entry("userId")
                .or_insert_with(|| Value::String(user_id.to_string()));
        }

        Ok(SerializedEvent {
            event_type: event.kind().to_string(),
            data,
            timestamp,
            sdk_version: SDK_VERSION.to_string(),
            latency: None,
        })
    }

    /// Session the event was tracked under
    pub fn session_id(&self) -> Option<&str> {
        self.data.get("sessionId").and_then(Value::as_str)
    }
}

/// Request body for POST <endpoint>
#[derive(Debug, Serialize)]
pub struct EventsPayload<'a> {
    pub events: &'a [SerializedEvent],
}

impl EventsPayload<'_> {
    /// Encode a batch into the exact body that is signed and transmitted
    pub fn encode(events: &[SerializedEvent]) -> Result<String> {
        Ok(serde_json::to_string(&EventsPayload { events })?)
    }
}
