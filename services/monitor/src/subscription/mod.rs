//! Subscription handles that deliver storage notifications.
//!
//! [`Subscription`] is the seam between the consumption loop and the message
//! service. [`PubSubSubscription`] talks to Cloud Pub/Sub over its REST API;
//! [`MemorySubscription`] keeps everything in process for tests.

mod memory;
mod pubsub;
mod token;

pub use memory::{MemorySubscription, PublishedMessage};
pub use pubsub::{PubSubClient, PubSubSubscription};
pub use token::{MetadataTokens, TokenSource};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Errors returned by subscription operations
#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error("Receive session cancelled")]
    Cancelled,

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Pub/Sub API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Failed to obtain access token: {0}")]
    Auth(String),

    #[error("Malformed response: {0}")]
    Decode(String),

    #[error("Subscription unavailable: {0}")]
    Unavailable(String),
}

impl SubscriptionError {
    /// True for the error that ends a session on cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SubscriptionError::Cancelled)
    }
}

/// Settings applied when a subscription is created
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSettings {
    /// Acknowledgment deadline of delivered messages
    pub ack_deadline: Duration,
    /// Dead-letter topic and the delivery attempts before messages move there
    pub dead_letter: Option<DeadLetterPolicy>,
}

/// Where undeliverable messages go and after how many attempts
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterPolicy {
    pub topic: String,
    pub max_delivery_attempts: u32,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            ack_deadline: Duration::from_secs(20),
            dead_letter: None,
        }
    }
}

/// Per-session receive settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveSettings {
    /// Messages a session hands to its callback before it idles until cancelled
    pub max_messages: usize,
}

impl Default for ReceiveSettings {
    fn default() -> Self {
        Self { max_messages: 1 }
    }
}

/// Settles delivered messages with the message service
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Remove the message from redelivery
    async fn ack(&self, ack_id: &str) -> Result<(), SubscriptionError>;

    /// Make the message available for redelivery right away
    async fn nack(&self, ack_id: &str) -> Result<(), SubscriptionError>;
}

/// A notification delivered by a receive session
pub struct NotificationMessage {
    /// Server-assigned message id
    pub id: String,
    /// Handle used to acknowledge this delivery
    pub ack_id: String,
    /// Message attributes
    pub attributes: HashMap<String, String>,
    /// Raw payload
    pub data: Vec<u8>,
    /// Publish time, when supplied by the server
    pub publish_time: Option<DateTime<Utc>>,
    /// Delivery attempt, when the subscription has a dead-letter policy
    pub delivery_attempt: Option<u32>,
    acknowledger: Arc<dyn Acknowledger>,
    settled: AtomicBool,
}

impl NotificationMessage {
    pub fn new(
        id: impl Into<String>,
        ack_id: impl Into<String>,
        attributes: HashMap<String, String>,
        data: Vec<u8>,
        acknowledger: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            id: id.into(),
            ack_id: ack_id.into(),
            attributes,
            data,
            publish_time: None,
            delivery_attempt: None,
            acknowledger,
            settled: AtomicBool::new(false),
        }
    }

    pub fn with_publish_time(mut self, publish_time: Option<DateTime<Utc>>) -> Self {
        self.publish_time = publish_time;
        self
    }

    pub fn with_delivery_attempt(mut self, delivery_attempt: Option<u32>) -> Self {
        self.delivery_attempt = delivery_attempt;
        self
    }

    /// Attribute value, or the empty string when absent
    pub fn attribute(&self, key: &str) -> &str {
        self.attributes.get(key).map(String::as_str).unwrap_or("")
    }

    /// Whether ack or nack has been called
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Acknowledge the message. Only the first settle call reaches the server;
    /// failures are logged and the message is left to expire.
    pub async fn ack(&self) {
        if self.settled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.acknowledger.ack(&self.ack_id).await {
            warn!(message_id = %self.id, error = %e, "Failed to acknowledge message");
        }
    }

    /// Release the message for immediate redelivery
    pub async fn nack(&self) {
        if self.settled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.acknowledger.nack(&self.ack_id).await {
            warn!(message_id = %self.id, error = %e, "Failed to nack message");
        }
    }
}

impl fmt::Debug for NotificationMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationMessage")
            .field("id", &self.id)
            .field("attributes", &self.attributes)
            .field("data_len", &self.data.len())
            .field("delivery_attempt", &self.delivery_attempt)
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Callback invoked once per delivered message
pub type DeliveryCallback = Box<dyn FnMut(NotificationMessage) + Send>;

/// A named subscription on a notification topic
#[async_trait]
pub trait Subscription: Send + Sync + 'static {
    /// Subscription id
    fn name(&self) -> &str;

    /// Topic id the subscription is attached to
    fn topic(&self) -> &str;

    /// Whether the source topic exists
    async fn topic_exists(&self) -> Result<bool, SubscriptionError>;

    /// Whether the subscription exists
    async fn exists(&self) -> Result<bool, SubscriptionError>;

    /// Create the subscription against its topic
    async fn create(&self, settings: &SubscriptionSettings) -> Result<(), SubscriptionError>;

    /// Run a receive session, handing messages to `deliver` until `scope` is
    /// cancelled (`Err(Cancelled)`) or an unrecoverable error occurs. After
    /// `settings.max_messages` deliveries the session stops pulling and waits
    /// for cancellation.
    async fn receive(
        &self,
        scope: CancellationToken,
        settings: ReceiveSettings,
        deliver: DeliveryCallback,
    ) -> Result<(), SubscriptionError>;
}
