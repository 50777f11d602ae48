//! GCS Monitor
//!
//! Watches Cloud Storage buckets through their Pub/Sub notification topics and
//! exports what it sees as Prometheus metrics: an event counter per
//! project/event type/bucket, a counter of zero-size object events and a
//! summary of object sizes.
//!
//! ## Architecture
//!
//! ```text
//! Pub/Sub topics             Consumption loop             Metrics
//! ┌──────────────┐          ┌──────────────────┐        ┌──────────────┐
//! │ bucket       │  pull    │ permit pool      │        │ event_count  │
//! │ notifications│─────────▶│ one delivery per │        │ zero_size_   │
//! └──────────────┘          │ receive session  │        │  event_count │
//!                           └──────────────────┘        │ size_summary │
//!                                    │                  └──────────────┘
//!                                    ▼                         ▲
//!                           ┌──────────────────┐               │
//!                           │ Event handler    │───────────────┘
//!                           │ classify, record │
//!                           │ acknowledge      │        ┌──────────────┐
//!                           └──────────────────┘        │ GET /metrics │
//!                                                       └──────────────┘
//! ```

pub mod classifier;
pub mod config;
pub mod consumer;
pub mod handler;
pub mod metrics;
pub mod server;
pub mod subscription;

pub use classifier::{classify, Classification, ObjectDescriptor, ObjectSize};
pub use config::Config;
pub use consumer::ConsumptionLoop;
pub use handler::{provision, EventHandler, Outcome, ProvisionError};
pub use metrics::{EventMetrics, EventRecorder, MetricLabels, MetricsRegistry};
pub use server::{start_metrics_server, AppState};
pub use subscription::{
    MemorySubscription, NotificationMessage, PubSubClient, PubSubSubscription, Subscription,
    SubscriptionError, SubscriptionSettings,
};
