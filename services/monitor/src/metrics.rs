//! Label-keyed metric aggregations for storage notification events.
//!
//! The registry wraps a Prometheus recorder that is owned by the application
//! instead of being installed as the global `metrics` recorder, so it can be
//! constructed per test and shared with handler tasks through an `Arc`.

use metrics::{Key, KeyName, Label, Level, Metadata, Recorder};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

/// Name of the processed event counter
pub const EVENT_COUNT: &str = "event_count";
/// Name of the zero-size event counter
pub const ZERO_SIZE_EVENT_COUNT: &str = "zero_size_event_count";
/// Name of the object size summary
pub const SIZE_SUMMARY: &str = "size_summary";

/// Errors raised while setting up metrics
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Metric already registered: {0}")]
    Duplicate(String),

    #[error("Failed to build Prometheus recorder: {0}")]
    Build(#[from] BuildError),
}

/// Replace hyphens so the value is usable in the exposition output
pub fn normalize_label(value: &str) -> String {
    value.replace('-', "_")
}

/// The (project, type, bucket) label set every observation carries
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricLabels {
    pub project: String,
    pub event_type: String,
    pub bucket: String,
}

impl MetricLabels {
    /// Build a label set, normalizing the event type and bucket
    pub fn new(project: &str, event_type: &str, bucket: &str) -> Self {
        Self {
            project: project.to_string(),
            event_type: normalize_label(event_type),
            bucket: normalize_label(bucket),
        }
    }

    fn key(&self, name: &str) -> Key {
        Key::from_parts(
            name.to_string(),
            vec![
                Label::new("project", self.project.clone()),
                Label::new("type", self.event_type.clone()),
                Label::new("bucket", self.bucket.clone()),
            ],
        )
    }
}

fn metadata() -> Metadata<'static> {
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
}

/// Owner of the Prometheus recorder and the set of registered metric names
pub struct MetricsRegistry {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    namespace: String,
    registered: Mutex<HashSet<String>>,
}

impl MetricsRegistry {
    /// Create a registry with the exporter's default summary quantiles
    pub fn new() -> Self {
        Self::from_builder(PrometheusBuilder::new())
    }

    /// Create a registry reporting the given summary quantiles
    pub fn with_quantiles(quantiles: &[f64]) -> Result<Self, MetricsError> {
        let builder = PrometheusBuilder::new().set_quantiles(quantiles)?;
        Ok(Self::from_builder(builder))
    }

    fn from_builder(builder: PrometheusBuilder) -> Self {
        let recorder = builder.build_recorder();
        let handle = recorder.handle();

        Self {
            recorder,
            handle,
            namespace: String::new(),
            registered: Mutex::new(HashSet::new()),
        }
    }

    /// Prefix every metric registered afterwards with `namespace_`
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    fn full_name(&self, name: &str) -> String {
        if self.namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}_{}", self.namespace, name)
        }
    }

    fn claim(&self, name: &str) -> Result<String, MetricsError> {
        let full_name = self.full_name(name);
        let mut registered = self
            .registered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if !registered.insert(full_name.clone()) {
            return Err(MetricsError::Duplicate(full_name));
        }

        debug!(metric = %full_name, "Registered metric");
        Ok(full_name)
    }

    /// Register a labeled counter; fails if the name is already taken
    pub fn register_counter(
        self: &Arc<Self>,
        name: &str,
        help: &'static str,
    ) -> Result<CounterVec, MetricsError> {
        let name = self.claim(name)?;
        self.recorder
            .describe_counter(KeyName::from(name.clone()), None, help.into());

        Ok(CounterVec {
            registry: Arc::clone(self),
            name,
        })
    }

    /// Register a labeled summary; fails if the name is already taken
    pub fn register_summary(
        self: &Arc<Self>,
        name: &str,
        help: &'static str,
    ) -> Result<SummaryVec, MetricsError> {
        let name = self.claim(name)?;
        self.recorder
            .describe_histogram(KeyName::from(name.clone()), None, help.into());

        Ok(SummaryVec {
            registry: Arc::clone(self),
            name,
        })
    }

    /// Render every recorded metric in the Prometheus text format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic counter partitioned by label set
pub struct CounterVec {
    registry: Arc<MetricsRegistry>,
    name: String,
}

impl CounterVec {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inc(&self, labels: &MetricLabels) {
        self.registry
            .recorder
            .register_counter(&labels.key(&self.name), &metadata())
            .increment(1);
    }
}

/// Quantile summary partitioned by label set
pub struct SummaryVec {
    registry: Arc<MetricsRegistry>,
    name: String,
}

impl SummaryVec {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn observe(&self, labels: &MetricLabels, value: f64) {
        self.registry
            .recorder
            .register_histogram(&labels.key(&self.name), &metadata())
            .record(value);
    }
}

/// Sink for the observations derived from one notification
#[cfg_attr(test, mockall::automock)]
pub trait EventRecorder: Send + Sync {
    /// Count one processed event
    fn record_event(&self, labels: &MetricLabels);

    /// Count one event whose object is empty
    fn record_zero_size(&self, labels: &MetricLabels);

    /// Observe the size in bytes of a non-empty object
    fn observe_size(&self, labels: &MetricLabels, bytes: f64);
}

/// The three storage event aggregations
pub struct EventMetrics {
    events: CounterVec,
    zero_size_events: CounterVec,
    sizes: SummaryVec,
}

impl EventMetrics {
    /// Register the event metrics; call once per registry at startup
    pub fn register(registry: &Arc<MetricsRegistry>) -> Result<Self, MetricsError> {
        Ok(Self {
            events: registry.register_counter(EVENT_COUNT, "storage notification events per bucket")?,
            zero_size_events: registry
                .register_counter(ZERO_SIZE_EVENT_COUNT, "zero-size object events per bucket")?,
            sizes: registry.register_summary(SIZE_SUMMARY, "bucket object size summary in bytes")?,
        })
    }
}

impl EventRecorder for EventMetrics {
    fn record_event(&self, labels: &MetricLabels) {
        self.events.inc(labels);
    }

    fn record_zero_size(&self, labels: &MetricLabels) {
        self.zero_size_events.inc(labels);
    }

    fn observe_size(&self, labels: &MetricLabels, bytes: f64) {
        self.sizes.observe(labels, bytes);
    }
}
