use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Main configuration for the monitor
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Pub/Sub configuration
    pub pubsub: PubSubConfig,
    /// Metric naming configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Address the /metrics endpoint binds to
    #[serde(default = "default_metrics_host")]
    pub metrics_host: String,
    /// Port the /metrics endpoint listens on
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Pub/Sub subscription configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PubSubConfig {
    /// Project the topics and subscriptions live in
    pub project: String,
    /// Notification topics to monitor, one subscription each
    #[serde(default)]
    pub topics: Vec<String>,
    /// Prefix of the subscription id created per topic
    #[serde(default = "default_subscription_prefix")]
    pub subscription_prefix: String,
    /// Maximum number of messages handled concurrently per subscription
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Acknowledgment deadline set on newly created subscriptions
    #[serde(default = "default_ack_deadline_secs")]
    pub ack_deadline_secs: u32,
    /// HTTP timeout of a single pull request
    #[serde(default = "default_pull_timeout_secs")]
    pub pull_timeout_secs: u64,
    /// Pub/Sub API endpoint
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Emulator host:port; disables authentication when set
    pub emulator_host: Option<String>,
    /// Static OAuth access token; the metadata server is used when absent
    pub access_token: Option<String>,
    /// Topic receiving messages that exceeded max_delivery_attempts
    pub dead_letter_topic: Option<String>,
    /// Delivery attempts before a message is dead-lettered
    pub max_delivery_attempts: Option<u32>,
}

/// Metric naming configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Prefix prepended to every metric name
    #[serde(default)]
    pub namespace: String,
    /// Quantiles reported by the size summary
    #[serde(default = "default_quantiles")]
    pub quantiles: Vec<f64>,
}

// Default value functions
fn default_service_name() -> String {
    "gcs-monitor".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_host() -> String {
    "0.0.0.0".to_string()
}

fn default_metrics_port() -> u16 {
    9142
}

fn default_subscription_prefix() -> String {
    "gcs-monitor".to_string()
}

fn default_workers() -> usize {
    5
}

fn default_ack_deadline_secs() -> u32 {
    20
}

fn default_pull_timeout_secs() -> u64 {
    60
}

fn default_endpoint() -> String {
    "https://pubsub.googleapis.com".to_string()
}

fn default_quantiles() -> Vec<f64> {
    vec![0.5, 0.9, 0.99]
}

impl Config {
    /// Load configuration from config files and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/gcs-monitor").required(false))
            .add_source(config::File::with_name("/etc/gcs-monitor/config").required(false));

        Self::from_builder(builder)
    }

    /// Finish a builder with the environment overrides and deserialize it
    pub fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        let config = builder
            .set_default("service.name", default_service_name())?
            .set_default("service.log_level", default_log_level())?
            .set_default("service.metrics_port", i64::from(default_metrics_port()))?
            // GCS_MONITOR__PUBSUB__PROJECT -> pubsub.project
            .add_source(
                config::Environment::with_prefix("GCS_MONITOR")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("pubsub.topics")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = config.try_deserialize()?;
        if config.pubsub.emulator_host.is_none() {
            config.pubsub.emulator_host = std::env::var("PUBSUB_EMULATOR_HOST").ok();
        }

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pubsub = &self.pubsub;

        if pubsub.project.is_empty() {
            return Err(ConfigError::MissingRequired("pubsub.project".to_string()));
        }

        if pubsub.topics.iter().all(|t| t.trim().is_empty()) {
            return Err(ConfigError::MissingRequired("pubsub.topics".to_string()));
        }

        if pubsub.workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "pubsub.workers".to_string(),
                message: "must be a positive integer".to_string(),
            });
        }

        if !(10..=600).contains(&pubsub.ack_deadline_secs) {
            return Err(ConfigError::InvalidValue {
                key: "pubsub.ack_deadline_secs".to_string(),
                message: format!("{} is outside 10..=600", pubsub.ack_deadline_secs),
            });
        }

        if let Some(attempts) = pubsub.max_delivery_attempts {
            if !(5..=100).contains(&attempts) {
                return Err(ConfigError::InvalidValue {
                    key: "pubsub.max_delivery_attempts".to_string(),
                    message: format!("{} is outside 5..=100", attempts),
                });
            }
            if pubsub.dead_letter_topic.is_none() {
                return Err(ConfigError::MissingRequired(
                    "pubsub.dead_letter_topic (required with max_delivery_attempts)".to_string(),
                ));
            }
        }

        if self.metrics.quantiles.iter().any(|q| !(0.0..=1.0).contains(q)) {
            return Err(ConfigError::InvalidValue {
                key: "metrics.quantiles".to_string(),
                message: "quantiles must be within 0.0..=1.0".to_string(),
            });
        }

        Ok(())
    }

    /// Configured topics with blanks removed
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.pubsub
            .topics
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
    }

    /// Subscription id used for a topic
    pub fn subscription_id(&self, topic: &str) -> String {
        format!("{}-{}", self.pubsub.subscription_prefix, topic)
    }

    /// Get the acknowledgment deadline as Duration
    pub fn ack_deadline(&self) -> Duration {
        Duration::from_secs(u64::from(self.pubsub.ack_deadline_secs))
    }
}

impl PubSubConfig {
    /// Get the pull request timeout as Duration
    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_host: default_metrics_host(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            quantiles: default_quantiles(),
        }
    }
}
