use anyhow::{Context, Result};
use futures::future::join_all;
use gcs_monitor::config::Config;
use gcs_monitor::consumer::ConsumptionLoop;
use gcs_monitor::handler::{provision, EventHandler};
use gcs_monitor::metrics::{EventMetrics, MetricsRegistry};
use gcs_monitor::server::{start_metrics_server, AppState};
use gcs_monitor::subscription::{DeadLetterPolicy, PubSubClient, SubscriptionSettings};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(
        service = %config.service.name,
        project = %config.pubsub.project,
        "Starting GCS monitor"
    );

    // Register metrics
    let registry = Arc::new(
        MetricsRegistry::with_quantiles(&config.metrics.quantiles)
            .context("Failed to build metrics registry")?
            .with_namespace(config.metrics.namespace.clone()),
    );
    let recorder = Arc::new(
        EventMetrics::register(&registry).context("Failed to register event metrics")?,
    );

    let settings = subscription_settings(&config);
    let handler = Arc::new(
        EventHandler::new(config.pubsub.project.clone(), recorder).with_max_delivery_attempts(
            settings.dead_letter.as_ref().map(|p| p.max_delivery_attempts),
        ),
    );

    let client = PubSubClient::new(&config.pubsub).context("Failed to initialize Pub/Sub client")?;
    let shutdown = CancellationToken::new();

    // Provision every subscription before consuming from any of them
    let mut loops = Vec::new();
    for topic in config.topics() {
        let subscription = Arc::new(client.subscription(topic, &config.subscription_id(topic)));
        provision(subscription.as_ref(), &settings)
            .await
            .with_context(|| format!("Failed to provision subscription for topic {}", topic))?;

        loops.push(Arc::new(ConsumptionLoop::new(
            subscription,
            Arc::clone(&handler),
            config.pubsub.workers,
            shutdown.clone(),
        )));
    }

    let loop_handles: Vec<_> = loops
        .iter()
        .map(|consumption| {
            let consumption = Arc::clone(consumption);
            tokio::spawn(async move { consumption.run().await })
        })
        .collect();

    // Spawn metrics server task
    let server_state = AppState {
        registry: Arc::clone(&registry),
        service: config.service.name.clone(),
    };
    let service_config = config.service.clone();
    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_metrics_server(server_state, &service_config, server_shutdown).await {
            error!(error = %e, "Metrics server error");
        }
    });

    info!(subscriptions = loops.len(), "GCS monitor started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down GCS monitor");
    shutdown.cancel();

    for result in join_all(loop_handles).await {
        if let Err(e) = result {
            error!(error = %e, "Consumption loop task failed");
        }
    }
    if let Err(e) = server_handle.await {
        error!(error = %e, "Metrics server task failed");
    }

    info!("GCS monitor stopped");

    Ok(())
}

/// Settings of subscriptions created at startup
fn subscription_settings(config: &Config) -> SubscriptionSettings {
    // Pub/Sub applies 5 attempts when a dead-letter topic comes without a limit
    let dead_letter = config
        .pubsub
        .dead_letter_topic
        .as_ref()
        .map(|topic| DeadLetterPolicy {
            topic: topic.clone(),
            max_delivery_attempts: config.pubsub.max_delivery_attempts.unwrap_or(5),
        });

    SubscriptionSettings {
        ack_deadline: config.ack_deadline(),
        dead_letter,
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
