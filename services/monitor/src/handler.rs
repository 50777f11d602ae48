use crate::classifier::{classify, ObjectSize};
use crate::metrics::{EventRecorder, MetricLabels};
use crate::subscription::{NotificationMessage, Subscription, SubscriptionError, SubscriptionSettings};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Errors that stop a subscription from being set up
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Topic {0} does not exist")]
    TopicNotFound(String),

    #[error("Failed to look up {what}: {source}")]
    Lookup {
        what: String,
        #[source]
        source: SubscriptionError,
    },

    #[error("Failed to create subscription {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: SubscriptionError,
    },
}

/// Verify the topic exists and create the subscription if it is missing
#[instrument(skip(subscription, settings), fields(topic = %subscription.topic(), subscription = %subscription.name()))]
pub async fn provision<S: Subscription + ?Sized>(
    subscription: &S,
    settings: &SubscriptionSettings,
) -> Result<(), ProvisionError> {
    info!("Initializing subscription");

    let topic_exists = subscription
        .topic_exists()
        .await
        .map_err(|source| ProvisionError::Lookup {
            what: format!("topic {}", subscription.topic()),
            source,
        })?;
    if !topic_exists {
        return Err(ProvisionError::TopicNotFound(subscription.topic().to_string()));
    }

    let exists = subscription
        .exists()
        .await
        .map_err(|source| ProvisionError::Lookup {
            what: format!("subscription {}", subscription.name()),
            source,
        })?;
    if exists {
        debug!("Reusing existing subscription");
        return Ok(());
    }

    subscription
        .create(settings)
        .await
        .map_err(|source| ProvisionError::Create {
            name: subscription.name().to_string(),
            source,
        })?;

    info!(
        ack_deadline_secs = settings.ack_deadline.as_secs(),
        dead_letter_topic = settings.dead_letter.as_ref().map(|p| p.topic.as_str()),
        "Created subscription"
    );

    Ok(())
}

/// How a handled message was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Metrics recorded and the message acknowledged
    Acked,
    /// The payload did not decode; the message is left to expire
    Unacked,
}

/// Turns notifications into metric observations
pub struct EventHandler {
    project: String,
    recorder: Arc<dyn EventRecorder>,
    max_delivery_attempts: Option<u32>,
}

impl EventHandler {
    pub fn new(project: impl Into<String>, recorder: Arc<dyn EventRecorder>) -> Self {
        Self {
            project: project.into(),
            recorder,
            max_delivery_attempts: None,
        }
    }

    /// Delivery attempts after which the server dead-letters a message
    pub fn with_max_delivery_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_delivery_attempts = attempts;
        self
    }

    /// Record metrics for one message and acknowledge it unless its payload is malformed
    pub async fn handle(&self, message: &NotificationMessage) -> Outcome {
        let classification = classify(message);
        let labels = MetricLabels::new(
            &self.project,
            classification.event_type,
            classification.bucket,
        );

        self.recorder.record_event(&labels);

        if let Some(descriptor) = &classification.descriptor {
            debug!(
                message_id = %message.id,
                object = ?descriptor.name,
                generation = ?descriptor.generation,
                content_type = ?descriptor.content_type,
                size = descriptor.size,
                "Storage object event"
            );
        }

        match classification.object {
            ObjectSize::Bytes(size) => self.recorder.observe_size(&labels, size as f64),
            ObjectSize::Empty => self.recorder.record_zero_size(&labels),
            ObjectSize::NotDescribed => {}
            ObjectSize::Malformed(e) => {
                error!(
                    message_id = %message.id,
                    error = %e,
                    "Error unmarshalling json payload"
                );
                if let (Some(attempt), Some(max)) = (message.delivery_attempt, self.max_delivery_attempts) {
                    if attempt >= max {
                        warn!(
                            message_id = %message.id,
                            delivery_attempt = attempt,
                            "Message reached max delivery attempts and will be dead-lettered"
                        );
                    }
                }
                return Outcome::Unacked;
            }
        }

        message.ack().await;
        Outcome::Acked
    }
}
