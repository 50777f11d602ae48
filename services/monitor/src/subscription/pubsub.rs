use super::{
    Acknowledger, DeliveryCallback, NotificationMessage, ReceiveSettings, Subscription,
    SubscriptionError, SubscriptionSettings, TokenSource,
};
use crate::config::PubSubConfig;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const PULL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: PubsubMessage,
    #[serde(default)]
    delivery_attempt: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PubsubMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
    message_id: String,
    #[serde(default)]
    publish_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSubscriptionRequest {
    topic: String,
    ack_deadline_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    dead_letter_policy: Option<DeadLetterPolicyBody>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeadLetterPolicyBody {
    dead_letter_topic: String,
    max_delivery_attempts: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    ack_ids: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyAckDeadlineRequest<'a> {
    ack_ids: Vec<&'a str>,
    ack_deadline_seconds: u32,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

struct ClientInner {
    http: reqwest::Client,
    base_url: String,
    project: String,
    tokens: TokenSource,
    pull_timeout: Duration,
}

impl ClientInner {
    fn topic_path(&self, topic: &str) -> String {
        format!("projects/{}/topics/{}", self.project, topic)
    }

    fn subscription_path(&self, subscription: &str) -> String {
        format!("projects/{}/subscriptions/{}", self.project, subscription)
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, SubscriptionError> {
        let url = format!("{}/v1/{}", self.base_url, path);
        let mut builder = self.http.request(method, url);
        if let Some(token) = self.tokens.token(&self.http).await? {
            builder = builder.bearer_auth(token);
        }
        Ok(builder)
    }

    async fn exists(&self, path: &str) -> Result<bool, SubscriptionError> {
        let response = self.request(Method::GET, path).await?.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(response).await?;
        Ok(true)
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<Response, SubscriptionError> {
        let response = self.request(Method::POST, path).await?.json(body).send().await?;
        check(response).await
    }
}

/// Turn a non-success response into an API error carrying the server message
async fn check(response: Response) -> Result<Response, SubscriptionError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorBody>(&body)
        .map(|b| b.error.message)
        .unwrap_or(body);

    Err(SubscriptionError::Api {
        status: status.as_u16(),
        message,
    })
}

/// Cloud Pub/Sub REST client for one project
#[derive(Clone)]
pub struct PubSubClient {
    inner: Arc<ClientInner>,
}

impl PubSubClient {
    /// Create a client from configuration
    pub fn new(config: &PubSubConfig) -> Result<Self, SubscriptionError> {
        let (base_url, tokens) = match (&config.emulator_host, &config.access_token) {
            (Some(host), _) => (format!("http://{}", host), TokenSource::Anonymous),
            (None, Some(token)) => (config.endpoint.clone(), TokenSource::Static(token.clone())),
            (None, None) => (config.endpoint.clone(), TokenSource::metadata()),
        };

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        info!(
            project = %config.project,
            endpoint = %base_url,
            "Pub/Sub client initialized"
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                base_url: base_url.trim_end_matches('/').to_string(),
                project: config.project.clone(),
                tokens,
                pull_timeout: config.pull_timeout(),
            }),
        })
    }

    /// Handle for `subscription` attached to `topic`
    pub fn subscription(&self, topic: &str, subscription: &str) -> PubSubSubscription {
        let path = self.inner.subscription_path(subscription);
        PubSubSubscription {
            client: Arc::clone(&self.inner),
            topic: topic.to_string(),
            name: subscription.to_string(),
            topic_path: self.inner.topic_path(topic),
            acknowledger: Arc::new(PubSubAcknowledger {
                client: Arc::clone(&self.inner),
                path: path.clone(),
            }),
            path,
        }
    }
}

struct PubSubAcknowledger {
    client: Arc<ClientInner>,
    path: String,
}

#[async_trait]
impl Acknowledger for PubSubAcknowledger {
    async fn ack(&self, ack_id: &str) -> Result<(), SubscriptionError> {
        let body = AcknowledgeRequest {
            ack_ids: vec![ack_id],
        };
        self.client
            .post(&format!("{}:acknowledge", self.path), &body)
            .await?;
        Ok(())
    }

    async fn nack(&self, ack_id: &str) -> Result<(), SubscriptionError> {
        let body = ModifyAckDeadlineRequest {
            ack_ids: vec![ack_id],
            ack_deadline_seconds: 0,
        };
        self.client
            .post(&format!("{}:modifyAckDeadline", self.path), &body)
            .await?;
        Ok(())
    }
}

/// A Pub/Sub subscription reached over the REST API
pub struct PubSubSubscription {
    client: Arc<ClientInner>,
    topic: String,
    name: String,
    topic_path: String,
    path: String,
    acknowledger: Arc<PubSubAcknowledger>,
}

impl PubSubSubscription {
    async fn pull(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, SubscriptionError> {
        let response = self
            .client
            .request(Method::POST, &format!("{}:pull", self.path))
            .await?
            .timeout(self.client.pull_timeout)
            .json(&PullRequest { max_messages })
            .send()
            .await?;

        let pulled: PullResponse = check(response).await?.json().await?;
        Ok(pulled.received_messages)
    }

}

/// Turn a pulled message into a notification. An envelope whose data is not
/// valid base64 is nacked and its decode error returned.
async fn accept(
    received: ReceivedMessage,
    acknowledger: Arc<dyn Acknowledger>,
) -> Result<NotificationMessage, SubscriptionError> {
    let data = match STANDARD.decode(received.message.data.as_bytes()) {
        Ok(data) => data,
        Err(e) => {
            warn!(
                message_id = %received.message.message_id,
                error = %e,
                "Failed to decode message data, releasing message"
            );
            if let Err(nack_error) = acknowledger.nack(&received.ack_id).await {
                warn!(
                    message_id = %received.message.message_id,
                    error = %nack_error,
                    "Failed to nack message"
                );
            }
            return Err(SubscriptionError::Decode(format!(
                "data of message {}: {}",
                received.message.message_id, e
            )));
        }
    };

    Ok(NotificationMessage::new(
        received.message.message_id,
        received.ack_id,
        received.message.attributes,
        data,
        acknowledger,
    )
    .with_publish_time(received.message.publish_time)
    .with_delivery_attempt(received.delivery_attempt))
}

#[async_trait]
impl Subscription for PubSubSubscription {
    fn name(&self) -> &str {
        &self.name
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    async fn topic_exists(&self) -> Result<bool, SubscriptionError> {
        self.client.exists(&self.topic_path).await
    }

    async fn exists(&self) -> Result<bool, SubscriptionError> {
        self.client.exists(&self.path).await
    }

    async fn create(&self, settings: &SubscriptionSettings) -> Result<(), SubscriptionError> {
        let body = CreateSubscriptionRequest {
            topic: self.topic_path.clone(),
            ack_deadline_seconds: settings.ack_deadline.as_secs(),
            dead_letter_policy: settings.dead_letter.as_ref().map(|policy| DeadLetterPolicyBody {
                dead_letter_topic: self.client.topic_path(&policy.topic),
                max_delivery_attempts: policy.max_delivery_attempts,
            }),
        };

        let response = self
            .client
            .request(Method::PUT, &self.path)
            .await?
            .json(&body)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    #[instrument(skip(self, scope, deliver), fields(subscription = %self.name))]
    async fn receive(
        &self,
        scope: CancellationToken,
        settings: ReceiveSettings,
        mut deliver: DeliveryCallback,
    ) -> Result<(), SubscriptionError> {
        let mut delivered = 0;

        loop {
            if delivered >= settings.max_messages {
                scope.cancelled().await;
                return Err(SubscriptionError::Cancelled);
            }

            let pulled = tokio::select! {
                biased;
                _ = scope.cancelled() => return Err(SubscriptionError::Cancelled),
                pulled = self.pull(settings.max_messages - delivered) => pulled,
            };
            let pulled = match pulled {
                Ok(pulled) => pulled,
                Err(e) => {
                    // pause so a failing endpoint is not hammered by the next session
                    tokio::select! {
                        _ = scope.cancelled() => {}
                        _ = tokio::time::sleep(PULL_ERROR_BACKOFF) => {}
                    }
                    return Err(e);
                }
            };

            if pulled.is_empty() {
                debug!("Pull returned no messages");
                continue;
            }

            for received in pulled {
                delivered += 1;
                deliver(accept(received, self.acknowledger.clone()).await?);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> PubSubConfig {
        PubSubConfig {
            project: "my-project".to_string(),
            topics: vec!["uploads".to_string()],
            subscription_prefix: "gcs-monitor".to_string(),
            workers: 5,
            ack_deadline_secs: 20,
            pull_timeout_secs: 60,
            endpoint: "https://pubsub.googleapis.com/".to_string(),
            emulator_host: None,
            access_token: Some("token".to_string()),
            dead_letter_topic: None,
            max_delivery_attempts: None,
        }
    }

    #[test]
    fn test_resource_paths() {
        let client = PubSubClient::new(&test_config()).unwrap();
        let subscription = client.subscription("uploads", "gcs-monitor-uploads");

        assert_eq!(client.inner.base_url, "https://pubsub.googleapis.com");
        assert_eq!(subscription.topic_path, "projects/my-project/topics/uploads");
        assert_eq!(
            subscription.path,
            "projects/my-project/subscriptions/gcs-monitor-uploads"
        );
        assert_eq!(subscription.name(), "gcs-monitor-uploads");
        assert_eq!(subscription.topic(), "uploads");
        assert_eq!(client.inner.pull_timeout, Duration::from_secs(60));
    }

    #[derive(Default)]
    struct RecordingAcknowledger {
        nacked: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Acknowledger for RecordingAcknowledger {
        async fn ack(&self, _ack_id: &str) -> Result<(), SubscriptionError> {
            Ok(())
        }

        async fn nack(&self, ack_id: &str) -> Result<(), SubscriptionError> {
            self.nacked.lock().unwrap().push(ack_id.to_string());
            Ok(())
        }
    }

    fn received(data: &str) -> ReceivedMessage {
        ReceivedMessage {
            ack_id: "ack-7".to_string(),
            message: PubsubMessage {
                data: data.to_string(),
                attributes: HashMap::new(),
                message_id: "7".to_string(),
                publish_time: None,
            },
            delivery_attempt: Some(1),
        }
    }

    #[tokio::test]
    async fn test_undecodable_data_is_nacked() {
        let acknowledger = Arc::new(RecordingAcknowledger::default());

        let err = accept(received("not base64!"), acknowledger.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::Decode(ref m) if m.contains("message 7")));
        assert_eq!(*acknowledger.nacked.lock().unwrap(), vec!["ack-7".to_string()]);
    }

    #[tokio::test]
    async fn test_accepted_message_keeps_envelope() {
        let acknowledger = Arc::new(RecordingAcknowledger::default());

        let message = accept(received("eyJzaXplIjoiNTIzIn0="), acknowledger.clone())
            .await
            .unwrap();
        assert_eq!(message.id, "7");
        assert_eq!(message.ack_id, "ack-7");
        assert_eq!(message.delivery_attempt, Some(1));
        assert_eq!(message.data, br#"{"size":"523"}"#);
        assert!(acknowledger.nacked.lock().unwrap().is_empty());
    }

    #[test]
    fn test_emulator_host_overrides_endpoint() {
        let mut config = test_config();
        config.emulator_host = Some("localhost:8085".to_string());

        let client = PubSubClient::new(&config).unwrap();
        assert_eq!(client.inner.base_url, "http://localhost:8085");
        assert!(matches!(client.inner.tokens, TokenSource::Anonymous));
    }

    #[test]
    fn test_pull_response_deserialize() {
        let json = r#"{
            "receivedMessages": [{
                "ackId": "ack-1",
                "message": {
                    "data": "eyJzaXplIjoiNTIzIn0=",
                    "attributes": {
                        "eventType": "OBJECT_FINALIZE",
                        "bucketId": "my-bucket",
                        "payloadFormat": "JSON_API_V1"
                    },
                    "messageId": "42",
                    "publishTime": "2024-01-15T10:30:00.123Z"
                },
                "deliveryAttempt": 2
            }]
        }"#;

        let response: PullResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.received_messages.len(), 1);

        let received = &response.received_messages[0];
        assert_eq!(received.ack_id, "ack-1");
        assert_eq!(received.delivery_attempt, Some(2));
        assert_eq!(received.message.message_id, "42");
        assert!(received.message.publish_time.is_some());
        assert_eq!(
            STANDARD.decode(&received.message.data).unwrap(),
            br#"{"size":"523"}"#
        );
    }

    #[test]
    fn test_empty_pull_response() {
        let response: PullResponse = serde_json::from_str("{}").unwrap();
        assert!(response.received_messages.is_empty());
    }

    #[test]
    fn test_create_request_serialization() {
        let body = CreateSubscriptionRequest {
            topic: "projects/p/topics/t".to_string(),
            ack_deadline_seconds: 20,
            dead_letter_policy: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["ackDeadlineSeconds"], 20);
        assert!(json.get("deadLetterPolicy").is_none());

        let body = CreateSubscriptionRequest {
            dead_letter_policy: Some(DeadLetterPolicyBody {
                dead_letter_topic: "projects/p/topics/dead".to_string(),
                max_delivery_attempts: 5,
            }),
            ..body
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["deadLetterPolicy"]["maxDeliveryAttempts"], 5);
    }

    #[test]
    fn test_ack_request_serialization() {
        let json = serde_json::to_string(&ModifyAckDeadlineRequest {
            ack_ids: vec!["a"],
            ack_deadline_seconds: 0,
        })
        .unwrap();
        assert_eq!(json, r#"{"ackIds":["a"],"ackDeadlineSeconds":0}"#);
    }
}
