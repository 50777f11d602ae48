use super::{
    Acknowledger, DeliveryCallback, NotificationMessage, ReceiveSettings, Subscription,
    SubscriptionError, SubscriptionSettings,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// A message published to an in-memory subscription
#[derive(Debug, Clone, Default)]
pub struct PublishedMessage {
    pub attributes: HashMap<String, String>,
    pub data: Vec<u8>,
}

impl PublishedMessage {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            attributes: HashMap::new(),
            data: data.into(),
        }
    }

    pub fn attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    message: PublishedMessage,
    delivery_attempt: u32,
}

#[derive(Default)]
struct State {
    topic_exists: bool,
    settings: Option<SubscriptionSettings>,
    queue: VecDeque<StoredMessage>,
    outstanding: HashMap<String, StoredMessage>,
    acked: Vec<String>,
    dead_lettered: Vec<String>,
    next_id: u64,
    sessions: usize,
    deliveries: usize,
    max_session_deliveries: usize,
    max_outstanding: usize,
    fail_after_delivery: bool,
}

struct Inner {
    name: String,
    topic: String,
    state: Mutex<State>,
    available: Notify,
    ack_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Put a delivered message back, or dead-letter it when it used up its attempts
    fn requeue(&self, state: &mut State, stored: StoredMessage) {
        let exhausted = state
            .settings
            .as_ref()
            .and_then(|s| s.dead_letter.as_ref())
            .is_some_and(|policy| stored.delivery_attempt >= policy.max_delivery_attempts);

        if exhausted {
            debug!(message_id = %stored.id, "Dead-lettering message");
            state.dead_lettered.push(stored.id);
        } else {
            state.queue.push_back(stored);
            self.available.notify_one();
        }
    }
}

#[async_trait]
impl Acknowledger for Inner {
    async fn ack(&self, ack_id: &str) -> Result<(), SubscriptionError> {
        let gate = self
            .ack_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|e| SubscriptionError::Unavailable(e.to_string()))?
                .forget();
        }

        let mut state = self.state();
        if let Some(stored) = state.outstanding.remove(ack_id) {
            state.acked.push(stored.id);
        }
        Ok(())
    }

    async fn nack(&self, ack_id: &str) -> Result<(), SubscriptionError> {
        let mut state = self.state();
        if let Some(stored) = state.outstanding.remove(ack_id) {
            self.requeue(&mut state, stored);
        }
        Ok(())
    }
}

/// In-process subscription with deadline expiry and delivery instrumentation
#[derive(Clone)]
pub struct MemorySubscription {
    inner: Arc<Inner>,
}

impl MemorySubscription {
    /// An existing topic without a subscription yet
    pub fn new(topic: &str, name: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                topic: topic.to_string(),
                state: Mutex::new(State {
                    topic_exists: true,
                    ..Default::default()
                }),
                available: Notify::new(),
                ack_gate: Mutex::new(None),
            }),
        }
    }

    /// Pretend the source topic does not exist
    pub fn without_topic(self) -> Self {
        self.inner.state().topic_exists = false;
        self
    }

    /// End every receive session with an error right after its delivery
    pub fn fail_after_delivery(self) -> Self {
        self.inner.state().fail_after_delivery = true;
        self
    }

    /// Block acknowledgments until [`release_acks`](Self::release_acks) is called
    pub fn hold_acks(self) -> Self {
        *self
            .inner
            .ack_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Let `count` held acknowledgments complete
    pub fn release_acks(&self, count: usize) {
        if let Some(gate) = self
            .inner
            .ack_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
        {
            gate.add_permits(count);
        }
    }

    /// Publish a message and return its id
    pub fn publish(&self, message: PublishedMessage) -> String {
        let mut state = self.inner.state();
        state.next_id += 1;
        let id = state.next_id.to_string();
        state.queue.push_back(StoredMessage {
            id: id.clone(),
            message,
            delivery_attempt: 0,
        });
        drop(state);

        self.inner.available.notify_one();
        id
    }

    /// Simulate the acknowledgment deadline passing for every outstanding
    /// delivery; returns how many messages were released
    pub fn expire_outstanding(&self) -> usize {
        let mut state = self.inner.state();
        let expired: Vec<_> = state.outstanding.drain().map(|(_, stored)| stored).collect();
        let count = expired.len();
        for stored in expired {
            self.inner.requeue(&mut state, stored);
        }
        count
    }

    pub fn sessions_opened(&self) -> usize {
        self.inner.state().sessions
    }

    pub fn deliveries(&self) -> usize {
        self.inner.state().deliveries
    }

    /// Largest number of messages a single session delivered
    pub fn max_session_deliveries(&self) -> usize {
        self.inner.state().max_session_deliveries
    }

    /// Largest number of deliveries that were unacknowledged at the same time
    pub fn max_outstanding(&self) -> usize {
        self.inner.state().max_outstanding
    }

    /// Ids of acknowledged messages, in acknowledgment order
    pub fn acked(&self) -> Vec<String> {
        self.inner.state().acked.clone()
    }

    /// Delivered messages that are neither acknowledged nor expired
    pub fn outstanding(&self) -> usize {
        self.inner.state().outstanding.len()
    }

    /// Messages waiting for delivery
    pub fn pending(&self) -> usize {
        self.inner.state().queue.len()
    }

    pub fn dead_lettered(&self) -> Vec<String> {
        self.inner.state().dead_lettered.clone()
    }

    /// Settings the subscription was created with, if it was created
    pub fn settings(&self) -> Option<SubscriptionSettings> {
        self.inner.state().settings.clone()
    }

    fn take_next(&self) -> Option<NotificationMessage> {
        let mut state = self.inner.state();
        let mut stored = state.queue.pop_front()?;
        stored.delivery_attempt += 1;
        state.deliveries += 1;

        let ack_id = Uuid::new_v4().to_string();
        state.outstanding.insert(ack_id.clone(), stored.clone());
        state.max_outstanding = state.max_outstanding.max(state.outstanding.len());
        drop(state);

        let acknowledger: Arc<dyn Acknowledger> = self.inner.clone();
        Some(
            NotificationMessage::new(
                stored.id,
                ack_id,
                stored.message.attributes,
                stored.message.data,
                acknowledger,
            )
            .with_publish_time(Some(Utc::now()))
            .with_delivery_attempt(Some(stored.delivery_attempt)),
        )
    }

    async fn next_message(&self) -> NotificationMessage {
        loop {
            if let Some(message) = self.take_next() {
                return message;
            }
            self.inner.available.notified().await;
        }
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn topic(&self) -> &str {
        &self.inner.topic
    }

    async fn topic_exists(&self) -> Result<bool, SubscriptionError> {
        Ok(self.inner.state().topic_exists)
    }

    async fn exists(&self) -> Result<bool, SubscriptionError> {
        Ok(self.inner.state().settings.is_some())
    }

    async fn create(&self, settings: &SubscriptionSettings) -> Result<(), SubscriptionError> {
        let mut state = self.inner.state();
        if !state.topic_exists {
            return Err(SubscriptionError::Api {
                status: 404,
                message: format!("topic {} not found", self.inner.topic),
            });
        }
        if state.settings.is_some() {
            return Err(SubscriptionError::Api {
                status: 409,
                message: format!("subscription {} already exists", self.inner.name),
            });
        }
        state.settings = Some(settings.clone());
        Ok(())
    }

    async fn receive(
        &self,
        scope: CancellationToken,
        settings: ReceiveSettings,
        mut deliver: DeliveryCallback,
    ) -> Result<(), SubscriptionError> {
        let fail_after_delivery = {
            let mut state = self.inner.state();
            state.sessions += 1;
            state.fail_after_delivery
        };
        let mut delivered = 0;

        loop {
            if delivered >= settings.max_messages {
                scope.cancelled().await;
                return Err(SubscriptionError::Cancelled);
            }

            let message = tokio::select! {
                biased;
                _ = scope.cancelled() => return Err(SubscriptionError::Cancelled),
                message = self.next_message() => message,
            };

            delivered += 1;
            {
                let mut state = self.inner.state();
                state.max_session_deliveries = state.max_session_deliveries.max(delivered);
            }
            deliver(message);

            if fail_after_delivery {
                return Err(SubscriptionError::Unavailable(
                    "session failed after delivery".to_string(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::DeadLetterPolicy;
    use std::time::Duration;

    fn collect_one(subscription: &MemorySubscription) -> (CancellationToken, Arc<Mutex<Vec<NotificationMessage>>>) {
        let scope = CancellationToken::new();
        let received = Arc::new(Mutex::new(Vec::new()));

        let sink = received.clone();
        let session_scope = scope.clone();
        let subscription = subscription.clone();
        tokio::spawn(async move {
            let _ = subscription
                .receive(
                    session_scope,
                    ReceiveSettings::default(),
                    Box::new(move |m: NotificationMessage| sink.lock().unwrap().push(m)),
                )
                .await;
        });

        (scope, received)
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_session_delivers_at_most_max_messages() {
        let subscription = MemorySubscription::new("t", "s");
        subscription.publish(PublishedMessage::new("a"));
        subscription.publish(PublishedMessage::new("b"));

        let (scope, received) = collect_one(&subscription);
        wait_until(|| received.lock().unwrap().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(received.lock().unwrap().len(), 1);
        assert_eq!(subscription.pending(), 1);
        assert_eq!(subscription.max_session_deliveries(), 1);
        scope.cancel();
    }

    #[tokio::test]
    async fn test_cancelled_session_returns_cancelled() {
        let subscription = MemorySubscription::new("t", "s");
        let scope = CancellationToken::new();
        scope.cancel();

        let result = subscription
            .receive(scope, ReceiveSettings::default(), Box::new(|_: NotificationMessage| {}))
            .await;
        assert!(matches!(result, Err(SubscriptionError::Cancelled)));
        assert_eq!(subscription.sessions_opened(), 1);
    }

    #[tokio::test]
    async fn test_ack_and_expiry() {
        let subscription = MemorySubscription::new("t", "s");
        let id = subscription.publish(PublishedMessage::new("a"));

        let (scope, received) = collect_one(&subscription);
        wait_until(|| received.lock().unwrap().len() == 1).await;
        scope.cancel();

        assert_eq!(subscription.outstanding(), 1);
        assert_eq!(subscription.expire_outstanding(), 1);
        assert_eq!(subscription.pending(), 1);

        let (scope, received) = collect_one(&subscription);
        wait_until(|| received.lock().unwrap().len() == 1).await;
        let message = received.lock().unwrap().pop().unwrap();
        assert_eq!(message.id, id);
        assert_eq!(message.delivery_attempt, Some(2));

        message.ack().await;
        assert_eq!(subscription.acked(), vec![id]);
        assert_eq!(subscription.outstanding(), 0);
        scope.cancel();
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_attempts() {
        let subscription = MemorySubscription::new("t", "s");
        subscription
            .create(&SubscriptionSettings {
                ack_deadline: Duration::from_secs(20),
                dead_letter: Some(DeadLetterPolicy {
                    topic: "dead".to_string(),
                    max_delivery_attempts: 2,
                }),
            })
            .await
            .unwrap();
        let id = subscription.publish(PublishedMessage::new("a"));

        for _ in 0..2 {
            let (scope, received) = collect_one(&subscription);
            wait_until(|| received.lock().unwrap().len() == 1).await;
            scope.cancel();
            subscription.expire_outstanding();
        }

        assert_eq!(subscription.dead_lettered(), vec![id]);
        assert_eq!(subscription.pending(), 0);
    }

    #[tokio::test]
    async fn test_create_requires_topic() {
        let subscription = MemorySubscription::new("t", "s").without_topic();
        assert!(!subscription.topic_exists().await.unwrap());
        assert!(subscription
            .create(&SubscriptionSettings::default())
            .await
            .is_err());
        assert!(!subscription.exists().await.unwrap());
    }
}
