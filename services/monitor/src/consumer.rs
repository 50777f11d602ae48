//! Bounded consumption loop for one subscription.
//!
//! Every iteration takes a permit from a fixed pool, opens a receive session
//! that accepts a single delivery and hands that delivery to a handler task.
//! The handler task cancels the session and returns the permit when it
//! finishes, so the loop never has more than `workers` messages in flight and
//! no session outlives its message.

use crate::handler::{EventHandler, Outcome};
use crate::subscription::{DeliveryCallback, NotificationMessage, ReceiveSettings, Subscription};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// Receive settings of every session opened by the loop
const SESSION_SETTINGS: ReceiveSettings = ReceiveSettings { max_messages: 1 };

/// Cancels the session and releases the permit of a finished handler task
struct SessionGuard {
    session: CancellationToken,
    message_id: String,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.cancel();
        debug!(message_id = %self.message_id, "Canceling session for message");
        drop(self.permit.take());
    }
}

/// Pulls messages from a subscription with at most `workers` in flight
pub struct ConsumptionLoop<S: Subscription + ?Sized> {
    subscription: Arc<S>,
    handler: Arc<EventHandler>,
    permits: Arc<Semaphore>,
    workers: usize,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    sessions: AtomicUsize,
    unacked: Arc<AtomicUsize>,
}

impl<S: Subscription + ?Sized> ConsumptionLoop<S> {
    pub fn new(
        subscription: Arc<S>,
        handler: Arc<EventHandler>,
        workers: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            subscription,
            handler,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            shutdown,
            tracker: TaskTracker::new(),
            sessions: AtomicUsize::new(0),
            unacked: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Permits currently held by open sessions and running handler tasks
    pub fn in_flight(&self) -> usize {
        self.workers - self.permits.available_permits()
    }

    /// Receive sessions opened so far
    pub fn sessions_opened(&self) -> usize {
        self.sessions.load(Ordering::Relaxed)
    }

    /// Handled messages that were left unacknowledged for redelivery
    pub fn unacked(&self) -> usize {
        self.unacked.load(Ordering::Relaxed)
    }

    /// Wait for every dispatched handler task to finish
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Consume until the shutdown token is cancelled
    #[instrument(skip(self), fields(subscription = %self.subscription.name(), topic = %self.subscription.topic()))]
    pub async fn run(&self) {
        info!(workers = self.workers, "Starting runner for subscription");

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let session = self.shutdown.child_token();
            self.sessions.fetch_add(1, Ordering::Relaxed);
            debug!("Receive start");

            let deliver = self.dispatcher(permit, session.clone());
            match self
                .subscription
                .receive(session, SESSION_SETTINGS, deliver)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    error!(error = %e, "Error processing message");
                }
            }

            debug!("Receive done");
        }

        info!("Consumption loop stopped");
    }

    /// Callback for one session: the first delivery takes the session's
    /// permit into a handler task, anything after it is released unprocessed
    fn dispatcher(&self, permit: OwnedSemaphorePermit, session: CancellationToken) -> DeliveryCallback {
        let mut permit = Some(permit);
        let handler = Arc::clone(&self.handler);
        let tracker = self.tracker.clone();
        let unacked = Arc::clone(&self.unacked);
        let topic = self.subscription.topic().to_string();

        Box::new(move |message: NotificationMessage| {
            debug!(topic = %topic, message_id = %message.id, "Starting message from topic");

            let Some(permit) = permit.take() else {
                warn!(
                    message_id = %message.id,
                    "Session already accepted a delivery, releasing message"
                );
                tracker.spawn(async move { message.nack().await });
                return;
            };

            let guard = SessionGuard {
                session: session.clone(),
                message_id: message.id.clone(),
                permit: Some(permit),
            };
            let handler = Arc::clone(&handler);
            let unacked = Arc::clone(&unacked);
            tracker.spawn(async move {
                let _guard = guard;
                let outcome = handler.handle(&message).await;
                if outcome == Outcome::Unacked {
                    unacked.fetch_add(1, Ordering::Relaxed);
                }
                debug!(message_id = %message.id, outcome = ?outcome, "Finished message");
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{EventRecorder, MetricLabels};
    use crate::subscription::{
        Acknowledger, MemorySubscription, PublishedMessage, SubscriptionError, SubscriptionSettings,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingRecorder {
        events: AtomicUsize,
        zero_size: AtomicUsize,
        sizes: Mutex<Vec<f64>>,
    }

    impl CountingRecorder {
        fn events(&self) -> usize {
            self.events.load(Ordering::SeqCst)
        }
    }

    impl EventRecorder for CountingRecorder {
        fn record_event(&self, _labels: &MetricLabels) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }

        fn record_zero_size(&self, _labels: &MetricLabels) {
            self.zero_size.fetch_add(1, Ordering::SeqCst);
        }

        fn observe_size(&self, _labels: &MetricLabels, bytes: f64) {
            self.sizes.lock().unwrap().push(bytes);
        }
    }

    fn json_event(payload: &str) -> PublishedMessage {
        PublishedMessage::new(payload)
            .attribute("eventType", "OBJECT_FINALIZE")
            .attribute("bucketId", "my-bucket")
            .attribute("payloadFormat", "JSON_API_V1")
    }

    fn start<S: Subscription>(
        subscription: S,
        workers: usize,
    ) -> (Arc<ConsumptionLoop<S>>, Arc<CountingRecorder>, CancellationToken) {
        let recorder = Arc::new(CountingRecorder::default());
        let handler = Arc::new(EventHandler::new("p", recorder.clone()));
        let shutdown = CancellationToken::new();
        let consumption = Arc::new(ConsumptionLoop::new(
            Arc::new(subscription),
            handler,
            workers,
            shutdown.clone(),
        ));

        let runner = Arc::clone(&consumption);
        tokio::spawn(async move { runner.run().await });

        (consumption, recorder, shutdown)
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

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_session_per_delivery() {
        let subscription = MemorySubscription::new("t", "s");
        subscription.publish(json_event(r#"{"size":"523"}"#));
        subscription.publish(json_event(r#"{"size":"0"}"#));
        subscription.publish(
            PublishedMessage::new("raw bytes")
                .attribute("eventType", "OBJECT_DELETE")
                .attribute("payloadFormat", "RAW"),
        );

        let (consumption, recorder, shutdown) = start(subscription.clone(), 5);

        wait_until(|| subscription.acked().len() == 3).await;
        // the session opened after the last delivery stays idle
        wait_until(|| subscription.sessions_opened() == 4).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(subscription.sessions_opened(), 4);
        assert_eq!(consumption.sessions_opened(), 4);
        assert_eq!(subscription.deliveries(), 3);
        assert_eq!(subscription.max_session_deliveries(), 1);
        assert_eq!(consumption.unacked(), 0);
        assert_eq!(recorder.events(), 3);
        assert_eq!(recorder.zero_size.load(Ordering::SeqCst), 1);
        assert_eq!(*recorder.sizes.lock().unwrap(), vec![523.0]);

        shutdown.cancel();
        consumption.drain().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_ceiling() {
        let subscription = MemorySubscription::new("t", "s")
            .fail_after_delivery()
            .hold_acks();
        for _ in 0..10 {
            subscription.publish(json_event(r#"{"size":"1"}"#));
        }

        let (consumption, recorder, shutdown) = start(subscription.clone(), 3);

        wait_until(|| subscription.deliveries() == 3).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(subscription.deliveries(), 3);
        assert_eq!(consumption.in_flight(), 3);

        subscription.release_acks(10);
        wait_until(|| subscription.acked().len() == 10).await;

        assert_eq!(recorder.events(), 10);
        assert!(subscription.max_outstanding() <= 3);
        assert_eq!(subscription.max_session_deliveries(), 1);

        shutdown.cancel();
        consumption.drain().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_permit_released_after_decode_error() {
        let subscription = MemorySubscription::new("t", "s");
        subscription.publish(json_event("{not json"));
        subscription.publish(json_event(r#"{"size":"10"}"#));

        let (consumption, recorder, shutdown) = start(subscription.clone(), 1);

        wait_until(|| subscription.acked().len() == 1).await;
        assert_eq!(recorder.events(), 2);
        assert_eq!(subscription.outstanding(), 1);
        assert_eq!(consumption.unacked(), 1);

        // the malformed message comes back once its deadline passes
        assert_eq!(subscription.expire_outstanding(), 1);
        wait_until(|| subscription.deliveries() == 3).await;
        wait_until(|| recorder.events() == 3).await;
        assert_eq!(subscription.acked().len(), 1);
        assert!(recorder.sizes.lock().unwrap().iter().all(|s| *s == 10.0));
        wait_until(|| consumption.unacked() == 2).await;

        wait_until(|| consumption.in_flight() <= 1).await;

        shutdown.cancel();
        consumption.drain().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_ends_loop() {
        let subscription = MemorySubscription::new("t", "s");
        let recorder = Arc::new(CountingRecorder::default());
        let handler = Arc::new(EventHandler::new("p", recorder));
        let shutdown = CancellationToken::new();
        let consumption = Arc::new(ConsumptionLoop::new(
            Arc::new(subscription.clone()),
            handler,
            2,
            shutdown.clone(),
        ));

        let runner = Arc::clone(&consumption);
        let handle = tokio::spawn(async move { runner.run().await });

        wait_until(|| subscription.sessions_opened() == 1).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
        assert_eq!(consumption.in_flight(), 0);
    }

    #[derive(Default)]
    struct CountingAcknowledger {
        acks: AtomicUsize,
        nacks: AtomicUsize,
    }

    #[async_trait]
    impl Acknowledger for CountingAcknowledger {
        async fn ack(&self, _ack_id: &str) -> Result<(), SubscriptionError> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn nack(&self, _ack_id: &str) -> Result<(), SubscriptionError> {
            self.nacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Ignores the session limit and pushes two messages into every session
    struct GreedySubscription {
        acknowledger: Arc<CountingAcknowledger>,
        sessions: AtomicUsize,
    }

    #[async_trait]
    impl Subscription for GreedySubscription {
        fn name(&self) -> &str {
            "greedy"
        }

        fn topic(&self) -> &str {
            "t"
        }

        async fn topic_exists(&self) -> Result<bool, SubscriptionError> {
            Ok(true)
        }

        async fn exists(&self) -> Result<bool, SubscriptionError> {
            Ok(true)
        }

        async fn create(&self, _settings: &SubscriptionSettings) -> Result<(), SubscriptionError> {
            Ok(())
        }

        async fn receive(
            &self,
            scope: CancellationToken,
            _settings: ReceiveSettings,
            mut deliver: DeliveryCallback,
        ) -> Result<(), SubscriptionError> {
            if self.sessions.fetch_add(1, Ordering::SeqCst) == 0 {
                for id in ["1", "2"] {
                    deliver(NotificationMessage::new(
                        id,
                        format!("ack-{}", id),
                        HashMap::new(),
                        Vec::new(),
                        self.acknowledger.clone(),
                    ));
                }
            }
            scope.cancelled().await;
            Err(SubscriptionError::Cancelled)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_extra_delivery_in_session_is_released() {
        let acknowledger = Arc::new(CountingAcknowledger::default());
        let subscription = GreedySubscription {
            acknowledger: acknowledger.clone(),
            sessions: AtomicUsize::new(0),
        };

        let (consumption, recorder, shutdown) = start(subscription, 5);

        wait_until(|| acknowledger.acks.load(Ordering::SeqCst) == 1).await;
        wait_until(|| acknowledger.nacks.load(Ordering::SeqCst) == 1).await;
        assert_eq!(recorder.events(), 1);

        shutdown.cancel();
        consumption.drain().await;
    }
}
