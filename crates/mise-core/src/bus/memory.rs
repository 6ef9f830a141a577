//! In-process message bus with at-least-once semantics.
//!
//! A single ready queue plus a lease table. `next()` leases a message for the
//! visibility timeout; an acked lease is gone, a nacked lease goes back to
//! the ready queue, and an expired lease is reclaimed on a later `next()`
//! call. Redeliveries get a fresh delivery id.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use super::{Delivery, Envelope, MessageConsumer, MessagePublisher};

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct QueuedMessage {
    topic: String,
    body: String,
}

#[derive(Debug)]
struct Lease {
    message: QueuedMessage,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct BusInner {
    ready: VecDeque<QueuedMessage>,
    in_flight: HashMap<Uuid, Lease>,
    closed: bool,
}

/// The bus the worker ships with: everything in one process, one queue.
#[derive(Debug)]
pub struct InProcessBus {
    inner: Mutex<BusInner>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    /// Bus with a custom lease duration. Handlers must finish (and ack)
    /// within it or the message is redelivered.
    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(BusInner::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    /// Enqueue a raw body without going through [`Envelope`] encoding.
    /// The runtime's reject path exists because of bodies like these.
    pub async fn publish_raw(&self, topic: &str, body: String) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            anyhow::bail!("bus is closed");
        }
        inner.ready.push_back(QueuedMessage {
            topic: topic.to_string(),
            body,
        });
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Stop accepting publishes. Consumers drain the remaining ready
    /// messages, then `next()` returns `None`.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Messages waiting for a consumer. For shutdown logging and tests.
    pub async fn ready_len(&self) -> usize {
        self.inner.lock().await.ready.len()
    }

    /// Messages currently leased to a handler.
    pub async fn in_flight_len(&self) -> usize {
        self.inner.lock().await.in_flight.len()
    }

    /// Move expired leases back to the ready queue. Called under the lock.
    fn reclaim_expired(inner: &mut BusInner, now: Instant) {
        let expired: Vec<Uuid> = inner
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(lease) = inner.in_flight.remove(&id) {
                inner.ready.push_back(lease.message);
            }
        }
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessagePublisher for InProcessBus {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<()> {
        let body = envelope.encode()?;
        self.publish_raw(topic, body).await
    }
}

#[async_trait]
impl MessageConsumer for InProcessBus {
    async fn next(&self) -> Result<Option<Delivery>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().await;
                Self::reclaim_expired(&mut inner, Instant::now());

                if let Some(message) = inner.ready.pop_front() {
                    let id = Uuid::new_v4();
                    let delivery = Delivery {
                        id,
                        topic: message.topic.clone(),
                        body: message.body.clone(),
                    };
                    inner.in_flight.insert(
                        id,
                        Lease {
                            message,
                            expires_at: Instant::now() + self.visibility_timeout,
                        },
                    );
                    let more_ready = !inner.ready.is_empty();
                    drop(inner);
                    if more_ready {
                        // Wake a sibling consumer, if any.
                        self.notify.notify_one();
                    }
                    return Ok(Some(delivery));
                }

                if inner.closed {
                    return Ok(None);
                }
            }

            // Waking at least every visibility timeout guarantees expired
            // leases are reclaimed even when nothing new is published.
            let _ = tokio::time::timeout(self.visibility_timeout, notified).await;
        }
    }

    async fn ack(&self, delivery_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.in_flight.remove(&delivery_id);
        Ok(())
    }

    async fn nack(&self, delivery_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(lease) = inner.in_flight.remove(&delivery_id) {
            inner.ready.push_back(lease.message);
            drop(inner);
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn reject(&self, delivery_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.in_flight.remove(&delivery_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MessageKind, WORKER_TICKS_TOPIC};

    #[tokio::test]
    async fn publish_then_next_then_ack() {
        let bus = InProcessBus::new();
        let envelope = Envelope::tick(MessageKind::TaskTick);
        bus.publish(WORKER_TICKS_TOPIC, &envelope).await.unwrap();

        let delivery = bus.next().await.unwrap().expect("one message");
        assert_eq!(delivery.topic, WORKER_TICKS_TOPIC);
        assert_eq!(Envelope::decode(&delivery.body).unwrap(), envelope);
        assert_eq!(bus.in_flight_len().await, 1);

        bus.ack(delivery.id).await.unwrap();
        assert_eq!(bus.in_flight_len().await, 0);
        assert_eq!(bus.ready_len().await, 0);
    }

    #[tokio::test]
    async fn nack_redelivers_with_fresh_id() {
        let bus = InProcessBus::new();
        bus.publish_raw(WORKER_TICKS_TOPIC, "{\"type\":\"taskTick\"}".to_string())
            .await
            .unwrap();

        let first = bus.next().await.unwrap().expect("first delivery");
        bus.nack(first.id).await.unwrap();

        let second = bus.next().await.unwrap().expect("redelivery");
        assert_eq!(second.body, first.body);
        assert_ne!(second.id, first.id, "redelivery gets a fresh id");
        bus.ack(second.id).await.unwrap();
    }

    #[tokio::test]
    async fn reject_drops_permanently() {
        let bus = InProcessBus::new();
        bus.publish_raw(WORKER_TICKS_TOPIC, "not json".to_string())
            .await
            .unwrap();

        let delivery = bus.next().await.unwrap().expect("delivery");
        bus.reject(delivery.id).await.unwrap();

        assert_eq!(bus.ready_len().await, 0);
        assert_eq!(bus.in_flight_len().await, 0);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let bus = InProcessBus::with_visibility_timeout(Duration::from_millis(20));
        bus.publish_raw(WORKER_TICKS_TOPIC, "{\"type\":\"groceryTick\"}".to_string())
            .await
            .unwrap();

        let first = bus.next().await.unwrap().expect("first delivery");
        tokio::time::sleep(Duration::from_millis(40)).await;

        // Never acked; the lease expired, so the message comes back.
        let second = bus.next().await.unwrap().expect("reclaimed delivery");
        assert_eq!(second.body, first.body);
        assert_ne!(second.id, first.id);

        // Acking the stale first id is harmless.
        bus.ack(first.id).await.unwrap();
        assert_eq!(bus.in_flight_len().await, 1);
    }

    #[tokio::test]
    async fn close_drains_ready_then_ends() {
        let bus = InProcessBus::new();
        bus.publish_raw(WORKER_TICKS_TOPIC, "{\"type\":\"taskTick\"}".to_string())
            .await
            .unwrap();
        bus.close().await;

        let drained = bus.next().await.unwrap();
        assert!(drained.is_some(), "ready messages drain after close");
        let delivery = drained.unwrap();
        bus.ack(delivery.id).await.unwrap();

        assert!(bus.next().await.unwrap().is_none(), "then the bus ends");
        assert!(
            bus.publish_raw(WORKER_TICKS_TOPIC, "{}".to_string())
                .await
                .is_err(),
            "publishing after close fails"
        );
    }

    #[tokio::test]
    async fn waiting_consumer_wakes_on_publish() {
        let bus = std::sync::Arc::new(InProcessBus::new());

        let consumer = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.next().await })
        };

        // Give the consumer a moment to start waiting.
        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.publish_raw(WORKER_TICKS_TOPIC, "{\"type\":\"finalizationTick\"}".to_string())
            .await
            .unwrap();

        let delivery = consumer
            .await
            .unwrap()
            .unwrap()
            .expect("consumer received the publish");
        assert_eq!(delivery.topic, WORKER_TICKS_TOPIC);
    }
}
