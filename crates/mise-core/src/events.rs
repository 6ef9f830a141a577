//! Analytics event sink: the post-commit side-effect consumer that
//! `dataChange` messages are forwarded to.
//!
//! The sink is best-effort. The persisted row is the source of truth, so a
//! sink failure is logged by the caller and the message is still acked.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::bus::DataChangeMessage;

/// Consumer of data-change notifications (analytics, webhooks, caches).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, message: &DataChangeMessage) -> Result<()>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn EventSink) {}
};

/// Sink that discards everything. The default when no analytics backend is
/// configured.
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn record(&self, _message: &DataChangeMessage) -> Result<()> {
        Ok(())
    }
}

/// Sink that keeps every message in memory, for tests and local inspection.
#[derive(Default)]
pub struct MemoryEventSink {
    records: Mutex<Vec<DataChangeMessage>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far, in arrival order.
    pub async fn recorded(&self) -> Vec<DataChangeMessage> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn record(&self, message: &DataChangeMessage) -> Result<()> {
        self.records.lock().await.push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn memory_sink_keeps_arrival_order() {
        let sink = MemoryEventSink::new();
        let first = DataChangeMessage::meal_plan_finalized(Uuid::new_v4(), Uuid::new_v4());
        let second = DataChangeMessage::meal_plan_finalized(Uuid::new_v4(), Uuid::new_v4());

        sink.record(&first).await.unwrap();
        sink.record(&second).await.unwrap();

        assert_eq!(sink.recorded().await, vec![first, second]);
    }

    #[tokio::test]
    async fn noop_sink_accepts_everything() {
        let sink: Box<dyn EventSink> = Box::new(NoopEventSink);
        let message = DataChangeMessage::meal_plan_finalized(Uuid::new_v4(), Uuid::new_v4());
        sink.record(&message).await.unwrap();
    }
}
