//! Message runtime: pulls deliveries off the bus and dispatches them to the
//! workflow handlers.
//!
//! Handlers run concurrently up to a semaphore-bounded limit, each under a
//! deadline kept at or below the bus visibility timeout so an abandoned
//! delivery is reclaimed rather than lost. A handler's error decides the
//! delivery's fate: transient failures are nacked for redelivery, malformed
//! payloads are rejected permanently. Cancellation drains in-flight handlers
//! against a fixed deadline and leaves unfinished deliveries leased; the bus
//! redelivers them after the lease expires.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use mise_db::queries::meal_plans::FinalizeOptions;

use crate::analysis::RecipeAnalyzer;
use crate::bus::{DataChangeMessage, Delivery, Envelope, MessageConsumer, MessageKind, MessagePublisher};
use crate::error::{Disposition, WorkerError};
use crate::events::EventSink;
use crate::lifecycle;
use crate::materialize::{materialize_grocery_lists, materialize_tasks};

/// How long a cancelled runtime waits for in-flight handlers.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the message runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum number of concurrently running handlers.
    pub max_concurrent_handlers: usize,
    /// Wall time limit per handler. Keep this at or below the bus visibility
    /// timeout, or a slow handler's delivery is redelivered while the
    /// handler still runs.
    pub handler_deadline: Duration,
    /// How far ahead the task materializer looks for upcoming events.
    pub task_lookahead: chrono::Duration,
    /// Winner-selection knobs applied when tallying votes.
    pub finalize: FinalizeOptions,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: 4,
            handler_deadline: Duration::from_secs(25),
            task_lookahead: chrono::Duration::days(7),
            finalize: FinalizeOptions::default(),
        }
    }
}

/// Result of running the message runtime to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeResult {
    /// The bus closed and every remaining delivery was handled.
    Drained,
    /// The runtime was interrupted by a cancellation signal.
    Interrupted,
}

/// How one delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Acked,
    Retried,
    Rejected,
    TimedOut,
    Aborted,
}

/// Message sent from spawned handler tasks back to the runtime loop.
struct HandlerDone {
    settled: Settled,
}

/// Running totals across one runtime session.
#[derive(Debug, Default, Clone, Copy)]
struct SettleTally {
    acked: usize,
    retried: usize,
    rejected: usize,
    timed_out: usize,
    aborted: usize,
}

impl SettleTally {
    fn count(&mut self, settled: Settled) {
        match settled {
            Settled::Acked => self.acked += 1,
            Settled::Retried => self.retried += 1,
            Settled::Rejected => self.rejected += 1,
            Settled::TimedOut => self.timed_out += 1,
            Settled::Aborted => self.aborted += 1,
        }
    }
}

/// The workflow handlers plus everything they need to run.
///
/// Cloned into each spawned handler task; the pool and the bus ends are
/// shared, the rest is cheap.
#[derive(Clone)]
pub struct Handlers {
    pool: PgPool,
    publisher: Arc<dyn MessagePublisher>,
    sink: Arc<dyn EventSink>,
    analyzer: RecipeAnalyzer,
    task_lookahead: chrono::Duration,
    finalize: FinalizeOptions,
}

impl Handlers {
    pub fn new(
        pool: PgPool,
        publisher: Arc<dyn MessagePublisher>,
        sink: Arc<dyn EventSink>,
        analyzer: RecipeAnalyzer,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            pool,
            publisher,
            sink,
            analyzer,
            task_lookahead: config.task_lookahead,
            finalize: config.finalize,
        }
    }

    /// Decode one delivery and run the matching handler inside a tracing
    /// span that carries the message kind and any identifiers present.
    pub async fn handle(&self, delivery: &Delivery) -> Result<(), WorkerError> {
        let payload_len = delivery.body.len();
        let envelope = Envelope::decode(&delivery.body).map_err(|e| WorkerError::Malformed {
            payload_len,
            detail: e.to_string(),
        })?;

        let span = tracing::info_span!(
            "handle_message",
            kind = %envelope.kind,
            meal_plan_id = tracing::field::Empty,
            household_id = tracing::field::Empty,
            user_id = tracing::field::Empty,
        );
        if let Some(id) = envelope.meal_plan_id {
            span.record("meal_plan_id", tracing::field::display(id));
        }
        if let Some(id) = envelope.household_id {
            span.record("household_id", tracing::field::display(id));
        }
        if let Some(id) = envelope.user_id {
            span.record("user_id", tracing::field::display(id));
        }

        self.dispatch(&envelope, payload_len).instrument(span).await
    }

    async fn dispatch(&self, envelope: &Envelope, payload_len: usize) -> Result<(), WorkerError> {
        match envelope.kind {
            MessageKind::FinalizationTick => {
                lifecycle::schedule_tally_requests(&self.pool, self.publisher.as_ref()).await?;
                Ok(())
            }
            MessageKind::TallyRequest => {
                let meal_plan_id = require_id(envelope.meal_plan_id, payload_len, "mealPlanID")?;
                let household_id = require_id(envelope.household_id, payload_len, "householdID")?;
                lifecycle::execute_tally(
                    &self.pool,
                    self.publisher.as_ref(),
                    meal_plan_id,
                    household_id,
                    &self.finalize,
                )
                .await
            }
            MessageKind::TaskTick => {
                materialize_tasks(
                    &self.pool,
                    self.publisher.as_ref(),
                    &self.analyzer,
                    self.task_lookahead,
                )
                .await?;
                Ok(())
            }
            MessageKind::GroceryTick => {
                materialize_grocery_lists(&self.pool, self.publisher.as_ref()).await?;
                Ok(())
            }
            MessageKind::DataChange => {
                let payload = envelope.payload.as_ref().ok_or_else(|| WorkerError::Malformed {
                    payload_len,
                    detail: "dataChange envelope without payload".to_string(),
                })?;
                let message: DataChangeMessage =
                    serde_json::from_value(payload.clone()).map_err(|e| WorkerError::Malformed {
                        payload_len,
                        detail: format!("invalid data change payload: {e}"),
                    })?;

                // The derived rows are the source of truth; a sink outage
                // must not push the message back onto the queue.
                if let Err(e) = self.sink.record(&message).await {
                    tracing::warn!(
                        error = %e,
                        data_type = ?message.data_type,
                        event_type = ?message.event_type,
                        "event sink rejected data change"
                    );
                }
                Ok(())
            }
        }
    }
}

/// A tally request without its identifiers cannot be retried into sense.
fn require_id(id: Option<Uuid>, payload_len: usize, field: &str) -> Result<Uuid, WorkerError> {
    id.ok_or_else(|| WorkerError::Malformed {
        payload_len,
        detail: format!("tallyRequest envelope missing {field}"),
    })
}

/// Consumes bus deliveries and runs handlers until the bus closes or the
/// cancellation token fires.
pub struct MessageRuntime {
    consumer: Arc<dyn MessageConsumer>,
    handlers: Handlers,
    config: RuntimeConfig,
}

impl MessageRuntime {
    pub fn new(consumer: Arc<dyn MessageConsumer>, handlers: Handlers, config: RuntimeConfig) -> Self {
        Self {
            consumer,
            handlers,
            config,
        }
    }

    /// Run the dispatch loop.
    ///
    /// Steps:
    /// 1. Check cancellation; on shutdown, drain in-flight handlers against
    ///    a deadline and return.
    /// 2. Collect finished handler results (non-blocking).
    /// 3. Wait for the next delivery; a closed bus drains and returns.
    /// 4. Acquire a concurrency permit and spawn the handler.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RuntimeResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_handlers));
        let (tx, mut rx) = mpsc::channel::<HandlerDone>(self.config.max_concurrent_handlers * 2);
        let mut in_flight: usize = 0;
        let mut tally = SettleTally::default();

        loop {
            // 1. Shutdown requested: drain what is running, leave the rest
            //    leased for redelivery.
            if cancel.is_cancelled() {
                let drain_deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
                while in_flight > 0 {
                    match tokio::time::timeout_at(drain_deadline, rx.recv()).await {
                        Ok(Some(done)) => {
                            in_flight -= 1;
                            tally.count(done.settled);
                        }
                        _ => break,
                    }
                }
                if in_flight > 0 {
                    tracing::warn!(
                        remaining = in_flight,
                        "drain deadline expired with handlers still in flight"
                    );
                }
                log_session(&tally, "message runtime interrupted");
                return Ok(RuntimeResult::Interrupted);
            }

            // 2. Collect finished handlers (non-blocking).
            while let Ok(done) = rx.try_recv() {
                in_flight -= 1;
                tally.count(done.settled);
            }

            // 3. Wait for work.
            let next = tokio::select! {
                next = self.consumer.next() => next?,
                _ = cancel.cancelled() => continue,
            };
            let Some(delivery) = next else {
                while in_flight > 0 {
                    let Some(done) = rx.recv().await else {
                        break;
                    };
                    in_flight -= 1;
                    tally.count(done.settled);
                }
                log_session(&tally, "message runtime drained");
                return Ok(RuntimeResult::Drained);
            };

            // 4. Spawn the handler under a concurrency permit.
            let permit = semaphore.clone().acquire_owned().await?;
            let consumer = Arc::clone(&self.consumer);
            let handlers = self.handlers.clone();
            let deadline = self.config.handler_deadline;
            let handler_cancel = cancel.clone();
            let tx_clone = tx.clone();
            in_flight += 1;

            tokio::spawn(async move {
                let settled = tokio::select! {
                    settled = settle_delivery(consumer.as_ref(), &handlers, &delivery, deadline) => settled,
                    _ = handler_cancel.cancelled() => {
                        tracing::warn!(
                            delivery_id = %delivery.id,
                            topic = %delivery.topic,
                            "handler aborted by shutdown, leaving delivery leased"
                        );
                        Settled::Aborted
                    }
                };
                drop(permit);
                let _ = tx_clone.send(HandlerDone { settled }).await;
            });
        }
    }
}

/// Run one handler under its deadline and settle the delivery accordingly.
async fn settle_delivery(
    consumer: &dyn MessageConsumer,
    handlers: &Handlers,
    delivery: &Delivery,
    deadline: Duration,
) -> Settled {
    let outcome = match tokio::time::timeout(deadline, handlers.handle(delivery)).await {
        Ok(outcome) => outcome,
        Err(_elapsed) => {
            tracing::warn!(
                delivery_id = %delivery.id,
                topic = %delivery.topic,
                "handler deadline expired, leaving delivery for lease reclaim"
            );
            return Settled::TimedOut;
        }
    };

    match outcome {
        Ok(()) => {
            if let Err(e) = consumer.ack(delivery.id).await {
                tracing::warn!(delivery_id = %delivery.id, error = %e, "failed to ack delivery");
            }
            Settled::Acked
        }
        Err(err) => match err.disposition() {
            Disposition::Retry => {
                tracing::warn!(
                    delivery_id = %delivery.id,
                    topic = %delivery.topic,
                    error = %err,
                    "handler failed, requeueing delivery"
                );
                if let Err(e) = consumer.nack(delivery.id).await {
                    tracing::warn!(delivery_id = %delivery.id, error = %e, "failed to nack delivery");
                }
                Settled::Retried
            }
            Disposition::Reject => {
                tracing::error!(
                    delivery_id = %delivery.id,
                    topic = %delivery.topic,
                    payload_len = delivery.body.len(),
                    error = %err,
                    "rejecting malformed delivery"
                );
                if let Err(e) = consumer.reject(delivery.id).await {
                    tracing::warn!(delivery_id = %delivery.id, error = %e, "failed to reject delivery");
                }
                Settled::Rejected
            }
        },
    }
}

fn log_session(tally: &SettleTally, message: &str) {
    tracing::info!(
        acked = tally.acked,
        retried = tally.retried,
        rejected = tally.rejected,
        timed_out = tally.timed_out,
        aborted = tally.aborted,
        "{message}"
    );
}
