//! `mise-worker run` command: the long-running worker process.
//!
//! Wires the in-process bus, the workflow handlers, and three interval
//! timers that publish the periodic tick messages. Ctrl-c cancels the
//! runtime, which drains in-flight handlers before returning.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use mise_core::analysis::RecipeAnalyzer;
use mise_core::bus::memory::InProcessBus;
use mise_core::bus::{Envelope, MessageKind, MessagePublisher, WORKER_TICKS_TOPIC};
use mise_core::events::NoopEventSink;
use mise_core::runtime::{Handlers, MessageRuntime, RuntimeResult};

use crate::config::WorkerSection;

/// Start the runtime and block until ctrl-c.
pub async fn run_worker(pool: &PgPool, worker: &WorkerSection) -> Result<()> {
    let bus = Arc::new(InProcessBus::with_visibility_timeout(
        worker.visibility_timeout(),
    ));
    let runtime_config = worker.runtime_config();
    if worker.handler_deadline_seconds > worker.visibility_timeout_seconds {
        tracing::warn!(
            handler_deadline_seconds = worker.handler_deadline_seconds,
            visibility_timeout_seconds = worker.visibility_timeout_seconds,
            "handler deadline exceeds visibility timeout, clamping"
        );
    }

    let handlers = Handlers::new(
        pool.clone(),
        bus.clone(),
        Arc::new(NoopEventSink),
        RecipeAnalyzer::new(worker.analyzer_config()),
        &runtime_config,
    );
    let runtime = MessageRuntime::new(bus.clone(), handlers, runtime_config);

    let cancel = CancellationToken::new();

    // Ctrl-c cancels the runtime.
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        tracing::info!("shutdown requested");
        signal_cancel.cancel();
    });

    // Periodic tick publishers. Each fires immediately at startup, then at
    // its configured interval, until cancellation.
    let timers = [
        spawn_ticker(
            bus.clone(),
            cancel.clone(),
            MessageKind::FinalizationTick,
            worker.finalization_interval(),
        ),
        spawn_ticker(
            bus.clone(),
            cancel.clone(),
            MessageKind::TaskTick,
            worker.task_interval(),
        ),
        spawn_ticker(
            bus.clone(),
            cancel.clone(),
            MessageKind::GroceryTick,
            worker.grocery_interval(),
        ),
    ];

    tracing::info!(
        max_concurrent_handlers = worker.max_concurrent_handlers,
        "worker running, press ctrl-c to stop"
    );
    let result = runtime.run(cancel.clone()).await.context("runtime failed")?;

    for timer in timers {
        let _ = timer.await;
    }

    match result {
        RuntimeResult::Interrupted => {
            let leftover = bus.ready_len().await + bus.in_flight_len().await;
            if leftover > 0 {
                tracing::info!(
                    leftover,
                    "stopping with unprocessed messages; the next run re-derives them from plan state"
                );
            }
        }
        RuntimeResult::Drained => {}
    }

    println!("mise-worker stopped.");
    Ok(())
}

/// Publish one tick kind at a fixed interval until cancelled.
fn spawn_ticker(
    bus: Arc<InProcessBus>,
    cancel: CancellationToken,
    kind: MessageKind,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let envelope = Envelope::tick(kind);
                    if let Err(e) = bus.publish(WORKER_TICKS_TOPIC, &envelope).await {
                        tracing::warn!(kind = %kind, error = %e, "failed to publish tick");
                    }
                }
            }
        }
    })
}
