//! `mise-worker tick` command: run one workflow stage once.
//!
//! Operational escape hatch: the same stage functions the runtime
//! dispatches to, invoked directly against a throwaway in-process bus.
//! Data-change events published during the stage are dropped with the bus;
//! the next `run` republishes from the persisted rows.

use anyhow::{Context, Result};
use sqlx::PgPool;

use mise_core::analysis::RecipeAnalyzer;
use mise_core::bus::memory::InProcessBus;
use mise_core::bus::{Envelope, MessageConsumer};
use mise_core::error::WorkerError;
use mise_core::lifecycle::{execute_tally, schedule_tally_requests};
use mise_core::materialize::{materialize_grocery_lists, materialize_tasks};

use crate::TickStage;
use crate::config::WorkerSection;

/// Run one stage to completion and print the outcome.
pub async fn run_tick(pool: &PgPool, worker: &WorkerSection, stage: TickStage) -> Result<()> {
    match stage {
        TickStage::TallySchedule => run_tally_schedule(pool, worker).await,
        TickStage::Tasks => run_tasks(pool, worker).await,
        TickStage::Groceries => run_groceries(pool).await,
    }
}

/// Sweep for expired voting windows, then execute every scheduled tally
/// inline so the command finalizes plans instead of just queueing work.
async fn run_tally_schedule(pool: &PgPool, worker: &WorkerSection) -> Result<()> {
    let bus = InProcessBus::new();
    let schedule = schedule_tally_requests(pool, &bus).await?;
    println!(
        "Scheduled {} tally request(s), {} failed to publish.",
        schedule.requested, schedule.failed
    );

    let options = worker.finalize_options();
    let mut finalized = 0usize;
    let mut pending = 0usize;
    for _ in 0..schedule.requested {
        let Some(delivery) = bus.next().await? else {
            break;
        };
        let envelope = Envelope::decode(&delivery.body).context("invalid tally request")?;
        let meal_plan_id = envelope
            .meal_plan_id
            .context("tally request missing meal plan id")?;
        let household_id = envelope
            .household_id
            .context("tally request missing household id")?;

        match execute_tally(pool, &bus, meal_plan_id, household_id, &options).await {
            Ok(()) => finalized += 1,
            Err(WorkerError::NotFinalized { .. }) => pending += 1,
            Err(err) => return Err(anyhow::Error::new(err)),
        }
        bus.ack(delivery.id).await?;
    }

    println!("Finalized {finalized} plan(s); {pending} still not finalizable.");
    Ok(())
}

/// One task materialization sweep.
async fn run_tasks(pool: &PgPool, worker: &WorkerSection) -> Result<()> {
    let bus = InProcessBus::new();
    let analyzer = RecipeAnalyzer::new(worker.analyzer_config());
    let lookahead = chrono::Duration::days(worker.lookahead_days);

    match materialize_tasks(pool, &bus, &analyzer, lookahead).await {
        Ok(outcome) => {
            println!(
                "Materialized {} task(s) across {} plan(s).",
                outcome.tasks_created, outcome.plans_materialized
            );
            Ok(())
        }
        Err(WorkerError::PartialFailure { failures }) => {
            for failure in &failures {
                eprintln!("  plan {}: {:#}", failure.meal_plan_id, failure.cause);
            }
            anyhow::bail!("{} plan(s) failed task materialization", failures.len());
        }
        Err(err) => Err(anyhow::Error::new(err)),
    }
}

/// One grocery list materialization sweep.
async fn run_groceries(pool: &PgPool) -> Result<()> {
    let bus = InProcessBus::new();

    match materialize_grocery_lists(pool, &bus).await {
        Ok(outcome) => {
            println!(
                "Initialized {} grocery list(s), {} item(s) created.",
                outcome.plans_materialized, outcome.items_created
            );
            Ok(())
        }
        Err(WorkerError::PartialFailure { failures }) => {
            for failure in &failures {
                eprintln!("  plan {}: {:#}", failure.meal_plan_id, failure.cause);
            }
            anyhow::bail!("{} plan(s) failed grocery materialization", failures.len());
        }
        Err(err) => Err(anyhow::Error::new(err)),
    }
}
