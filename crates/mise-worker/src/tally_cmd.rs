//! `mise-worker tally` command: tally one meal plan inline.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use mise_core::bus::memory::InProcessBus;
use mise_core::error::WorkerError;
use mise_core::lifecycle::execute_tally;

use crate::config::WorkerSection;

/// Attempt finalization for a single plan and report the outcome.
pub async fn run_tally(
    pool: &PgPool,
    worker: &WorkerSection,
    meal_plan_id_str: &str,
    household_id_str: &str,
) -> Result<()> {
    let meal_plan_id = Uuid::parse_str(meal_plan_id_str)
        .with_context(|| format!("invalid meal plan ID: {meal_plan_id_str}"))?;
    let household_id = Uuid::parse_str(household_id_str)
        .with_context(|| format!("invalid household ID: {household_id_str}"))?;

    let bus = InProcessBus::new();
    match execute_tally(
        pool,
        &bus,
        meal_plan_id,
        household_id,
        &worker.finalize_options(),
    )
    .await
    {
        Ok(()) => {
            println!("Meal plan {meal_plan_id} finalized.");
            Ok(())
        }
        Err(WorkerError::NotFinalized { .. }) => {
            println!(
                "Meal plan {meal_plan_id} not finalized \
                 (already finalized, voting still open, or a required vote is missing)."
            );
            Ok(())
        }
        Err(err) => Err(anyhow::Error::new(err))
            .with_context(|| format!("failed to tally meal plan {meal_plan_id}")),
    }
}
