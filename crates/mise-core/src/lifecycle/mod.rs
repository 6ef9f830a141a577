//! Meal plan lifecycle: scheduling vote tallies and executing them.
//!
//! A periodic tick sweeps for plans whose voting window has closed and
//! publishes one tally request per plan. The tally executor consumes a
//! request, attempts finalization in a single storage transaction, and
//! announces the outcome. Both sides tolerate replay: repeated requests for
//! the same plan settle on whichever attempt finalized it first.

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing;
use uuid::Uuid;

use mise_db::queries::meal_plans::{self, FinalizeOptions};

use crate::bus::{DATA_CHANGES_TOPIC, DataChangeMessage, Envelope, MessagePublisher, TALLY_REQUESTS_TOPIC};
use crate::error::WorkerError;

/// Outcome of one tally scheduling sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TallySchedule {
    /// Requests published.
    pub requested: usize,
    /// Requests that failed to publish; the next sweep picks them up again.
    pub failed: usize,
}

/// Publish a tally request for every plan whose voting window has closed.
///
/// Steps:
/// 1. List plans with `status=awaiting_votes` and an expired voting window.
/// 2. Publish one tally request per plan.
///
/// A failed publish is logged and counted but never aborts the sweep; the
/// plan stays `awaiting_votes` and the next sweep retries it.
pub async fn schedule_tally_requests(
    pool: &PgPool,
    publisher: &dyn MessagePublisher,
) -> Result<TallySchedule> {
    // 1. Plans whose voting window has closed.
    let plans = meal_plans::get_unfinalized_meal_plans_with_expired_voting_periods(pool)
        .await
        .context("failed to list plans with expired voting periods")?;

    if plans.is_empty() {
        tracing::debug!("no meal plans awaiting tally");
        return Ok(TallySchedule::default());
    }

    // 2. One request per plan.
    let mut schedule = TallySchedule::default();
    for plan in &plans {
        let envelope = Envelope::tally_request(plan.id, plan.belongs_to_household);
        match publisher.publish(TALLY_REQUESTS_TOPIC, &envelope).await {
            Ok(()) => schedule.requested += 1,
            Err(e) => {
                schedule.failed += 1;
                tracing::warn!(
                    meal_plan_id = %plan.id,
                    error = %e,
                    "failed to publish tally request"
                );
            }
        }
    }

    tracing::info!(
        requested = schedule.requested,
        failed = schedule.failed,
        "scheduled tally requests"
    );
    Ok(schedule)
}

/// Tally the votes for one meal plan and finalize it if possible.
///
/// Steps:
/// 1. Attempt finalization in one storage transaction.
/// 2. No state change means the plan was not finalizable yet (voting still
///    open, a required vote missing) or another attempt won the race; report
///    `NotFinalized` so the request is redelivered.
/// 3. On a state change, publish the finalization event. The plan row is the
///    source of truth, so a failed publish is logged and the tally still
///    counts as done.
pub async fn execute_tally(
    pool: &PgPool,
    publisher: &dyn MessagePublisher,
    meal_plan_id: Uuid,
    household_id: Uuid,
    options: &FinalizeOptions,
) -> Result<(), WorkerError> {
    // 1. Attempt finalization.
    let changed =
        meal_plans::attempt_to_finalize_meal_plan(pool, meal_plan_id, household_id, options)
            .await
            .with_context(|| format!("failed to finalize meal plan {meal_plan_id}"))?;

    // 2. Nothing changed.
    if !changed {
        tracing::info!(meal_plan_id = %meal_plan_id, "tally ran without finalizing");
        return Err(WorkerError::NotFinalized { meal_plan_id });
    }

    // 3. Announce the finalization.
    let message = DataChangeMessage::meal_plan_finalized(meal_plan_id, household_id);
    publish_or_log(publisher, &message, meal_plan_id).await;

    tracing::info!(
        meal_plan_id = %meal_plan_id,
        household_id = %household_id,
        "meal plan finalized"
    );
    Ok(())
}

/// Best-effort publication of a data change event.
///
/// Derived rows and plan state are committed before this runs, so a bus
/// outage here must not fail the operation; the next tick republishes from
/// persisted rows.
pub(crate) async fn publish_or_log(
    publisher: &dyn MessagePublisher,
    message: &DataChangeMessage,
    meal_plan_id: Uuid,
) {
    let envelope = match Envelope::data_change(message) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(
                meal_plan_id = %meal_plan_id,
                error = %e,
                "failed to encode data change event"
            );
            return;
        }
    };
    if let Err(e) = publisher.publish(DATA_CHANGES_TOPIC, &envelope).await {
        tracing::warn!(
            meal_plan_id = %meal_plan_id,
            error = %e,
            "failed to publish data change event"
        );
    }
}
