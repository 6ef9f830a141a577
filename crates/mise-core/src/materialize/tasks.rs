//! Prep-task materialization for finalized meal plans.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::Duration;
use sqlx::PgPool;
use tracing;
use uuid::Uuid;

use mise_db::models::{FinalizedMealPlanResult, MealPlanTaskCreationInput};
use mise_db::queries::{meal_plan_tasks, meal_plans, recipes};

use crate::analysis::RecipeAnalyzer;
use crate::bus::{DataChangeMessage, MessagePublisher};
use crate::error::{PlanFailure, WorkerError};
use crate::lifecycle::publish_or_log;

/// Outcome of one task materialization sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskMaterialization {
    /// Plans fully materialized and marked this sweep.
    pub plans_materialized: usize,
    /// Task rows created across those plans.
    pub tasks_created: usize,
}

/// Create prep tasks for every finalized plan with an upcoming event.
///
/// Steps, per plan:
/// 1. Fetch the chosen-option rows whose events start inside the lookahead
///    window and whose plan has `tasks_created=false`.
/// 2. Analyze each backing recipe against its event's start time.
/// 3. Bulk-insert the task inputs; rows that already exist are skipped.
/// 4. Publish a data change event per created row.
/// 5. Mark the plan as having its tasks created.
///
/// A plan that fails anywhere is left unmarked and reported in the
/// `PartialFailure`; the next sweep retries it from the top.
pub async fn materialize_tasks(
    pool: &PgPool,
    publisher: &dyn MessagePublisher,
    analyzer: &RecipeAnalyzer,
    lookahead: Duration,
) -> Result<TaskMaterialization, WorkerError> {
    // 1. Chosen options with events inside the window.
    let rows = meal_plans::get_finalized_meal_plan_ids_for_the_next_week(pool, lookahead)
        .await
        .context("failed to list plans awaiting task creation")?;

    if rows.is_empty() {
        tracing::debug!("no plans awaiting task creation");
        return Ok(TaskMaterialization::default());
    }

    let mut by_plan: BTreeMap<Uuid, Vec<&FinalizedMealPlanResult>> = BTreeMap::new();
    for row in &rows {
        by_plan.entry(row.meal_plan_id).or_default().push(row);
    }

    let mut outcome = TaskMaterialization::default();
    let mut failures = Vec::new();

    for (meal_plan_id, plan_rows) in by_plan {
        match materialize_plan(pool, publisher, analyzer, meal_plan_id, &plan_rows).await {
            Ok(created) => {
                outcome.plans_materialized += 1;
                outcome.tasks_created += created;
            }
            Err(cause) => {
                tracing::warn!(
                    meal_plan_id = %meal_plan_id,
                    error = %cause,
                    "task materialization failed for plan"
                );
                failures.push(PlanFailure {
                    meal_plan_id,
                    cause,
                });
            }
        }
    }

    tracing::info!(
        plans = outcome.plans_materialized,
        tasks = outcome.tasks_created,
        failed = failures.len(),
        "task materialization sweep finished"
    );

    if failures.is_empty() {
        Ok(outcome)
    } else {
        Err(WorkerError::PartialFailure { failures })
    }
}

/// Analyze, persist, and announce the tasks for one plan.
///
/// Returns the number of task rows created. A plan whose recipes produce no
/// advance-eligible steps is still marked, so it drops out of the sweep.
async fn materialize_plan(
    pool: &PgPool,
    publisher: &dyn MessagePublisher,
    analyzer: &RecipeAnalyzer,
    meal_plan_id: Uuid,
    rows: &[&FinalizedMealPlanResult],
) -> Result<usize> {
    let Some(first) = rows.first() else {
        return Ok(0);
    };
    let household_id = first.household_id;

    let mut inputs: Vec<MealPlanTaskCreationInput> = Vec::new();

    // 2. Analyze every recipe of every chosen option, anchored to its
    //    event's start.
    for row in rows {
        let event = meal_plans::get_meal_plan_event(pool, meal_plan_id, row.meal_plan_event_id)
            .await?
            .with_context(|| {
                format!(
                    "meal plan event {} disappeared from plan {meal_plan_id}",
                    row.meal_plan_event_id
                )
            })?;

        for recipe_id in &row.recipe_ids {
            let recipe = recipes::get_recipe(pool, *recipe_id)
                .await?
                .with_context(|| format!("recipe {recipe_id} disappeared"))?;
            let mut derived = analyzer
                .generate_meal_plan_tasks(&recipe, row.meal_plan_option_id, event.starts_at)
                .map_err(WorkerError::from)?;
            inputs.append(&mut derived);
        }
    }

    // 3. Insert; the natural key (option, step) skips rows that already
    //    exist from an earlier attempt.
    let created = meal_plan_tasks::create_meal_plan_tasks(pool, &inputs)
        .await
        .with_context(|| format!("failed to create tasks for plan {meal_plan_id}"))?;

    // 4. Announce every persisted row, not just the ones created here. An
    //    earlier attempt may have committed rows and crashed before
    //    publishing; duplicates are fine under at-least-once.
    let persisted = meal_plan_tasks::list_meal_plan_tasks_for_plan(pool, meal_plan_id)
        .await
        .with_context(|| format!("failed to list tasks for plan {meal_plan_id}"))?;
    for task in &persisted {
        let message = DataChangeMessage::task_created(task, meal_plan_id, household_id);
        publish_or_log(publisher, &message, meal_plan_id).await;
    }

    // 5. Flip the monotone flag.
    meal_plans::mark_meal_plan_as_having_tasks_created(pool, meal_plan_id)
        .await
        .with_context(|| format!("failed to mark tasks created for plan {meal_plan_id}"))?;

    tracing::info!(
        meal_plan_id = %meal_plan_id,
        tasks = created.len(),
        "materialized prep tasks for plan"
    );
    Ok(created.len())
}
