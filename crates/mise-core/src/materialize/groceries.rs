//! Grocery list materialization for finalized meal plans.

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing;

use mise_db::models::HydratedMealPlan;
use mise_db::queries::{grocery_list_items, meal_plans};

use crate::bus::{DataChangeMessage, MessagePublisher};
use crate::error::{PlanFailure, WorkerError};
use crate::grocery::GroceryListCreator;
use crate::lifecycle::publish_or_log;

/// Outcome of one grocery materialization sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroceryMaterialization {
    /// Plans whose grocery list was initialized this sweep.
    pub plans_materialized: usize,
    /// Grocery rows created across those plans.
    pub items_created: usize,
}

/// Initialize the grocery list for every finalized plan that lacks one.
///
/// Steps, per plan:
/// 1. Fetch hydrated plans with `grocery_list_initialized=false`.
/// 2. Aggregate ingredient demand across the chosen options.
/// 3. Bulk-insert; rows that already exist are skipped.
/// 4. Publish a data change event per created row.
/// 5. Mark the plan's grocery list as initialized.
///
/// Per-plan failures are collected into a `PartialFailure` and the failed
/// plans stay unmarked for the next sweep.
pub async fn materialize_grocery_lists(
    pool: &PgPool,
    publisher: &dyn MessagePublisher,
) -> Result<GroceryMaterialization, WorkerError> {
    // 1. Plans missing their grocery list.
    let plans = meal_plans::get_finalized_meal_plans_with_uninitialized_grocery_lists(pool)
        .await
        .context("failed to list plans awaiting grocery lists")?;

    if plans.is_empty() {
        tracing::debug!("no plans awaiting grocery lists");
        return Ok(GroceryMaterialization::default());
    }

    let mut outcome = GroceryMaterialization::default();
    let mut failures = Vec::new();

    for plan in &plans {
        match materialize_plan(pool, publisher, plan).await {
            Ok(created) => {
                outcome.plans_materialized += 1;
                outcome.items_created += created;
            }
            Err(cause) => {
                tracing::warn!(
                    meal_plan_id = %plan.meal_plan.id,
                    error = %cause,
                    "grocery materialization failed for plan"
                );
                failures.push(PlanFailure {
                    meal_plan_id: plan.meal_plan.id,
                    cause,
                });
            }
        }
    }

    tracing::info!(
        plans = outcome.plans_materialized,
        items = outcome.items_created,
        failed = failures.len(),
        "grocery materialization sweep finished"
    );

    if failures.is_empty() {
        Ok(outcome)
    } else {
        Err(WorkerError::PartialFailure { failures })
    }
}

/// Aggregate, persist, and announce the grocery list for one plan.
///
/// Returns the number of rows created. A plan whose chosen meals reference
/// no catalog ingredients still gets its flag set, with an empty list.
async fn materialize_plan(
    pool: &PgPool,
    publisher: &dyn MessagePublisher,
    plan: &HydratedMealPlan,
) -> Result<usize> {
    let meal_plan_id = plan.meal_plan.id;
    let household_id = plan.meal_plan.belongs_to_household;

    // 2. Aggregate demand across chosen options.
    let inputs = GroceryListCreator.generate_grocery_list_inputs(plan);

    // 3. Insert; the natural key (plan, ingredient, unit) skips rows that
    //    already exist from an earlier attempt.
    let created = grocery_list_items::create_meal_plan_grocery_list_items(pool, meal_plan_id, &inputs)
        .await
        .with_context(|| format!("failed to create grocery list for plan {meal_plan_id}"))?;

    // 4. Announce every persisted row, not just the ones created here, so a
    //    crash between commit and publish heals on the next sweep.
    let persisted = grocery_list_items::list_grocery_list_items_for_plan(pool, meal_plan_id)
        .await
        .with_context(|| format!("failed to list grocery list for plan {meal_plan_id}"))?;
    for item in &persisted {
        let message = DataChangeMessage::grocery_list_item_created(item, household_id);
        publish_or_log(publisher, &message, meal_plan_id).await;
    }

    // 5. Flip the monotone flag.
    meal_plans::mark_meal_plan_grocery_list_initialized(pool, meal_plan_id)
        .await
        .with_context(|| format!("failed to mark grocery list initialized for plan {meal_plan_id}"))?;

    tracing::info!(
        meal_plan_id = %meal_plan_id,
        items = created.len(),
        "materialized grocery list for plan"
    );
    Ok(created.len())
}
