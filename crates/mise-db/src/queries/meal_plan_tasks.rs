//! Database query functions for derived meal plan prep tasks.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{MealPlanTask, MealPlanTaskCreationInput, MealPlanTaskStatus};

/// Insert a batch of derived prep tasks in one transaction.
///
/// Rows that collide on `(belongs_to_meal_plan_option, recipe_step_id)` are
/// skipped, so replaying the same batch is harmless. Returns only the rows
/// actually created by this call.
pub async fn create_meal_plan_tasks(
    pool: &PgPool,
    inputs: &[MealPlanTaskCreationInput],
) -> Result<Vec<MealPlanTask>> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to begin task creation transaction")?;

    let mut created = Vec::with_capacity(inputs.len());
    for input in inputs {
        let task = sqlx::query_as::<_, MealPlanTask>(
            "INSERT INTO meal_plan_tasks \
             (belongs_to_meal_plan_option, recipe_step_id, creation_explanation, \
              cannot_complete_before, cannot_complete_after) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (belongs_to_meal_plan_option, recipe_step_id) DO NOTHING \
             RETURNING *",
        )
        .bind(input.meal_plan_option_id)
        .bind(input.recipe_step_id)
        .bind(&input.creation_explanation)
        .bind(input.cannot_complete_before)
        .bind(input.cannot_complete_after)
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| {
            format!(
                "failed to insert task for option {} step {}",
                input.meal_plan_option_id, input.recipe_step_id
            )
        })?;

        if let Some(task) = task {
            created.push(task);
        }
    }

    tx.commit()
        .await
        .context("failed to commit task creation transaction")?;

    Ok(created)
}

/// List every prep task attached to a plan, oldest first.
pub async fn list_meal_plan_tasks_for_plan(
    pool: &PgPool,
    meal_plan_id: Uuid,
) -> Result<Vec<MealPlanTask>> {
    let tasks = sqlx::query_as::<_, MealPlanTask>(
        "SELECT t.* FROM meal_plan_tasks t \
         JOIN meal_plan_options o ON t.belongs_to_meal_plan_option = o.id \
         JOIN meal_plan_events e ON o.belongs_to_meal_plan_event = e.id \
         WHERE e.belongs_to_meal_plan = $1 \
         ORDER BY t.created_at ASC, t.id ASC",
    )
    .bind(meal_plan_id)
    .fetch_all(pool)
    .await
    .context("failed to list meal plan tasks")?;

    Ok(tasks)
}

/// Fetch one task by ID.
pub async fn get_meal_plan_task(pool: &PgPool, task_id: Uuid) -> Result<Option<MealPlanTask>> {
    let task = sqlx::query_as::<_, MealPlanTask>("SELECT * FROM meal_plan_tasks WHERE id = $1")
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch meal plan task")?;

    Ok(task)
}

/// Move a task to a new status. `completed_at` is stamped when the task
/// reaches `finished` and cleared on any other status.
pub async fn update_meal_plan_task_status(
    pool: &PgPool,
    task_id: Uuid,
    status: MealPlanTaskStatus,
    status_explanation: &str,
) -> Result<MealPlanTask> {
    let task = sqlx::query_as::<_, MealPlanTask>(
        "UPDATE meal_plan_tasks \
         SET status = $2, \
             status_explanation = $3, \
             completed_at = CASE WHEN $2 = 'finished' THEN NOW() ELSE NULL END \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(task_id)
    .bind(status)
    .bind(status_explanation)
    .fetch_optional(pool)
    .await
    .context("failed to update meal plan task status")?;

    match task {
        Some(task) => Ok(task),
        None => anyhow::bail!("meal plan task {task_id} not found"),
    }
}

/// Assign a task to a household member, or clear the assignment with `None`.
pub async fn assign_meal_plan_task(
    pool: &PgPool,
    task_id: Uuid,
    user_id: Option<Uuid>,
) -> Result<MealPlanTask> {
    let task = sqlx::query_as::<_, MealPlanTask>(
        "UPDATE meal_plan_tasks SET assigned_to_user = $2 WHERE id = $1 RETURNING *",
    )
    .bind(task_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .context("failed to assign meal plan task")?;

    match task {
        Some(task) => Ok(task),
        None => anyhow::bail!("meal plan task {task_id} not found"),
    }
}
