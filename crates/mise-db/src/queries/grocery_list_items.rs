//! Database query functions for derived grocery list items.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{
    GroceryListItemStatus, MealPlanGroceryListItem, MealPlanGroceryListItemCreationInput,
};

/// Insert a batch of aggregated grocery rows for one plan in one transaction.
///
/// Rows that collide on `(belongs_to_meal_plan, valid_ingredient_id,
/// valid_measurement_unit_id)` are skipped, so replaying the same batch is
/// harmless. Returns only the rows actually created by this call.
pub async fn create_meal_plan_grocery_list_items(
    pool: &PgPool,
    meal_plan_id: Uuid,
    inputs: &[MealPlanGroceryListItemCreationInput],
) -> Result<Vec<MealPlanGroceryListItem>> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to begin grocery list transaction")?;

    let mut created = Vec::with_capacity(inputs.len());
    for input in inputs {
        let item = sqlx::query_as::<_, MealPlanGroceryListItem>(
            "INSERT INTO meal_plan_grocery_list_items \
             (belongs_to_meal_plan, valid_ingredient_id, valid_measurement_unit_id, \
              minimum_quantity_needed, maximum_quantity_needed, status) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (belongs_to_meal_plan, valid_ingredient_id, valid_measurement_unit_id) \
             DO NOTHING \
             RETURNING *",
        )
        .bind(meal_plan_id)
        .bind(input.valid_ingredient_id)
        .bind(input.valid_measurement_unit_id)
        .bind(input.minimum_quantity_needed)
        .bind(input.maximum_quantity_needed)
        .bind(input.status)
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| {
            format!(
                "failed to insert grocery list item for ingredient {}",
                input.valid_ingredient_id
            )
        })?;

        if let Some(item) = item {
            created.push(item);
        }
    }

    tx.commit()
        .await
        .context("failed to commit grocery list transaction")?;

    Ok(created)
}

/// List a plan's grocery rows, oldest first.
pub async fn list_grocery_list_items_for_plan(
    pool: &PgPool,
    meal_plan_id: Uuid,
) -> Result<Vec<MealPlanGroceryListItem>> {
    let items = sqlx::query_as::<_, MealPlanGroceryListItem>(
        "SELECT * FROM meal_plan_grocery_list_items \
         WHERE belongs_to_meal_plan = $1 \
         ORDER BY created_at ASC, id ASC",
    )
    .bind(meal_plan_id)
    .fetch_all(pool)
    .await
    .context("failed to list grocery list items")?;

    Ok(items)
}

/// Move a grocery row to a new status, e.g. when a shopper marks it acquired.
pub async fn update_grocery_list_item_status(
    pool: &PgPool,
    item_id: Uuid,
    status: GroceryListItemStatus,
) -> Result<MealPlanGroceryListItem> {
    let item = sqlx::query_as::<_, MealPlanGroceryListItem>(
        "UPDATE meal_plan_grocery_list_items SET status = $2 WHERE id = $1 RETURNING *",
    )
    .bind(item_id)
    .bind(status)
    .fetch_optional(pool)
    .await
    .context("failed to update grocery list item status")?;

    match item {
        Some(item) => Ok(item),
        None => anyhow::bail!("grocery list item {item_id} not found"),
    }
}
