//! `mise-worker status` command: table counts and plans by status.

use anyhow::Result;
use sqlx::PgPool;

use mise_db::pool;
use mise_db::queries::meal_plans;

/// Print row counts per table and a meal-plan status summary.
pub async fn run_status(pool: &PgPool) -> Result<()> {
    let counts = pool::table_counts(pool).await?;
    println!("Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    let statuses = meal_plans::plan_status_counts(pool).await?;
    println!();
    println!("Meal plans by status:");
    if statuses.is_empty() {
        println!("  (none)");
    }
    for (status, count) in &statuses {
        println!("  {status}: {count}");
    }

    Ok(())
}
