//! `mise-worker db-init` command: create the database and run migrations.

use anyhow::Result;

use mise_db::pool;

use crate::config::MiseConfig;

/// Create the database if needed, apply migrations, and print table counts.
pub async fn run_db_init(config: &MiseConfig) -> Result<()> {
    println!("Initializing mise database...");

    // 1. Create the database if it does not exist.
    pool::ensure_database_exists(&config.db_config).await?;

    // 2. Connect to the target database.
    let db_pool = pool::create_pool(&config.db_config).await?;

    // 3. Run migrations.
    pool::run_migrations(&db_pool).await?;

    // 4. Print success with table counts.
    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    // 5. Clean shutdown.
    db_pool.close().await;

    println!("mise-worker db-init complete.");
    Ok(())
}
