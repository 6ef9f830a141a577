mod config;
mod db_cmd;
mod run_cmd;
mod status_cmd;
mod tally_cmd;
mod tick_cmd;

use clap::{Parser, Subcommand};

use mise_db::pool;

use config::MiseConfig;

#[derive(Parser)]
#[command(name = "mise-worker", about = "Background workflow workers for a household meal-planning service")]
struct Cli {
    /// Database URL (overrides MISE_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a mise config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/mise")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the mise database (create it and run migrations)
    DbInit,
    /// Run the worker: tick timers, message bus, and handlers
    Run,
    /// Run one workflow stage once and exit
    Tick {
        #[command(subcommand)]
        stage: TickStage,
    },
    /// Tally the votes for one meal plan inline
    Tally {
        /// Meal plan ID to tally
        #[arg(long)]
        meal_plan_id: String,
        /// Household the plan belongs to
        #[arg(long)]
        household_id: String,
    },
    /// Show table counts and plans by status
    Status,
}

#[derive(Subcommand, Clone, Copy)]
pub enum TickStage {
    /// Sweep for expired voting windows and tally each affected plan
    TallySchedule,
    /// Materialize prep tasks for finalized plans with upcoming events
    Tasks,
    /// Initialize grocery lists for finalized plans
    Groceries,
}

/// Execute the `mise-worker init` command: write the config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        worker: config::WorkerSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `mise-worker db-init` to create and migrate the database.");

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            let resolved = MiseConfig::resolve(cli.database_url.as_deref())?;
            db_cmd::run_db_init(&resolved).await?;
        }
        Commands::Run => {
            let resolved = MiseConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = run_cmd::run_worker(&db_pool, &resolved.worker).await;
            db_pool.close().await;
            result?;
        }
        Commands::Tick { stage } => {
            let resolved = MiseConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = tick_cmd::run_tick(&db_pool, &resolved.worker, stage).await;
            db_pool.close().await;
            result?;
        }
        Commands::Tally {
            meal_plan_id,
            household_id,
        } => {
            let resolved = MiseConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result =
                tally_cmd::run_tally(&db_pool, &resolved.worker, &meal_plan_id, &household_id)
                    .await;
            db_pool.close().await;
            result?;
        }
        Commands::Status => {
            let resolved = MiseConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
