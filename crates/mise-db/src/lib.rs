//! Postgres persistence layer for the meal planning workers.
//!
//! Holds the connection pool setup, embedded migrations, typed row models,
//! and the query functions the worker crates call. All queries are plain
//! async functions over a [`sqlx::PgPool`].

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;

pub use config::DbConfig;
pub use pool::{create_pool, ensure_database_exists, run_migrations, MIGRATOR};
