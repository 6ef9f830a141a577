//! Configuration file management for the worker.
//!
//! Provides a TOML-based config file at `~/.config/mise/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use mise_core::analysis::AnalyzerConfig;
use mise_core::runtime::RuntimeConfig;
use mise_db::config::DbConfig;
use mise_db::queries::meal_plans::FinalizeOptions;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub worker: WorkerSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

/// Worker tuning. Every field has a default, so a config file may carry any
/// subset of them (or omit the `[worker]` section entirely).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Maximum number of concurrently running message handlers.
    pub max_concurrent_handlers: usize,
    /// Wall time limit per handler, in seconds. Kept at or below the bus
    /// visibility timeout so an abandoned delivery is reclaimed, not lost.
    pub handler_deadline_seconds: u64,
    /// Bus lease duration, in seconds. A delivery neither acked nor nacked
    /// within it is redelivered.
    pub visibility_timeout_seconds: u64,
    /// How often the tally scheduler sweeps for expired voting windows.
    pub finalization_interval_seconds: u64,
    /// How often the task materializer sweeps.
    pub task_interval_seconds: u64,
    /// How often the grocery list materializer sweeps.
    pub grocery_interval_seconds: u64,
    /// How far ahead the task materializer looks for upcoming events.
    pub lookahead_days: i64,
    /// Minimum product storage duration for a step to count as advance work
    /// on storage grounds.
    pub min_advance_window_seconds: i64,
    /// Preparation names that are inherently advance work.
    pub advance_preparation_names: Vec<String>,
    /// Break vote ties by earliest option creation before option id order.
    pub tie_break_by_earliest_creation: bool,
    /// Refuse to finalize a plan while any of its events has zero votes.
    pub require_at_least_one_vote: bool,
}

impl Default for WorkerSection {
    fn default() -> Self {
        let analyzer = AnalyzerConfig::default();
        let mut advance_preparation_names: Vec<String> =
            analyzer.advance_preparation_names.into_iter().collect();
        advance_preparation_names.sort_unstable();

        Self {
            max_concurrent_handlers: 4,
            handler_deadline_seconds: 25,
            visibility_timeout_seconds: 30,
            finalization_interval_seconds: 60,
            task_interval_seconds: 300,
            grocery_interval_seconds: 300,
            lookahead_days: 7,
            min_advance_window_seconds: analyzer.min_advance_window_seconds,
            advance_preparation_names,
            tie_break_by_earliest_creation: true,
            require_at_least_one_vote: false,
        }
    }
}

impl WorkerSection {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }

    pub fn finalization_interval(&self) -> Duration {
        Duration::from_secs(self.finalization_interval_seconds)
    }

    pub fn task_interval(&self) -> Duration {
        Duration::from_secs(self.task_interval_seconds)
    }

    pub fn grocery_interval(&self) -> Duration {
        Duration::from_secs(self.grocery_interval_seconds)
    }

    /// Runtime settings, with the handler deadline clamped to the visibility
    /// timeout.
    pub fn runtime_config(&self) -> RuntimeConfig {
        let deadline_seconds = self
            .handler_deadline_seconds
            .min(self.visibility_timeout_seconds);
        RuntimeConfig {
            max_concurrent_handlers: self.max_concurrent_handlers,
            handler_deadline: Duration::from_secs(deadline_seconds),
            task_lookahead: chrono::Duration::days(self.lookahead_days),
            finalize: self.finalize_options(),
        }
    }

    pub fn analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            advance_preparation_names: self
                .advance_preparation_names
                .iter()
                .map(|name| name.to_lowercase())
                .collect(),
            min_advance_window_seconds: self.min_advance_window_seconds,
        }
    }

    pub fn finalize_options(&self) -> FinalizeOptions {
        FinalizeOptions {
            require_at_least_one_vote: self.require_at_least_one_vote,
            tie_break_by_earliest_creation: self.tie_break_by_earliest_creation,
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the mise config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/mise` or `~/.config/mise`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("mise");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("mise")
}

/// Return the path to the mise config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    // Set permissions to 0600 (owner read/write only) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct MiseConfig {
    pub db_config: DbConfig,
    pub worker: WorkerSection,
}

impl MiseConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - DB URL: `cli_db_url` > `MISE_DATABASE_URL` env > `config_file.database.url` > `DbConfig::DEFAULT_URL`
    /// - Worker tuning: `config_file.worker` > defaults
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        // DB URL resolution.
        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("MISE_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let db_config = DbConfig::new(db_url);

        let worker = file_config.map(|cfg| cfg.worker).unwrap_or_default();

        Ok(Self { db_config, worker })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
