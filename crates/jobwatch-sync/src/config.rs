use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jobwatch_adapters::SourceConfig;
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;

/// Upper bound for the stale window, roughly a century.
pub const MAX_STALE_AFTER_HOURS: i64 = 24 * 366 * 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name}={value:?} is invalid: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime configuration, read from the environment (and `.env` via the CLI).
///
/// Credentials are optional here so that commands which never touch the store
/// or the AI API can run without them; [`SyncConfig::require_database_url`]
/// and [`SyncConfig::require_openai_key`] fail fast where they are needed.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub scoring_model: String,
    pub scoring_prompt_file: Option<PathBuf>,
    pub embedding_model: String,
    pub embedding_dims: usize,
    pub stale_after: chrono::Duration,
    pub batch_size: usize,
    pub request_delay: Duration,
    pub http_timeout: Duration,
    pub ai_timeout: Duration,
    pub db_timeout: Duration,
    pub db_max_connections: u32,
    pub max_pages: u32,
    pub score_limit: i64,
    pub embed_limit: i64,
    pub enrich_limit: i64,
    pub sweep_page_size: i64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sweep_cron: String,
    pub pipeline_cron: String,
    pub reports_dir: PathBuf,
    pub sources_file: PathBuf,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let stale_hours: i64 = parse_var(&var, "JOBWATCH_STALE_AFTER_HOURS", 48)?;
        let stale_after = (1..=MAX_STALE_AFTER_HOURS)
            .contains(&stale_hours)
            .then(|| chrono::Duration::try_hours(stale_hours))
            .flatten()
            .ok_or_else(|| ConfigError::Invalid {
                name: "JOBWATCH_STALE_AFTER_HOURS",
                value: stale_hours.to_string(),
                reason: format!("must be between 1 and {MAX_STALE_AFTER_HOURS}"),
            })?;
        let batch_size: usize = parse_var(&var, "JOBWATCH_BATCH_SIZE", 20)?;
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                name: "JOBWATCH_BATCH_SIZE",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        let workspace_root = var("JOBWATCH_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            database_url: var("DATABASE_URL"),
            openai_api_key: var("OPENAI_API_KEY"),
            openai_base_url: var("OPENAI_BASE_URL"),
            scoring_model: var("JOBWATCH_SCORING_MODEL").unwrap_or_else(|| "gpt-4o".to_string()),
            scoring_prompt_file: var("JOBWATCH_SCORING_PROMPT_FILE").map(PathBuf::from),
            embedding_model: var("JOBWATCH_EMBEDDING_MODEL")
                .unwrap_or_else(|| "text-embedding-ada-002".to_string()),
            embedding_dims: parse_var(&var, "JOBWATCH_EMBEDDING_DIMS", 1536)?,
            stale_after,
            batch_size,
            request_delay: Duration::from_millis(parse_var(&var, "JOBWATCH_REQUEST_DELAY_MS", 1000)?),
            http_timeout: Duration::from_secs(parse_var(&var, "JOBWATCH_HTTP_TIMEOUT_SECS", 20)?),
            ai_timeout: Duration::from_secs(parse_var(&var, "JOBWATCH_AI_TIMEOUT_SECS", 30)?),
            db_timeout: Duration::from_secs(parse_var(&var, "JOBWATCH_DB_TIMEOUT_SECS", 30)?),
            db_max_connections: parse_var(&var, "JOBWATCH_DB_MAX_CONNECTIONS", 5)?,
            max_pages: parse_var(&var, "JOBWATCH_MAX_PAGES", 50)?,
            score_limit: parse_var(&var, "JOBWATCH_SCORE_LIMIT", 100)?,
            embed_limit: parse_var(&var, "JOBWATCH_EMBED_LIMIT", 1000)?,
            enrich_limit: parse_var(&var, "JOBWATCH_ENRICH_LIMIT", 200)?,
            sweep_page_size: parse_var(&var, "JOBWATCH_SWEEP_PAGE_SIZE", 500)?,
            user_agent: var("JOBWATCH_USER_AGENT").unwrap_or_else(|| "jobwatch-bot/0.1".to_string()),
            scheduler_enabled: var("JOBWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sweep_cron: var("SWEEP_CRON").unwrap_or_else(|| "0 0 3 * * *".to_string()),
            pipeline_cron: var("PIPELINE_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            reports_dir: var("JOBWATCH_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("reports")),
            sources_file: var("JOBWATCH_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("sources.yaml")),
            workspace_root,
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url.as_deref().ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    pub fn require_openai_key(&self) -> Result<&str, ConfigError> {
        self.openai_api_key.as_deref().ok_or(ConfigError::Missing("OPENAI_API_KEY"))
    }

    /// Records observed before this instant are stale.
    pub fn stale_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        crate::stale_cutoff(now, self.stale_after)
    }
}

fn parse_var<T, V>(var: &V, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    match var(name) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        }),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

pub async fn load_source_registry(path: &Path) -> Result<SourceRegistry> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
