//! Ingestion, staleness sweeping and annotation passes over a [`JobStore`].

use chrono::Utc;
use jobwatch_core::JobKey;
use jobwatch_storage::{FailureRecord, JobStore};
use serde::Serialize;
use tracing::warn;

mod annotate;
mod config;
mod ingest;
mod pipeline;
mod regions;
mod report;
mod sweep;
#[cfg(test)]
mod test_support;
mod validate;

pub use annotate::{embed_pending, enrich_missing, score_pending, EmbedReport, EnrichReport, PassOptions, ScoreReport};
pub use config::{load_source_registry, ConfigError, SourceRegistry, SyncConfig, MAX_STALE_AFTER_HOURS};
pub use ingest::{ingest_batch, ingest_source, IngestOptions, IngestReport};
pub use pipeline::{run_sync_once_from_env, Pipeline};
pub use regions::{map_regions, RegionOptions, RegionReport};
pub use report::{report_recent_markdown, write_run_report, PassError, RunSummary, RunTotals};
pub use sweep::{restore, stale_cutoff, sweep, SweepOptions, SweepReport};
pub use validate::{validate_active, ValidateReport};

pub const CRATE_NAME: &str = "jobwatch-sync";

/// Per-record failure surfaced to the caller so only the failed subset needs retrying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub stage: &'static str,
    pub key: Option<JobKey>,
    pub reason: String,
}

impl RecordFailure {
    pub fn new(stage: &'static str, key: Option<JobKey>, reason: impl Into<String>) -> Self {
        Self {
            stage,
            key,
            reason: reason.into(),
        }
    }
}

/// Writes to the failure ledger; a ledger error is logged and otherwise ignored.
pub(crate) async fn log_failure(store: &dyn JobStore, failure: &RecordFailure, url: Option<&str>) {
    let record = FailureRecord {
        stage: failure.stage.to_string(),
        key: failure.key.clone(),
        url: url.map(str::to_string),
        message: failure.reason.clone(),
        logged_at: Utc::now(),
    };
    if let Err(err) = store.record_failure(&record).await {
        warn!(stage = failure.stage, error = %err, "could not write failure ledger entry");
    }
}
