//! Job store contract, Postgres + in-memory implementations, and HTTP fetch utilities.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::{Embedding, JobAttributes, JobKey, JobRecord, Lifecycle, NewJob, Region, RelevanceScore};
use serde::Serialize;
use thiserror::Error;

mod http;
mod memory;
mod postgres;

pub use http::{retryable_error, retryable_status, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RetryPolicy};
pub use memory::MemoryJobStore;
pub use postgres::{PgJobStore, PgStoreConfig};

pub const CRATE_NAME: &str = "jobwatch-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("stored row for {key} is invalid: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("{0}")]
    Rejected(String),
}

/// Outcome of one batched insert, attributed per record.
#[derive(Debug, Default)]
pub struct InsertReport {
    pub inserted: Vec<JobKey>,
    /// Keys another writer inserted between the existence check and this write.
    pub conflicted: Vec<JobKey>,
    pub failed: Vec<(JobKey, StoreError)>,
}

/// Active record eligible for expiry, as read at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleCandidate {
    pub key: JobKey,
    pub observed_at: DateTime<Utc>,
}

/// Keyset position inside a sweep; candidates strictly after it are returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepCursor {
    pub observed_at: DateTime<Utc>,
    pub key: JobKey,
}

impl From<&StaleCandidate> for SweepCursor {
    fn from(candidate: &StaleCandidate) -> Self {
        Self {
            observed_at: candidate.observed_at,
            key: candidate.key.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSelector {
    Keys(Vec<JobKey>),
    All,
}

/// What happens to `last_seen` when a record is restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LastSeenOnRestore {
    #[default]
    Keep,
    /// Reset to `created_at`.
    CreatedAt,
    /// Set to the restore time, giving a full staleness window.
    Now(DateTime<Utc>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStatistics {
    pub total: i64,
    pub active: i64,
    pub deleted: i64,
    pub pending_stale: i64,
    pub scored: i64,
    pub score_distribution: [i64; 4],
    pub relevant: i64,
    pub embedded: i64,
    pub with_region: i64,
}

/// Best-effort failure ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub stage: String,
    pub key: Option<JobKey>,
    pub url: Option<String>,
    pub message: String,
    pub logged_at: DateTime<Utc>,
}

/// Relational store for job records.
///
/// Every read path named "active" excludes soft-deleted rows. Writes owned by
/// one responsibility (touch, score, embedding, backfill) only apply to active
/// rows and never overwrite a value that is already set.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Lifecycle of every candidate key already stored, active or deleted.
    async fn existing_keys(&self, keys: &[JobKey]) -> Result<HashMap<JobKey, Lifecycle>, StoreError>;

    async fn insert_new(&self, jobs: &[NewJob], now: DateTime<Utc>) -> InsertReport;

    /// Moves `last_seen` forward for active rows. Returns rows touched.
    async fn touch_last_seen(&self, keys: &[JobKey], now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn get(&self, key: &JobKey) -> Result<Option<JobRecord>, StoreError>;

    /// Active records, oldest publication first.
    async fn active_jobs(&self, limit: i64, offset: i64) -> Result<Vec<JobRecord>, StoreError>;

    /// Active records observed before `cutoff`, oldest observation first.
    async fn stale_candidates(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<&SweepCursor>,
        limit: i64,
    ) -> Result<Vec<StaleCandidate>, StoreError>;

    /// Soft-deletes `key` only if it is still active and still observed before `cutoff`.
    async fn expire_if_stale(
        &self,
        key: &JobKey,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn soft_delete(&self, key: &JobKey, now: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn restore(
        &self,
        selector: &RestoreSelector,
        last_seen: LastSeenOnRestore,
    ) -> Result<Vec<JobKey>, StoreError>;

    /// Active records without a score, oldest first.
    async fn unscored_jobs(&self, limit: i64) -> Result<Vec<JobRecord>, StoreError>;

    /// Writes the score unless the record is already scored or deleted.
    async fn record_score(
        &self,
        key: &JobKey,
        score: RelevanceScore,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn jobs_missing_embedding(
        &self,
        min_score: RelevanceScore,
        limit: i64,
    ) -> Result<Vec<JobRecord>, StoreError>;

    async fn record_embedding(
        &self,
        key: &JobKey,
        embedding: &Embedding,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Active records with a blank company, company url or description.
    async fn jobs_missing_attributes(&self, limit: i64) -> Result<Vec<JobRecord>, StoreError>;

    /// Fills blank attributes from `scraped`; returns the field names written.
    async fn backfill_attributes(
        &self,
        key: &JobKey,
        scraped: &JobAttributes,
    ) -> Result<Vec<&'static str>, StoreError>;

    /// Active records without a region, in key order, strictly after `after`.
    async fn jobs_missing_region(&self, after: Option<&JobKey>, limit: i64) -> Result<Vec<JobRecord>, StoreError>;

    /// Operator-maintained city to region overrides.
    async fn city_regions(&self) -> Result<HashMap<String, Region>, StoreError>;

    /// Writes the region unless the record already has one or is deleted.
    async fn record_region(&self, key: &JobKey, region: Region) -> Result<bool, StoreError>;

    async fn statistics(&self, stale_cutoff: DateTime<Utc>) -> Result<StoreStatistics, StoreError>;

    async fn record_failure(&self, failure: &FailureRecord) -> Result<(), StoreError>;
}
