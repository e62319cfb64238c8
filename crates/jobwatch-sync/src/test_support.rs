//! Store wrapper that injects concurrent writes and failures into a [`MemoryJobStore`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::{Embedding, JobAttributes, JobKey, JobRecord, Lifecycle, NewJob, Region, RelevanceScore};
use jobwatch_storage::{
    FailureRecord, InsertReport, JobStore, LastSeenOnRestore, MemoryJobStore, RestoreSelector, StaleCandidate,
    StoreError, StoreStatistics, SweepCursor,
};

#[derive(Debug, Default)]
pub(crate) struct InterferingStore {
    pub inner: MemoryJobStore,
    /// Soft-deleted right before each touch, the way a concurrent sweep would.
    pub delete_before_touch: Option<JobKey>,
    /// Touched right after each candidate scan, the way concurrent ingestion would.
    pub touch_after_scan: Option<(JobKey, DateTime<Utc>)>,
    pub fail_unscored_reads: bool,
    pub fail_region_reads: bool,
}

impl InterferingStore {
    pub fn new(inner: MemoryJobStore) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }
}

fn unavailable(what: &str) -> StoreError {
    StoreError::Rejected(format!("{what} unavailable"))
}

#[async_trait]
impl JobStore for InterferingStore {
    async fn existing_keys(&self, keys: &[JobKey]) -> Result<HashMap<JobKey, Lifecycle>, StoreError> {
        self.inner.existing_keys(keys).await
    }

    async fn insert_new(&self, jobs: &[NewJob], now: DateTime<Utc>) -> InsertReport {
        self.inner.insert_new(jobs, now).await
    }

    async fn touch_last_seen(&self, keys: &[JobKey], now: DateTime<Utc>) -> Result<u64, StoreError> {
        if let Some(key) = &self.delete_before_touch {
            self.inner.soft_delete(key, now).await?;
        }
        self.inner.touch_last_seen(keys, now).await
    }

    async fn get(&self, key: &JobKey) -> Result<Option<JobRecord>, StoreError> {
        self.inner.get(key).await
    }

    async fn active_jobs(&self, limit: i64, offset: i64) -> Result<Vec<JobRecord>, StoreError> {
        self.inner.active_jobs(limit, offset).await
    }

    async fn stale_candidates(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<&SweepCursor>,
        limit: i64,
    ) -> Result<Vec<StaleCandidate>, StoreError> {
        let candidates = self.inner.stale_candidates(cutoff, after, limit).await?;
        if let Some((key, at)) = &self.touch_after_scan {
            self.inner.touch_last_seen(std::slice::from_ref(key), *at).await?;
        }
        Ok(candidates)
    }

    async fn expire_if_stale(
        &self,
        key: &JobKey,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.expire_if_stale(key, cutoff, now).await
    }

    async fn soft_delete(&self, key: &JobKey, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.inner.soft_delete(key, now).await
    }

    async fn restore(
        &self,
        selector: &RestoreSelector,
        last_seen: LastSeenOnRestore,
    ) -> Result<Vec<JobKey>, StoreError> {
        self.inner.restore(selector, last_seen).await
    }

    async fn unscored_jobs(&self, limit: i64) -> Result<Vec<JobRecord>, StoreError> {
        if self.fail_unscored_reads {
            return Err(unavailable("unscored jobs"));
        }
        self.inner.unscored_jobs(limit).await
    }

    async fn record_score(
        &self,
        key: &JobKey,
        score: RelevanceScore,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.record_score(key, score, now).await
    }

    async fn jobs_missing_embedding(
        &self,
        min_score: RelevanceScore,
        limit: i64,
    ) -> Result<Vec<JobRecord>, StoreError> {
        self.inner.jobs_missing_embedding(min_score, limit).await
    }

    async fn record_embedding(
        &self,
        key: &JobKey,
        embedding: &Embedding,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.record_embedding(key, embedding, now).await
    }

    async fn jobs_missing_attributes(&self, limit: i64) -> Result<Vec<JobRecord>, StoreError> {
        self.inner.jobs_missing_attributes(limit).await
    }

    async fn backfill_attributes(
        &self,
        key: &JobKey,
        scraped: &JobAttributes,
    ) -> Result<Vec<&'static str>, StoreError> {
        self.inner.backfill_attributes(key, scraped).await
    }

    async fn jobs_missing_region(&self, after: Option<&JobKey>, limit: i64) -> Result<Vec<JobRecord>, StoreError> {
        if self.fail_region_reads {
            return Err(unavailable("region candidates"));
        }
        self.inner.jobs_missing_region(after, limit).await
    }

    async fn city_regions(&self) -> Result<HashMap<String, Region>, StoreError> {
        self.inner.city_regions().await
    }

    async fn record_region(&self, key: &JobKey, region: Region) -> Result<bool, StoreError> {
        self.inner.record_region(key, region).await
    }

    async fn statistics(&self, stale_cutoff: DateTime<Utc>) -> Result<StoreStatistics, StoreError> {
        self.inner.statistics(stale_cutoff).await
    }

    async fn record_failure(&self, failure: &FailureRecord) -> Result<(), StoreError> {
        self.inner.record_failure(failure).await
    }
}
