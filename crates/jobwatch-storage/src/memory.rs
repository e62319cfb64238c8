use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::{Embedding, JobAttributes, JobKey, JobRecord, Lifecycle, NewJob, Region, RelevanceScore};
use tokio::sync::Mutex;

use crate::{
    FailureRecord, InsertReport, JobStore, LastSeenOnRestore, RestoreSelector, StaleCandidate, StoreError,
    StoreStatistics, SweepCursor,
};

#[derive(Debug, Default)]
struct MemoryState {
    jobs: BTreeMap<JobKey, JobRecord>,
    failures: Vec<FailureRecord>,
    rejected_inserts: HashSet<JobKey>,
    city_regions: HashMap<String, Region>,
}

/// In-process [`JobStore`] with the same guards as the Postgres store.
/// Used for tests and for local dry runs without a database.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a record as-is, bypassing ingestion.
    pub async fn put(&self, record: JobRecord) {
        self.state.lock().await.jobs.insert(record.key.clone(), record);
    }

    /// Makes every later insert of `key` fail.
    pub async fn reject_inserts_of(&self, key: JobKey) {
        self.state.lock().await.rejected_inserts.insert(key);
    }

    pub async fn set_city_region(&self, city: &str, region: Region) {
        self.state.lock().await.city_regions.insert(city.to_lowercase(), region);
    }

    pub async fn snapshot(&self) -> Vec<JobRecord> {
        self.state.lock().await.jobs.values().cloned().collect()
    }

    pub async fn failures(&self) -> Vec<FailureRecord> {
        self.state.lock().await.failures.clone()
    }
}

fn sorted_by<F, K>(mut records: Vec<JobRecord>, key: F) -> Vec<JobRecord>
where
    F: Fn(&JobRecord) -> K,
    K: Ord,
{
    records.sort_by(|a, b| key(a).cmp(&key(b)));
    records
}

fn take(records: Vec<JobRecord>, offset: i64, limit: i64) -> Vec<JobRecord> {
    records
        .into_iter()
        .skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn existing_keys(&self, keys: &[JobKey]) -> Result<HashMap<JobKey, Lifecycle>, StoreError> {
        let state = self.state.lock().await;
        Ok(keys
            .iter()
            .filter_map(|key| state.jobs.get(key).map(|job| (key.clone(), job.lifecycle)))
            .collect())
    }

    async fn insert_new(&self, jobs: &[NewJob], now: DateTime<Utc>) -> InsertReport {
        let mut state = self.state.lock().await;
        let mut report = InsertReport::default();
        for job in jobs {
            if state.rejected_inserts.contains(&job.key) {
                report.failed.push((
                    job.key.clone(),
                    StoreError::Rejected(format!("insert of {} rejected", job.key)),
                ));
            } else if state.jobs.contains_key(&job.key) {
                report.conflicted.push(job.key.clone());
            } else {
                state.jobs.insert(job.key.clone(), JobRecord::new(job.clone(), now));
                report.inserted.push(job.key.clone());
            }
        }
        report
    }

    async fn touch_last_seen(&self, keys: &[JobKey], now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut touched = 0;
        for key in keys {
            if let Some(job) = state.jobs.get_mut(key).filter(|job| job.is_active()) {
                job.last_seen = Some(job.last_seen.map_or(now, |seen| seen.max(now)));
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn get(&self, key: &JobKey) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.state.lock().await.jobs.get(key).cloned())
    }

    async fn active_jobs(&self, limit: i64, offset: i64) -> Result<Vec<JobRecord>, StoreError> {
        let state = self.state.lock().await;
        let active = state.jobs.values().filter(|job| job.is_active()).cloned().collect();
        let ordered = sorted_by(active, |job| {
            (
                job.attributes.publication_date.is_some(),
                job.attributes.publication_date,
                job.created_at,
                job.key.clone(),
            )
        });
        Ok(take(ordered, offset, limit))
    }

    async fn stale_candidates(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<&SweepCursor>,
        limit: i64,
    ) -> Result<Vec<StaleCandidate>, StoreError> {
        let state = self.state.lock().await;
        let mut candidates: Vec<StaleCandidate> = state
            .jobs
            .values()
            .filter(|job| job.is_active() && job.observed_at() < cutoff)
            .map(|job| StaleCandidate {
                key: job.key.clone(),
                observed_at: job.observed_at(),
            })
            .filter(|c| match after {
                Some(cursor) => (c.observed_at, &c.key) > (cursor.observed_at, &cursor.key),
                None => true,
            })
            .collect();
        candidates.sort_by(|a, b| (a.observed_at, &a.key).cmp(&(b.observed_at, &b.key)));
        candidates.truncate(limit.max(0) as usize);
        Ok(candidates)
    }

    async fn expire_if_stale(
        &self,
        key: &JobKey,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(key) {
            Some(job) if job.is_active() && job.observed_at() < cutoff => {
                job.lifecycle = Lifecycle::Deleted { at: now };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn soft_delete(&self, key: &JobKey, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(key) {
            Some(job) if job.is_active() => {
                job.lifecycle = Lifecycle::Deleted { at: now };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn restore(
        &self,
        selector: &RestoreSelector,
        last_seen: LastSeenOnRestore,
    ) -> Result<Vec<JobKey>, StoreError> {
        let mut state = self.state.lock().await;
        let mut restored = Vec::new();
        for job in state.jobs.values_mut() {
            if job.is_active() {
                continue;
            }
            if let RestoreSelector::Keys(keys) = selector {
                if !keys.contains(&job.key) {
                    continue;
                }
            }
            job.lifecycle = Lifecycle::Active;
            match last_seen {
                LastSeenOnRestore::Keep => {}
                LastSeenOnRestore::CreatedAt => job.last_seen = Some(job.created_at),
                LastSeenOnRestore::Now(now) => job.last_seen = Some(now),
            }
            restored.push(job.key.clone());
        }
        Ok(restored)
    }

    async fn unscored_jobs(&self, limit: i64) -> Result<Vec<JobRecord>, StoreError> {
        let state = self.state.lock().await;
        let pending = state
            .jobs
            .values()
            .filter(|job| job.is_active() && job.relevance_score.is_none())
            .cloned()
            .collect();
        Ok(take(sorted_by(pending, |job| (job.created_at, job.key.clone())), 0, limit))
    }

    async fn record_score(
        &self,
        key: &JobKey,
        score: RelevanceScore,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(key) {
            Some(job) if job.is_active() && job.relevance_score.is_none() => {
                job.relevance_score = Some(score);
                job.scored_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn jobs_missing_embedding(
        &self,
        min_score: RelevanceScore,
        limit: i64,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let state = self.state.lock().await;
        let pending = state
            .jobs
            .values()
            .filter(|job| {
                job.is_active()
                    && job.embedding.is_none()
                    && job.relevance_score.is_some_and(|s| s >= min_score)
            })
            .cloned()
            .collect();
        Ok(take(sorted_by(pending, |job| (job.created_at, job.key.clone())), 0, limit))
    }

    async fn record_embedding(
        &self,
        key: &JobKey,
        embedding: &Embedding,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(key) {
            Some(job) if job.is_active() && job.embedding.is_none() => {
                job.embedding = Some(embedding.clone());
                job.embedded_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn jobs_missing_attributes(&self, limit: i64) -> Result<Vec<JobRecord>, StoreError> {
        let state = self.state.lock().await;
        let pending = state
            .jobs
            .values()
            .filter(|job| {
                job.is_active()
                    && job.attributes.missing_fields().iter().any(|field| {
                        matches!(
                            *field,
                            jobwatch_core::fields::COMPANY
                                | jobwatch_core::fields::COMPANY_URL
                                | jobwatch_core::fields::DESCRIPTION
                        )
                    })
            })
            .cloned()
            .collect();
        Ok(take(
            sorted_by(pending, |job| (std::cmp::Reverse(job.created_at), job.key.clone())),
            0,
            limit,
        ))
    }

    async fn backfill_attributes(
        &self,
        key: &JobKey,
        scraped: &JobAttributes,
    ) -> Result<Vec<&'static str>, StoreError> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(key) {
            Some(job) if job.is_active() => Ok(job.attributes.fill_missing_from(scraped)),
            _ => Ok(Vec::new()),
        }
    }

    async fn jobs_missing_region(&self, after: Option<&JobKey>, limit: i64) -> Result<Vec<JobRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.is_active() && job.region.is_none())
            .filter(|job| after.map_or(true, |cursor| &job.key > cursor))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn city_regions(&self) -> Result<HashMap<String, Region>, StoreError> {
        Ok(self.state.lock().await.city_regions.clone())
    }

    async fn record_region(&self, key: &JobKey, region: Region) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(key) {
            Some(job) if job.is_active() && job.region.is_none() => {
                job.region = Some(region);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn statistics(&self, stale_cutoff: DateTime<Utc>) -> Result<StoreStatistics, StoreError> {
        let state = self.state.lock().await;
        let mut stats = StoreStatistics::default();
        for job in state.jobs.values() {
            stats.total += 1;
            if !job.is_active() {
                stats.deleted += 1;
                continue;
            }
            stats.active += 1;
            if job.observed_at() < stale_cutoff {
                stats.pending_stale += 1;
            }
            if job.region.is_some() {
                stats.with_region += 1;
            }
            if let Some(score) = job.relevance_score {
                stats.scored += 1;
                stats.score_distribution[usize::from(score.value())] += 1;
                if score.is_relevant() {
                    stats.relevant += 1;
                    if job.embedding.is_some() {
                        stats.embedded += 1;
                    }
                }
            }
        }
        Ok(stats)
    }

    async fn record_failure(&self, failure: &FailureRecord) -> Result<(), StoreError> {
        self.state.lock().await.failures.push(failure.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    fn new_job(key: &str) -> NewJob {
        NewJob {
            key: JobKey::new(key).unwrap(),
            attributes: JobAttributes::default(),
        }
    }

    #[tokio::test]
    async fn touch_never_moves_last_seen_backwards_or_revives_deleted_rows() {
        let store = MemoryJobStore::new();
        store.insert_new(&[new_job("a"), new_job("b")], at(10)).await;
        let b = JobKey::new("b").unwrap();
        store.soft_delete(&b, at(11)).await.unwrap();

        let touched = store
            .touch_last_seen(&[JobKey::new("a").unwrap(), b.clone()], at(9))
            .await
            .unwrap();
        assert_eq!(touched, 1);

        let a = store.get(&JobKey::new("a").unwrap()).await.unwrap().unwrap();
        assert_eq!(a.last_seen, Some(at(10)));
        let b = store.get(&b).await.unwrap().unwrap();
        assert!(!b.is_active());
    }

    #[tokio::test]
    async fn stale_candidates_page_with_keyset_cursor() {
        let store = MemoryJobStore::new();
        store.insert_new(&[new_job("c"), new_job("a")], at(1)).await;
        store.insert_new(&[new_job("b")], at(0)).await;

        let cutoff = at(5);
        let first = store.stale_candidates(cutoff, None, 2).await.unwrap();
        let keys: Vec<_> = first.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "a"]);

        let cursor = SweepCursor::from(first.last().unwrap());
        let rest = store.stale_candidates(cutoff, Some(&cursor), 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].key.as_str(), "c");
    }

    #[tokio::test]
    async fn expire_rechecks_observation_at_write_time() {
        let store = MemoryJobStore::new();
        store.insert_new(&[new_job("a")], at(0)).await;
        let key = JobKey::new("a").unwrap();
        store.touch_last_seen(&[key.clone()], at(8)).await.unwrap();

        assert!(!store.expire_if_stale(&key, at(6), at(9)).await.unwrap());
        assert!(store.expire_if_stale(&key, at(8) + Duration::minutes(1), at(9)).await.unwrap());
        assert!(!store.expire_if_stale(&key, at(12), at(13)).await.unwrap());
    }

    #[tokio::test]
    async fn statistics_count_lifecycle_and_annotations() {
        let store = MemoryJobStore::new();
        store.insert_new(&[new_job("a"), new_job("b"), new_job("c")], at(0)).await;
        let a = JobKey::new("a").unwrap();
        store
            .record_score(&a, RelevanceScore::try_from(2).unwrap(), at(1))
            .await
            .unwrap();
        store.soft_delete(&JobKey::new("c").unwrap(), at(2)).await.unwrap();

        let stats = store.statistics(at(1)).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.pending_stale, 2);
        assert_eq!(stats.score_distribution, [0, 0, 1, 0]);
        assert_eq!(stats.relevant, 1);
        assert_eq!(stats.embedded, 0);
    }
}
