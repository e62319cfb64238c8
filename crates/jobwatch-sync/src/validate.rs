use chrono::Utc;
use jobwatch_adapters::{DetailSource, PageVerdict};
use jobwatch_storage::{JobStore, StoreError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{log_failure, PassOptions, RecordFailure};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidateReport {
    pub checked: usize,
    pub expired: usize,
    pub kept: usize,
    /// Pages that could not be read or were empty; always kept.
    pub uncertain: usize,
    pub failed: usize,
    pub failures: Vec<RecordFailure>,
}

/// Visits each active record's own page and soft-deletes it only when the page
/// carries the explicit expiry marker. Fetch errors and empty pages keep the
/// record.
///
/// This is the alternative to the timestamp sweep and is not part of the
/// default pipeline.
pub async fn validate_active(
    store: &dyn JobStore,
    detail: &dyn DetailSource,
    options: PassOptions,
) -> Result<ValidateReport, StoreError> {
    let jobs = store.active_jobs(options.limit, 0).await?;
    let mut report = ValidateReport::default();

    for (index, job) in jobs.iter().enumerate() {
        if index > 0 && !options.delay.is_zero() {
            tokio::time::sleep(options.delay).await;
        }
        report.checked += 1;

        let url = job.attributes.job_url.as_deref();
        let fetched = match tokio::time::timeout(options.call_timeout, detail.fetch_detail(&job.key, url)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(key = %job.key, "detail fetch timed out");
                report.uncertain += 1;
                continue;
            }
        };

        match PageVerdict::from_fetch(&fetched) {
            PageVerdict::Live => report.kept += 1,
            PageVerdict::Unknown => {
                debug!(key = %job.key, "page unreadable; keeping");
                report.uncertain += 1;
            }
            PageVerdict::Expired => match store.soft_delete(&job.key, Utc::now()).await {
                Ok(true) => {
                    info!(key = %job.key, "listing page marked expired; soft-deleted");
                    report.expired += 1;
                }
                Ok(false) => report.kept += 1,
                Err(err) => {
                    warn!(key = %job.key, error = %err, "soft delete failed");
                    report.failed += 1;
                    let failure = RecordFailure::new("validate", Some(job.key.clone()), err.to_string());
                    log_failure(store, &failure, url).await;
                    report.failures.push(failure);
                }
            },
        }
    }

    info!(
        checked = report.checked,
        expired = report.expired,
        kept = report.kept,
        uncertain = report.uncertain,
        "validation finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use jobwatch_adapters::FixtureDetailSource;
    use jobwatch_core::{JobAttributes, JobKey, NewJob};
    use jobwatch_storage::MemoryJobStore;

    fn key(k: &str) -> JobKey {
        JobKey::new(k).unwrap()
    }

    #[tokio::test]
    async fn only_explicit_marker_deletes() {
        let store = MemoryJobStore::new();
        let jobs: Vec<NewJob> = ["h1601234", "h1601240", "h0000000"]
            .into_iter()
            .map(|k| NewJob {
                key: key(k),
                attributes: JobAttributes::default(),
            })
            .collect();
        store.insert_new(&jobs, Utc::now()).await;

        let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/jobindex");
        let detail = FixtureDetailSource::new(dir);
        let options = PassOptions {
            limit: 10,
            call_timeout: Duration::from_secs(20),
            delay: Duration::ZERO,
        };

        let report = validate_active(&store, &detail, options).await.unwrap();
        assert_eq!(report.checked, 3);
        assert_eq!(report.expired, 1);
        assert_eq!(report.kept, 1);
        assert_eq!(report.uncertain, 1);

        assert!(!store.get(&key("h1601234")).await.unwrap().unwrap().is_active());
        assert!(store.get(&key("h1601240")).await.unwrap().unwrap().is_active());
        assert!(store.get(&key("h0000000")).await.unwrap().unwrap().is_active());
    }
}
