use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobwatch_adapters::ListingSource;
use jobwatch_core::{extract_key, JobAttributes, JobKey, Lifecycle, NewJob, RawListing};
use jobwatch_storage::JobStore;
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{log_failure, RecordFailure};

const STAGE: &str = "ingest";

/// Counts for one or more ingested batches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub pages: usize,
    pub failed_pages: usize,
    pub inserted: usize,
    /// Known, active keys whose `last_seen` was moved forward.
    pub reobserved: usize,
    /// Known keys whose stored row is soft-deleted, at lookup or by the time of
    /// the touch; left untouched.
    pub reobserved_deleted: usize,
    pub extraction_errors: usize,
    pub duplicates_in_batch: usize,
    /// Keys already handed to ingestion earlier in the same paging run.
    pub duplicates_in_run: usize,
    pub failures: Vec<RecordFailure>,
}

impl IngestReport {
    /// Records that were already stored, active or not.
    pub fn known(&self) -> usize {
        self.reobserved + self.reobserved_deleted
    }

    pub fn absorb(&mut self, other: IngestReport) {
        self.pages += other.pages;
        self.failed_pages += other.failed_pages;
        self.inserted += other.inserted;
        self.reobserved += other.reobserved;
        self.reobserved_deleted += other.reobserved_deleted;
        self.extraction_errors += other.extraction_errors;
        self.duplicates_in_batch += other.duplicates_in_batch;
        self.duplicates_in_run += other.duplicates_in_run;
        self.failures.extend(other.failures);
    }
}

/// Ingests one scraped batch: new keys are inserted, known active keys are touched.
///
/// Never fails as a whole. Store errors are attributed to the records they
/// affect and returned in [`IngestReport::failures`].
pub async fn ingest_batch(store: &dyn JobStore, batch: Vec<RawListing>, now: DateTime<Utc>) -> IngestReport {
    let mut report = IngestReport::default();

    let mut keyed: Vec<(JobKey, RawListing)> = Vec::with_capacity(batch.len());
    let mut in_batch = HashSet::new();
    for raw in batch {
        match extract_key(&raw) {
            Ok(key) => {
                if in_batch.insert(key.clone()) {
                    keyed.push((key, raw));
                } else {
                    debug!(%key, "duplicate key within batch");
                    report.duplicates_in_batch += 1;
                }
            }
            Err(err) => {
                warn!(error = %err, fields = ?raw.fields.keys().collect::<Vec<_>>(), "dropping listing without a key");
                report.extraction_errors += 1;
            }
        }
    }
    if keyed.is_empty() {
        return report;
    }

    let keys: Vec<JobKey> = keyed.iter().map(|(key, _)| key.clone()).collect();
    let existing = match store.existing_keys(&keys).await {
        Ok(existing) => existing,
        Err(err) => {
            warn!(error = %err, batch = keys.len(), "existing-key lookup failed; batch not ingested");
            for key in keys {
                let failure = RecordFailure::new(STAGE, Some(key), format!("existing-key lookup failed: {err}"));
                log_failure(store, &failure, None).await;
                report.failures.push(failure);
            }
            return report;
        }
    };

    let mut new_jobs = Vec::new();
    let mut to_touch = Vec::new();
    for (key, raw) in keyed {
        match existing.get(&key) {
            None => new_jobs.push(NewJob {
                attributes: JobAttributes::from_raw(&raw),
                key,
            }),
            Some(Lifecycle::Active) => to_touch.push(key),
            Some(Lifecycle::Deleted { at }) => {
                debug!(%key, deleted_at = %at, "re-observed a deleted listing; not restoring");
                report.reobserved_deleted += 1;
            }
        }
    }

    if !new_jobs.is_empty() {
        let outcome = store.insert_new(&new_jobs, now).await;
        report.inserted += outcome.inserted.len();
        // Lost an insert race: the row exists now, so treat it as known.
        to_touch.extend(outcome.conflicted);
        for (key, err) in outcome.failed {
            let url = new_jobs
                .iter()
                .find(|job| job.key == key)
                .and_then(|job| job.attributes.job_url.clone());
            warn!(%key, error = %err, "insert failed");
            let failure = RecordFailure::new(STAGE, Some(key), format!("insert failed: {err}"));
            log_failure(store, &failure, url.as_deref()).await;
            report.failures.push(failure);
        }
    }

    if !to_touch.is_empty() {
        match store.touch_last_seen(&to_touch, now).await {
            Ok(touched) => {
                let touched = usize::try_from(touched).unwrap_or(usize::MAX).min(to_touch.len());
                debug!(requested = to_touch.len(), touched, "touched last_seen");
                report.reobserved += touched;
                // Rows are never removed, so a key the touch missed was soft-deleted after the lookup.
                report.reobserved_deleted += to_touch.len() - touched;
            }
            Err(err) => {
                warn!(error = %err, keys = to_touch.len(), "last_seen touch failed");
                for key in to_touch {
                    let failure = RecordFailure::new(STAGE, Some(key), format!("last_seen touch failed: {err}"));
                    log_failure(store, &failure, None).await;
                    report.failures.push(failure);
                }
            }
        }
    }

    report
}

#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    pub batch_size: usize,
    pub max_pages: u32,
    /// Pause between consecutive page fetches.
    pub page_delay: Duration,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_pages: 50,
            page_delay: Duration::from_millis(1000),
        }
    }
}

/// Number of consecutive empty pages after which paging stops.
const EMPTY_PAGE_LIMIT: usize = 2;

/// Pages through a listing source and ingests each page in batches.
///
/// Stops at `max_pages`, after consecutive empty pages, or when the source
/// reports no further page. A page that fails to load is skipped.
pub async fn ingest_source(store: &dyn JobStore, source: &dyn ListingSource, options: IngestOptions) -> IngestReport {
    let source_id = source.source_id().to_string();
    let span = info_span!("ingest_source", source_id = %source_id);
    async move {
        let mut report = IngestReport::default();
        let mut seen: HashSet<JobKey> = HashSet::new();
        let mut empty_streak = 0usize;

        for page_no in 1..=options.max_pages.max(1) {
            if page_no > 1 && !options.page_delay.is_zero() {
                tokio::time::sleep(options.page_delay).await;
            }

            let page = match source.fetch_page(page_no).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(page_no, error = %err, "listing page failed; skipping");
                    report.failed_pages += 1;
                    let failure = RecordFailure::new("fetch_page", None, format!("page {page_no}: {err}"));
                    log_failure(store, &failure, None).await;
                    report.failures.push(failure);
                    empty_streak += 1;
                    if empty_streak >= EMPTY_PAGE_LIMIT {
                        break;
                    }
                    continue;
                }
            };
            report.pages += 1;

            if page.listings.is_empty() {
                empty_streak += 1;
                debug!(page_no, empty_streak, "empty listing page");
                if empty_streak >= EMPTY_PAGE_LIMIT || !page.has_next {
                    break;
                }
                continue;
            }
            empty_streak = 0;

            let mut fresh = Vec::with_capacity(page.listings.len());
            for raw in page.listings {
                if let Ok(key) = extract_key(&raw) {
                    if !seen.insert(key) {
                        report.duplicates_in_run += 1;
                        continue;
                    }
                }
                fresh.push(raw);
            }

            let mut remaining = fresh;
            while !remaining.is_empty() {
                let rest = remaining.split_off(remaining.len().min(options.batch_size.max(1)));
                let batch_report = ingest_batch(store, remaining, Utc::now()).await;
                report.absorb(batch_report);
                remaining = rest;
            }

            if !page.has_next {
                break;
            }
        }

        info!(
            pages = report.pages,
            failed_pages = report.failed_pages,
            inserted = report.inserted,
            reobserved = report.reobserved,
            reobserved_deleted = report.reobserved_deleted,
            extraction_errors = report.extraction_errors,
            failures = report.failures.len(),
            "ingestion finished"
        );
        report
    }
    .instrument(span)
    .await
}
