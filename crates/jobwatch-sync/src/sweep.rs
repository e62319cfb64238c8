use chrono::{DateTime, Utc};
use jobwatch_core::JobKey;
use jobwatch_storage::{JobStore, LastSeenOnRestore, RestoreSelector, StoreError, SweepCursor};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::RecordFailure;

#[derive(Debug, Clone, Copy)]
pub struct SweepOptions {
    pub threshold: chrono::Duration,
    /// Candidates read per keyset page.
    pub page_size: i64,
    /// Scan and count without deleting.
    pub dry_run: bool,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            threshold: chrono::Duration::hours(48),
            page_size: 500,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub cutoff: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub scanned: usize,
    /// Soft-deleted records; in a dry run, records that would have been.
    pub expired: usize,
    /// Candidates re-observed (or deleted elsewhere) between snapshot and write.
    pub skipped: usize,
    pub failed: usize,
    /// A candidate page could not be read; the sweep stopped early.
    pub interrupted: bool,
    pub failures: Vec<RecordFailure>,
}

/// `now - threshold`, clamped to the earliest representable instant so a very
/// wide window expires nothing instead of overflowing.
pub fn stale_cutoff(now: DateTime<Utc>, threshold: chrono::Duration) -> DateTime<Utc> {
    now.checked_sub_signed(threshold).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Soft-deletes active records not observed within `threshold` of `now`.
///
/// Candidates are visited oldest observation first through a keyset cursor, so
/// an interrupted sweep leaves a consistent store and a rerun picks up where
/// it stopped. Each deletion re-checks staleness at write time; a record
/// touched after it was read is skipped rather than expired.
pub async fn sweep(store: &dyn JobStore, options: SweepOptions, now: DateTime<Utc>) -> SweepReport {
    let cutoff = stale_cutoff(now, options.threshold);
    let span = info_span!("sweep", %cutoff, dry_run = options.dry_run);
    async move {
        let mut report = SweepReport {
            cutoff: Some(cutoff),
            dry_run: options.dry_run,
            ..Default::default()
        };
        let page_size = options.page_size.max(1);
        let mut cursor: Option<SweepCursor> = None;

        loop {
            let page = match store.stale_candidates(cutoff, cursor.as_ref(), page_size).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(error = %err, "reading stale candidates failed; stopping sweep");
                    report.interrupted = true;
                    report
                        .failures
                        .push(RecordFailure::new("sweep", None, format!("candidate scan failed: {err}")));
                    break;
                }
            };
            if page.is_empty() {
                break;
            }

            for candidate in &page {
                report.scanned += 1;
                if options.dry_run {
                    report.expired += 1;
                    continue;
                }
                match store.expire_if_stale(&candidate.key, cutoff, now).await {
                    Ok(true) => {
                        debug!(key = %candidate.key, observed_at = %candidate.observed_at, "expired");
                        report.expired += 1;
                    }
                    Ok(false) => {
                        debug!(key = %candidate.key, "re-observed since snapshot; kept");
                        report.skipped += 1;
                    }
                    Err(err) => {
                        warn!(key = %candidate.key, error = %err, "expiry failed");
                        report.failed += 1;
                        report.failures.push(RecordFailure::new(
                            "sweep",
                            Some(candidate.key.clone()),
                            err.to_string(),
                        ));
                    }
                }
            }

            let full_page = page.len() as i64 == page_size;
            cursor = page.last().map(SweepCursor::from);
            if !full_page {
                break;
            }
        }

        info!(
            scanned = report.scanned,
            expired = report.expired,
            skipped = report.skipped,
            failed = report.failed,
            "sweep finished"
        );
        report
    }
    .instrument(span)
    .await
}

/// Clears the soft delete on the selected records. Returns the keys restored.
pub async fn restore(
    store: &dyn JobStore,
    selector: &RestoreSelector,
    last_seen: LastSeenOnRestore,
) -> Result<Vec<JobKey>, StoreError> {
    let restored = store.restore(selector, last_seen).await?;
    info!(restored = restored.len(), ?last_seen, "restored listings");
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use jobwatch_core::{JobAttributes, JobRecord, Lifecycle, NewJob};
    use jobwatch_storage::MemoryJobStore;

    use crate::test_support::InterferingStore;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().unwrap()
    }

    fn key(k: &str) -> JobKey {
        JobKey::new(k).unwrap()
    }

    fn record(k: &str, created_hours_ago: i64, seen_hours_ago: Option<i64>) -> JobRecord {
        let mut record = JobRecord::new(
            NewJob {
                key: key(k),
                attributes: JobAttributes::default(),
            },
            now() - Duration::hours(created_hours_ago),
        );
        record.last_seen = seen_hours_ago.map(|h| now() - Duration::hours(h));
        record
    }

    fn options() -> SweepOptions {
        SweepOptions {
            threshold: Duration::hours(48),
            page_size: 2,
            dry_run: false,
        }
    }

    #[tokio::test]
    async fn record_unseen_for_fifty_hours_is_expired() {
        let store = MemoryJobStore::new();
        store.put(record("old", 100, Some(50))).await;
        store.put(record("fresh", 100, Some(1))).await;

        let report = sweep(&store, options(), now()).await;
        assert_eq!((report.scanned, report.expired, report.skipped), (1, 1, 0));

        let old = store.get(&key("old")).await.unwrap().unwrap();
        assert_eq!(old.lifecycle, Lifecycle::Deleted { at: now() });
        assert!(store.get(&key("fresh")).await.unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn never_reobserved_records_age_from_created_at() {
        let store = MemoryJobStore::new();
        store.put(record("never-seen-old", 60, None)).await;
        store.put(record("never-seen-new", 10, None)).await;

        let report = sweep(&store, options(), now()).await;
        assert_eq!(report.expired, 1);
        assert!(!store.get(&key("never-seen-old")).await.unwrap().unwrap().is_active());
        assert!(store.get(&key("never-seen-new")).await.unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn after_sweep_every_active_record_is_within_threshold() {
        let store = MemoryJobStore::new();
        for (i, hours) in [3, 47, 49, 72, 200, 12, 48].into_iter().enumerate() {
            store.put(record(&format!("k{i}"), 300, Some(hours))).await;
        }
        store.put(record("null-seen", 90, None)).await;

        let report = sweep(&store, options(), now()).await;
        assert_eq!(report.expired, 4);
        let cutoff = now() - Duration::hours(48);
        for job in store.snapshot().await.into_iter().filter(JobRecord::is_active) {
            assert!(job.observed_at() >= cutoff, "{} should have expired", job.key);
        }
    }

    #[tokio::test]
    async fn window_wider_than_the_calendar_expires_nothing() {
        let store = MemoryJobStore::new();
        store.put(record("old", 100, Some(50))).await;
        let threshold = Duration::try_days(i64::MAX / 86_400_000).unwrap();
        assert_eq!(stale_cutoff(now(), threshold), DateTime::<Utc>::MIN_UTC);

        let report = sweep(&store, SweepOptions { threshold, ..options() }, now()).await;
        assert_eq!((report.scanned, report.expired), (0, 0));
        assert!(store.get(&key("old")).await.unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn dry_run_deletes_nothing() {
        let store = MemoryJobStore::new();
        store.put(record("old", 100, Some(50))).await;
        let report = sweep(&store, SweepOptions { dry_run: true, ..options() }, now()).await;
        assert_eq!(report.expired, 1);
        assert!(store.get(&key("old")).await.unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn restore_reverses_expiry() {
        let store = MemoryJobStore::new();
        store.put(record("old", 100, Some(50))).await;
        sweep(&store, options(), now()).await;
        assert!(store.active_jobs(10, 0).await.unwrap().is_empty());

        let restored = restore(
            &store,
            &RestoreSelector::Keys(vec![key("old")]),
            LastSeenOnRestore::CreatedAt,
        )
        .await
        .unwrap();
        assert_eq!(restored, vec![key("old")]);

        let active = store.active_jobs(10, 0).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].last_seen, Some(active[0].created_at));
    }

    #[tokio::test]
    async fn record_touched_after_snapshot_is_not_expired() {
        let inner = MemoryJobStore::new();
        inner.put(record("racing", 100, Some(50))).await;
        inner.put(record("idle", 100, Some(60))).await;
        let store = InterferingStore {
            touch_after_scan: Some((key("racing"), now())),
            ..InterferingStore::new(inner)
        };

        let report = sweep(&store, options(), now()).await;
        assert_eq!(report.scanned, 2);
        assert_eq!(report.expired, 1);
        assert_eq!(report.skipped, 1);

        assert!(store.get(&key("racing")).await.unwrap().unwrap().is_active());
        assert!(!store.get(&key("idle")).await.unwrap().unwrap().is_active());
    }
}
