use std::collections::BTreeMap;

use jobwatch_core::{JobKey, Region, RegionLookup};
use jobwatch_storage::{JobStore, StoreError};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{log_failure, RecordFailure};

const STAGE: &str = "regions";

#[derive(Debug, Clone, Copy)]
pub struct RegionOptions {
    /// Records read per keyset page.
    pub page_size: i64,
    /// Resolve and count without writing.
    pub dry_run: bool,
}

impl Default for RegionOptions {
    fn default() -> Self {
        Self {
            page_size: 500,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegionReport {
    pub dry_run: bool,
    pub scanned: usize,
    /// Regions written; in a dry run, regions that would have been.
    pub mapped: usize,
    /// No location, or no city token with a known region. Left blank for a later pass.
    pub unmatched: usize,
    /// Given a region or deleted by someone else between read and write.
    pub skipped: usize,
    pub failed: usize,
    pub by_region: BTreeMap<Region, usize>,
    pub failures: Vec<RecordFailure>,
}

/// Assigns a region to every active record that has none, from its location text.
///
/// Overrides stored in the `city_to_region` table take precedence over the
/// built-in city table. Records are visited in key order through a keyset
/// cursor; a record whose location cannot be resolved stays blank.
pub async fn map_regions(store: &dyn JobStore, options: RegionOptions) -> Result<RegionReport, StoreError> {
    let span = info_span!("map_regions", dry_run = options.dry_run);
    async move {
        let lookup = RegionLookup::with_overrides(store.city_regions().await?);
        let mut report = RegionReport {
            dry_run: options.dry_run,
            ..Default::default()
        };
        let page_size = options.page_size.max(1);
        let mut cursor: Option<JobKey> = None;

        loop {
            let page = store.jobs_missing_region(cursor.as_ref(), page_size).await?;
            if page.is_empty() {
                break;
            }

            for job in &page {
                report.scanned += 1;
                let resolved = job
                    .attributes
                    .location
                    .as_deref()
                    .and_then(|location| lookup.resolve(location));
                let Some((city, region)) = resolved else {
                    debug!(key = %job.key, location = ?job.attributes.location, "no region for location");
                    report.unmatched += 1;
                    continue;
                };

                if options.dry_run {
                    report.mapped += 1;
                    *report.by_region.entry(region).or_default() += 1;
                    continue;
                }
                match store.record_region(&job.key, region).await {
                    Ok(true) => {
                        debug!(key = %job.key, %city, %region, "region assigned");
                        report.mapped += 1;
                        *report.by_region.entry(region).or_default() += 1;
                    }
                    Ok(false) => report.skipped += 1,
                    Err(err) => {
                        warn!(key = %job.key, error = %err, "writing region failed");
                        report.failed += 1;
                        let failure = RecordFailure::new(STAGE, Some(job.key.clone()), err.to_string());
                        log_failure(store, &failure, job.attributes.job_url.as_deref()).await;
                        report.failures.push(failure);
                    }
                }
            }

            let full_page = page.len() as i64 == page_size;
            cursor = page.last().map(|job| job.key.clone());
            if !full_page {
                break;
            }
        }

        info!(
            scanned = report.scanned,
            mapped = report.mapped,
            unmatched = report.unmatched,
            failed = report.failed,
            "region mapping finished"
        );
        Ok(report)
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jobwatch_core::{JobAttributes, NewJob};
    use jobwatch_storage::MemoryJobStore;

    fn key(k: &str) -> JobKey {
        JobKey::new(k).unwrap()
    }

    async fn seed(store: &MemoryJobStore, jobs: &[(&str, Option<&str>)]) {
        let jobs: Vec<NewJob> = jobs
            .iter()
            .map(|(k, location)| NewJob {
                key: key(k),
                attributes: JobAttributes {
                    location: location.map(str::to_string),
                    ..Default::default()
                },
            })
            .collect();
        store.insert_new(&jobs, Utc::now()).await;
    }

    async fn region_of(store: &MemoryJobStore, k: &str) -> Option<Region> {
        store.get(&key(k)).await.unwrap().unwrap().region
    }

    fn options(dry_run: bool) -> RegionOptions {
        RegionOptions { page_size: 2, dry_run }
    }

    #[tokio::test]
    async fn maps_locations_across_pages_and_leaves_unknowns_blank() {
        let store = MemoryJobStore::new();
        seed(
            &store,
            &[
                ("a", Some("2100 København Ø")),
                ("b", Some("Aarhus C og mulighed for hjemmearbejde")),
                ("c", Some("Flere arbejdssteder")),
                ("d", None),
                ("e", Some("Odense SØ")),
            ],
        )
        .await;

        let report = map_regions(&store, options(false)).await.unwrap();
        assert_eq!(report.scanned, 5);
        assert_eq!(report.mapped, 3);
        assert_eq!(report.unmatched, 2);
        assert_eq!(report.by_region.get(&Region::Fyn), Some(&1));

        assert_eq!(region_of(&store, "a").await, Some(Region::Hovedstaden));
        assert_eq!(region_of(&store, "b").await, Some(Region::Midtjylland));
        assert_eq!(region_of(&store, "c").await, None);

        let again = map_regions(&store, options(false)).await.unwrap();
        assert_eq!((again.scanned, again.mapped), (2, 0));
    }

    #[tokio::test]
    async fn stored_overrides_win_and_dry_run_writes_nothing() {
        let store = MemoryJobStore::new();
        seed(&store, &[("a", Some("Atlantis")), ("b", Some("Viby J"))]).await;
        store.set_city_region("atlantis", Region::Udlandet).await;
        store.set_city_region("viby", Region::Sjaelland).await;

        let dry = map_regions(&store, options(true)).await.unwrap();
        assert_eq!(dry.mapped, 2);
        assert!(store.snapshot().await.iter().all(|job| job.region.is_none()));

        map_regions(&store, options(false)).await.unwrap();
        assert_eq!(region_of(&store, "a").await, Some(Region::Udlandet));
        assert_eq!(region_of(&store, "b").await, Some(Region::Sjaelland));
    }

    #[tokio::test]
    async fn deleted_records_are_never_mapped() {
        let store = MemoryJobStore::new();
        seed(&store, &[("gone", Some("Aalborg"))]).await;
        store.soft_delete(&key("gone"), Utc::now()).await.unwrap();

        let report = map_regions(&store, options(false)).await.unwrap();
        assert_eq!(report.scanned, 0);
        assert_eq!(region_of(&store, "gone").await, None);
    }
}
