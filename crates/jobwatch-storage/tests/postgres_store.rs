//! `PgJobStore` against a real Postgres started with testcontainers.
//!
//! Run with `cargo test -p jobwatch-storage --features postgres-tests`. The
//! container is shared by every test; each test migrates its own database.

#![cfg(feature = "postgres-tests")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use jobwatch_core::{Embedding, JobAttributes, JobKey, Lifecycle, NewJob, Region, RelevanceScore};
use jobwatch_storage::{
    FailureRecord, JobStore, LastSeenOnRestore, PgJobStore, PgStoreConfig, RestoreSelector, SweepCursor,
};
use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct SharedPostgres {
    base_url: String,
    _container: ContainerAsync<Postgres>,
}

static POSTGRES: OnceCell<SharedPostgres> = OnceCell::const_new();
static NEXT_DATABASE: AtomicUsize = AtomicUsize::new(0);

async fn shared_postgres() -> &'static SharedPostgres {
    POSTGRES
        .get_or_init(|| async {
            let container = Postgres::default()
                .with_tag("16")
                .start()
                .await
                .expect("starting postgres container");
            let host = container.get_host().await.expect("container host");
            let port = container.get_host_port_ipv4(5432).await.expect("container port");
            SharedPostgres {
                base_url: format!("postgres://postgres:postgres@{host}:{port}"),
                _container: container,
            }
        })
        .await
}

/// A freshly migrated database of its own, plus a raw pool for seeding.
async fn fresh_store() -> (PgJobStore, PgPool) {
    let postgres = shared_postgres().await;
    let name = format!(
        "jobwatch_test_{}_{}",
        std::process::id(),
        NEXT_DATABASE.fetch_add(1, Ordering::SeqCst)
    );
    let admin = PgPool::connect(&format!("{}/postgres", postgres.base_url)).await.unwrap();
    sqlx::query(&format!("CREATE DATABASE {name}")).execute(&admin).await.unwrap();
    admin.close().await;

    let database_url = format!("{}/{name}", postgres.base_url);
    let store = PgJobStore::connect(&PgStoreConfig {
        database_url: database_url.clone(),
        max_connections: 4,
        timeout: Duration::from_secs(10),
    })
    .await
    .unwrap();
    store.migrate().await.unwrap();
    // Migrations are idempotent.
    store.migrate().await.unwrap();
    let pool = PgPool::connect(&database_url).await.unwrap();
    (store, pool)
}

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
}

fn key(k: &str) -> JobKey {
    JobKey::new(k).unwrap()
}

fn keys(ks: &[&str]) -> Vec<JobKey> {
    ks.iter().map(|k| key(k)).collect()
}

fn new_job(k: &str, location: Option<&str>) -> NewJob {
    NewJob {
        key: key(k),
        attributes: JobAttributes {
            title: Some(format!("Job {k}")),
            location: location.map(str::to_string),
            ..Default::default()
        },
    }
}

fn jobs(ks: &[&str]) -> Vec<NewJob> {
    ks.iter().map(|k| new_job(k, None)).collect()
}

async fn last_seen(store: &PgJobStore, k: &str) -> Option<DateTime<Utc>> {
    store.get(&key(k)).await.unwrap().unwrap().last_seen
}

#[tokio::test]
async fn insert_reports_conflicts_and_existing_keys_carry_lifecycle() {
    let (store, _pool) = fresh_store().await;

    let first = store.insert_new(&jobs(&["a", "b"]), at(1)).await;
    assert_eq!(first.inserted, keys(&["a", "b"]));

    let second = store.insert_new(&jobs(&["b", "c"]), at(2)).await;
    assert_eq!(second.inserted, keys(&["c"]));
    assert_eq!(second.conflicted, keys(&["b"]));
    assert!(second.failed.is_empty());

    store.soft_delete(&key("a"), at(3)).await.unwrap();
    let existing = store.existing_keys(&keys(&["a", "b", "zzz"])).await.unwrap();
    assert_eq!(existing.len(), 2);
    assert_eq!(existing[&key("a")], Lifecycle::Deleted { at: at(3) });
    assert_eq!(existing[&key("b")], Lifecycle::Active);

    let b = store.get(&key("b")).await.unwrap().unwrap();
    assert_eq!(b.created_at, at(1));
    assert_eq!(b.attributes.title.as_deref(), Some("Job b"));
}

#[tokio::test]
async fn touch_keeps_the_latest_observation_and_skips_deleted_rows() {
    let (store, _pool) = fresh_store().await;
    store.insert_new(&jobs(&["a", "b"]), at(1)).await;

    assert_eq!(store.touch_last_seen(&keys(&["a", "b"]), at(5)).await.unwrap(), 2);
    // An older observation matches the row but leaves last_seen alone.
    store.touch_last_seen(&keys(&["a"]), at(3)).await.unwrap();
    assert_eq!(last_seen(&store, "a").await, Some(at(5)));

    store.soft_delete(&key("b"), at(6)).await.unwrap();
    assert_eq!(store.touch_last_seen(&keys(&["a", "b"]), at(7)).await.unwrap(), 1);
    assert_eq!(last_seen(&store, "a").await, Some(at(7)));
    assert_eq!(last_seen(&store, "b").await, Some(at(5)));
}

#[tokio::test]
async fn stale_candidates_page_by_observation_then_key() {
    let (store, _pool) = fresh_store().await;
    store.insert_new(&jobs(&["b", "a", "c"]), at(1)).await;
    store.insert_new(&jobs(&["d"]), at(2)).await;
    store.touch_last_seen(&keys(&["c"]), at(4)).await.unwrap();

    let cutoff = at(3);
    let first = store.stale_candidates(cutoff, None, 2).await.unwrap();
    let first_keys: Vec<&str> = first.iter().map(|c| c.key.as_str()).collect();
    assert_eq!(first_keys, vec!["a", "b"]);
    assert_eq!(first[0].observed_at, at(1));

    let cursor = SweepCursor {
        observed_at: at(1),
        key: key("b"),
    };
    let second = store.stale_candidates(cutoff, Some(&cursor), 2).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!((second[0].key.as_str(), second[0].observed_at), ("d", at(2)));

    let cursor = SweepCursor {
        observed_at: at(2),
        key: key("d"),
    };
    assert!(store.stale_candidates(cutoff, Some(&cursor), 2).await.unwrap().is_empty());

    assert!(!store.expire_if_stale(&key("c"), cutoff, at(5)).await.unwrap());
    assert!(store.expire_if_stale(&key("a"), cutoff, at(5)).await.unwrap());
    assert!(!store.expire_if_stale(&key("a"), cutoff, at(6)).await.unwrap());

    let stats = store.statistics(cutoff).await.unwrap();
    assert_eq!((stats.total, stats.active, stats.deleted, stats.pending_stale), (4, 3, 1, 2));
}

#[tokio::test]
async fn restore_applies_each_last_seen_mode() {
    let (store, _pool) = fresh_store().await;
    store.insert_new(&jobs(&["a", "b", "c"]), at(1)).await;
    store.touch_last_seen(&keys(&["a", "b", "c"]), at(2)).await.unwrap();
    for k in ["a", "b", "c"] {
        store.soft_delete(&key(k), at(3)).await.unwrap();
    }

    let kept = store
        .restore(&RestoreSelector::Keys(keys(&["a"])), LastSeenOnRestore::Keep)
        .await
        .unwrap();
    assert_eq!(kept, keys(&["a"]));
    assert_eq!(last_seen(&store, "a").await, Some(at(2)));

    store
        .restore(&RestoreSelector::Keys(keys(&["b"])), LastSeenOnRestore::CreatedAt)
        .await
        .unwrap();
    assert_eq!(last_seen(&store, "b").await, Some(at(1)));

    let rest = store
        .restore(&RestoreSelector::All, LastSeenOnRestore::Now(at(9)))
        .await
        .unwrap();
    assert_eq!(rest, keys(&["c"]));
    assert_eq!(last_seen(&store, "c").await, Some(at(9)));
    assert!(store.get(&key("c")).await.unwrap().unwrap().is_active());

    let nothing_left = store
        .restore(&RestoreSelector::All, LastSeenOnRestore::Keep)
        .await
        .unwrap();
    assert!(nothing_left.is_empty());
}

#[tokio::test]
async fn scores_and_embeddings_are_written_once_to_active_rows() {
    let (store, _pool) = fresh_store().await;
    store.insert_new(&jobs(&["a", "b", "gone"]), at(1)).await;
    store.soft_delete(&key("gone"), at(2)).await.unwrap();

    let unscored: Vec<JobKey> = store.unscored_jobs(10).await.unwrap().into_iter().map(|j| j.key).collect();
    assert_eq!(unscored, keys(&["a", "b"]));

    let two = RelevanceScore::try_from(2_i64).unwrap();
    assert!(store.record_score(&key("a"), two, at(3)).await.unwrap());
    assert!(!store.record_score(&key("a"), RelevanceScore::RELEVANT, at(4)).await.unwrap());
    assert!(!store.record_score(&key("gone"), two, at(3)).await.unwrap());
    assert!(store.record_score(&key("b"), RelevanceScore::try_from(0_i64).unwrap(), at(3)).await.unwrap());

    let pending = store.jobs_missing_embedding(RelevanceScore::RELEVANT, 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].key, key("a"));

    let embedding = Embedding::new(vec![0.25, -0.5, 1.0], 3).unwrap();
    assert!(store.record_embedding(&key("a"), &embedding, at(5)).await.unwrap());
    assert!(!store.record_embedding(&key("a"), &embedding, at(6)).await.unwrap());

    let a = store.get(&key("a")).await.unwrap().unwrap();
    assert_eq!(a.relevance_score, Some(two));
    assert_eq!(a.embedding.as_ref().map(|e| e.as_slice().to_vec()), Some(vec![0.25, -0.5, 1.0]));
    assert_eq!(a.embedded_at, Some(at(5)));

    let stats = store.statistics(at(0)).await.unwrap();
    assert_eq!(stats.score_distribution, [1, 0, 1, 0]);
    assert_eq!((stats.relevant, stats.embedded), (1, 1));
}

#[tokio::test]
async fn backfill_only_fills_blank_columns() {
    let (store, _pool) = fresh_store().await;
    store
        .insert_new(&[new_job("a", Some("Aarhus C"))], at(1))
        .await;

    let missing = store.jobs_missing_attributes(10).await.unwrap();
    assert_eq!(missing.len(), 1);

    let scraped = JobAttributes {
        title: Some("Other title".into()),
        company: Some("Nordlys A/S".into()),
        location: Some("Odense".into()),
        ..Default::default()
    };
    let filled = store.backfill_attributes(&key("a"), &scraped).await.unwrap();
    assert_eq!(filled, vec!["company"]);

    let a = store.get(&key("a")).await.unwrap().unwrap();
    assert_eq!(a.attributes.title.as_deref(), Some("Job a"));
    assert_eq!(a.attributes.company.as_deref(), Some("Nordlys A/S"));
    assert_eq!(a.attributes.location.as_deref(), Some("Aarhus C"));
}

#[tokio::test]
async fn regions_page_by_key_and_overrides_are_normalized() {
    let (store, pool) = fresh_store().await;
    store.insert_new(&jobs(&["c", "a", "b", "gone"]), at(1)).await;
    store.soft_delete(&key("gone"), at(2)).await.unwrap();

    let first = store.jobs_missing_region(None, 2).await.unwrap();
    let first_keys: Vec<&str> = first.iter().map(|j| j.key.as_str()).collect();
    assert_eq!(first_keys, vec!["a", "b"]);
    let second = store.jobs_missing_region(Some(&key("b")), 2).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].key, key("c"));

    assert!(store.record_region(&key("a"), Region::SydOgSoenderjylland).await.unwrap());
    assert!(!store.record_region(&key("a"), Region::Fyn).await.unwrap());
    assert!(!store.record_region(&key("gone"), Region::Fyn).await.unwrap());
    let a = store.get(&key("a")).await.unwrap().unwrap();
    assert_eq!(a.region, Some(Region::SydOgSoenderjylland));

    sqlx::query("INSERT INTO city_to_region (city, region) VALUES ($1, $2), ($3, $4)")
        .bind("  Viby ")
        .bind(Region::Sjaelland.as_str())
        .bind("atlantis")
        .bind(Region::Udlandet.as_str())
        .execute(&pool)
        .await
        .unwrap();
    let overrides = store.city_regions().await.unwrap();
    assert_eq!(overrides.get("viby"), Some(&Region::Sjaelland));
    assert_eq!(overrides.get("atlantis"), Some(&Region::Udlandet));

    let rejected = sqlx::query("INSERT INTO city_to_region (city, region) VALUES ('nowhere', 'Mars')")
        .execute(&pool)
        .await;
    assert!(rejected.is_err());

    assert_eq!(store.statistics(at(0)).await.unwrap().with_region, 1);
}

#[tokio::test]
async fn failures_are_logged_with_their_stage() {
    let (store, pool) = fresh_store().await;
    store
        .record_failure(&FailureRecord {
            stage: "enrich".into(),
            key: Some(key("a")),
            url: Some("https://www.jobindex.dk/vis-job/a".into()),
            message: "detail page returned 500".into(),
            logged_at: at(4),
        })
        .await
        .unwrap();

    let (stage, job_key, message): (String, Option<String>, String) =
        sqlx::query_as("SELECT stage, job_key, message FROM scrape_errors")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(stage, "enrich");
    assert_eq!(job_key.as_deref(), Some("a"));
    assert_eq!(message, "detail page returned 500");
}
