use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use jobwatch_core::{Embedding, JobAttributes, JobKey, JobRecord, Lifecycle, NewJob, Region, RelevanceScore};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use tracing::{debug, warn};

use crate::{
    FailureRecord, InsertReport, JobStore, LastSeenOnRestore, RestoreSelector, StaleCandidate, StoreError,
    StoreStatistics, SweepCursor,
};

const JOB_COLUMNS: &str = "job_key, title, job_url, company, company_url, location, publication_date, \
     description, created_at, last_seen, deleted_at, relevance_score, scored_at, embedding, embedded_at, region";

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Bounds both pool acquisition and each statement.
    pub timeout: Duration,
}

/// Postgres-backed [`JobStore`]. One instance is created per run and passed
/// to every component that needs the store.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct JobRow {
    job_key: String,
    title: Option<String>,
    job_url: Option<String>,
    company: Option<String>,
    company_url: Option<String>,
    location: Option<String>,
    publication_date: Option<NaiveDate>,
    description: Option<String>,
    created_at: DateTime<Utc>,
    last_seen: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
    relevance_score: Option<i16>,
    scored_at: Option<DateTime<Utc>>,
    embedding: Option<Vec<f32>>,
    embedded_at: Option<DateTime<Utc>>,
    region: Option<String>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StoreError::Corrupt {
            key: row.job_key.clone(),
            reason,
        };
        let key = JobKey::new(row.job_key.clone()).map_err(|e| corrupt(e.to_string()))?;
        let relevance_score = row
            .relevance_score
            .map(|s| RelevanceScore::try_from(i64::from(s)))
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?;
        let embedding = row
            .embedding
            .map(|values| {
                let dims = values.len();
                Embedding::new(values, dims)
            })
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?;
        let region = row
            .region
            .as_deref()
            .map(str::parse::<Region>)
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?;

        Ok(JobRecord {
            key,
            attributes: JobAttributes {
                title: row.title,
                job_url: row.job_url,
                company: row.company,
                company_url: row.company_url,
                location: row.location,
                publication_date: row.publication_date,
                description: row.description,
            },
            created_at: row.created_at,
            last_seen: row.last_seen,
            lifecycle: Lifecycle::from_deleted_at(row.deleted_at),
            relevance_score,
            scored_at: row.scored_at,
            embedding,
            embedded_at: row.embedded_at,
            region,
        })
    }
}

#[derive(Debug, FromRow)]
struct StatisticsRow {
    total: i64,
    active: i64,
    deleted: i64,
    pending_stale: i64,
    scored: i64,
    score_0: i64,
    score_1: i64,
    score_2: i64,
    score_3: i64,
    relevant: i64,
    embedded: i64,
    with_region: i64,
}

fn key_strings(keys: &[JobKey]) -> Vec<String> {
    keys.iter().map(|k| k.as_str().to_string()).collect()
}

fn rows_to_records(rows: Vec<JobRow>) -> Result<Vec<JobRecord>, StoreError> {
    rows.into_iter().map(JobRecord::try_from).collect()
}

impl PgJobStore {
    pub async fn connect(config: &PgStoreConfig) -> Result<Self, StoreError> {
        let statement_timeout_ms = config.timeout.as_millis().to_string();
        let options = PgConnectOptions::from_str(&config.database_url)?
            .options([("statement_timeout", statement_timeout_ms)]);
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.timeout)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn insert_rows(&self, jobs: &[NewJob], now: DateTime<Utc>) -> Result<Vec<String>, sqlx::Error> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO jobs (job_key, title, job_url, company, company_url, location, \
             publication_date, description, created_at, last_seen) ",
        );
        builder.push_values(jobs, |mut row, job| {
            let attrs = &job.attributes;
            row.push_bind(job.key.as_str().to_string())
                .push_bind(attrs.title.clone())
                .push_bind(attrs.job_url.clone())
                .push_bind(attrs.company.clone())
                .push_bind(attrs.company_url.clone())
                .push_bind(attrs.location.clone())
                .push_bind(attrs.publication_date)
                .push_bind(attrs.description.clone())
                .push_bind(now)
                .push_bind(now);
        });
        builder.push(" ON CONFLICT (job_key) DO NOTHING RETURNING job_key");
        builder.build_query_scalar::<String>().fetch_all(&self.pool).await
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn existing_keys(&self, keys: &[JobKey]) -> Result<HashMap<JobKey, Lifecycle>, StoreError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<(String, Option<DateTime<Utc>>)> =
            sqlx::query_as("SELECT job_key, deleted_at FROM jobs WHERE job_key = ANY($1)")
                .bind(key_strings(keys))
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(key, deleted_at)| {
                let key = JobKey::new(key.clone()).map_err(|e| StoreError::Corrupt {
                    key,
                    reason: e.to_string(),
                })?;
                Ok((key, Lifecycle::from_deleted_at(deleted_at)))
            })
            .collect()
    }

    async fn insert_new(&self, jobs: &[NewJob], now: DateTime<Utc>) -> InsertReport {
        let mut report = InsertReport::default();
        if jobs.is_empty() {
            return report;
        }

        match self.insert_rows(jobs, now).await {
            Ok(returned) => {
                for job in jobs {
                    if returned.iter().any(|k| k == job.key.as_str()) {
                        report.inserted.push(job.key.clone());
                    } else {
                        report.conflicted.push(job.key.clone());
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, batch = jobs.len(), "batched insert failed; retrying records individually");
                for job in jobs {
                    match self.insert_rows(std::slice::from_ref(job), now).await {
                        Ok(returned) if returned.is_empty() => report.conflicted.push(job.key.clone()),
                        Ok(_) => report.inserted.push(job.key.clone()),
                        Err(err) => report.failed.push((job.key.clone(), err.into())),
                    }
                }
            }
        }
        report
    }

    async fn touch_last_seen(&self, keys: &[JobKey], now: DateTime<Utc>) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE jobs SET last_seen = GREATEST(last_seen, $2) \
             WHERE job_key = ANY($1) AND deleted_at IS NULL",
        )
        .bind(key_strings(keys))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get(&self, key: &JobKey) -> Result<Option<JobRecord>, StoreError> {
        let row: Option<JobRow> = sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_key = $1"))
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn active_jobs(&self, limit: i64, offset: i64) -> Result<Vec<JobRecord>, StoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE deleted_at IS NULL \
             ORDER BY publication_date ASC NULLS FIRST, created_at, job_key LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows_to_records(rows)
    }

    async fn stale_candidates(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<&SweepCursor>,
        limit: i64,
    ) -> Result<Vec<StaleCandidate>, StoreError> {
        let rows: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT job_key, COALESCE(last_seen, created_at) AS observed_at FROM jobs \
             WHERE deleted_at IS NULL AND COALESCE(last_seen, created_at) < $1 \
               AND ($2::timestamptz IS NULL OR (COALESCE(last_seen, created_at), job_key) > ($2, $3::text)) \
             ORDER BY observed_at, job_key LIMIT $4",
        )
        .bind(cutoff)
        .bind(after.map(|c| c.observed_at))
        .bind(after.map(|c| c.key.as_str().to_string()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(key, observed_at)| {
                let key = JobKey::new(key.clone()).map_err(|e| StoreError::Corrupt {
                    key,
                    reason: e.to_string(),
                })?;
                Ok(StaleCandidate { key, observed_at })
            })
            .collect()
    }

    async fn expire_if_stale(
        &self,
        key: &JobKey,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET deleted_at = $3 \
             WHERE job_key = $1 AND deleted_at IS NULL AND COALESCE(last_seen, created_at) < $2",
        )
        .bind(key.as_str())
        .bind(cutoff)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn soft_delete(&self, key: &JobKey, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE jobs SET deleted_at = $2 WHERE job_key = $1 AND deleted_at IS NULL")
            .bind(key.as_str())
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn restore(
        &self,
        selector: &RestoreSelector,
        last_seen: LastSeenOnRestore,
    ) -> Result<Vec<JobKey>, StoreError> {
        let (mode, now) = match last_seen {
            LastSeenOnRestore::Keep => ("keep", None),
            LastSeenOnRestore::CreatedAt => ("created", None),
            LastSeenOnRestore::Now(now) => ("now", Some(now)),
        };
        let keys = match selector {
            RestoreSelector::Keys(keys) => Some(key_strings(keys)),
            RestoreSelector::All => None,
        };
        let restored: Vec<String> = sqlx::query_scalar(
            "UPDATE jobs SET deleted_at = NULL, \
               last_seen = CASE $2::text WHEN 'created' THEN created_at WHEN 'now' THEN $3::timestamptz ELSE last_seen END \
             WHERE deleted_at IS NOT NULL AND ($1::text[] IS NULL OR job_key = ANY($1)) \
             RETURNING job_key",
        )
        .bind(keys)
        .bind(mode)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        debug!(count = restored.len(), mode, "restored soft-deleted jobs");
        restored
            .into_iter()
            .map(|key| {
                JobKey::new(key.clone()).map_err(|e| StoreError::Corrupt {
                    key,
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    async fn unscored_jobs(&self, limit: i64) -> Result<Vec<JobRecord>, StoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE deleted_at IS NULL AND relevance_score IS NULL \
             ORDER BY created_at, job_key LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows_to_records(rows)
    }

    async fn record_score(
        &self,
        key: &JobKey,
        score: RelevanceScore,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET relevance_score = $2, scored_at = $3 \
             WHERE job_key = $1 AND deleted_at IS NULL AND relevance_score IS NULL",
        )
        .bind(key.as_str())
        .bind(i16::from(score.value()))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn jobs_missing_embedding(
        &self,
        min_score: RelevanceScore,
        limit: i64,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE deleted_at IS NULL AND embedding IS NULL AND relevance_score >= $1 \
             ORDER BY created_at, job_key LIMIT $2"
        ))
        .bind(i16::from(min_score.value()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows_to_records(rows)
    }

    async fn record_embedding(
        &self,
        key: &JobKey,
        embedding: &Embedding,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET embedding = $2, embedded_at = $3 \
             WHERE job_key = $1 AND deleted_at IS NULL AND embedding IS NULL",
        )
        .bind(key.as_str())
        .bind(embedding.as_slice().to_vec())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn jobs_missing_attributes(&self, limit: i64) -> Result<Vec<JobRecord>, StoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE deleted_at IS NULL AND ( \
               COALESCE(BTRIM(company), '') = '' \
               OR COALESCE(BTRIM(company_url), '') = '' \
               OR COALESCE(BTRIM(description), '') = '') \
             ORDER BY created_at DESC, job_key DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows_to_records(rows)
    }

    async fn backfill_attributes(
        &self,
        key: &JobKey,
        scraped: &JobAttributes,
    ) -> Result<Vec<&'static str>, StoreError> {
        let Some(current) = self.get(key).await?.filter(JobRecord::is_active) else {
            return Ok(Vec::new());
        };
        let mut merged = current.attributes.clone();
        let filled = merged.fill_missing_from(scraped);
        if filled.is_empty() {
            return Ok(filled);
        }

        // Each column is only replaced while it is still blank in the row.
        sqlx::query(
            "UPDATE jobs SET \
               title = CASE WHEN COALESCE(BTRIM(title), '') = '' THEN $2 ELSE title END, \
               company = CASE WHEN COALESCE(BTRIM(company), '') = '' THEN $3 ELSE company END, \
               company_url = CASE WHEN COALESCE(BTRIM(company_url), '') = '' THEN $4 ELSE company_url END, \
               location = CASE WHEN COALESCE(BTRIM(location), '') = '' THEN $5 ELSE location END, \
               description = CASE WHEN COALESCE(BTRIM(description), '') = '' THEN $6 ELSE description END \
             WHERE job_key = $1 AND deleted_at IS NULL",
        )
        .bind(key.as_str())
        .bind(merged.title)
        .bind(merged.company)
        .bind(merged.company_url)
        .bind(merged.location)
        .bind(merged.description)
        .execute(&self.pool)
        .await?;
        Ok(filled)
    }

    async fn jobs_missing_region(&self, after: Option<&JobKey>, limit: i64) -> Result<Vec<JobRecord>, StoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE deleted_at IS NULL AND region IS NULL AND ($1::text IS NULL OR job_key > $1) \
             ORDER BY job_key LIMIT $2"
        ))
        .bind(after.map(|k| k.as_str().to_string()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows_to_records(rows)
    }

    async fn city_regions(&self) -> Result<HashMap<String, Region>, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT city, region FROM city_to_region")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|(city, region)| match region.parse::<Region>() {
                Ok(region) => Ok((city.trim().to_lowercase(), region)),
                Err(err) => Err(StoreError::Corrupt {
                    key: format!("city_to_region/{city}"),
                    reason: err.to_string(),
                }),
            })
            .collect()
    }

    async fn record_region(&self, key: &JobKey, region: Region) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET region = $2 WHERE job_key = $1 AND deleted_at IS NULL AND region IS NULL",
        )
        .bind(key.as_str())
        .bind(region.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn statistics(&self, stale_cutoff: DateTime<Utc>) -> Result<StoreStatistics, StoreError> {
        let row: StatisticsRow = sqlx::query_as(
            "SELECT \
               COUNT(*) AS total, \
               COUNT(*) FILTER (WHERE deleted_at IS NULL) AS active, \
               COUNT(*) FILTER (WHERE deleted_at IS NOT NULL) AS deleted, \
               COUNT(*) FILTER (WHERE deleted_at IS NULL AND COALESCE(last_seen, created_at) < $1) AS pending_stale, \
               COUNT(*) FILTER (WHERE deleted_at IS NULL AND relevance_score IS NOT NULL) AS scored, \
               COUNT(*) FILTER (WHERE deleted_at IS NULL AND relevance_score = 0) AS score_0, \
               COUNT(*) FILTER (WHERE deleted_at IS NULL AND relevance_score = 1) AS score_1, \
               COUNT(*) FILTER (WHERE deleted_at IS NULL AND relevance_score = 2) AS score_2, \
               COUNT(*) FILTER (WHERE deleted_at IS NULL AND relevance_score = 3) AS score_3, \
               COUNT(*) FILTER (WHERE deleted_at IS NULL AND relevance_score >= 1) AS relevant, \
               COUNT(*) FILTER (WHERE deleted_at IS NULL AND relevance_score >= 1 AND embedding IS NOT NULL) AS embedded, \
               COUNT(*) FILTER (WHERE deleted_at IS NULL AND region IS NOT NULL) AS with_region \
             FROM jobs",
        )
        .bind(stale_cutoff)
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStatistics {
            total: row.total,
            active: row.active,
            deleted: row.deleted,
            pending_stale: row.pending_stale,
            scored: row.scored,
            score_distribution: [row.score_0, row.score_1, row.score_2, row.score_3],
            relevant: row.relevant,
            embedded: row.embedded,
            with_region: row.with_region,
        })
    }

    async fn record_failure(&self, failure: &FailureRecord) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO scrape_errors (stage, job_key, url, message, logged_at) VALUES ($1, $2, $3, $4, $5)")
            .bind(&failure.stage)
            .bind(failure.key.as_ref().map(|k| k.as_str().to_string()))
            .bind(&failure.url)
            .bind(&failure.message)
            .bind(failure.logged_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
