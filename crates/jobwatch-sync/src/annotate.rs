//! Per-record annotation passes: relevance scoring, embedding and attribute backfill.
//!
//! Each pass selects its own work from the store, handles one record at a
//! time, and commits per record, so an interrupted pass is simply rerun.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use jobwatch_adapters::DetailSource;
use jobwatch_ai::{embedding_text, scoring_input, Embedder, RelevanceScorer};
use jobwatch_core::{Embedding, JobRecord, RelevanceScore};
use jobwatch_storage::{JobStore, StoreError};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{log_failure, RecordFailure};

#[derive(Debug, Clone, Copy)]
pub struct PassOptions {
    pub limit: i64,
    /// Upper bound for one external call.
    pub call_timeout: Duration,
    /// Pause between consecutive external calls.
    pub delay: Duration,
}

impl Default for PassOptions {
    fn default() -> Self {
        Self {
            limit: 100,
            call_timeout: Duration::from_secs(30),
            delay: Duration::from_secs(2),
        }
    }
}

async fn bounded<T, E, F>(timeout: Duration, call: F) -> Result<T, String>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err(format!("timed out after {}s", timeout.as_secs_f32())),
    }
}

async fn pause(index: usize, delay: Duration) {
    if index > 0 && !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScoreReport {
    pub selected: usize,
    pub scored: usize,
    /// Replies that were not an integer in 0..=3; the record stays unscored.
    pub rejected: usize,
    /// Transient failures; retried on the next pass.
    pub failed: usize,
    /// Scored or deleted by someone else between selection and write.
    pub skipped: usize,
    pub distribution: [usize; 4],
    pub failures: Vec<RecordFailure>,
}

/// Scores active, unscored records oldest first. A record is scored at most once.
pub async fn score_pending(
    store: &dyn JobStore,
    scorer: &dyn RelevanceScorer,
    options: PassOptions,
) -> Result<ScoreReport, StoreError> {
    let jobs = store.unscored_jobs(options.limit).await?;
    let mut report = ScoreReport {
        selected: jobs.len(),
        ..Default::default()
    };

    for (index, job) in jobs.iter().enumerate() {
        pause(index, options.delay).await;
        let span = info_span!("score", key = %job.key);
        let outcome = score_one(store, scorer, job, options.call_timeout).instrument(span).await;
        match outcome {
            Ok(Some(score)) => {
                report.scored += 1;
                report.distribution[usize::from(score.value())] += 1;
            }
            Ok(None) => report.skipped += 1,
            Err((rejected, failure)) => {
                if rejected {
                    report.rejected += 1;
                } else {
                    report.failed += 1;
                }
                log_failure(store, &failure, job.attributes.job_url.as_deref()).await;
                report.failures.push(failure);
            }
        }
    }

    info!(
        selected = report.selected,
        scored = report.scored,
        rejected = report.rejected,
        failed = report.failed,
        distribution = ?report.distribution,
        "scoring pass finished"
    );
    Ok(report)
}

/// `Err((true, ..))` for a policy rejection, `Err((false, ..))` for a transient failure.
async fn score_one(
    store: &dyn JobStore,
    scorer: &dyn RelevanceScorer,
    job: &JobRecord,
    timeout: Duration,
) -> Result<Option<RelevanceScore>, (bool, RecordFailure)> {
    let fail = |rejected: bool, reason: String| (rejected, RecordFailure::new("score", Some(job.key.clone()), reason));

    let input = scoring_input(&job.attributes);
    let reply = bounded(timeout, scorer.score(&input)).await.map_err(|reason| {
        warn!(%reason, "scorer call failed");
        fail(false, reason)
    })?;

    let score = RelevanceScore::parse_reply(&reply).map_err(|err| {
        warn!(error = %err, "scorer reply rejected");
        fail(true, err.to_string())
    })?;

    match store.record_score(&job.key, score, Utc::now()).await {
        Ok(true) => {
            debug!(%score, "scored");
            Ok(Some(score))
        }
        Ok(false) => Ok(None),
        Err(err) => Err(fail(false, format!("writing score: {err}"))),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmbedReport {
    pub selected: usize,
    pub embedded: usize,
    /// Vectors of the wrong length or with non-finite components.
    pub rejected: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failures: Vec<RecordFailure>,
}

/// Embeds active records scored relevant (>= 1) that have no embedding yet.
pub async fn embed_pending(
    store: &dyn JobStore,
    embedder: &dyn Embedder,
    options: PassOptions,
) -> Result<EmbedReport, StoreError> {
    let jobs = store
        .jobs_missing_embedding(RelevanceScore::RELEVANT, options.limit)
        .await?;
    let mut report = EmbedReport {
        selected: jobs.len(),
        ..Default::default()
    };

    for (index, job) in jobs.iter().enumerate() {
        pause(index, options.delay).await;
        let text = embedding_text(&job.attributes);
        let result = match bounded(options.call_timeout, embedder.embed(&text)).await {
            Err(reason) => Err((false, reason)),
            Ok(values) => match Embedding::new(values, embedder.dimensions()) {
                Err(err) => Err((true, err.to_string())),
                Ok(embedding) => store
                    .record_embedding(&job.key, &embedding, Utc::now())
                    .await
                    .map_err(|err| (false, format!("writing embedding: {err}"))),
            },
        };

        match result {
            Ok(true) => {
                debug!(key = %job.key, "embedded");
                report.embedded += 1;
            }
            Ok(false) => report.skipped += 1,
            Err((rejected, reason)) => {
                warn!(key = %job.key, %reason, "embedding failed");
                if rejected {
                    report.rejected += 1;
                } else {
                    report.failed += 1;
                }
                let failure = RecordFailure::new("embed", Some(job.key.clone()), reason);
                log_failure(store, &failure, job.attributes.job_url.as_deref()).await;
                report.failures.push(failure);
            }
        }
    }

    info!(
        selected = report.selected,
        embedded = report.embedded,
        rejected = report.rejected,
        failed = report.failed,
        "embedding pass finished"
    );
    Ok(report)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichReport {
    pub selected: usize,
    pub enriched: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub fields_filled: usize,
    pub failures: Vec<RecordFailure>,
}

/// Backfills blank attributes of active records from their detail pages.
/// Values already present are never overwritten.
pub async fn enrich_missing(
    store: &dyn JobStore,
    detail: &dyn DetailSource,
    options: PassOptions,
) -> Result<EnrichReport, StoreError> {
    let jobs = store.jobs_missing_attributes(options.limit).await?;
    let mut report = EnrichReport {
        selected: jobs.len(),
        ..Default::default()
    };

    for (index, job) in jobs.iter().enumerate() {
        pause(index, options.delay).await;
        let url = job.attributes.job_url.as_deref();
        let outcome = match bounded(options.call_timeout, detail.fetch_detail(&job.key, url)).await {
            Err(reason) => Err(reason),
            Ok(page) => store
                .backfill_attributes(&job.key, &page.attributes)
                .await
                .map_err(|err| format!("writing attributes: {err}")),
        };

        match outcome {
            Ok(filled) if filled.is_empty() => report.unchanged += 1,
            Ok(filled) => {
                debug!(key = %job.key, ?filled, "backfilled attributes");
                report.enriched += 1;
                report.fields_filled += filled.len();
            }
            Err(reason) => {
                warn!(key = %job.key, %reason, "enrichment failed; record left unchanged");
                report.failed += 1;
                let failure = RecordFailure::new("enrich", Some(job.key.clone()), reason);
                log_failure(store, &failure, url).await;
                report.failures.push(failure);
            }
        }
    }

    info!(
        selected = report.selected,
        enriched = report.enriched,
        fields_filled = report.fields_filled,
        failed = report.failed,
        "enrichment pass finished"
    );
    Ok(report)
}
