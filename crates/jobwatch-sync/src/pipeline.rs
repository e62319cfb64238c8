use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use jobwatch_adapters::{adapters_for_source, SourceAdapters};
use jobwatch_ai::{Embedder, OpenAiClient, OpenAiEmbedder, OpenAiScorer, RelevanceScorer};
use jobwatch_core::JobKey;
use jobwatch_storage::{
    HttpClientConfig, HttpFetcher, JobStore, LastSeenOnRestore, PgJobStore, PgStoreConfig, RestoreSelector,
    StoreStatistics,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::{
    embed_pending, enrich_missing, ingest_source, load_source_registry, map_regions, restore, score_pending, sweep,
    validate_active, write_run_report, EmbedReport, EnrichReport, IngestOptions, IngestReport, PassError, PassOptions,
    RegionOptions, RegionReport, RunSummary, ScoreReport, SourceRegistry, SweepOptions, SweepReport, SyncConfig,
    ValidateReport,
};

/// One run's worth of wiring: the store, the HTTP fetcher and the AI clients,
/// built once and handed to every pass.
pub struct Pipeline {
    config: SyncConfig,
    store: Arc<dyn JobStore>,
    http: Arc<HttpFetcher>,
    scorer: Option<Arc<dyn RelevanceScorer>>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl Pipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn JobStore>) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
            min_interval: config.request_delay,
            ..Default::default()
        })?;
        Ok(Self {
            config,
            store,
            http: Arc::new(http),
            scorer: None,
            embedder: None,
        })
    }

    pub fn with_ai(mut self, scorer: Arc<dyn RelevanceScorer>, embedder: Arc<dyn Embedder>) -> Self {
        self.scorer = Some(scorer);
        self.embedder = Some(embedder);
        self
    }

    /// Connects to Postgres and, when an API key is configured, the OpenAI API.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let database_url = config.require_database_url()?.to_string();
        let store = PgJobStore::connect(&PgStoreConfig {
            database_url,
            max_connections: config.db_max_connections,
            timeout: config.db_timeout,
        })
        .await
        .context("connecting to the job store")?;

        let ai = match config.openai_api_key.as_deref() {
            Some(key) => Some(build_ai(&config, key).await?),
            None => None,
        };
        let pipeline = Self::new(config, Arc::new(store))?;
        Ok(match ai {
            Some((scorer, embedder)) => pipeline.with_ai(scorer, embedder),
            None => pipeline,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn JobStore {
        self.store.as_ref()
    }

    fn pass_options(&self, limit: i64) -> PassOptions {
        PassOptions {
            limit,
            call_timeout: self.config.ai_timeout,
            delay: self.config.request_delay,
        }
    }

    async fn registry(&self) -> Result<SourceRegistry> {
        load_source_registry(&self.config.sources_file).await
    }

    fn adapters(&self, source: &jobwatch_adapters::SourceConfig) -> Result<SourceAdapters> {
        adapters_for_source(source, self.http.clone(), &self.config.workspace_root)
            .with_context(|| format!("building adapters for {}", source.source_id))
    }

    /// Detail pages are read through the first enabled source.
    async fn detail_adapters(&self) -> Result<SourceAdapters> {
        let registry = self.registry().await?;
        let source = registry
            .enabled()
            .next()
            .ok_or_else(|| anyhow!("no enabled source in {}", self.config.sources_file.display()))?;
        self.adapters(source)
    }

    pub async fn ingest_all(&self) -> Result<(usize, IngestReport)> {
        let registry = self.registry().await?;
        let mut report = IngestReport::default();
        let mut enabled = 0;
        for source in registry.enabled() {
            enabled += 1;
            let adapters = self.adapters(source)?;
            let options = IngestOptions {
                batch_size: self.config.batch_size,
                max_pages: source.max_pages.unwrap_or(self.config.max_pages),
                page_delay: self.config.request_delay,
            };
            report.absorb(ingest_source(self.store(), adapters.listing.as_ref(), options).await);
        }
        Ok((enabled, report))
    }

    pub async fn sweep(&self, dry_run: bool, threshold: Option<chrono::Duration>) -> SweepReport {
        let options = SweepOptions {
            threshold: threshold.unwrap_or(self.config.stale_after),
            page_size: self.config.sweep_page_size,
            dry_run,
        };
        sweep(self.store(), options, Utc::now()).await
    }

    pub async fn restore(&self, selector: &RestoreSelector, last_seen: LastSeenOnRestore) -> Result<Vec<JobKey>> {
        Ok(restore(self.store(), selector, last_seen).await?)
    }

    pub async fn score(&self) -> Result<ScoreReport> {
        let scorer = self
            .scorer
            .as_deref()
            .ok_or_else(|| anyhow!("scoring needs OPENAI_API_KEY"))?;
        Ok(score_pending(self.store(), scorer, self.pass_options(self.config.score_limit)).await?)
    }

    pub async fn embed(&self) -> Result<EmbedReport> {
        let embedder = self
            .embedder
            .as_deref()
            .ok_or_else(|| anyhow!("embedding needs OPENAI_API_KEY"))?;
        Ok(embed_pending(self.store(), embedder, self.pass_options(self.config.embed_limit)).await?)
    }

    pub async fn enrich(&self) -> Result<EnrichReport> {
        let adapters = self.detail_adapters().await?;
        let options = PassOptions {
            call_timeout: self.config.http_timeout,
            ..self.pass_options(self.config.enrich_limit)
        };
        Ok(enrich_missing(self.store(), adapters.detail.as_ref(), options).await?)
    }

    pub async fn validate(&self) -> Result<ValidateReport> {
        let adapters = self.detail_adapters().await?;
        let options = PassOptions {
            call_timeout: self.config.http_timeout,
            ..self.pass_options(self.config.enrich_limit)
        };
        Ok(validate_active(self.store(), adapters.detail.as_ref(), options).await?)
    }

    pub async fn statistics(&self) -> Result<StoreStatistics> {
        let cutoff = self.config.stale_cutoff(Utc::now());
        Ok(self.store.statistics(cutoff).await?)
    }

    pub async fn map_regions(&self, dry_run: bool) -> Result<RegionReport> {
        let options = RegionOptions {
            page_size: self.config.sweep_page_size,
            dry_run,
        };
        Ok(map_regions(self.store(), options).await?)
    }

    /// Ingest, enrich, map regions, sweep, then score and embed when AI clients
    /// are configured. A failing pass is recorded in the summary and the run
    /// moves on, so the run report is always written.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id);
        async move {
            let started_at = Utc::now();
            let mut pass_errors = Vec::new();

            let (enabled_sources, ingest) =
                settle("ingest", self.ingest_all().await, &mut pass_errors).unwrap_or_default();
            let enrich = settle("enrich", self.enrich().await, &mut pass_errors);
            let regions = settle("regions", self.map_regions(false).await, &mut pass_errors);
            let sweep = self.sweep(false, None).await;
            let score = match &self.scorer {
                Some(_) => settle("score", self.score().await, &mut pass_errors),
                None => None,
            };
            let embed = match &self.embedder {
                Some(_) => settle("embed", self.embed().await, &mut pass_errors),
                None => None,
            };
            let statistics = settle("statistics", self.statistics().await, &mut pass_errors);

            let mut summary = RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                enabled_sources,
                ingest,
                enrich,
                regions,
                sweep,
                score,
                embed,
                statistics,
                pass_errors,
                reports_dir: None,
            };
            let run_dir = write_run_report(&self.config.reports_dir, &summary).await?;
            summary.reports_dir = Some(run_dir.display().to_string());
            info!(summary = %summary.headline(), "run finished");
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Scheduler with the sweep and the full pipeline on their own crons, or
    /// `None` when scheduling is disabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let pipeline = Arc::clone(self);
        let sweep_job = Job::new_async(self.config.sweep_cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                let report = pipeline.sweep(false, None).await;
                info!(expired = report.expired, skipped = report.skipped, "scheduled sweep done");
            })
        })
        .with_context(|| format!("creating sweep job for cron {}", self.config.sweep_cron))?;
        sched.add(sweep_job).await.context("adding sweep job")?;

        let pipeline = Arc::clone(self);
        let run_job = Job::new_async(self.config.pipeline_cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                if let Err(err) = pipeline.run_once().await {
                    error!(error = %err, "scheduled pipeline run failed");
                }
            })
        })
        .with_context(|| format!("creating pipeline job for cron {}", self.config.pipeline_cron))?;
        sched.add(run_job).await.context("adding pipeline job")?;

        Ok(Some(sched))
    }
}

fn settle<T>(pass: &'static str, outcome: Result<T>, errors: &mut Vec<PassError>) -> Option<T> {
    match outcome {
        Ok(report) => Some(report),
        Err(err) => {
            let message = format!("{err:#}");
            error!(pass, error = %message, "pass failed; continuing with the rest of the run");
            errors.push(PassError { pass, message });
            None
        }
    }
}

async fn build_ai(config: &SyncConfig, api_key: &str) -> Result<(Arc<dyn RelevanceScorer>, Arc<dyn Embedder>)> {
    let mut client = OpenAiClient::new(api_key, config.ai_timeout)?;
    if let Some(url) = &config.openai_base_url {
        client = client.with_base_url(url);
    }

    let mut scorer = OpenAiScorer::new(client.clone(), config.scoring_model.clone());
    if let Some(path) = &config.scoring_prompt_file {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        scorer = scorer.with_system_prompt(prompt.trim());
    }
    let embedder = OpenAiEmbedder::new(client, config.embedding_model.clone(), config.embedding_dims);
    Ok((Arc::new(scorer), Arc::new(embedder)))
}

pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = Pipeline::from_config(config).await?;
    pipeline.run_once().await
}
