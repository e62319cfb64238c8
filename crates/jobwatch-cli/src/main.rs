use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{ArgGroup, Parser, Subcommand};
use jobwatch_core::JobKey;
use jobwatch_storage::{LastSeenOnRestore, PgJobStore, PgStoreConfig, RestoreSelector};
use jobwatch_sync::{report_recent_markdown, Pipeline, SyncConfig, MAX_STALE_AFTER_HOURS};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "info,jobwatch_sync=debug,sqlx=warn";

#[derive(Debug, Parser)]
#[command(name = "jobwatch")]
#[command(about = "Job listing ingestion, staleness sweeping and AI annotation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Page through every enabled source and store new listings.
    Ingest,
    /// Soft-delete active listings not observed within the stale window.
    Sweep {
        #[arg(long)]
        dry_run: bool,
        /// Override JOBWATCH_STALE_AFTER_HOURS for this sweep.
        #[arg(long, value_parser = clap::value_parser!(i64).range(1..=MAX_STALE_AFTER_HOURS))]
        hours: Option<i64>,
    },
    /// Reactivate soft-deleted listings.
    #[command(group(ArgGroup::new("target").required(true).args(["all", "keys"])))]
    Restore {
        #[arg(long)]
        all: bool,
        keys: Vec<String>,
        /// Reset last_seen to created_at.
        #[arg(long, conflicts_with = "refresh_last_seen")]
        reset_last_seen: bool,
        /// Set last_seen to now.
        #[arg(long)]
        refresh_last_seen: bool,
    },
    Score,
    Embed,
    /// Fill blank listing fields from each listing's own page.
    Enrich,
    /// Visit listing pages and soft-delete those marked expired.
    Validate,
    /// Assign a region to listings that have none, from their location.
    MapRegions {
        #[arg(long)]
        dry_run: bool,
    },
    Stats,
    /// Ingest, enrich, map regions, sweep, score and embed, then write a run report.
    Run,
    Migrate,
    /// Run the sweep and the pipeline on their cron schedules until Ctrl-C.
    Schedule,
    /// Print a digest of recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    let json = matches!(
        std::env::var("JOBWATCH_LOG_JSON").as_deref(),
        Ok("1" | "true" | "TRUE")
    );
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_target(true)))
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .init();
}

fn parse_keys(keys: &[String]) -> Result<Vec<JobKey>> {
    keys.iter()
        .map(|k| JobKey::new(k.as_str()).with_context(|| format!("invalid key {k:?}")))
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Report { runs } => {
            println!("{}", report_recent_markdown(&config.reports_dir, runs)?);
        }
        Commands::Migrate => {
            let store = PgJobStore::connect(&PgStoreConfig {
                database_url: config.require_database_url()?.to_string(),
                max_connections: config.db_max_connections,
                timeout: config.db_timeout,
            })
            .await?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        command => {
            let pipeline = Pipeline::from_config(config).await?;
            run_command(pipeline, command).await?;
        }
    }

    Ok(())
}

async fn run_command(pipeline: Pipeline, command: Commands) -> Result<()> {
    match command {
        Commands::Ingest => {
            let (sources, r) = pipeline.ingest_all().await?;
            println!(
                "ingest complete: sources={sources} pages={} failed_pages={} inserted={} reobserved={} reobserved_deleted={} extraction_errors={} duplicates={} failures={}",
                r.pages,
                r.failed_pages,
                r.inserted,
                r.reobserved,
                r.reobserved_deleted,
                r.extraction_errors,
                r.duplicates_in_batch + r.duplicates_in_run,
                r.failures.len()
            );
        }
        Commands::Sweep { dry_run, hours } => {
            let threshold = hours
                .map(|h| chrono::Duration::try_hours(h).with_context(|| format!("--hours {h} is out of range")))
                .transpose()?;
            let r = pipeline.sweep(dry_run, threshold).await;
            println!(
                "sweep complete: cutoff={} dry_run={} scanned={} expired={} skipped={} failed={} interrupted={}",
                r.cutoff.map(|c| c.to_rfc3339()).unwrap_or_default(),
                r.dry_run,
                r.scanned,
                r.expired,
                r.skipped,
                r.failed,
                r.interrupted
            );
        }
        Commands::Restore {
            all,
            keys,
            reset_last_seen,
            refresh_last_seen,
        } => {
            let selector = if all {
                RestoreSelector::All
            } else {
                RestoreSelector::Keys(parse_keys(&keys)?)
            };
            let last_seen = if reset_last_seen {
                LastSeenOnRestore::CreatedAt
            } else if refresh_last_seen {
                LastSeenOnRestore::Now(Utc::now())
            } else {
                LastSeenOnRestore::Keep
            };
            let restored = pipeline.restore(&selector, last_seen).await?;
            println!("restore complete: restored={}", restored.len());
            for key in restored {
                println!("  {key}");
            }
        }
        Commands::Score => {
            let r = pipeline.score().await?;
            println!(
                "score complete: selected={} scored={} rejected={} failed={} skipped={} distribution={:?}",
                r.selected, r.scored, r.rejected, r.failed, r.skipped, r.distribution
            );
        }
        Commands::Embed => {
            let r = pipeline.embed().await?;
            println!(
                "embed complete: selected={} embedded={} rejected={} failed={} skipped={}",
                r.selected, r.embedded, r.rejected, r.failed, r.skipped
            );
        }
        Commands::Enrich => {
            let r = pipeline.enrich().await?;
            println!(
                "enrich complete: selected={} enriched={} unchanged={} fields_filled={} failed={}",
                r.selected, r.enriched, r.unchanged, r.fields_filled, r.failed
            );
        }
        Commands::Validate => {
            let r = pipeline.validate().await?;
            println!(
                "validate complete: checked={} expired={} kept={} uncertain={} failed={}",
                r.checked, r.expired, r.kept, r.uncertain, r.failed
            );
        }
        Commands::MapRegions { dry_run } => {
            let r = pipeline.map_regions(dry_run).await?;
            println!(
                "map-regions complete: dry_run={} scanned={} mapped={} unmatched={} skipped={} failed={}",
                r.dry_run, r.scanned, r.mapped, r.unmatched, r.skipped, r.failed
            );
            for (region, count) in &r.by_region {
                println!("  {region}: {count}");
            }
        }
        Commands::Stats => {
            let s = pipeline.statistics().await?;
            println!(
                "total={} active={} deleted={} pending_stale={} scored={} relevant={} embedded={} with_region={}",
                s.total, s.active, s.deleted, s.pending_stale, s.scored, s.relevant, s.embedded, s.with_region
            );
            for (score, count) in s.score_distribution.iter().enumerate() {
                println!("  score {score}: {count}");
            }
        }
        Commands::Run => {
            let summary = pipeline.run_once().await?;
            println!(
                "run complete: run_id={} sources={} {} reports={}",
                summary.run_id,
                summary.enabled_sources,
                summary.headline(),
                summary.reports_dir.as_deref().unwrap_or("-")
            );
            for failed in &summary.pass_errors {
                eprintln!("  {} pass failed: {}", failed.pass, failed.message);
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduling is disabled; set JOBWATCH_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                sweep_cron = %pipeline.config().sweep_cron,
                pipeline_cron = %pipeline.config().pipeline_cron,
                "scheduler running"
            );
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { .. } | Commands::Migrate => bail!("command does not run through the pipeline"),
    }
    Ok(())
}
