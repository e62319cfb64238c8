use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jobwatch_storage::StoreStatistics;
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

use crate::{EmbedReport, EnrichReport, IngestReport, RegionReport, ScoreReport, SweepReport};

/// Headline counts of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub inserted: usize,
    pub reobserved: usize,
    pub reobserved_deleted: usize,
    pub expired: usize,
    pub scored: usize,
    pub embedded: usize,
    pub enriched: usize,
    pub regions_mapped: usize,
    pub errored: usize,
    pub failed_pages: usize,
    pub failed_passes: usize,
}

/// A pass of the run that failed as a whole; the rest of the run went on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassError {
    pub pass: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sources: usize,
    pub ingest: IngestReport,
    pub enrich: Option<EnrichReport>,
    pub regions: Option<RegionReport>,
    pub sweep: SweepReport,
    pub score: Option<ScoreReport>,
    pub embed: Option<EmbedReport>,
    pub statistics: Option<StoreStatistics>,
    pub pass_errors: Vec<PassError>,
    pub reports_dir: Option<String>,
}

impl RunSummary {
    pub fn totals(&self) -> RunTotals {
        let score = self.score.as_ref();
        let embed = self.embed.as_ref();
        let enrich = self.enrich.as_ref();
        let regions = self.regions.as_ref();
        RunTotals {
            inserted: self.ingest.inserted,
            reobserved: self.ingest.reobserved,
            reobserved_deleted: self.ingest.reobserved_deleted,
            expired: self.sweep.expired,
            scored: score.map_or(0, |s| s.scored),
            embedded: embed.map_or(0, |e| e.embedded),
            enriched: enrich.map_or(0, |e| e.enriched),
            regions_mapped: regions.map_or(0, |r| r.mapped),
            errored: self.ingest.extraction_errors
                + self.ingest.failures.len()
                + self.sweep.failures.len()
                + score.map_or(0, |s| s.failures.len())
                + embed.map_or(0, |e| e.failures.len())
                + enrich.map_or(0, |e| e.failures.len())
                + regions.map_or(0, |r| r.failures.len()),
            failed_pages: self.ingest.failed_pages,
            failed_passes: self.pass_errors.len(),
        }
    }

    /// One-line summary printed at the end of a run.
    pub fn headline(&self) -> String {
        let t = self.totals();
        format!(
            "inserted={} reobserved={} reobserved_deleted={} expired={} scored={} embedded={} enriched={} regions_mapped={} errored={} failed_pages={} failed_passes={}",
            t.inserted,
            t.reobserved,
            t.reobserved_deleted,
            t.expired,
            t.scored,
            t.embedded,
            t.enriched,
            t.regions_mapped,
            t.errored,
            t.failed_pages,
            t.failed_passes
        )
    }
}

/// Writes `summary.json` and `run_brief.md` under `<reports_dir>/<run_id>/`.
pub async fn write_run_report(reports_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let totals = summary.totals();
    let json = serde_json::to_vec_pretty(&serde_json::json!({
        "totals": totals,
        "run": summary,
    }))
    .context("serializing run summary")?;
    fs::write(run_dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;

    let mut failures: Vec<String> = summary
        .ingest
        .failures
        .iter()
        .chain(&summary.sweep.failures)
        .chain(summary.score.iter().flat_map(|s| &s.failures))
        .chain(summary.embed.iter().flat_map(|e| &e.failures))
        .chain(summary.enrich.iter().flat_map(|e| &e.failures))
        .chain(summary.regions.iter().flat_map(|r| &r.failures))
        .map(|f| {
            let key = f.key.as_ref().map(|k| k.as_str()).unwrap_or("-");
            format!("- {} `{}`: {}", f.stage, key, f.reason)
        })
        .collect();
    let mut failed_passes: Vec<String> = summary
        .pass_errors
        .iter()
        .map(|e| format!("- {}: {}", e.pass, e.message))
        .collect();
    if failed_passes.is_empty() {
        failed_passes.push("- none".to_string());
    }
    if failures.is_empty() {
        failures.push("- none".to_string());
    }

    let brief = format!(
        "# jobwatch run brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Enabled sources: {}\n\n\
         ## Counts\n- inserted: {}\n- re-observed: {}\n- re-observed (deleted, left as is): {}\n- expired: {}\n\
         - scored: {}\n- embedded: {}\n- enriched: {}\n- regions mapped: {}\n- errored: {}\n- failed pages: {}\n\n\
         ## Failed passes\n{}\n\n## Failures\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.enabled_sources,
        totals.inserted,
        totals.reobserved,
        totals.reobserved_deleted,
        totals.expired,
        totals.scored,
        totals.embedded,
        totals.enriched,
        totals.regions_mapped,
        totals.errored,
        totals.failed_pages,
        failed_passes.join("\n"),
        failures.join("\n"),
    );
    fs::write(run_dir.join("run_brief.md"), brief)
        .await
        .context("writing run_brief.md")?;

    Ok(run_dir)
}

/// Markdown digest of the most recent `runs` reports, newest first.
pub fn report_recent_markdown(reports_dir: &Path, runs: usize) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join("summary.json").exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# jobwatch recent runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let summary_path = dir.path().join("summary.json");
        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;

        let count = |name: &str| {
            value
                .get("totals")
                .and_then(|t| t.get(name))
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };
        let finished = value
            .get("run")
            .and_then(|r| r.get("finished_at"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- finished: {finished}"));
        for name in ["inserted", "reobserved", "expired", "scored", "embedded", "errored", "failed_passes"] {
            lines.push(format!("- {name}: {}", count(name)));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RecordFailure;
    use jobwatch_core::JobKey;

    fn summary() -> RunSummary {
        let now = Utc::now();
        RunSummary {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            enabled_sources: 1,
            ingest: IngestReport {
                inserted: 3,
                reobserved: 2,
                extraction_errors: 1,
                failures: vec![RecordFailure::new("ingest", JobKey::new("h9").ok(), "insert failed")],
                ..Default::default()
            },
            enrich: None,
            regions: None,
            sweep: SweepReport {
                expired: 4,
                ..Default::default()
            },
            score: Some(ScoreReport {
                scored: 5,
                ..Default::default()
            }),
            embed: None,
            statistics: None,
            pass_errors: vec![PassError {
                pass: "embed",
                message: "embedding needs OPENAI_API_KEY".into(),
            }],
            reports_dir: None,
        }
    }

    #[test]
    fn totals_add_up_errors_across_passes() {
        let totals = summary().totals();
        assert_eq!(totals.inserted, 3);
        assert_eq!(totals.expired, 4);
        assert_eq!(totals.scored, 5);
        assert_eq!(totals.errored, 2);
        assert_eq!(totals.failed_passes, 1);
        assert!(summary().headline().starts_with("inserted=3 reobserved=2"));
    }

    #[tokio::test]
    async fn writes_summary_and_brief() {
        let dir = tempfile::tempdir().unwrap();
        let summary = summary();
        let run_dir = write_run_report(dir.path(), &summary).await.unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(run_dir.join("summary.json")).unwrap()).unwrap();
        assert_eq!(json["totals"]["inserted"], 3);
        assert_eq!(json["run"]["run_id"], summary.run_id.to_string());

        let brief = std::fs::read_to_string(run_dir.join("run_brief.md")).unwrap();
        assert!(brief.contains("- expired: 4"));
        assert!(brief.contains("- ingest `h9`: insert failed"));
        assert!(brief.contains("## Failed passes\n- embed: embedding needs OPENAI_API_KEY"));

        let digest = report_recent_markdown(dir.path(), 5).unwrap();
        assert!(digest.contains(&summary.run_id.to_string()));
        assert!(digest.contains("- scored: 5"));
    }
}
