//! Run report files and parquet snapshots under `reports/<run_id>/`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use bizhunt_core::{Listing, ScraperRun, SourceReport};
use bizhunt_storage::{sha256_hex, ListingStore};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use tokio::fs;

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReportPaths {
    pub reports_dir: PathBuf,
    pub run_report: PathBuf,
    pub brief: PathBuf,
    pub manifest: PathBuf,
}

/// Write `run_report.json`, `run_brief.md` and the snapshot set for a finished run.
pub async fn write_run_reports(
    reports_root: &Path,
    run: &ScraperRun,
    listings: &[Listing],
) -> Result<RunReportPaths> {
    let reports_dir = reports_root.join(run.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let run_report = reports_dir.join("run_report.json");
    let json = serde_json::to_vec_pretty(run).context("serializing run report")?;
    fs::write(&run_report, json)
        .await
        .with_context(|| format!("writing {}", run_report.display()))?;

    let brief = reports_dir.join("run_brief.md");
    fs::write(&brief, run_brief_markdown(run))
        .await
        .context("writing run_brief.md")?;

    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;
    let listings_path = snapshot_dir.join("listings.parquet");
    let sources_path = snapshot_dir.join("source_runs.parquet");
    write_listings_parquet(&listings_path, listings)?;
    write_source_runs_parquet(&sources_path, run)?;

    let manifest = ParquetManifest {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        files: vec![
            manifest_entry("listings", &reports_dir, &listings_path)?,
            manifest_entry("source_runs", &reports_dir, &sources_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(RunReportPaths {
        reports_dir,
        run_report,
        brief,
        manifest: manifest_path,
    })
}

pub fn run_brief_markdown(run: &ScraperRun) -> String {
    let mut lines = vec![
        "# Listing Run Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", run.run_id),
        format!("- Sources: {}", run.source),
        format!("- Status: **{}**", run.status),
        format!("- Started: {}", run.start_time),
        format!(
            "- Finished: {}",
            run.end_time
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string())
        ),
        format!(
            "- Found {} / new {} / updated {} / deactivated {} / errors {}",
            run.total_found, run.new, run.updated, run.deactivated, run.error_count
        ),
        String::new(),
        "## Sources".to_string(),
        String::new(),
        "| source | state | found | new | updated | unchanged | deactivated | errors | swept |"
            .to_string(),
        "|---|---|---|---|---|---|---|---|---|".to_string(),
    ];
    lines.extend(run.sources.iter().map(source_row));

    if !run.errors.is_empty() {
        lines.push(String::new());
        lines.push("## Errors".to_string());
        lines.push(String::new());
        lines.extend(run.errors.iter().map(|e| format!("- {e}")));
    }
    lines.push(String::new());
    lines.join("\n")
}

fn source_row(report: &SourceReport) -> String {
    format!(
        "| {} | {:?} | {} | {} | {} | {} | {} | {} | {} |",
        report.source,
        report.state,
        report.total_found,
        report.new,
        report.updated,
        report.unchanged,
        report.deactivated,
        report.error_count,
        if report.swept { "yes" } else { "no" }
    )
}

/// Markdown summary of the `runs` most recent runs in the store.
pub async fn report_recent_runs_markdown(store: &dyn ListingStore, runs: usize) -> Result<String> {
    let recent = store
        .recent_runs(runs.max(1))
        .await
        .context("loading recent runs")?;

    let mut lines = vec!["# Recent Listing Runs".to_string(), String::new()];
    if recent.is_empty() {
        lines.push("No runs recorded yet.".to_string());
    }
    for run in recent {
        lines.push(format!("## Run `{}`", run.run_id));
        lines.push(format!("- status: {}", run.status));
        lines.push(format!("- sources: {}", run.source));
        lines.push(format!("- started: {}", run.start_time));
        lines.push(format!(
            "- found {} / new {} / updated {} / deactivated {} / errors {}",
            run.total_found, run.new, run.updated, run.deactivated, run.error_count
        ));
        for source in run.sources.iter().filter(|s| s.state.is_failure()) {
            lines.push(format!("- {} ended {:?}", source.source, source.state));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_listings_parquet(path: &Path, listings: &[Listing]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("listing_id", DataType::Utf8, false),
        ArrowField::new("source", DataType::Utf8, false),
        ArrowField::new("source_url", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, true),
        ArrowField::new("category", DataType::Utf8, true),
        ArrowField::new("country", DataType::Utf8, true),
        ArrowField::new("niches", DataType::Utf8, true),
        ArrowField::new("currency", DataType::Utf8, false),
        ArrowField::new("asking_price", DataType::Float64, true),
        ArrowField::new("revenue", DataType::Float64, true),
        ArrowField::new("profit", DataType::Float64, true),
        ArrowField::new("cash_flow", DataType::Float64, true),
        ArrowField::new("price_to_revenue_multiple", DataType::Float64, true),
        ArrowField::new("price_to_profit_multiple", DataType::Float64, true),
        ArrowField::new("profit_margin_percent", DataType::Float64, true),
        ArrowField::new("data_completeness_score", DataType::Float64, false),
        ArrowField::new("is_active", DataType::Boolean, false),
        ArrowField::new("first_seen", DataType::Utf8, false),
        ArrowField::new("last_updated", DataType::Utf8, false),
    ]));

    let ids: Vec<String> = listings.iter().map(|l| l.listing_id.to_string()).collect();
    let niches: Vec<Option<String>> = listings
        .iter()
        .map(|l| {
            (!l.niches.is_empty()).then(|| l.niches.iter().cloned().collect::<Vec<_>>().join("; "))
        })
        .collect();
    let money = |pick: fn(&Listing) -> Option<f64>| {
        Float64Array::from(listings.iter().map(pick).collect::<Vec<_>>())
    };

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                ids.iter().map(|s| Some(s.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                listings.iter().map(|l| Some(l.source.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                listings.iter().map(|l| Some(l.source_url.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                listings.iter().map(|l| l.title.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                listings.iter().map(|l| l.category.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                listings.iter().map(|l| l.location.country.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                niches.iter().map(|n| n.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                listings
                    .iter()
                    .map(|l| Some(l.asking_price.currency.as_str()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(money(|l| l.asking_price.value)),
            Arc::new(money(|l| l.revenue.value)),
            Arc::new(money(|l| l.profit.value)),
            Arc::new(money(|l| l.cash_flow.value)),
            Arc::new(money(|l| l.price_to_revenue_multiple)),
            Arc::new(money(|l| l.price_to_profit_multiple)),
            Arc::new(money(|l| l.profit_margin_percent)),
            Arc::new(Float64Array::from(
                listings.iter().map(|l| l.data_completeness_score).collect::<Vec<_>>(),
            )),
            Arc::new(BooleanArray::from(
                listings.iter().map(|l| l.is_active).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                listings
                    .iter()
                    .map(|l| Some(l.first_seen.to_rfc3339()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                listings
                    .iter()
                    .map(|l| Some(l.last_updated.to_rfc3339()))
                    .collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building listings record batch")?;
    write_parquet(path, batch)
}

fn counter(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn write_source_runs_parquet(path: &Path, run: &ScraperRun) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("run_id", DataType::Utf8, false),
        ArrowField::new("source", DataType::Utf8, false),
        ArrowField::new("state", DataType::Utf8, false),
        ArrowField::new("total_found", DataType::UInt32, false),
        ArrowField::new("new", DataType::UInt32, false),
        ArrowField::new("updated", DataType::UInt32, false),
        ArrowField::new("unchanged", DataType::UInt32, false),
        ArrowField::new("deactivated", DataType::UInt32, false),
        ArrowField::new("error_count", DataType::UInt32, false),
        ArrowField::new("swept", DataType::Boolean, false),
    ]));

    let sources = &run.sources;
    let run_id = run.run_id.to_string();
    let count = |pick: fn(&SourceReport) -> usize| {
        UInt32Array::from(sources.iter().map(|s| counter(pick(s))).collect::<Vec<_>>())
    };

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                sources.iter().map(|_| Some(run_id.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                sources.iter().map(|s| Some(s.source.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                sources
                    .iter()
                    .map(|s| Some(format!("{:?}", s.state)))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(count(|s| s.total_found)),
            Arc::new(count(|s| s.new)),
            Arc::new(count(|s| s.updated)),
            Arc::new(count(|s| s.unchanged)),
            Arc::new(count(|s| s.deactivated)),
            Arc::new(count(|s| s.error_count)),
            Arc::new(BooleanArray::from(
                sources.iter().map(|s| s.swept).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building source_runs record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}
