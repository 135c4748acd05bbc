#![forbid(unsafe_code)]

//! Pulls day-by-day search results from the research API and folds them into
//! the per-date and combined CSV tables under `DATA_ROOT`.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tiktok_archive_tools::collector::{API_DATE_FORMAT, CollectorJob, DayReport, load_terms};
use tiktok_archive_tools::config::{CollectorOverrides, CollectorSettings, resolve_collector_settings};
use tiktok_archive_tools::logging;
use tiktok_archive_tools::research_api::{HttpSearchApi, SearchFilter};
use tiktok_archive_tools::retry::{RetryPolicy, ThreadSleeper};
use tiktok_archive_tools::table::TableLayout;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "collect_metadata", about = "Collect video metadata one day at a time")]
struct Args {
    /// Alternate `.env` file.
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// First day to query (YYYYMMDD), overrides COLLECTOR_START_DATE.
    #[arg(long)]
    start_date: Option<String>,
    /// Day after the last one to query (YYYYMMDD), overrides COLLECTOR_END_DATE.
    #[arg(long)]
    end_date: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let settings = resolve_collector_settings(CollectorOverrides {
        start_date: args.start_date,
        end_date: args.end_date,
        env_path: args.env_file,
    })?;

    let log_file = settings.log_root.as_ref().map(|root| {
        root.join(format!(
            "collect_metadata_{}_{}.log",
            settings.start_date.format(API_DATE_FORMAT),
            settings.end_date.format(API_DATE_FORMAT)
        ))
    });
    let _log_guard = logging::init(log_file.as_deref())?;

    let job = build_job(&settings)?;
    println!("Data root: {}", settings.data_root.display());
    println!(
        "Querying {} from {} to {} (exclusive)",
        settings.region_code,
        settings.start_date.format(API_DATE_FORMAT),
        settings.end_date.format(API_DATE_FORMAT)
    );

    let api = HttpSearchApi::new(&settings.api_url, &settings.api_token, settings.http_timeout);
    let reports = job.run(&api, &ThreadSleeper);
    print_summary(&reports);
    Ok(())
}

fn build_job(settings: &CollectorSettings) -> Result<CollectorJob> {
    let terms = load_terms(&settings.terms_file).context("loading search terms")?;
    if terms.is_empty() {
        bail!("{} contains no search terms", settings.terms_file.display());
    }
    info!(terms = terms.len(), "loaded search terms");

    Ok(CollectorJob {
        filter: SearchFilter {
            region_code: settings.region_code.clone(),
            keywords: terms.clone(),
            hashtags: terms,
        },
        page_size: settings.page_size,
        policy: RetryPolicy::search_api(settings.server_retry_cap),
        start: settings.start_date,
        end: settings.end_date,
        video_host: settings.video_host.clone(),
        snapshot_dir: settings.snapshot_dir(),
        tables: TableLayout::new(
            settings.daily_dir(),
            settings.combined_table(),
            &settings.table_prefix,
        ),
    })
}

fn print_summary(reports: &[DayReport]) {
    let fetched: usize = reports.iter().map(|report| report.fetched).sum();
    let incomplete: Vec<&str> = reports
        .iter()
        .filter(|report| !report.complete)
        .map(|report| report.start_date.as_str())
        .collect();

    println!("Fetched {fetched} video(s) over {} day(s).", reports.len());
    if let Some(combined) = reports.iter().rev().find_map(|report| report.merge.as_ref()) {
        println!("Combined table now holds {} row(s).", combined.combined_rows);
    }
    if !incomplete.is_empty() {
        println!("Interrupted days: {}", incomplete.join(", "));
    }
}
