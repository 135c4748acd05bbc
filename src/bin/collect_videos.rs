#![forbid(unsafe_code)]

//! Downloads the videos listed in one metadata chunk and writes the chunk back
//! out with `isPublic` and `mp4_isValid` columns.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Result, bail};
use clap::Parser;
use clap::error::ErrorKind;
use tiktok_archive_tools::config::{FetcherOverrides, resolve_fetcher_settings};
use tiktok_archive_tools::fetcher::{ChunkLocation, FetchPlan, YtDlpDownloader, process_table};
use tiktok_archive_tools::logging;
use tiktok_archive_tools::retry::ThreadSleeper;
use tiktok_archive_tools::visibility::WebDetailSource;
use tracing::info;

const USAGE: &str = "Usage: collect_videos [--env-file <path>] <csv_path>";

#[derive(Debug, Parser)]
#[command(name = "collect_videos", about = "Download and validate the videos of one chunk")]
struct Args {
    /// Chunk CSV, relative to METADATA_ROOT (e.g. `chunks_03_15/part_007.csv`).
    csv_path: PathBuf,
    /// Alternate `.env` file.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            eprintln!("{USAGE}");
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let settings = resolve_fetcher_settings(FetcherOverrides {
        env_path: args.env_file,
    })?;

    let input = settings.metadata_root.join(&args.csv_path);
    if !input.is_file() {
        bail!("{} does not exist", input.display());
    }
    let location = ChunkLocation::from_path(&input)?;
    let log_path = settings.log_root.join(location.log_file_name());
    let _log_guard = logging::init(Some(&log_path))?;

    let downloader = YtDlpDownloader::new(&settings.downloader_program);
    downloader.ensure_available()?;
    let detail = WebDetailSource::new(settings.http_timeout);

    let mut plan = FetchPlan::new(
        location.video_dir(&settings.video_root),
        location.augmented_path(&settings.augmented_root),
    );
    plan.video_host = settings.video_host.clone();
    plan.download_policy = settings.download_policy;

    println!("Input: {}", input.display());
    println!("Videos: {}", plan.video_dir.display());
    println!("Log: {}", log_path.display());
    info!(input = %input.display(), policy = ?plan.download_policy, "processing chunk");

    let summary = process_table(&input, &plan, &detail, &downloader, &ThreadSleeper)?;
    println!(
        "Processed {} row(s): {} public, {} valid, {} invalid, {} without verdict.",
        summary.rows, summary.public, summary.valid, summary.invalid, summary.no_verdict
    );
    if summary.skipped > 0 {
        println!("Skipped {} unreadable row(s); see the log.", summary.skipped);
    }
    println!("Augmented table: {}", plan.output_csv.display());
    Ok(())
}
