#![forbid(unsafe_code)]

//! Day-by-day metadata collection: page through the search endpoint, then
//! snapshot and merge each non-empty day into the CSV tables.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Days, NaiveDate};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::record::{TableRow, VideoRecord};
use crate::research_api::{QueryRequest, SearchApi, SearchFilter};
use crate::retry::{FailureKind, RetryPolicy, RetryState, Sleeper};
use crate::table::{MergeSummary, TableLayout, merge_and_persist};

pub const API_DATE_FORMAT: &str = "%Y%m%d";

/// Why a day-range query ended before the API reported `has_more = false`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interruption {
    pub kind: FailureKind,
    pub message: String,
}

/// Everything accumulated for one day-range query.
#[derive(Debug, Default)]
pub struct DayBatch {
    pub videos: Vec<VideoRecord>,
    pub pages: usize,
    pub interrupted: Option<Interruption>,
}

impl DayBatch {
    pub fn count(&self) -> usize {
        self.videos.len()
    }

    pub fn is_complete(&self) -> bool {
        self.interrupted.is_none()
    }

    /// Appends a page and hands the accumulator back.
    fn with_page(mut self, videos: Vec<VideoRecord>) -> Self {
        self.videos.extend(videos);
        self.pages += 1;
        self
    }

    fn interrupt(mut self, kind: FailureKind, message: String) -> Self {
        self.interrupted = Some(Interruption { kind, message });
        self
    }
}

/// Query parameters shared by every day of a collection run.
#[derive(Debug, Clone)]
pub struct DayQuery<'a> {
    pub filter: &'a SearchFilter,
    pub page_size: u32,
    pub policy: &'a RetryPolicy,
}

/// Pages through `[start_date, end_date]` until the API stops reporting
/// `has_more`. Failures never raise: whatever was accepted so far is returned
/// along with the reason the loop stopped.
pub fn fetch_day_range(
    api: &dyn SearchApi,
    query: &DayQuery<'_>,
    start_date: &str,
    end_date: &str,
    sleeper: &dyn Sleeper,
) -> DayBatch {
    let mut request = QueryRequest::new(query.filter, start_date, end_date, query.page_size);
    let mut state = RetryState::new();
    let mut batch = DayBatch::default();

    loop {
        let page = match query
            .policy
            .run(&mut state, sleeper, |_| api.query_page(&request))
        {
            Ok(page) => page,
            Err(err) => {
                warn!(
                    start_date,
                    end_date,
                    accumulated = batch.count(),
                    "stopping day query: {err}"
                );
                let kind = err.kind();
                return batch.interrupt(kind, err.into_error().to_string());
            }
        };

        let next = page.next_cursor();
        batch = batch.with_page(page.videos);
        match next {
            Some(cursor) => request.resume_from(&cursor),
            None => return batch,
        }
    }
}

/// Iterates `[start, end)` one calendar day at a time, yielding each day and
/// its successor.
pub fn day_windows(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = (NaiveDate, NaiveDate)> {
    std::iter::successors(Some(start), |day| day.checked_add_days(Days::new(1)))
        .take_while(move |day| *day < end)
        .filter_map(|day| day.checked_add_days(Days::new(1)).map(|next| (day, next)))
}

/// Converts API records into table rows, dropping records whose timestamp
/// cannot be represented.
pub fn to_rows(videos: &[VideoRecord], host: &str) -> Vec<TableRow> {
    videos
        .iter()
        .filter_map(|video| {
            let row = TableRow::from_record(video, host);
            if row.is_none() {
                warn!(
                    id = %video.id,
                    create_time = video.create_time,
                    "skipping record with invalid timestamp"
                );
            }
            row
        })
        .collect()
}

#[derive(Serialize)]
struct SnapshotVideos<'a> {
    videos: &'a [VideoRecord],
}

#[derive(Serialize)]
struct Snapshot<'a> {
    data: SnapshotVideos<'a>,
}

/// Writes `{"data": {"videos": [...]}}` exactly as the records were received.
pub fn write_snapshot(path: &Path, videos: &[VideoRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let snapshot = Snapshot {
        data: SnapshotVideos { videos },
    };
    serde_json::to_writer_pretty(&mut writer, &snapshot)
        .with_context(|| format!("writing {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

/// Reads one search term per line, skipping blank lines.
pub fn load_terms(path: &Path) -> Result<Vec<String>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("reading terms {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Fully resolved collection run.
#[derive(Debug, Clone)]
pub struct CollectorJob {
    pub filter: SearchFilter,
    pub page_size: u32,
    pub policy: RetryPolicy,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub video_host: String,
    pub snapshot_dir: PathBuf,
    pub tables: TableLayout,
}

#[derive(Debug, Clone, Default)]
pub struct DayReport {
    pub start_date: String,
    pub end_date: String,
    pub fetched: usize,
    pub complete: bool,
    pub merge: Option<MergeSummary>,
}

impl CollectorJob {
    pub fn snapshot_path(&self, start_date: &str, end_date: &str) -> PathBuf {
        self.snapshot_dir
            .join(format!("{start_date}_{end_date}_{}.json", self.tables.prefix))
    }

    /// Runs every day in `[start, end)`. A day that fails to persist is logged
    /// and skipped; earlier days stay on disk.
    pub fn run(&self, api: &dyn SearchApi, sleeper: &dyn Sleeper) -> Vec<DayReport> {
        let query = DayQuery {
            filter: &self.filter,
            page_size: self.page_size,
            policy: &self.policy,
        };

        let mut reports = Vec::new();
        for (day, next) in day_windows(self.start, self.end) {
            let start_date = day.format(API_DATE_FORMAT).to_string();
            let end_date = next.format(API_DATE_FORMAT).to_string();
            info!(%start_date, %end_date, "querying day");

            let batch = fetch_day_range(api, &query, &start_date, &end_date, sleeper);
            let mut report = DayReport {
                start_date: start_date.clone(),
                end_date: end_date.clone(),
                fetched: batch.count(),
                complete: batch.is_complete(),
                merge: None,
            };
            info!(
                %start_date,
                fetched = batch.count(),
                pages = batch.pages,
                complete = batch.is_complete(),
                "day query finished"
            );

            if batch.count() != 0 {
                match self.persist_day(&start_date, &end_date, &batch) {
                    Ok(summary) => report.merge = Some(summary),
                    Err(err) => error!(%start_date, "failed to persist day: {err:#}"),
                }
            }
            reports.push(report);
        }
        reports
    }

    fn persist_day(&self, start_date: &str, end_date: &str, batch: &DayBatch) -> Result<MergeSummary> {
        write_snapshot(&self.snapshot_path(start_date, end_date), &batch.videos)?;
        let rows = to_rows(&batch.videos, &self.video_host);
        merge_and_persist(&rows, &self.tables)
    }
}
