#![forbid(unsafe_code)]

//! Per-row download pipeline: probe visibility, fetch the MP4 through the
//! external downloader, validate its container signature and write the
//! verdicts back next to the original columns.

use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use thiserror::Error;
use tracing::{info, warn};

use crate::record::{DEFAULT_VIDEO_HOST, share_url, video_url};
use crate::retry::{Classify, FailureKind, RetryPolicy, RetryState, Sleeper};
use crate::signature::is_mp4_file;
use crate::visibility::{DetailSource, check_visibility, is_timeout_message};

pub const DEFAULT_DOWNLOADER_PROGRAM: &str = "yt-dlp";
pub const IS_PUBLIC_COLUMN: &str = "isPublic";
pub const MP4_VALID_COLUMN: &str = "mp4_isValid";
/// Pause before every download attempt to stay polite with the host.
pub const COURTESY_DELAY: Duration = Duration::from_secs(10);

/// Whether rows that failed the visibility probe still get a download attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DownloadPolicy {
    /// Download every row and keep `isPublic` for later filtering.
    #[default]
    Always,
    PublicOnly,
}

impl FromStr for DownloadPolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "always" | "all" => Ok(DownloadPolicy::Always),
            "public-only" | "public_only" | "public" => Ok(DownloadPolicy::PublicOnly),
            _ => bail!("unknown download policy: {value}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download timed out: {0}")]
    Timeout(String),
    #[error("item unavailable: {0}")]
    Unavailable(String),
    #[error("downloader failed: {0}")]
    Failed(String),
}

impl Classify for DownloadError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            DownloadError::Timeout(_) => FailureKind::Timeout,
            DownloadError::Unavailable(_) => FailureKind::Unavailable,
            DownloadError::Failed(_) => FailureKind::Unexpected,
        }
    }
}

/// External routine that saves the media behind `url` to `target`.
pub trait MediaDownloader {
    fn download(&self, url: &str, target: &Path) -> Result<(), DownloadError>;
}

/// Shells out to yt-dlp (or anything accepting the same flags).
pub struct YtDlpDownloader {
    program: OsString,
}

impl YtDlpDownloader {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Fails loudly when the program is missing before any row is touched.
    pub fn ensure_available(&self) -> Result<()> {
        let status = Command::new(&self.program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(_) => bail!(
                "{} is installed but returned a failure status",
                self.program.to_string_lossy()
            ),
            Err(err) => bail!(
                "{} is not installed or not in PATH: {}",
                self.program.to_string_lossy(),
                err
            ),
        }
    }
}

impl MediaDownloader for YtDlpDownloader {
    fn download(&self, url: &str, target: &Path) -> Result<(), DownloadError> {
        let output = Command::new(&self.program)
            .arg("--format")
            .arg("best[ext=mp4]/best")
            .arg("--output")
            .arg(target)
            .arg("--no-part")
            .arg("--no-progress")
            .arg("--no-warnings")
            .arg(url)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| DownloadError::Failed(format!("could not run downloader: {err}")))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify_downloader_output(&stderr, output.status.code()))
    }
}

/// Maps downloader stderr onto a failure class. Removed items are reported
/// through the page's detail structure or an explicit "unavailable" notice.
pub fn classify_downloader_output(stderr: &str, code: Option<i32>) -> DownloadError {
    let lower = stderr.to_ascii_lowercase();
    let message = if stderr.is_empty() {
        format!("exit status {}", code.map_or("unknown".into(), |code| code.to_string()))
    } else {
        stderr.to_string()
    };

    if lower.contains("webapp.video-detail")
        || lower.contains("iteminfo")
        || lower.contains("not available")
        || lower.contains("unavailable")
    {
        DownloadError::Unavailable(message)
    } else if is_timeout_message(&lower) {
        DownloadError::Timeout(message)
    } else {
        DownloadError::Failed(message)
    }
}

/// Identity of one row's media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub id: String,
    pub author: String,
    pub url: String,
}

impl MediaItem {
    /// `@{author}_video_{id}.mp4`
    pub fn file_name(&self) -> String {
        format!("@{}_video_{}.mp4", self.author, self.id)
    }
}

/// Downloads `item` into `output_dir` and checks the MP4 signature.
///
/// `Some(valid)` once the downloader ran to completion, `None` when no verdict
/// was reached (item removed, or every attempt failed).
pub fn download_and_validate(
    item: &MediaItem,
    output_dir: &Path,
    downloader: &dyn MediaDownloader,
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
) -> Option<bool> {
    let started = Instant::now();
    let target = output_dir.join(item.file_name());
    let url = share_url(&item.url);
    let mut state = RetryState::new();

    let outcome = policy.run(&mut state, sleeper, |_| {
        sleeper.sleep(COURTESY_DELAY);
        downloader.download(&url, &target)?;
        Ok::<bool, DownloadError>(is_mp4_file(&target))
    });

    let elapsed = started.elapsed().as_secs_f64();
    match outcome {
        Ok(valid) => {
            info!("Downloaded video {} in {:.2} seconds", item.url, elapsed);
            Some(valid)
        }
        Err(err) if err.kind() == FailureKind::Unavailable => {
            info!(url = %item.url, "skipping download: {err}");
            None
        }
        Err(err) => {
            warn!(
                "FAILED Downloaded video {} in {:.2} seconds: {err}",
                item.url, elapsed
            );
            None
        }
    }
}

/// Where an input chunk sits in the `chunks_<date>/<stem>.csv` layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLocation {
    /// Text after the first `_` of the `chunks*` directory, e.g. `03_15`.
    pub date_part: String,
    /// File name without extension.
    pub stem: String,
}

impl ChunkLocation {
    pub fn from_path(path: &Path) -> Result<Self> {
        let chunks_dir = path
            .components()
            .filter_map(|component| match component {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .find(|part| part.starts_with("chunks"))
            .ok_or_else(|| {
                anyhow!(
                    "{} is not inside a chunks_<date> directory",
                    path.display()
                )
            })?;
        let date_part = chunks_dir
            .split_once('_')
            .map(|(_, rest)| rest.to_string())
            .filter(|rest| !rest.is_empty())
            .ok_or_else(|| anyhow!("{chunks_dir} does not carry a date suffix"))?;
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| anyhow!("{} has no file name", path.display()))?
            .to_string();
        Ok(Self { date_part, stem })
    }

    /// `<date_part>_<stem>_process_log.log`
    pub fn log_file_name(&self) -> String {
        format!("{}_{}_process_log.log", self.date_part, self.stem)
    }

    pub fn video_dir(&self, video_root: &Path) -> PathBuf {
        video_root.join(&self.date_part).join(&self.stem)
    }

    pub fn augmented_path(&self, augmented_root: &Path) -> PathBuf {
        augmented_root
            .join(&self.date_part)
            .join(format!("{}.csv", self.stem))
    }
}

/// Resolved settings for one table run.
#[derive(Debug, Clone)]
pub struct FetchPlan {
    pub video_dir: PathBuf,
    pub output_csv: PathBuf,
    pub video_host: String,
    pub download_policy: DownloadPolicy,
    pub visibility_policy: RetryPolicy,
    pub download_retry: RetryPolicy,
}

impl FetchPlan {
    pub fn new(video_dir: PathBuf, output_csv: PathBuf) -> Self {
        Self {
            video_dir,
            output_csv,
            video_host: DEFAULT_VIDEO_HOST.to_string(),
            download_policy: DownloadPolicy::default(),
            visibility_policy: RetryPolicy::visibility(),
            download_retry: RetryPolicy::download(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub rows: usize,
    pub public: usize,
    pub valid: usize,
    pub invalid: usize,
    pub no_verdict: usize,
    /// Records that could not be parsed and are missing from the output.
    pub skipped: usize,
}

struct Columns {
    id: usize,
    author: usize,
    url: Option<usize>,
}

impl Columns {
    fn locate(headers: &csv::StringRecord) -> Result<Self> {
        let find = |name: &str| headers.iter().position(|header| header == name);
        Ok(Self {
            id: find("id").ok_or_else(|| anyhow!("input table has no id column"))?,
            author: find("username").ok_or_else(|| anyhow!("input table has no username column"))?,
            url: find("tiktokurl"),
        })
    }

    fn item(&self, row: &csv::StringRecord, host: &str) -> Option<MediaItem> {
        let id = row.get(self.id)?.trim().to_string();
        let author = row.get(self.author)?.trim().to_string();
        if id.is_empty() || author.is_empty() {
            return None;
        }
        let url = self
            .url
            .and_then(|index| row.get(index))
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| video_url(host, &author, &id));
        Some(MediaItem { id, author, url })
    }
}

/// Boolean cells are written the way the downstream notebooks read them.
fn bool_cell(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

/// Runs every row of `input` through the visibility probe and the downloader,
/// then writes the table with `isPublic` and `mp4_isValid` appended (replaced
/// when a previous run already added them).
pub fn process_table(
    input: &Path,
    plan: &FetchPlan,
    detail: &dyn DetailSource,
    downloader: &dyn MediaDownloader,
    sleeper: &dyn Sleeper,
) -> Result<FetchSummary> {
    let started = Instant::now();
    // Ragged rows are padded or truncated to the header instead of failing.
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(input)
        .with_context(|| format!("opening {}", input.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("reading header of {}", input.display()))?
        .clone();
    let columns = Columns::locate(&headers)?;
    let kept: Vec<usize> = headers
        .iter()
        .enumerate()
        .filter(|(_, name)| *name != IS_PUBLIC_COLUMN && *name != MP4_VALID_COLUMN)
        .map(|(index, _)| index)
        .collect();

    fs::create_dir_all(&plan.video_dir)
        .with_context(|| format!("creating {}", plan.video_dir.display()))?;

    let mut output_rows = Vec::new();
    let mut summary = FetchSummary::default();
    for (index, row) in reader.records().enumerate() {
        let row = match row {
            Ok(row) => row,
            Err(err) => {
                warn!(row = index + 1, input = %input.display(), "unreadable row, leaving it out: {err}");
                summary.skipped += 1;
                continue;
            }
        };
        summary.rows += 1;

        let (is_public, valid) = match columns.item(&row, &plan.video_host) {
            Some(item) => process_item(&item, plan, detail, downloader, sleeper),
            None => {
                warn!(row = index + 1, "row has no id/username, skipping");
                (false, None)
            }
        };

        if is_public {
            summary.public += 1;
        }
        match valid {
            Some(true) => summary.valid += 1,
            Some(false) => summary.invalid += 1,
            None => summary.no_verdict += 1,
        }

        let mut out: Vec<String> = kept
            .iter()
            .map(|&column| row.get(column).unwrap_or_default().to_string())
            .collect();
        out.push(bool_cell(is_public).to_string());
        out.push(valid.map(bool_cell).unwrap_or_default().to_string());
        output_rows.push(out);
    }

    let mut out_headers: Vec<&str> = kept
        .iter()
        .map(|&column| headers.get(column).unwrap_or_default())
        .collect();
    out_headers.push(IS_PUBLIC_COLUMN);
    out_headers.push(MP4_VALID_COLUMN);
    write_rows(&plan.output_csv, &out_headers, &output_rows)?;

    info!(
        "Processed {} in {:.2} seconds",
        input.display(),
        started.elapsed().as_secs_f64()
    );
    Ok(summary)
}

fn process_item(
    item: &MediaItem,
    plan: &FetchPlan,
    detail: &dyn DetailSource,
    downloader: &dyn MediaDownloader,
    sleeper: &dyn Sleeper,
) -> (bool, Option<bool>) {
    let is_public = check_visibility(&item.url, detail, &plan.visibility_policy, sleeper);
    if !is_public && plan.download_policy == DownloadPolicy::PublicOnly {
        info!(url = %item.url, "not public, download skipped");
        return (false, None);
    }
    let valid = download_and_validate(
        item,
        &plan.video_dir,
        downloader,
        &plan.download_retry,
        sleeper,
    );
    (is_public, valid)
}

fn write_rows(path: &Path, headers: &[&str], rows: &[Vec<String>]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("csv.tmp");
    {
        let mut writer = csv::Writer::from_path(&tmp_path)
            .with_context(|| format!("creating {}", tmp_path.display()))?;
        writer
            .write_record(headers)
            .with_context(|| format!("writing header to {}", tmp_path.display()))?;
        for row in rows {
            writer
                .write_record(row)
                .with_context(|| format!("writing {}", tmp_path.display()))?;
        }
        writer
            .flush()
            .with_context(|| format!("flushing {}", tmp_path.display()))?;
    }
    fs::rename(&tmp_path, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::testing::RecordingSleeper;
    use crate::visibility::DetailError;
    use serde_json::{Value, json};
    use std::cell::RefCell;
    use std::collections::{HashMap, VecDeque};
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    const MP4_HEADER: &[u8] = b"\0\0\0\x18ftypisom\0\0\x02\0isomiso2";

    /// What the fake downloader does on each call.
    #[derive(Clone)]
    enum Step {
        Write(&'static [u8]),
        Fail(&'static str),
        Timeout,
        Unavailable,
        Nothing,
    }

    struct ScriptedDownloader {
        steps: RefCell<VecDeque<Step>>,
        calls: RefCell<Vec<(String, PathBuf)>>,
    }

    impl ScriptedDownloader {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: RefCell::new(steps.into()),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl MediaDownloader for ScriptedDownloader {
        fn download(&self, url: &str, target: &Path) -> Result<(), DownloadError> {
            self.calls
                .borrow_mut()
                .push((url.to_string(), target.to_path_buf()));
            let step = self.steps.borrow_mut().pop_front().unwrap_or(Step::Write(MP4_HEADER));
            match step {
                Step::Write(bytes) => {
                    fs::write(target, bytes).unwrap();
                    Ok(())
                }
                Step::Fail(message) => Err(DownloadError::Failed(message.into())),
                Step::Timeout => Err(DownloadError::Timeout("read timed out".into())),
                Step::Unavailable => Err(DownloadError::Unavailable("gone".into())),
                Step::Nothing => Ok(()),
            }
        }
    }

    /// Answers per video id; unknown ids look like removed items.
    struct MapDetail {
        private_by_id: HashMap<&'static str, bool>,
    }

    impl DetailSource for MapDetail {
        fn fetch_detail(&self, url: &str) -> Result<Value, DetailError> {
            let id = url
                .split("/video/")
                .nth(1)
                .and_then(|rest| rest.split('?').next())
                .unwrap_or_default();
            match self.private_by_id.get(id) {
                Some(private) => Ok(json!({
                    "__DEFAULT_SCOPE__": {"webapp.video-detail": {
                        "itemInfo": {"itemStruct": {"privateItem": private}}
                    }}
                })),
                None => Ok(json!({"__DEFAULT_SCOPE__": {}})),
            }
        }
    }

    fn item() -> MediaItem {
        MediaItem {
            id: "42".into(),
            author: "someone".into(),
            url: "https://www.tiktok.com/@someone/video/42".into(),
        }
    }

    fn download(downloader: &ScriptedDownloader, dir: &Path, sleeper: &RecordingSleeper) -> Option<bool> {
        download_and_validate(&item(), dir, downloader, &RetryPolicy::download(), sleeper)
    }

    #[test]
    fn valid_download_reports_true() {
        let dir = tempdir().unwrap();
        let downloader = ScriptedDownloader::new(vec![Step::Write(MP4_HEADER)]);
        let sleeper = RecordingSleeper::default();
        assert_eq!(download(&downloader, dir.path(), &sleeper), Some(true));

        let calls = downloader.calls.borrow();
        assert_eq!(
            calls[0].0,
            "https://www.tiktok.com/@someone/video/42?is_copy_url=1&is_from_webapp=v1"
        );
        assert_eq!(calls[0].1, dir.path().join("@someone_video_42.mp4"));
        assert_eq!(sleeper.secs(), vec![10]);
    }

    #[test]
    fn html_error_page_reports_false() {
        let dir = tempdir().unwrap();
        let downloader = ScriptedDownloader::new(vec![Step::Write(b"<!DOCTYPE html><html>")]);
        assert_eq!(
            download(&downloader, dir.path(), &RecordingSleeper::default()),
            Some(false)
        );
    }

    #[test]
    fn missing_output_reports_false() {
        let dir = tempdir().unwrap();
        let downloader = ScriptedDownloader::new(vec![Step::Nothing]);
        assert_eq!(
            download(&downloader, dir.path(), &RecordingSleeper::default()),
            Some(false)
        );
    }

    #[test]
    fn timeout_then_success_pauses_between_attempts() {
        let dir = tempdir().unwrap();
        let downloader = ScriptedDownloader::new(vec![Step::Timeout, Step::Write(MP4_HEADER)]);
        let sleeper = RecordingSleeper::default();
        assert_eq!(download(&downloader, dir.path(), &sleeper), Some(true));
        assert_eq!(sleeper.secs(), vec![10, 100, 10]);
    }

    #[test]
    fn three_failures_yield_no_verdict() {
        let dir = tempdir().unwrap();
        let downloader = ScriptedDownloader::new(vec![
            Step::Fail("boom"),
            Step::Timeout,
            Step::Fail("boom"),
            Step::Write(MP4_HEADER),
        ]);
        let sleeper = RecordingSleeper::default();
        assert_eq!(download(&downloader, dir.path(), &sleeper), None);
        assert_eq!(downloader.calls.borrow().len(), 3);
        assert_eq!(sleeper.secs(), vec![10, 100, 10, 100, 10]);
    }

    #[test]
    fn unavailable_item_aborts_immediately() {
        let dir = tempdir().unwrap();
        let downloader = ScriptedDownloader::new(vec![Step::Unavailable, Step::Write(MP4_HEADER)]);
        assert_eq!(
            download(&downloader, dir.path(), &RecordingSleeper::default()),
            None
        );
        assert_eq!(downloader.calls.borrow().len(), 1);
    }

    #[test]
    fn downloader_output_classification() {
        assert!(matches!(
            classify_downloader_output("ERROR: [TikTok] 42: Video not available", Some(1)),
            DownloadError::Unavailable(_)
        ));
        assert!(matches!(
            classify_downloader_output("ERROR: Read timed out.", Some(1)),
            DownloadError::Timeout(_)
        ));
        assert!(matches!(
            classify_downloader_output("", Some(2)),
            DownloadError::Failed(message) if message == "exit status 2"
        ));
    }

    #[test]
    fn chunk_location_parses_layout() -> Result<()> {
        let location =
            ChunkLocation::from_path(Path::new("/data/meta/chunks_03_15/part_007.csv"))?;
        assert_eq!(location.date_part, "03_15");
        assert_eq!(location.stem, "part_007");
        assert_eq!(location.log_file_name(), "03_15_part_007_process_log.log");
        assert_eq!(
            location.video_dir(Path::new("/videos")),
            PathBuf::from("/videos/03_15/part_007")
        );
        assert_eq!(
            location.augmented_path(Path::new("/extra")),
            PathBuf::from("/extra/03_15/part_007.csv")
        );
        Ok(())
    }

    #[test]
    fn chunk_location_requires_chunks_dir() {
        assert!(ChunkLocation::from_path(Path::new("/data/meta/part_007.csv")).is_err());
        assert!(ChunkLocation::from_path(Path::new("/data/chunks/part.csv")).is_err());
    }

    #[test]
    fn download_policy_parses_aliases() -> Result<()> {
        assert_eq!("always".parse::<DownloadPolicy>()?, DownloadPolicy::Always);
        assert_eq!(
            "Public-Only".parse::<DownloadPolicy>()?,
            DownloadPolicy::PublicOnly
        );
        assert!("sometimes".parse::<DownloadPolicy>().is_err());
        Ok(())
    }

    fn write_input(dir: &Path) -> PathBuf {
        let input = dir.join("chunks_03_15").join("part_1.csv");
        fs::create_dir_all(input.parent().unwrap()).unwrap();
        fs::write(
            &input,
            "id,username,video_description,tiktokurl\n\
             1,alpha,\"first, with comma\",https://www.tiktok.com/@alpha/video/1\n\
             2,beta,second,https://www.tiktok.com/@beta/video/2\n\
             3,gamma,third,\n",
        )
        .unwrap();
        input
    }

    fn read_output(path: &Path) -> Vec<Vec<String>> {
        let mut reader = csv::Reader::from_path(path).unwrap();
        let mut rows = vec![reader.headers().unwrap().iter().map(str::to_string).collect()];
        for row in reader.records() {
            rows.push(row.unwrap().iter().map(str::to_string).collect());
        }
        rows
    }

    #[test]
    fn process_table_appends_verdict_columns() -> Result<()> {
        let dir = tempdir()?;
        let input = write_input(dir.path());
        let plan = FetchPlan::new(dir.path().join("videos"), dir.path().join("out/part_1.csv"));
        let detail = MapDetail {
            private_by_id: HashMap::from([("1", false), ("2", true)]),
        };
        let downloader = ScriptedDownloader::new(vec![
            Step::Write(MP4_HEADER),
            Step::Write(b"garbage bytes here"),
            Step::Unavailable,
        ]);
        let sleeper = RecordingSleeper::default();

        let summary = process_table(&input, &plan, &detail, &downloader, &sleeper)?;
        assert_eq!(
            summary,
            FetchSummary {
                rows: 3,
                public: 1,
                valid: 1,
                invalid: 1,
                no_verdict: 1,
                skipped: 0,
            }
        );

        let rows = read_output(&plan.output_csv);
        assert_eq!(
            rows[0],
            vec!["id", "username", "video_description", "tiktokurl", "isPublic", "mp4_isValid"]
        );
        assert_eq!(rows[1][2], "first, with comma");
        assert_eq!(&rows[1][4..], &["True".to_string(), "True".to_string()]);
        assert_eq!(&rows[2][4..], &["False".to_string(), "False".to_string()]);
        assert_eq!(&rows[3][4..], &["False".to_string(), String::new()]);

        // The row without a URL gets one built from id and username.
        let calls = downloader.calls.borrow();
        assert!(calls[2].0.starts_with("https://www.tiktok.com/@gamma/video/3?"));
        assert!(dir.path().join("videos/@alpha_video_1.mp4").exists());
        Ok(())
    }

    #[test]
    fn public_only_policy_skips_hidden_rows() -> Result<()> {
        let dir = tempdir()?;
        let input = write_input(dir.path());
        let mut plan = FetchPlan::new(dir.path().join("videos"), dir.path().join("out.csv"));
        plan.download_policy = DownloadPolicy::PublicOnly;
        let detail = MapDetail {
            private_by_id: HashMap::from([("1", false), ("2", true)]),
        };
        let downloader = ScriptedDownloader::new(Vec::new());
        let sleeper = RecordingSleeper::default();

        let summary = process_table(&input, &plan, &detail, &downloader, &sleeper)?;
        assert_eq!(downloader.calls.borrow().len(), 1);
        assert_eq!(summary.valid, 1);
        assert_eq!(summary.no_verdict, 2);
        Ok(())
    }

    #[test]
    fn rerun_replaces_existing_verdict_columns() -> Result<()> {
        let dir = tempdir()?;
        let input = dir.path().join("chunks_01_02").join("p.csv");
        fs::create_dir_all(input.parent().unwrap())?;
        fs::write(&input, "id,username,isPublic,mp4_isValid\n1,alpha,False,\n")?;
        let plan = FetchPlan::new(dir.path().join("videos"), dir.path().join("out.csv"));
        let detail = MapDetail {
            private_by_id: HashMap::from([("1", false)]),
        };
        let downloader = ScriptedDownloader::new(vec![Step::Write(MP4_HEADER)]);

        process_table(&input, &plan, &detail, &downloader, &RecordingSleeper::default())?;
        let rows = read_output(&plan.output_csv);
        assert_eq!(rows[0], vec!["id", "username", "isPublic", "mp4_isValid"]);
        assert_eq!(rows[1], vec!["1", "alpha", "True", "True"]);
        Ok(())
    }

    #[test]
    fn ragged_rows_do_not_abort_the_chunk() -> Result<()> {
        let dir = tempdir()?;
        let input = dir.path().join("chunks_01_02").join("p.csv");
        fs::create_dir_all(input.parent().unwrap())?;
        fs::write(
            &input,
            "id,username,note\n1,alpha,ok\n2,beta,extra,field\n3,gamma,ok\n4,delta\n",
        )?;
        let plan = FetchPlan::new(dir.path().join("videos"), dir.path().join("out.csv"));
        let detail = MapDetail {
            private_by_id: HashMap::from([("1", false), ("2", false), ("3", false), ("4", false)]),
        };
        let downloader = ScriptedDownloader::new(Vec::new());

        let summary =
            process_table(&input, &plan, &detail, &downloader, &RecordingSleeper::default())?;
        assert_eq!(summary.rows, 4);
        assert_eq!(summary.valid, 4);
        assert_eq!(summary.skipped, 0);

        let rows = read_output(&plan.output_csv);
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[2], vec!["2", "beta", "extra", "True", "True"]);
        assert_eq!(rows[3], vec!["3", "gamma", "ok", "True", "True"]);
        assert_eq!(rows[4], vec!["4", "delta", "", "True", "True"]);
        Ok(())
    }

    #[test]
    fn unreadable_row_is_skipped_and_the_rest_written() -> Result<()> {
        let dir = tempdir()?;
        let input = dir.path().join("chunks_01_02").join("p.csv");
        fs::create_dir_all(input.parent().unwrap())?;
        let mut content = b"id,username\n1,alpha\n2,".to_vec();
        content.extend_from_slice(&[0xff, 0xfe]);
        content.extend_from_slice(b"\n3,gamma\n");
        fs::write(&input, content)?;
        let plan = FetchPlan::new(dir.path().join("videos"), dir.path().join("out.csv"));
        let detail = MapDetail {
            private_by_id: HashMap::from([("1", false), ("3", false)]),
        };
        let downloader = ScriptedDownloader::new(Vec::new());

        let summary =
            process_table(&input, &plan, &detail, &downloader, &RecordingSleeper::default())?;
        assert_eq!(summary.rows, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(downloader.calls.borrow().len(), 2);

        let rows = read_output(&plan.output_csv);
        let ids: Vec<&str> = rows[1..].iter().map(|row| row[0].as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
        Ok(())
    }

    #[test]
    fn missing_id_column_is_an_error() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("bad.csv");
        fs::write(&input, "username\nalpha\n").unwrap();
        let plan = FetchPlan::new(dir.path().join("videos"), dir.path().join("out.csv"));
        let detail = MapDetail {
            private_by_id: HashMap::new(),
        };
        let downloader = ScriptedDownloader::new(Vec::new());
        let err = process_table(&input, &plan, &detail, &downloader, &RecordingSleeper::default())
            .unwrap_err();
        assert!(err.to_string().contains("id column"));
    }

    #[cfg(unix)]
    fn install_downloader_stub(dir: &Path) -> PathBuf {
        let script_path = dir.join("yt-dlp");
        let script = r#"#!/usr/bin/env bash
set -eu
output=""
url=""
while [[ $# -gt 0 ]]; do
  case "$1" in
    --output)
      shift
      output="$1"
      ;;
    --format)
      shift
      ;;
    --*)
      ;;
    *)
      url="$1"
      ;;
  esac
  shift
done

case "$url" in
  *video/404*)
    echo "ERROR: [TikTok] 404: Video not available" >&2
    exit 1
    ;;
esac

printf '\x00\x00\x00\x18ftypisom\x00\x00\x02\x00' > "$output"
"#;
        fs::write(&script_path, script).unwrap();
        let mut perms = fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms).unwrap();
        script_path
    }

    #[cfg(unix)]
    #[test]
    fn ytdlp_downloader_writes_target_file() {
        let dir = tempdir().unwrap();
        let stub = install_downloader_stub(dir.path());
        let downloader = YtDlpDownloader::new(stub.as_os_str());
        let target = dir.path().join("@a_video_1.mp4");

        downloader
            .download("https://www.tiktok.com/@a/video/1?is_copy_url=1", &target)
            .unwrap();
        assert!(is_mp4_file(&target));

        let err = downloader
            .download("https://www.tiktok.com/@a/video/404", &dir.path().join("x.mp4"))
            .unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::Unavailable);
    }

    #[cfg(unix)]
    #[test]
    fn ensure_available_detects_missing_program() {
        let dir = tempdir().unwrap();
        let missing = YtDlpDownloader::new(dir.path().join("does-not-exist").as_os_str());
        assert!(missing.ensure_available().is_err());
    }
}
