#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::collector::API_DATE_FORMAT;
use crate::fetcher::{DEFAULT_DOWNLOADER_PROGRAM, DownloadPolicy};
use crate::record::DEFAULT_VIDEO_HOST;
use crate::research_api::{DEFAULT_PAGE_SIZE, DEFAULT_QUERY_URL};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_REGION_CODE: &str = "EC";
pub const DEFAULT_TERMS_FILE: &str = "supplementary/keywords_hashtags.txt";
pub const DEFAULT_TABLE_PREFIX: &str = "ecuador";
pub const DEFAULT_SERVER_RETRY_CAP: u32 = 30;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Settings for `collect_metadata`.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub api_token: String,
    pub api_url: String,
    pub region_code: String,
    pub terms_file: PathBuf,
    pub data_root: PathBuf,
    pub table_prefix: String,
    pub start_date: NaiveDate,
    /// Exclusive.
    pub end_date: NaiveDate,
    pub page_size: u32,
    /// `None` retries 5xx responses without bound.
    pub server_retry_cap: Option<u32>,
    pub video_host: String,
    pub log_root: Option<PathBuf>,
    pub http_timeout: Duration,
}

impl CollectorSettings {
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_root.join("json")
    }

    pub fn daily_dir(&self) -> PathBuf {
        self.data_root.join("daily")
    }

    pub fn combined_table(&self) -> PathBuf {
        self.data_root.join(format!("{}.csv", self.table_prefix))
    }
}

#[derive(Debug, Clone, Default)]
pub struct CollectorOverrides {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub env_path: Option<PathBuf>,
}

/// Settings for `collect_videos`.
#[derive(Debug, Clone)]
pub struct FetcherSettings {
    pub metadata_root: PathBuf,
    pub video_root: PathBuf,
    pub augmented_root: PathBuf,
    pub log_root: PathBuf,
    pub downloader_program: String,
    pub download_policy: DownloadPolicy,
    pub video_host: String,
    pub http_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct FetcherOverrides {
    pub env_path: Option<PathBuf>,
}

pub fn resolve_collector_settings(overrides: CollectorOverrides) -> Result<CollectorSettings> {
    let file_vars = read_env_file(env_path(overrides.env_path.as_deref()))?;
    build_collector_settings(&file_vars, env_var_string, overrides)
}

pub fn resolve_fetcher_settings(overrides: FetcherOverrides) -> Result<FetcherSettings> {
    let file_vars = read_env_file(env_path(overrides.env_path.as_deref()))?;
    build_fetcher_settings(&file_vars, env_var_string)
}

fn env_path(path: Option<&Path>) -> &Path {
    path.unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH))
}

fn build_collector_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: CollectorOverrides,
) -> Result<CollectorSettings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let required = |key: &str| lookup(key).ok_or_else(|| anyhow!("{key} not set"));

    let api_token = required("RESEARCH_API_TOKEN")?;
    let data_root = required("DATA_ROOT")?;
    let start_date = overrides
        .start_date
        .and_then(non_blank)
        .or_else(|| lookup("COLLECTOR_START_DATE"))
        .ok_or_else(|| anyhow!("COLLECTOR_START_DATE not set"))?;
    let end_date = overrides
        .end_date
        .and_then(non_blank)
        .or_else(|| lookup("COLLECTOR_END_DATE"))
        .ok_or_else(|| anyhow!("COLLECTOR_END_DATE not set"))?;
    let start_date = parse_api_date(&start_date).context("Invalid start date")?;
    let end_date = parse_api_date(&end_date).context("Invalid end date")?;
    if end_date <= start_date {
        return Err(anyhow!(
            "end date {} must be after start date {}",
            end_date.format(API_DATE_FORMAT),
            start_date.format(API_DATE_FORMAT)
        ));
    }

    let page_size = lookup("PAGE_SIZE")
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|size| *size > 0)
        .unwrap_or(DEFAULT_PAGE_SIZE);
    let server_retry_cap = lookup("SERVER_RETRY_CAP")
        .map(|value| parse_retry_cap(&value))
        .unwrap_or(Some(DEFAULT_SERVER_RETRY_CAP));

    Ok(CollectorSettings {
        api_token,
        api_url: lookup("RESEARCH_API_URL").unwrap_or_else(|| DEFAULT_QUERY_URL.to_string()),
        region_code: lookup("REGION_CODE").unwrap_or_else(|| DEFAULT_REGION_CODE.to_string()),
        terms_file: PathBuf::from(
            lookup("TERMS_FILE").unwrap_or_else(|| DEFAULT_TERMS_FILE.to_string()),
        ),
        data_root: PathBuf::from(data_root),
        table_prefix: lookup("TABLE_PREFIX").unwrap_or_else(|| DEFAULT_TABLE_PREFIX.to_string()),
        start_date,
        end_date,
        page_size,
        server_retry_cap,
        video_host: lookup("VIDEO_HOST").unwrap_or_else(|| DEFAULT_VIDEO_HOST.to_string()),
        log_root: lookup("LOG_ROOT").map(PathBuf::from),
        http_timeout: http_timeout(&lookup),
    })
}

fn build_fetcher_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<FetcherSettings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let required_path = |key: &str| {
        lookup(key)
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("{key} not set"))
    };

    let download_policy = match lookup("DOWNLOAD_POLICY") {
        Some(value) => value.parse::<DownloadPolicy>().context("Invalid DOWNLOAD_POLICY")?,
        None => DownloadPolicy::default(),
    };

    Ok(FetcherSettings {
        metadata_root: required_path("METADATA_ROOT")?,
        video_root: required_path("VIDEO_ROOT")?,
        augmented_root: required_path("AUGMENTED_ROOT")?,
        log_root: required_path("LOG_ROOT")?,
        downloader_program: lookup("DOWNLOADER_PROGRAM")
            .unwrap_or_else(|| DEFAULT_DOWNLOADER_PROGRAM.to_string()),
        download_policy,
        video_host: lookup("VIDEO_HOST").unwrap_or_else(|| DEFAULT_VIDEO_HOST.to_string()),
        http_timeout: http_timeout(&lookup),
    })
}

fn http_timeout(lookup: &impl Fn(&str) -> Option<String>) -> Duration {
    let secs = lookup("HTTP_TIMEOUT_SECS")
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// `0` and `none` lift the cap; unparsable values keep the default.
fn parse_retry_cap(value: &str) -> Option<u32> {
    if value.eq_ignore_ascii_case("none") {
        return None;
    }
    match value.parse::<u32>() {
        Ok(0) => None,
        Ok(cap) => Some(cap),
        Err(_) => Some(DEFAULT_SERVER_RETRY_CAP),
    }
}

pub fn parse_api_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), API_DATE_FORMAT)
        .with_context(|| format!("{value:?} is not a YYYYMMDD date"))
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned().and_then(non_blank))
}

/// Loads `KEY=value` pairs from a dotenv-style file. A missing file is empty.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    Ok(content
        .lines()
        .filter_map(parse_env_line)
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect())
}

/// One assignment, with an optional `export ` prefix. Comments, blank lines
/// and lines without `=` yield nothing.
fn parse_env_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, raw) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, unquote(raw.trim())))
}

/// Strips one matching pair of single or double quotes.
fn unquote(value: &str) -> &str {
    ['"', '\'']
        .iter()
        .find_map(|quote| {
            value
                .strip_prefix(*quote)
                .and_then(|inner| inner.strip_suffix(*quote))
        })
        .unwrap_or(value)
}
