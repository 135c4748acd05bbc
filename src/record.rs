#![forbid(unsafe_code)]

//! Records returned by the research API and the flattened table rows written
//! to CSV.

use std::fmt;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_VIDEO_HOST: &str = "www.tiktok.com";

/// Video identifier as sent by the API. The research endpoint emits numeric
/// ids, older exports carry strings; both are kept verbatim on the wire and
/// compared through their decimal text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VideoId {
    Number(u64),
    Text(String),
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoId::Number(value) => write!(f, "{value}"),
            VideoId::Text(value) => f.write_str(value),
        }
    }
}

/// One item from `data.videos`. Fields we do not model explicitly are kept in
/// `extras` so the raw snapshot round-trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRecord {
    pub id: VideoId,
    #[serde(default)]
    pub username: String,
    pub create_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub like_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub music_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashtag_names: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect_ids: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlist_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_to_text: Option<String>,
    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

impl VideoRecord {
    pub fn key(&self) -> String {
        self.id.to_string()
    }

    pub fn url(&self, host: &str) -> String {
        video_url(host, &self.username, &self.key())
    }
}

pub fn video_url(host: &str, author: &str, video_id: &str) -> String {
    format!("https://{host}/@{author}/video/{video_id}")
}

/// Query string the web app appends to shared links; the detail page and the
/// downloader both expect it.
pub const SHARE_QUERY: &str = "is_copy_url=1&is_from_webapp=v1";

pub fn share_url(url: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}{SHARE_QUERY}")
}

/// UTC calendar breakdown of an epoch timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtcParts {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    pub date_string: String,
    pub time_string: String,
}

/// Splits epoch seconds into UTC calendar fields. Out-of-range timestamps
/// yield `None`.
pub fn decompose_epoch(epoch_secs: i64) -> Option<UtcParts> {
    let stamp: DateTime<Utc> = DateTime::from_timestamp(epoch_secs, 0)?;
    Some(UtcParts {
        year: stamp.year(),
        month: stamp.month(),
        day: stamp.day(),
        hour: stamp.hour(),
        minute: stamp.minute(),
        second: stamp.second(),
        date_string: stamp.format("%Y-%m-%d").to_string(),
        time_string: stamp.format("%H:%M:%S").to_string(),
    })
}

/// Flattened CSV row: API fields, the constructed URL and the UTC breakdown.
/// List-valued fields are stored as JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRow {
    pub id: String,
    pub username: String,
    pub create_time: i64,
    #[serde(default)]
    pub region_code: String,
    #[serde(default)]
    pub view_count: Option<u64>,
    #[serde(default)]
    pub like_count: Option<u64>,
    #[serde(default)]
    pub share_count: Option<u64>,
    #[serde(default)]
    pub comment_count: Option<u64>,
    #[serde(default)]
    pub music_id: String,
    #[serde(default)]
    pub hashtag_names: String,
    #[serde(default)]
    pub effect_ids: String,
    #[serde(default)]
    pub playlist_id: String,
    #[serde(default)]
    pub video_description: String,
    #[serde(default)]
    pub voice_to_text: String,
    pub tiktokurl: String,
    pub utc_year: i32,
    pub utc_month: u32,
    pub utc_day: u32,
    pub utc_hour: u32,
    pub utc_minute: u32,
    pub utc_second: u32,
    pub utc_date_string: String,
    pub utc_time_string: String,
}

impl TableRow {
    /// Builds the row for `record`, or `None` when its timestamp cannot be
    /// represented.
    pub fn from_record(record: &VideoRecord, host: &str) -> Option<Self> {
        let utc = decompose_epoch(record.create_time)?;
        Some(Self {
            id: record.key(),
            username: record.username.clone(),
            create_time: record.create_time,
            region_code: record.region_code.clone().unwrap_or_default(),
            view_count: record.view_count,
            like_count: record.like_count,
            share_count: record.share_count,
            comment_count: record.comment_count,
            music_id: cell_text(record.music_id.as_ref()),
            hashtag_names: record
                .hashtag_names
                .as_ref()
                .map(|names| serde_json::to_string(names).unwrap_or_default())
                .unwrap_or_default(),
            effect_ids: cell_text(record.effect_ids.as_ref()),
            playlist_id: cell_text(record.playlist_id.as_ref()),
            video_description: record.video_description.clone().unwrap_or_default(),
            voice_to_text: record.voice_to_text.clone().unwrap_or_default(),
            tiktokurl: record.url(host),
            utc_year: utc.year,
            utc_month: utc.month,
            utc_day: utc.day,
            utc_hour: utc.hour,
            utc_minute: utc.minute,
            utc_second: utc.second,
            utc_date_string: utc.date_string,
            utc_time_string: utc.time_string,
        })
    }
}

/// Strings are written bare, everything else as compact JSON.
fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}
