#![forbid(unsafe_code)]

//! Wire types and HTTP client for the research video-query endpoint.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::VideoRecord;
use crate::retry::{Classify, FailureKind};

pub const DEFAULT_QUERY_URL: &str = "https://open.tiktokapis.com/v2/research/video/query/";
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Fields requested from the endpoint, in the order the API documents them.
pub const QUERY_FIELDS: &[&str] = &[
    "id",
    "like_count",
    "create_time",
    "region_code",
    "share_count",
    "view_count",
    "comment_count",
    "music_id",
    "hashtag_names",
    "username",
    "effect_ids",
    "playlist_id",
    "video_description",
    "voice_to_text",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Condition {
    pub operation: String,
    pub field_name: String,
    pub field_values: Vec<String>,
}

impl Condition {
    pub fn is_in(field_name: &str, values: &[String]) -> Self {
        Self {
            operation: "IN".to_string(),
            field_name: field_name.to_string(),
            field_values: values.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Query {
    pub and: Vec<Condition>,
    pub or: Vec<Condition>,
}

/// Region AND (keyword OR hashtag).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchFilter {
    pub region_code: String,
    pub keywords: Vec<String>,
    pub hashtags: Vec<String>,
}

impl SearchFilter {
    pub fn to_query(&self) -> Query {
        Query {
            and: vec![Condition::is_in(
                "region_code",
                std::slice::from_ref(&self.region_code),
            )],
            or: vec![
                Condition::is_in("keyword", &self.keywords),
                Condition::is_in("hashtag_name", &self.hashtags),
            ],
        }
    }
}

/// Opaque paging token. The endpoint currently sends a number; anything else
/// is passed back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CursorToken {
    Number(u64),
    Text(String),
}

impl From<u64> for CursorToken {
    fn from(value: u64) -> Self {
        CursorToken::Number(value)
    }
}

/// Continuation token pair handed back by the API while `has_more` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    pub cursor: CursorToken,
    pub search_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryRequest {
    pub query: Query,
    pub start_date: String,
    pub end_date: String,
    pub max_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorToken>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_id: Option<String>,
}

impl QueryRequest {
    pub fn new(filter: &SearchFilter, start_date: &str, end_date: &str, max_count: u32) -> Self {
        Self {
            query: filter.to_query(),
            start_date: start_date.to_string(),
            end_date: end_date.to_string(),
            max_count,
            cursor: None,
            search_id: None,
        }
    }

    pub fn resume_from(&mut self, cursor: &PageCursor) {
        self.cursor = Some(cursor.cursor.clone());
        self.search_id = Some(cursor.search_id.clone());
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageData {
    #[serde(default)]
    pub videos: Vec<VideoRecord>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub cursor: Option<CursorToken>,
    #[serde(default)]
    pub search_id: Option<String>,
}

impl PageData {
    /// Continuation for the next request. A page that claims `has_more` but
    /// omits the tokens is treated as final.
    pub fn next_cursor(&self) -> Option<PageCursor> {
        if !self.has_more {
            return None;
        }
        Some(PageCursor {
            cursor: self.cursor.clone()?,
            search_id: self.search_id.clone()?,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub data: PageData,
    #[serde(default)]
    pub error: Option<ApiErrorBody>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    /// Transport failures, timeouts included: refused, reset or truncated.
    #[error("connection error: {0}")]
    Connection(String),
    #[error("could not decode response: {0}")]
    Decode(String),
    #[error("API rejected the query ({code}): {message}")]
    Rejected { code: String, message: String },
}

impl Classify for ApiError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            ApiError::Status { status, .. } => classify_status(*status),
            ApiError::Connection(_) => FailureKind::Connection,
            ApiError::Decode(_) | ApiError::Rejected { .. } => FailureKind::Unexpected,
        }
    }
}

pub fn classify_status(status: u16) -> FailureKind {
    match status {
        401 | 429 => FailureKind::RateLimited,
        500 | 503 => FailureKind::ServerUnavailable,
        504 => FailureKind::GatewayTimeout,
        _ => FailureKind::Unexpected,
    }
}

/// One page of the search endpoint. Implemented over HTTP by
/// [`HttpSearchApi`] and by scripted fakes in tests.
pub trait SearchApi {
    fn query_page(&self, request: &QueryRequest) -> Result<PageData, ApiError>;
}

pub struct HttpSearchApi {
    agent: ureq::Agent,
    url: String,
    token: String,
}

impl HttpSearchApi {
    pub fn new(url: &str, token: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .build();
        Self {
            agent,
            url: url.to_string(),
            token: token.to_string(),
        }
    }
}

impl SearchApi for HttpSearchApi {
    fn query_page(&self, request: &QueryRequest) -> Result<PageData, ApiError> {
        let response = self
            .agent
            .post(&self.url)
            .query("fields", &QUERY_FIELDS.join(","))
            .set("authorization", &format!("Bearer {}", self.token))
            .send_json(request)
            .map_err(from_ureq)?;

        // `into_json` reports a truncated body as invalid data.
        let text = response
            .into_string()
            .map_err(|err| ApiError::Connection(format!("reading response body: {err}")))?;
        let body: QueryResponse =
            serde_json::from_str(&text).map_err(|err| ApiError::Decode(err.to_string()))?;
        if let Some(error) = &body.error
            && !error.code.is_empty()
            && error.code != "ok"
        {
            return Err(ApiError::Rejected {
                code: error.code.clone(),
                message: error.message.clone(),
            });
        }
        Ok(body.data)
    }
}

fn from_ureq(error: ureq::Error) -> ApiError {
    match error {
        ureq::Error::Status(status, response) => ApiError::Status {
            status,
            body: response.into_string().unwrap_or_default(),
        },
        ureq::Error::Transport(transport) => ApiError::Connection(transport.to_string()),
    }
}
