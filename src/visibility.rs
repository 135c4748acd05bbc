#![forbid(unsafe_code)]

//! Public-visibility probe: fetch the item's web page, pull out the embedded
//! rehydration JSON and read its `privateItem` flag.

use std::io;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::record::share_url;
use crate::retry::{Classify, FailureKind, RetryPolicy, RetryState, Sleeper};

const REHYDRATION_MARKER: &str = "id=\"__UNIVERSAL_DATA_FOR_REHYDRATION__\"";
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Key path from the payload root to the item's privacy flag.
pub const PRIVATE_FLAG_POINTER: &str =
    "/__DEFAULT_SCOPE__/webapp.video-detail/itemInfo/itemStruct/privateItem";

#[derive(Debug, Error)]
pub enum DetailError {
    #[error("request timed out: {0}")]
    Timeout(String),
    /// The page loaded but carries no item: removed, banned or region-locked.
    #[error("item unavailable: {0}")]
    Unavailable(String),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("{0}")]
    Other(String),
}

impl Classify for DetailError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            DetailError::Timeout(_) => FailureKind::Timeout,
            DetailError::Unavailable(_) => FailureKind::Unavailable,
            DetailError::Status(404 | 410) => FailureKind::Unavailable,
            DetailError::Status(_) | DetailError::Other(_) => FailureKind::Unexpected,
            DetailError::Connection(_) => FailureKind::Connection,
        }
    }
}

/// Source of the detail payload for an item URL.
pub trait DetailSource {
    fn fetch_detail(&self, url: &str) -> Result<Value, DetailError>;
}

/// Fetches the public web page and extracts the embedded JSON document.
pub struct WebDetailSource {
    agent: ureq::Agent,
}

impl WebDetailSource {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .user_agent(BROWSER_USER_AGENT)
            .build();
        Self { agent }
    }
}

impl DetailSource for WebDetailSource {
    fn fetch_detail(&self, url: &str) -> Result<Value, DetailError> {
        let response = self.agent.get(url).call().map_err(|err| match err {
            ureq::Error::Status(status, _) => DetailError::Status(status),
            ureq::Error::Transport(transport) => {
                let message = transport.to_string();
                if is_timeout_message(&message) {
                    DetailError::Timeout(message)
                } else {
                    DetailError::Connection(message)
                }
            }
        })?;
        let html = response.into_string().map_err(|err| match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                DetailError::Timeout(err.to_string())
            }
            _ => DetailError::Connection(err.to_string()),
        })?;
        extract_rehydration_json(&html)
    }
}

pub(crate) fn is_timeout_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("timed out") || lower.contains("timeout")
}

/// Pulls the JSON body out of the rehydration `<script>` tag.
pub fn extract_rehydration_json(html: &str) -> Result<Value, DetailError> {
    let marker = html
        .find(REHYDRATION_MARKER)
        .ok_or_else(|| DetailError::Other("rehydration script not found in page".into()))?;
    let after_marker = &html[marker..];
    let open_end = after_marker
        .find('>')
        .ok_or_else(|| DetailError::Other("unterminated rehydration script tag".into()))?;
    let body = &after_marker[open_end + 1..];
    let close = body
        .find("</script>")
        .ok_or_else(|| DetailError::Other("unterminated rehydration script".into()))?;
    serde_json::from_str(&body[..close])
        .map_err(|err| DetailError::Other(format!("invalid rehydration JSON: {err}")))
}

/// Reads the privacy flag. Any missing or non-boolean step along the key path
/// means the item is gone.
pub fn private_flag(payload: &Value) -> Result<bool, DetailError> {
    payload
        .pointer(PRIVATE_FLAG_POINTER)
        .and_then(Value::as_bool)
        .ok_or_else(|| {
            let missing = ["__DEFAULT_SCOPE__", "webapp.video-detail", "itemInfo", "itemStruct"]
                .iter()
                .scan(String::new(), |path, key| {
                    path.push('/');
                    path.push_str(key);
                    Some((key, path.clone()))
                })
                .find(|(_, path)| payload.pointer(path).is_none())
                .map(|(key, _)| *key)
                .unwrap_or("privateItem");
            DetailError::Unavailable(format!("detail payload has no {missing}"))
        })
}

/// Whether the item at `url` is still public.
///
/// Fails closed: removed items, exhausted retries and unexpected payloads all
/// report `false`.
pub fn check_visibility(
    url: &str,
    source: &dyn DetailSource,
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
) -> bool {
    let target = share_url(url);
    let mut state = RetryState::new();
    let outcome = policy.run(&mut state, sleeper, |attempt| {
        debug!(url = %target, attempt, "fetching detail page");
        let payload = source.fetch_detail(&target)?;
        private_flag(&payload)
    });

    match outcome {
        Ok(is_private) => !is_private,
        Err(err) => {
            info!(%url, "treating item as not public: {err}");
            false
        }
    }
}
