//! Wire protocol: one newline-terminated JSON request per connection, one JSON reply
//! terminated by the server closing the connection.

use crate::hints::remediation_hint;
use serde::{Deserialize, Serialize};

pub const STATUS_COMMAND: &str = "__STATUS__";
pub const STOP_COMMAND: &str = "__STOP__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRequest {
    pub query: String,
}

impl WireRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
        }
    }

    pub fn command(&self) -> Command {
        match self.query.as_str() {
            STATUS_COMMAND => Command::Status,
            STOP_COMMAND => Command::Stop,
            q => Command::Search(q.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Stop,
    Search(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("request is not valid UTF-8")]
    NotUtf8,
    #[error("request is empty")]
    Empty,
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("request exceeds {0} bytes")]
    TooLarge(usize),
    #[error("no request received within {0}ms")]
    ReadTimeout(u64),
}

pub fn parse_request(line: &[u8]) -> Result<Command, ProtocolError> {
    let text = std::str::from_utf8(line).map_err(|_| ProtocolError::NotUtf8)?;
    let text = text.trim();
    if text.is_empty() {
        return Err(ProtocolError::Empty);
    }
    let req: WireRequest =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    Ok(req.command())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchSuccess {
    pub markdown: String,
    pub from_cache: bool,
    pub time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFailure {
    pub error: String,
    pub time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserState {
    Connected,
    Initializing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: String,
    /// Seconds since the daemon started.
    pub uptime: u64,
    pub cache_size: usize,
    pub browser: BrowserState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headless: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consecutive_challenges: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopAck {
    pub stopped: bool,
}

/// Variants are told apart by their required fields (`markdown`, `error`, `status`,
/// `stopped`), so unknown extra fields never change how a reply decodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Search(SearchSuccess),
    Failure(SearchFailure),
    Status(StatusReport),
    Stopped(StopAck),
}

impl Reply {
    pub fn failure(error: impl Into<String>, code: &str, time_ms: u64) -> Self {
        Self::Failure(SearchFailure {
            error: error.into(),
            time_ms,
            code: Some(code.to_string()),
            hint: None,
            retry_after_ms: None,
        })
    }
}

impl From<ProtocolError> for Reply {
    fn from(e: ProtocolError) -> Self {
        Self::Failure(SearchFailure {
            error: e.to_string(),
            time_ms: 0,
            code: Some("protocol_error".to_string()),
            hint: remediation_hint("protocol_error").map(str::to_string),
            retry_after_ms: None,
        })
    }
}

pub fn encode<T: Serialize>(msg: &T) -> Vec<u8> {
    let mut out = serde_json::to_vec(msg).unwrap_or_else(|e| {
        serde_json::json!({"error": format!("failed to encode reply: {e}"), "timeMs": 0, "code": "internal_error"})
            .to_string()
            .into_bytes()
    });
    out.push(b'\n');
    out
}

pub fn decode_reply(bytes: &[u8]) -> Result<Reply, ProtocolError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::NotUtf8)?;
    let text = text.trim();
    if text.is_empty() {
        return Err(ProtocolError::Empty);
    }
    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
}
