use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Keep-alive frame sent to the server while the socket is open.
pub const PING_FRAME: &str = "ping";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProtocolEvent {
    Connection,
    Progress(ProgressPayload),
    Completion(CompletionPayload),
    Error(ErrorPayload),
    Heartbeat,
    Unknown { raw: Value },
}

impl ProtocolEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Progress(_) => "progress",
            Self::Completion(_) => "completion",
            Self::Error(_) => "error",
            Self::Heartbeat => "heartbeat",
            Self::Unknown { .. } => "unknown",
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Heartbeat)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressCounters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressCounters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_items: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_items: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_services: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_services: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CompletionPayload {
    /// `summary` rendered as text, falling back to `message`.
    pub fn status_text(&self) -> Option<String> {
        self.summary
            .as_ref()
            .and_then(value_text)
            .or_else(|| self.message.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl ErrorPayload {
    pub fn description(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.error.as_ref().and_then(value_text))
            .unwrap_or_else(|| "server reported an error".to_string())
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[derive(Debug)]
pub enum ProtocolError {
    NotText,
    Json(serde_json::Error),
    NotObject,
    Payload {
        kind: &'static str,
        source: serde_json::Error,
    },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotText => write!(f, "frame is not utf-8 text"),
            Self::Json(err) => write!(f, "frame is not json: {err}"),
            Self::NotObject => write!(f, "frame is not a json object"),
            Self::Payload { kind, source } => write!(f, "invalid {kind} payload: {source}"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(err) | Self::Payload { source: err, .. } => Some(err),
            Self::NotText | Self::NotObject => None,
        }
    }
}

/// Unrecognised `type`s decode to [`ProtocolEvent::Unknown`]. Only frames that
/// are not JSON objects, or whose payload does not fit the type, are errors.
pub fn decode_frame(raw: &str) -> Result<ProtocolEvent, ProtocolError> {
    let value: Value = serde_json::from_str(raw).map_err(ProtocolError::Json)?;
    let kind = match &value {
        Value::Object(map) => map.get("type").and_then(Value::as_str).map(str::to_owned),
        _ => return Err(ProtocolError::NotObject),
    };

    let event = match kind.as_deref() {
        Some("connection") => ProtocolEvent::Connection,
        Some("progress") => ProtocolEvent::Progress(decode_payload("progress", &value)?),
        Some("completion") => ProtocolEvent::Completion(decode_payload("completion", &value)?),
        Some("error") => ProtocolEvent::Error(decode_payload("error", &value)?),
        Some("heartbeat") => ProtocolEvent::Heartbeat,
        _ => ProtocolEvent::Unknown { raw: value },
    };
    Ok(event)
}

pub fn decode_binary_frame(raw: &[u8]) -> Result<ProtocolEvent, ProtocolError> {
    let text = std::str::from_utf8(raw).map_err(|_| ProtocolError::NotText)?;
    decode_frame(text)
}

pub fn encode_event(event: &ProtocolEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

fn decode_payload<T: for<'de> Deserialize<'de>>(
    kind: &'static str,
    value: &Value,
) -> Result<T, ProtocolError> {
    T::deserialize(value).map_err(|source| ProtocolError::Payload { kind, source })
}
