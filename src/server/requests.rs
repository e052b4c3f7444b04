//! JSON-lines request and reply types.
//!
//! Each input line is one request:
//!
//! ```json
//! {"id": 7, "method": "display", "params": {"arguments": ["--display", "Main.hx@120@type"]}}
//! ```
//!
//! Replies carry the same `id` and either a `result` or an `error`. Session
//! events are pushed as `{"method": "session", "params": {...}}`.

use crate::dispatch::DisplayRequest;
use crate::error::DisplayError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw request line before the method is known.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DisplayParams {
    #[serde(alias = "args")]
    pub arguments: Vec<String>,
    #[serde(default, alias = "contents")]
    pub stdin: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

impl From<DisplayParams> for DisplayRequest {
    fn from(p: DisplayParams) -> Self {
        let mut request = DisplayRequest::new(p.arguments);
        if let Some(label) = p.label {
            request = request.with_label(label);
        }
        if let Some(stdin) = p.stdin {
            request = request.with_stdin(stdin);
        }
        request
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CancelParams {
    /// Id of the `display` request to cancel.
    #[serde(alias = "request_id")]
    pub id: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RestartParams {
    #[serde(default)]
    pub reason: Option<String>,
}

/// A request with typed parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerRequest {
    Display(DisplayParams),
    Cancel(CancelParams),
    Start,
    Stop,
    Restart(RestartParams),
    Status,
}

impl ServerRequest {
    /// Decode the parameters of `method`. Missing params count as `{}`.
    pub fn parse(method: &str, params: Value) -> Result<Self, String> {
        let params = if params.is_null() {
            Value::Object(Default::default())
        } else {
            params
        };
        let bad = |e: serde_json::Error| format!("invalid params for {method}: {e}");
        match method {
            "display" => Ok(ServerRequest::Display(
                serde_json::from_value(params).map_err(bad)?,
            )),
            "cancel" => Ok(ServerRequest::Cancel(
                serde_json::from_value(params).map_err(bad)?,
            )),
            "start" => Ok(ServerRequest::Start),
            "stop" => Ok(ServerRequest::Stop),
            "restart" => Ok(ServerRequest::Restart(
                serde_json::from_value(params).map_err(bad)?,
            )),
            "status" => Ok(ServerRequest::Status),
            other => Err(format!("unknown method: {other}")),
        }
    }
}

/// Error object of a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WireError {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

impl WireError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            kind: "invalid_request".to_string(),
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<&DisplayError> for WireError {
    fn from(e: &DisplayError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Reply {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, error: WireError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Unsolicited message, currently only session events.
#[derive(Debug, Clone, Serialize)]
pub struct Notification<T: Serialize> {
    pub method: &'static str,
    pub params: T,
}
