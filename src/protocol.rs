// ABOUTME: JSON-RPC 2.0 message types exchanged with the Goxel daemon
// ABOUTME: Requests, notifications, responses, error objects and inbound message classification

//! JSON-RPC 2.0 wire types.
//!
//! The daemon speaks newline-delimited JSON-RPC 2.0. The correlator works on the parsed
//! values defined here; framing lives in the transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Protocol version string carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// Implementation-defined server error range (inclusive).
pub const SERVER_ERROR_START: i32 = -32099;
pub const SERVER_ERROR_END: i32 = -32000;

/// Application errors raised by daemon method handlers start here and grow downwards.
pub const APPLICATION_ERROR_BASE: i32 = -1000;

/// Errors produced while interpreting inbound messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The payload was not valid JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Valid JSON that is neither a response nor a notification
    #[error("Invalid JSON-RPC message: {0}")]
    InvalidMessage(String),
}

/// Correlation identifier.
///
/// The correlator only ever issues numeric ids, but the daemon may echo strings back
/// for malformed requests, so both are accepted on the way in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl RequestId {
    /// Numeric value, if this id is one the correlator could have issued.
    pub fn as_number(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(s) => s.parse().ok(),
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "\"{s}\""),
        }
    }
}

/// Outgoing call that expects a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub id: RequestId,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: RequestId::Number(id),
        }
    }
}

/// Fire-and-forget message without an id. Flows in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Structured error carried by an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// One of the five codes defined by JSON-RPC 2.0 itself.
    pub const fn is_standard(&self) -> bool {
        matches!(
            self.code,
            PARSE_ERROR | INVALID_REQUEST | METHOD_NOT_FOUND | INVALID_PARAMS | INTERNAL_ERROR
        )
    }

    /// Raised by a daemon method handler rather than by the protocol layer.
    ///
    /// Everything from -32000 downwards is reserved by JSON-RPC.
    pub const fn is_application(&self) -> bool {
        self.code <= APPLICATION_ERROR_BASE && self.code > SERVER_ERROR_END
    }

    /// Inside the implementation-defined server error range.
    pub const fn is_server_error(&self) -> bool {
        self.code >= SERVER_ERROR_START && self.code <= SERVER_ERROR_END
    }
}

/// Success or error response to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    pub fn success(id: RequestId, result: impl Into<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result.into()),
            error: None,
        }
    }

    pub fn error(id: Option<RequestId>, error: ErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Collapse into the caller-facing outcome.
    ///
    /// A `"result": null` success deserialises with `result == None`, so a missing
    /// result without an error is a null result, not a failure.
    pub fn into_outcome(self) -> Result<Value, ErrorObject> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Anything the client writes to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutgoingMessage {
    Request(Request),
    Notification(Notification),
}

impl OutgoingMessage {
    pub fn method(&self) -> &str {
        match self {
            Self::Request(r) => &r.method,
            Self::Notification(n) => &n.method,
        }
    }

    /// Serialise as one newline-terminated frame.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }
}

/// Anything the daemon can send back.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    Response(Response),
    Notification(Notification),
}

impl IncomingMessage {
    /// Classify a parsed JSON document.
    ///
    /// Responses carry `result` or `error`; notifications carry `method` and no `id`.
    /// Server-to-client requests are not part of this protocol and are rejected.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Some(obj) = value.as_object() else {
            return Err(ProtocolError::InvalidMessage(
                "expected a JSON object".to_string(),
            ));
        };

        if obj.contains_key("result") || obj.contains_key("error") {
            return Ok(Self::Response(serde_json::from_value(value)?));
        }

        if obj.contains_key("method") {
            if obj.get("id").is_some_and(|id| !id.is_null()) {
                return Err(ProtocolError::InvalidMessage(
                    "server-initiated requests are not supported".to_string(),
                ));
            }
            return Ok(Self::Notification(serde_json::from_value(value)?));
        }

        Err(ProtocolError::InvalidMessage(
            "message has neither result, error nor method".to_string(),
        ))
    }

    /// Parse one frame of text.
    pub fn from_json_str(line: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(line.trim())?;
        Self::from_value(value)
    }
}
