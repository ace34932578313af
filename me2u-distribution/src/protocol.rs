//! Request/response vocabulary and the JSON wire frames.
//!
//! Wire format (one JSON object per WebSocket text message):
//! ```text
//! peer ──► gateway   {"type":"request","id":7,"channel":"annotations-<doc>","verb":"get","path":"/annotations.jsonld"}
//! peer ◄── gateway   {"type":"response","id":7,"code":"OK","data":[…]}
//! peer ◄── gateway   {"type":"publish","id":7,"data":[…]}        (sub routes only)
//! peer ──► gateway   {"type":"unsubscribe","id":7}
//! peer ◄── gateway   {"type":"unrouted","id":7,"reason":"…"}
//! ```
//!
//! Annotation bodies are arbitrary JSON, so frames are JSON as well.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Request verbs. `Sub` opens a subscription instead of a one-shot call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Get,
    Post,
    Put,
    Delete,
    Sub,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::Post => "post",
            Verb::Put => "put",
            Verb::Delete => "delete",
            Verb::Sub => "sub",
        }
    }

    /// Parse case-insensitively (`GET` and `get` both work).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "get" => Some(Verb::Get),
            "post" => Some(Verb::Post),
            "put" => Some(Verb::Put),
            "delete" => Some(Verb::Delete),
            "sub" => Some(Verb::Sub),
            _ => None,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application-level outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseCode {
    Ok,
    Created,
    Updated,
    Deleted,
    NotFound,
    /// Subscription acknowledged; data follows as publish frames
    PubInit,
    /// Store failure other than a missing document
    Error,
}

impl ResponseCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseCode::Ok => "OK",
            ResponseCode::Created => "CREATED",
            ResponseCode::Updated => "UPDATED",
            ResponseCode::Deleted => "DELETED",
            ResponseCode::NotFound => "NOT_FOUND",
            ResponseCode::PubInit => "PUB_INIT",
            ResponseCode::Error => "ERROR",
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request addressed to one channel's service.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub verb: Verb,
    pub path: String,
    pub body: Option<Value>,
}

impl Request {
    pub fn new(verb: Verb, path: impl Into<String>) -> Self {
        Self {
            verb,
            path: path.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Structured reply; peers always get one of these for application errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub code: ResponseCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    pub fn new(code: ResponseCode) -> Self {
        Self { code, data: None }
    }

    pub fn with_data(code: ResponseCode, data: Value) -> Self {
        Self {
            code,
            data: Some(data),
        }
    }

    pub fn ok(data: Value) -> Self {
        Self::with_data(ResponseCode::Ok, data)
    }

    pub fn not_found() -> Self {
        Self::new(ResponseCode::NotFound)
    }

    pub fn pub_init() -> Self {
        Self::new(ResponseCode::PubInit)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::with_data(ResponseCode::Error, Value::String(message.into()))
    }
}

/// Frames exchanged with the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Request {
        id: u64,
        channel: String,
        verb: Verb,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
    Response {
        id: u64,
        #[serde(flatten)]
        response: Response,
    },
    /// No service or route matched; answered by the transport itself
    Unrouted { id: u64, reason: String },
    /// Publish on the subscription opened by request `id`
    Publish { id: u64, data: Value },
    Unsubscribe { id: u64 },
}

impl Frame {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),
}
