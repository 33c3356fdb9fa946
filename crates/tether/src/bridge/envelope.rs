//! Envelope types exchanged between parent and child.
//!
//! Three shapes travel over a link:
//! - **Message**: `channel` + `payload`, no request id
//! - **Request**: carries a fresh `request_id`, `is_reply` unset
//! - **Reply**: echoes the request's `request_id` with `is_reply` set

use serde::{Deserialize, Serialize};

/// Correlation id for a request/reply exchange.
///
/// UUID v4 so ids never collide across restarts or sibling processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identity of a child process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChildId(String);

impl ChildId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChildId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ChildId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u32> for ChildId {
    fn from(id: u32) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for ChildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unit of data exchanged over a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_reply: bool,
}

/// How the router should treat an inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Message,
    Request(RequestId),
    Reply(RequestId),
    /// Reply flag without a request id; cannot be correlated.
    Malformed,
}

impl Envelope {
    pub fn message(channel: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            channel: channel.into(),
            payload,
            request_id: None,
            is_reply: false,
        }
    }

    pub fn request(
        channel: impl Into<String>,
        payload: serde_json::Value,
        request_id: RequestId,
    ) -> Self {
        Self {
            channel: channel.into(),
            payload,
            request_id: Some(request_id),
            is_reply: false,
        }
    }

    pub fn reply(
        channel: impl Into<String>,
        payload: serde_json::Value,
        request_id: RequestId,
    ) -> Self {
        Self {
            channel: channel.into(),
            payload,
            request_id: Some(request_id),
            is_reply: true,
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        match (self.request_id, self.is_reply) {
            (Some(id), true) => EnvelopeKind::Reply(id),
            (Some(id), false) => EnvelopeKind::Request(id),
            (None, false) => EnvelopeKind::Message,
            (None, true) => EnvelopeKind::Malformed,
        }
    }
}
