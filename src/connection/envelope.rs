//! Wire envelope for the realtime gateway
//!
//! Every frame is a JSON object.
//!
//! - Outbound messages and unsolicited inbound events:
//!   `{action, sessionId?, data, requestId?}`
//! - Responses: `{success, action, data?, error?, requestId?}`
//!
//! `requestId` carries the correlation ID of a request and is echoed back
//! unchanged on its response.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const PING_ACTION: &str = "ping";
pub const PONG_ACTION: &str = "pong";

/// Outbound message or inbound event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Required on the wire; a frame without it is rejected
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Envelope {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            session_id: None,
            data: Map::new(),
            request_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Heartbeat probe carrying the local send time
    pub fn ping() -> Self {
        Self::new(PING_ACTION).with_field("timestamp", chrono::Utc::now().timestamp_millis())
    }
}

/// Reply to a correlated request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub success: bool,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ResponseEnvelope {
    /// `data` of a successful response, or the remote error
    pub fn into_result(self) -> Result<Map<String, Value>, super::ConnectionError> {
        if self.success {
            Ok(self.data.unwrap_or_default())
        } else {
            Err(super::ConnectionError::Remote {
                action: self.action,
                message: self
                    .error
                    .unwrap_or_else(|| "request failed without an error message".to_string()),
            })
        }
    }
}

/// Frame rejected at the deserialization boundary
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// A parsed inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Response(ResponseEnvelope),
    Event(Envelope),
}

impl InboundFrame {
    /// Frames carrying a `success` field are responses; anything else must be
    /// a complete event envelope.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;

        let is_response = match &value {
            Value::Object(map) => map.contains_key("success"),
            _ => return Err(FrameError::NotAnObject),
        };

        if is_response {
            serde_json::from_value(value)
                .map(InboundFrame::Response)
                .map_err(|e| FrameError::Malformed(e.to_string()))
        } else {
            serde_json::from_value(value)
                .map(InboundFrame::Event)
                .map_err(|e| FrameError::Malformed(e.to_string()))
        }
    }

    pub fn action(&self) -> &str {
        match self {
            InboundFrame::Response(r) => &r.action,
            InboundFrame::Event(e) => &e.action,
        }
    }

    pub fn is_pong(&self) -> bool {
        self.action() == PONG_ACTION
    }
}
