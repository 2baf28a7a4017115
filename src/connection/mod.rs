//! Duplex connection to the realtime gateway
//!
//! # Architecture
//!
//! ```text
//! ConnectionManager (Clone handle) ──commands──▶ actor task
//!                                                   │  reduce(state, event)
//!                                                   ▼
//!                                 Transport::open ──▶ Link (reader/writer tasks)
//!                                                   │
//!                       responses ◀── correlation ──┤── events ──▶ listeners
//! ```
//!
//! The actor is the only writer of the connection state, the pending request
//! map and the outbound queue. Handles talk to it over a channel and never
//! share those structures.

mod backoff;
mod envelope;
mod manager;
mod state;
mod transport;

pub use backoff::ReconnectPolicy;
pub use envelope::{Envelope, FrameError, InboundFrame, ResponseEnvelope, PING_ACTION, PONG_ACTION};
pub use manager::{ConnectionManager, ConnectionStats, EventHandler, ListenerId, SendOptions};
pub use state::{reduce, ConnectionState, LinkEffect, LinkEvent};
pub use transport::{Link, Transport, TransportError, TransportEvent, WebSocketTransport};

use std::time::Duration;

use crate::resilience::{EnhancedError, RawError};

/// Errors returned to callers of the [`ConnectionManager`]
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    /// No response within the request's timeout
    #[error("request {request_id} timed out after {after:?}")]
    Timeout { request_id: String, after: Duration },
    /// `disconnect()` or `dispose()` while the request was outstanding
    #[error("request cancelled by disconnect")]
    Cancelled,
    /// The link carrying the request was lost
    #[error("connection lost: {0}")]
    Disconnected(String),
    /// Evicted from the full outbound queue
    #[error("outbound queue full, dropped queued '{action}' message")]
    QueueOverflow { action: String },
    /// Reconnect attempts exhausted
    #[error("connection unavailable: {0}")]
    Unavailable(Box<EnhancedError>),
    #[error("'{action}' failed remotely: {message}")]
    Remote { action: String, message: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to serialize message: {0}")]
    Serialization(String),
    /// The manager was disposed
    #[error("connection manager closed")]
    Closed,
}

impl From<&ConnectionError> for RawError {
    fn from(err: &ConnectionError) -> Self {
        let message = err.to_string();
        match err {
            ConnectionError::Timeout { .. } => RawError::with_code("REQUEST_TIMEOUT", message),
            ConnectionError::Disconnected(_) => RawError::with_code("TRANSPORT_CLOSED", message),
            ConnectionError::QueueOverflow { .. } => RawError::with_code("QUEUE_OVERFLOW", message),
            ConnectionError::Unavailable(e) => RawError::with_code(e.code(), e.raw_message()),
            ConnectionError::Transport(e) => RawError::from(e),
            ConnectionError::Serialization(_) => RawError::with_code("VALIDATION", message),
            // Remote errors only carry free text
            ConnectionError::Remote { .. }
            | ConnectionError::Cancelled
            | ConnectionError::Closed => RawError::new(message),
        }
    }
}

impl From<ConnectionError> for RawError {
    fn from(err: ConnectionError) -> Self {
        RawError::from(&err)
    }
}
