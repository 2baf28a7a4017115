//! Audio chunk batching
//!
//! ```text
//! capture callback ──add_chunk──▶ ChunkBuffer ──batch──▶ BatchHandler
//!                                   ▲     │                 │
//!                     flush timer ──┘     └── unmark on Err ◀┘
//! ```

mod batch;
mod chunk_buffer;

pub use batch::{audio_batch_envelope, connection_batch_handler, AUDIO_BATCH_ACTION};
pub use chunk_buffer::{BufferStats, ChunkBuffer, ErrorCallback, FlushOutcome};

use futures_util::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;

use crate::connection::ConnectionError;
use crate::resilience::RawError;

/// One captured slice of audio
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunk {
    /// Raw PCM bytes
    #[serde(skip)]
    pub data: Vec<u8>,
    /// Wall-clock capture time (Unix millis)
    pub timestamp_ms: i64,
    pub sequence: u64,
}

impl AudioChunk {
    /// Chunk stamped with the current time
    pub fn new(data: Vec<u8>, sequence: u64) -> Self {
        Self {
            data,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            sequence,
        }
    }

    /// PCM16 samples as little-endian bytes
    pub fn from_samples(samples: &[i16], sequence: u64) -> Self {
        let data = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self::new(data, sequence)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A chunk held by the buffer
#[derive(Debug, Clone)]
pub struct BufferedChunk {
    pub id: u64,
    pub chunk: AudioChunk,
    /// Part of a batch currently handed to the handler
    pub processed: bool,
    received_at: Instant,
}

impl BufferedChunk {
    fn new(id: u64, chunk: AudioChunk) -> Self {
        Self {
            id,
            chunk,
            processed: false,
            received_at: Instant::now(),
        }
    }

    /// Time since the buffer accepted this chunk
    pub fn age(&self) -> std::time::Duration {
        self.received_at.elapsed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("invalid audio chunk: {0}")]
    InvalidChunk(String),
    /// The buffer was full; `evicted` oldest chunks were dropped
    #[error("buffer full ({capacity} chunks), evicted {evicted} oldest")]
    Overflow { evicted: usize, capacity: usize },
    #[error("buffer disposed")]
    Disposed,
}

impl From<&BufferError> for RawError {
    fn from(err: &BufferError) -> Self {
        let message = err.to_string();
        match err {
            BufferError::InvalidChunk(_) => RawError::with_code("INVALID_CHUNK", message),
            BufferError::Overflow { .. } => RawError::with_code("BUFFER_OVERFLOW", message),
            BufferError::Disposed => RawError::new(message),
        }
    }
}

/// Failure reported by a [`BatchHandler`]
#[derive(Debug, Clone, thiserror::Error)]
pub enum BatchError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("batch rejected: {0}")]
    Rejected(String),
}

impl From<&BatchError> for RawError {
    fn from(err: &BatchError) -> Self {
        match err {
            BatchError::Connection(e) => RawError::from(e),
            BatchError::Rejected(message) => RawError::new(message.clone()),
        }
    }
}

/// Consumer of emitted batches; chunks are retried when it returns `Err`
pub type BatchHandler =
    Arc<dyn Fn(Vec<BufferedChunk>) -> BoxFuture<'static, Result<(), BatchError>> + Send + Sync>;
