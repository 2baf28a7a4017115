//! Resilient streaming-transport core
//!
//! ```text
//! capture ──▶ ChunkBuffer ──batch──▶ ConnectionManager ──▶ realtime gateway
//!                 │                        │
//!                 └──── failures ──────────┴──▶ ErrorHandler
//!                                               (classify, health, breakers,
//!                                                recovery, redacted log)
//! ```
//!
//! A [`TransportContext`] is built once per session and hands out components
//! that share its [`ErrorHandler`].

pub mod buffer;
pub mod config;
pub mod connection;
pub mod redact;
pub mod resilience;

pub use buffer::{
    connection_batch_handler, AudioChunk, BatchError, BatchHandler, BufferError, BufferStats,
    BufferedChunk, ChunkBuffer, FlushOutcome,
};
pub use config::{
    load_config, save_config, BufferConfig, CollaboratorConfig, ConfigError, ConnectionConfig,
    ResilienceConfig, TransportConfig,
};
pub use connection::{
    ConnectionError, ConnectionManager, ConnectionState, ConnectionStats, Envelope,
    ResponseEnvelope, SendOptions, Transport, WebSocketTransport,
};
pub use redact::{redact_pii, ErrorRecord, RedactingLogger};
pub use resilience::{
    EnhancedError, ErrorCategory, ErrorContext, ErrorHandler, RawError, RecoveryError,
    RecoveryStrategy, Severity,
};

use std::sync::Arc;

/// Per-session wiring of the transport core
pub struct TransportContext {
    config: TransportConfig,
    errors: Arc<ErrorHandler>,
}

impl TransportContext {
    pub fn new(config: TransportConfig) -> Self {
        let errors = Arc::new(ErrorHandler::new(&config));
        Self { config, errors }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn errors(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    /// WebSocket connection to the configured URL
    pub fn connection(&self) -> ConnectionManager {
        let transport = WebSocketTransport::new(self.config.connection.connect_timeout());
        self.connection_with(Arc::new(transport))
    }

    /// Connection to the configured URL over a caller-supplied transport
    pub fn connection_with(&self, transport: Arc<dyn Transport>) -> ConnectionManager {
        ConnectionManager::new(
            self.config.url.clone(),
            &self.config.connection,
            transport,
            self.errors.clone(),
        )
    }

    pub fn chunk_buffer(&self, handler: BatchHandler) -> ChunkBuffer {
        ChunkBuffer::new(&self.config.buffer, handler, self.errors.clone())
    }
}
