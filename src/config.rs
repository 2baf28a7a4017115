//! Transport configuration
//!
//! All values have defaults and every section can be overridden from a JSON
//! file. Durations are stored as milliseconds so the file stays hand-editable.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DIR_NAME: &str = "voxbridge";
const CONFIG_FILE_NAME: &str = "transport.json";

/// Environment variable overriding [`TransportConfig::url`]
pub const URL_ENV: &str = "VOXBRIDGE_URL";

/// Environment variable pointing at an alternate config file
pub const CONFIG_PATH_ENV: &str = "VOXBRIDGE_CONFIG";

/// Collaborator ID used for the duplex connection itself
pub const CONNECTION_COLLABORATOR: &str = "realtime-gateway";

/// Collaborator ID used for failures raised by the chunk buffer
pub const BUFFER_COLLABORATOR: &str = "audio-buffer";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,
    #[error("Failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to write config {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Root configuration for one transport session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// WebSocket endpoint of the remote gateway
    pub url: String,
    pub connection: ConnectionConfig,
    pub buffer: BufferConfig,
    pub resilience: ResilienceConfig,
    /// External services the core knows about, with their criticality
    pub collaborators: Vec<CollaboratorConfig>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            connection: ConnectionConfig::default(),
            buffer: BufferConfig::default(),
            resilience: ResilienceConfig::default(),
            collaborators: default_collaborators(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Reconnect attempts before the connection is declared failed
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect attempt
    pub reconnect_interval_ms: u64,
    /// Upper bound for any reconnect delay
    pub max_reconnect_interval_ms: u64,
    pub backoff_multiplier: f64,
    /// Ping period while connected; a missing pong for twice this long is a failure
    pub heartbeat_interval_ms: u64,
    /// Default timeout for correlated requests
    pub message_timeout_ms: u64,
    /// Outbound messages held while not connected
    pub max_queue_size: usize,
    /// Bound on the WebSocket handshake
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_interval_ms: 1_000,
            max_reconnect_interval_ms: 30_000,
            backoff_multiplier: 1.5,
            heartbeat_interval_ms: 30_000,
            message_timeout_ms: 10_000,
            max_queue_size: 100,
            connect_timeout_ms: 10_000,
        }
    }
}

impl ConnectionConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn max_reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum chunks held at once
    pub max_buffer_size: usize,
    /// Chunks per emitted batch
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// Oldest unprocessed chunk age that forces a flush
    pub max_chunk_age_ms: u64,
    /// Bytes per sample; chunk lengths must be a multiple of this
    pub sample_width_bytes: usize,
    pub max_chunk_bytes: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 100,
            batch_size: 10,
            flush_interval_ms: 1_000,
            max_chunk_age_ms: 5_000,
            sample_width_bytes: 2, // PCM16
            max_chunk_bytes: 64 * 1024,
        }
    }
}

impl BufferConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn max_chunk_age(&self) -> Duration {
        Duration::from_millis(self.max_chunk_age_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Consecutive errors after which a collaborator is marked unhealthy
    pub consecutive_error_threshold: u32,
    /// Consecutive failures after which a collaborator's breaker opens
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown_ms: u64,
    /// Cap for the cool-down after repeated failed probes
    pub max_circuit_cooldown_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Redacted error records kept for diagnostics
    pub error_history_limit: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            consecutive_error_threshold: 3,
            circuit_failure_threshold: 3,
            circuit_cooldown_ms: 30_000,
            max_circuit_cooldown_ms: 300_000,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 10_000,
            error_history_limit: 20,
        }
    }
}

impl ResilienceConfig {
    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_cooldown_ms)
    }

    pub fn max_circuit_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_circuit_cooldown_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

/// An external service the core depends on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    pub id: String,
    /// Critical collaborators escalate authentication and availability failures
    #[serde(default)]
    pub critical: bool,
    /// Alternate collaborator providing the same capability
    #[serde(default)]
    pub fallback: Option<String>,
}

impl CollaboratorConfig {
    pub fn new(id: impl Into<String>, critical: bool) -> Self {
        Self {
            id: id.into(),
            critical,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }
}

fn default_collaborators() -> Vec<CollaboratorConfig> {
    vec![
        CollaboratorConfig::new(CONNECTION_COLLABORATOR, true),
        CollaboratorConfig::new("translation", true),
        CollaboratorConfig::new("speech-to-text", true).with_fallback("batch-transcription"),
        CollaboratorConfig::new("batch-transcription", false),
        CollaboratorConfig::new("text-to-speech", false),
        CollaboratorConfig::new("generative-ai", false),
        CollaboratorConfig::new(BUFFER_COLLABORATOR, false),
    ]
}

impl TransportConfig {
    /// Look up a collaborator by ID
    pub fn collaborator(&self, id: &str) -> Option<&CollaboratorConfig> {
        self.collaborators.iter().find(|c| c.id == id)
    }

    /// Reject values the transport cannot operate with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Invalid("url must not be empty".to_string()));
        }
        if self.connection.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff_multiplier must be >= 1.0 (got {})",
                self.connection.backoff_multiplier
            )));
        }
        if self.connection.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_ms must be > 0".to_string(),
            ));
        }
        if self.connection.max_queue_size == 0 {
            return Err(ConfigError::Invalid("max_queue_size must be > 0".to_string()));
        }
        if self.buffer.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be > 0".to_string()));
        }
        if self.buffer.batch_size > self.buffer.max_buffer_size {
            return Err(ConfigError::Invalid(format!(
                "batch_size ({}) exceeds max_buffer_size ({})",
                self.buffer.batch_size, self.buffer.max_buffer_size
            )));
        }
        if self.buffer.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "flush_interval_ms must be > 0".to_string(),
            ));
        }
        if self.buffer.sample_width_bytes == 0 {
            return Err(ConfigError::Invalid(
                "sample_width_bytes must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply environment overrides (`VOXBRIDGE_URL`)
    pub fn apply_env(mut self) -> Self {
        if let Ok(url) = std::env::var(URL_ENV) {
            if !url.is_empty() {
                log::info!("Config: url overridden by {}", URL_ENV);
                self.url = url;
            }
        }
        self
    }
}

/// Default config file location (`<config_dir>/voxbridge/transport.json`)
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
    Ok(dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Read and parse a config file, failing on any problem
pub fn read_config(path: &Path) -> Result<TransportConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load config from `path`, falling back to defaults when missing or unreadable
pub fn load_config(path: &Path) -> TransportConfig {
    match read_config(path) {
        Ok(config) => config,
        Err(ConfigError::Read { source, .. })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            log::debug!("Config: {:?} not found, using defaults", path);
            TransportConfig::default()
        }
        Err(e) => {
            log::warn!("Config: {}", e);
            TransportConfig::default()
        }
    }
}

pub fn save_config(path: &Path, config: &TransportConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let contents = serde_json::to_string_pretty(config)?;

    // Write to a sibling temp file, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(|source| ConfigError::Write {
        path: tmp_path.clone(),
        source,
    })?;

    // Windows rename fails if the destination exists.
    if cfg!(windows) && path.exists() {
        if let Err(source) = std::fs::remove_file(path) {
            if source.kind() != std::io::ErrorKind::NotFound {
                return Err(ConfigError::Write {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TransportConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection.max_reconnect_attempts, 5);
        assert_eq!(config.buffer.batch_size, 10);
        assert_eq!(config.resilience.consecutive_error_threshold, 3);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let json = r#"{ "url": "wss://example.test/ws", "buffer": { "batch_size": 4 } }"#;
        let config: TransportConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.url, "wss://example.test/ws");
        assert_eq!(config.buffer.batch_size, 4);
        assert_eq!(config.buffer.max_buffer_size, 100);
        assert_eq!(config.connection.heartbeat_interval_ms, 30_000);
        assert!(config.collaborator(CONNECTION_COLLABORATOR).is_some());
    }

    #[test]
    fn test_validate_rejects_batch_larger_than_buffer() {
        let mut config = TransportConfig::default();
        config.buffer.batch_size = 500;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_shrinking_backoff() {
        let mut config = TransportConfig::default();
        config.connection.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("transport.json");

        let mut config = TransportConfig::default();
        config.connection.max_reconnect_attempts = 9;
        save_config(&path, &config).unwrap();

        let loaded = load_config(&path);
        assert_eq!(loaded.connection.max_reconnect_attempts, 9);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_config(&dir.path().join("absent.json"));
        assert_eq!(loaded.url, TransportConfig::default().url);
    }

    #[test]
    fn test_load_corrupt_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transport.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(read_config(&path), Err(ConfigError::Parse { .. })));
        assert_eq!(load_config(&path).buffer.batch_size, 10);
    }
}
