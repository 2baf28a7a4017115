//! Error taxonomy shared by every component of the transport core
//!
//! A failure enters the resilience layer as a [`RawError`] (whatever the
//! failing component could say about it) and leaves the classifier as an
//! [`EnhancedError`], which is immutable from then on.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Category of a classified failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Network,
    Timeout,
    ServiceUnavailable,
    Authentication,
    Permission,
    RateLimit,
    Validation,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "NETWORK",
            ErrorCategory::Timeout => "TIMEOUT",
            ErrorCategory::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCategory::Authentication => "AUTHENTICATION",
            ErrorCategory::Permission => "PERMISSION",
            ErrorCategory::RateLimit => "RATE_LIMIT",
            ErrorCategory::Validation => "VALIDATION",
            ErrorCategory::Unknown => "UNKNOWN",
        }
    }

    /// Whether a failure of this category may succeed if simply tried again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::ServiceUnavailable
                | ErrorCategory::RateLimit
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a classified failure, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Log level used when an error of this severity is emitted
    pub fn log_level(&self) -> log::Level {
        match self {
            Severity::Low => log::Level::Info,
            Severity::Medium => log::Level::Warn,
            Severity::High | Severity::Critical => log::Level::Error,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unclassified failure as reported by a component or collaborator
///
/// `code` and `status` are structured hints and take precedence over the
/// free-form `message` during classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawError {
    pub code: Option<String>,
    pub status: Option<u16>,
    pub message: String,
}

impl RawError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            status: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

impl From<String> for RawError {
    fn from(message: String) -> Self {
        RawError::new(message)
    }
}

impl From<&str> for RawError {
    fn from(message: &str) -> Self {
        RawError::new(message)
    }
}

impl From<std::io::Error> for RawError {
    fn from(e: std::io::Error) -> Self {
        let code = match e.kind() {
            std::io::ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
            std::io::ErrorKind::ConnectionReset => Some("ECONNRESET"),
            std::io::ErrorKind::TimedOut => Some("ETIMEDOUT"),
            std::io::ErrorKind::PermissionDenied => Some("ACCESS_DENIED"),
            _ => None,
        };
        RawError {
            code: code.map(str::to_string),
            status: None,
            message: e.to_string(),
        }
    }
}

/// Free-form context attached to an error report (operation name, session, ...)
///
/// Values are arbitrary JSON; string values are redacted before logging.
pub type ErrorContext = BTreeMap<String, serde_json::Value>;

/// A classified failure
///
/// Created once by the classifier and never mutated afterwards; fields are
/// only readable through accessors.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("[{category}] {collaborator}: {raw_message}")]
pub struct EnhancedError {
    pub(crate) code: String,
    pub(crate) raw_message: String,
    pub(crate) collaborator: String,
    pub(crate) category: ErrorCategory,
    pub(crate) severity: Severity,
    pub(crate) retryable: bool,
    pub(crate) correlation_id: String,
    pub(crate) user_message: String,
    pub(crate) recovery_actions: Vec<String>,
    pub(crate) occurred_at: DateTime<Utc>,
}

impl EnhancedError {
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Technical message; may contain PII and must be redacted before logging
    pub fn raw_message(&self) -> &str {
        &self.raw_message
    }

    pub fn collaborator(&self) -> &str {
        &self.collaborator
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// `err_<millis>_<random>` identifier for cross-referencing logs
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Plain-language message suitable for direct display
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Suggested next steps for the user, never empty
    pub fn recovery_actions(&self) -> &[String] {
        &self.recovery_actions
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_categories() {
        assert!(ErrorCategory::Network.is_retryable());
        assert!(ErrorCategory::Timeout.is_retryable());
        assert!(ErrorCategory::RateLimit.is_retryable());
        assert!(ErrorCategory::ServiceUnavailable.is_retryable());
        assert!(!ErrorCategory::Validation.is_retryable());
        assert!(!ErrorCategory::Authentication.is_retryable());
        assert!(!ErrorCategory::Permission.is_retryable());
        assert!(!ErrorCategory::Unknown.is_retryable());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(Severity::Critical.log_level(), log::Level::Error);
        assert_eq!(Severity::Low.log_level(), log::Level::Info);
    }

    #[test]
    fn test_category_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCategory::ServiceUnavailable).unwrap();
        assert_eq!(json, "\"SERVICE_UNAVAILABLE\"");
    }

    #[test]
    fn test_raw_error_from_io_error_carries_code() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let raw = RawError::from(io);
        assert_eq!(raw.code.as_deref(), Some("ECONNREFUSED"));
    }
}
