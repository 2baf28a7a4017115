//! Error classification
//!
//! Maps a [`RawError`] from a given collaborator to an [`EnhancedError`].
//! Classification consults, in order:
//!
//! 1. the structured `code`, when the failing component supplied one
//! 2. the HTTP-like `status`
//! 3. the ordered message pattern table below (last resort)
//!
//! The pattern table is policy: the order decides which category wins when a
//! message matches several (e.g. "invalid api key" is AUTHENTICATION, not
//! VALIDATION, because the unauthorized rule comes first).

use chrono::Utc;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use uuid::Uuid;

use super::error::{EnhancedError, ErrorCategory, ErrorContext, RawError, Severity};
use crate::config::CollaboratorConfig;

/// Ordered fallback rules applied to the lower-cased message
static MESSAGE_PATTERNS: LazyLock<Vec<(Regex, ErrorCategory)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"network|connection (refused|reset|closed|lost)|econn|socket|dns|unreachable|fetch failed").unwrap(),
            ErrorCategory::Network,
        ),
        (
            Regex::new(r"timeout|timed out|deadline exceeded").unwrap(),
            ErrorCategory::Timeout,
        ),
        (
            Regex::new(r"unauthori[sz]ed|unauthenticated|authentication|invalid (api )?key|token expired|\b401\b").unwrap(),
            ErrorCategory::Authentication,
        ),
        (
            Regex::new(r"rate limit|throttl|too many requests|quota exceeded|\b429\b").unwrap(),
            ErrorCategory::RateLimit,
        ),
        (
            Regex::new(r"validation|invalid|malformed|bad request|missing field|\b400\b").unwrap(),
            ErrorCategory::Validation,
        ),
        (
            Regex::new(r"forbidden|permission|access denied|not allowed|\b403\b").unwrap(),
            ErrorCategory::Permission,
        ),
        (
            Regex::new(r"service unavailable|unavailable|bad gateway|overloaded|\b50[23]\b").unwrap(),
            ErrorCategory::ServiceUnavailable,
        ),
    ]
});

fn category_for_code(code: &str) -> Option<ErrorCategory> {
    let category = match code.to_ascii_uppercase().as_str() {
        "NETWORK" | "NETWORK_ERROR" | "ECONNREFUSED" | "ECONNRESET" | "TRANSPORT_CLOSED" => {
            ErrorCategory::Network
        }
        "TIMEOUT" | "ETIMEDOUT" | "REQUEST_TIMEOUT" | "HEARTBEAT_TIMEOUT" => ErrorCategory::Timeout,
        "UNAUTHORIZED" | "AUTH_FAILED" | "TOKEN_EXPIRED" => ErrorCategory::Authentication,
        "FORBIDDEN" | "ACCESS_DENIED" => ErrorCategory::Permission,
        "RATE_LIMITED" | "THROTTLED" => ErrorCategory::RateLimit,
        "VALIDATION" | "INVALID_FRAME" | "INVALID_CHUNK" => ErrorCategory::Validation,
        "SERVICE_UNAVAILABLE" | "RECONNECT_EXHAUSTED" | "CIRCUIT_OPEN" | "QUEUE_OVERFLOW"
        | "BUFFER_OVERFLOW" => ErrorCategory::ServiceUnavailable,
        _ => return None,
    };
    Some(category)
}

fn category_for_status(status: u16) -> Option<ErrorCategory> {
    match status {
        400 | 422 => Some(ErrorCategory::Validation),
        401 => Some(ErrorCategory::Authentication),
        403 => Some(ErrorCategory::Permission),
        408 | 504 => Some(ErrorCategory::Timeout),
        429 => Some(ErrorCategory::RateLimit),
        500 | 502 | 503 => Some(ErrorCategory::ServiceUnavailable),
        _ => None,
    }
}

fn category_for_message(message: &str) -> ErrorCategory {
    let lowered = message.to_lowercase();
    MESSAGE_PATTERNS
        .iter()
        .find(|(pattern, _)| pattern.is_match(&lowered))
        .map(|(_, category)| *category)
        .unwrap_or(ErrorCategory::Unknown)
}

/// Severity lookup keyed by (collaborator criticality, category)
pub fn severity_for(critical: bool, category: ErrorCategory) -> Severity {
    use ErrorCategory::*;
    match (critical, category) {
        (true, Authentication) | (true, ServiceUnavailable) => Severity::Critical,
        (true, Network) | (true, Permission) => Severity::High,
        (true, Timeout) | (true, RateLimit) | (true, Unknown) => Severity::Medium,
        (true, Validation) => Severity::Low,

        (false, Authentication) => Severity::High,
        (false, Network) | (false, Permission) | (false, ServiceUnavailable) => Severity::Medium,
        (false, Timeout) | (false, RateLimit) | (false, Validation) | (false, Unknown) => {
            Severity::Low
        }
    }
}

fn user_message_for(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::Network => {
            "Connection problem. Please check your internet connection."
        }
        ErrorCategory::Timeout => "The service is taking too long to respond. Please try again.",
        ErrorCategory::ServiceUnavailable => {
            "The service is temporarily unavailable. We'll keep trying in the background."
        }
        ErrorCategory::Authentication => "Your session has expired. Please sign in again.",
        ErrorCategory::Permission => "You don't have permission to perform this action.",
        ErrorCategory::RateLimit => "Too many requests. Please wait a moment before trying again.",
        ErrorCategory::Validation => "Some of the provided data was not accepted.",
        ErrorCategory::Unknown => "An unexpected error occurred.",
    }
}

fn recovery_actions_for(category: ErrorCategory) -> Vec<String> {
    let actions: &[&str] = match category {
        ErrorCategory::Network => &[
            "Check your internet connection",
            "Wait for the connection to be restored automatically",
        ],
        ErrorCategory::Timeout => &["Try again", "Check your network speed"],
        ErrorCategory::ServiceUnavailable => &[
            "Wait a few minutes and try again",
            "Continue with reduced functionality",
        ],
        ErrorCategory::Authentication => &["Sign in again", "Refresh the page"],
        ErrorCategory::Permission => &[
            "Contact your administrator",
            "Check your account permissions",
        ],
        ErrorCategory::RateLimit => &["Wait a moment before trying again", "Reduce request frequency"],
        ErrorCategory::Validation => &["Check the input and try again"],
        ErrorCategory::Unknown => &["Try again", "Reload the application if the problem persists"],
    };
    actions.iter().map(|a| a.to_string()).collect()
}

/// `err_<unix millis>_<9 random chars>`
fn generate_correlation_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("err_{}_{}", Utc::now().timestamp_millis(), &random[..9])
}

/// Maps raw failures into the typed taxonomy
pub struct ErrorClassifier {
    collaborators: HashMap<String, CollaboratorConfig>,
}

impl ErrorClassifier {
    pub fn new(collaborators: &[CollaboratorConfig]) -> Self {
        Self {
            collaborators: collaborators
                .iter()
                .map(|c| (c.id.clone(), c.clone()))
                .collect(),
        }
    }

    /// Unknown collaborators are treated as non-critical
    pub fn is_critical(&self, collaborator: &str) -> bool {
        self.collaborators
            .get(collaborator)
            .map(|c| c.critical)
            .unwrap_or(false)
    }

    pub fn fallback_for(&self, collaborator: &str) -> Option<&str> {
        self.collaborators
            .get(collaborator)
            .and_then(|c| c.fallback.as_deref())
    }

    /// Category only, without building a full error
    pub fn categorize(&self, raw: &RawError) -> ErrorCategory {
        raw.code
            .as_deref()
            .and_then(category_for_code)
            .or_else(|| raw.status.and_then(category_for_status))
            .unwrap_or_else(|| category_for_message(&raw.message))
    }

    pub fn classify(
        &self,
        raw: &RawError,
        collaborator: &str,
        context: &ErrorContext,
    ) -> EnhancedError {
        let category = self.categorize(raw);
        let severity = severity_for(self.is_critical(collaborator), category);
        let code = raw
            .code
            .clone()
            .unwrap_or_else(|| category.as_str().to_string());

        let error = EnhancedError {
            code,
            raw_message: raw.message.clone(),
            collaborator: collaborator.to_string(),
            category,
            severity,
            retryable: category.is_retryable(),
            correlation_id: generate_correlation_id(),
            user_message: user_message_for(category).to_string(),
            recovery_actions: recovery_actions_for(category),
            occurred_at: Utc::now(),
        };

        log::debug!(
            "ErrorClassifier: {} from {} classified as {}/{} ({} context keys)",
            error.correlation_id,
            collaborator,
            category,
            severity,
            context.len()
        );

        error
    }
}
