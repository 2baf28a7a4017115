//! PII redaction and error logging
//!
//! Every error that reaches the log goes through [`RedactingLogger::log_error`],
//! which strips personally identifiable patterns from the technical message
//! and from string context values first.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{LazyLock, Mutex};

use crate::resilience::{EnhancedError, ErrorContext};

/// Kind of personally identifiable data found in a text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PiiField {
    Ssn,
    CreditCard,
    Phone,
    Email,
}

impl PiiField {
    pub fn as_str(&self) -> &'static str {
        match self {
            PiiField::Ssn => "SSN",
            PiiField::CreditCard => "CREDIT_CARD",
            PiiField::Phone => "PHONE",
            PiiField::Email => "EMAIL",
        }
    }

    fn token(&self) -> String {
        format!("[{}-REDACTED]", self.as_str())
    }
}

/// Applied in order; earlier rules consume digits later rules would also match.
static PII_PATTERNS: LazyLock<Vec<(Regex, PiiField)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap(),
            PiiField::Ssn,
        ),
        (
            Regex::new(r"\b(?:\d{4}[- ]?){3}\d{4}\b").unwrap(),
            PiiField::CreditCard,
        ),
        (
            Regex::new(r"(?:\+?1[-.\s]?)?(?:\(\d{3}\)|\b\d{3})[-.\s]?\d{3}[-.\s]?\d{4}\b").unwrap(),
            PiiField::Phone,
        ),
        (
            Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap(),
            PiiField::Email,
        ),
    ]
});

/// Result of [`redact_pii`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redaction {
    pub redacted_text: String,
    /// Field kinds found, in rule order, without duplicates
    pub redacted_fields: Vec<PiiField>,
}

pub fn redact_pii(text: &str) -> Redaction {
    let mut redacted_text = text.to_string();
    let mut redacted_fields = Vec::new();

    for (pattern, field) in PII_PATTERNS.iter() {
        if pattern.is_match(&redacted_text) {
            redacted_text = pattern
                .replace_all(&redacted_text, field.token().as_str())
                .into_owned();
            redacted_fields.push(*field);
        }
    }

    Redaction {
        redacted_text,
        redacted_fields,
    }
}

/// Redact every string inside a JSON value, recursively
fn redact_value(value: &serde_json::Value, found: &mut Vec<PiiField>) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => {
            let redaction = redact_pii(s);
            for field in redaction.redacted_fields {
                if !found.contains(&field) {
                    found.push(field);
                }
            }
            serde_json::Value::String(redaction.redacted_text)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| redact_value(v, found)).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), redact_value(v, found)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Redacted copy of a logged error, kept for diagnostics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub correlation_id: String,
    pub collaborator: String,
    pub code: String,
    pub category: String,
    pub severity: String,
    pub message: String,
    pub context: ErrorContext,
    pub redacted_fields: Vec<PiiField>,
    pub logged_at: DateTime<Utc>,
}

/// Logs classified errors with PII removed
pub struct RedactingLogger {
    history_limit: usize,
    /// Newest first
    history: Mutex<VecDeque<ErrorRecord>>,
}

impl RedactingLogger {
    pub fn new(history_limit: usize) -> Self {
        Self {
            history_limit,
            history: Mutex::new(VecDeque::with_capacity(history_limit)),
        }
    }

    /// Redact and emit one error; never panics on any input
    pub fn log_error(&self, error: &EnhancedError, context: &ErrorContext) -> ErrorRecord {
        let message = redact_pii(error.raw_message());
        let mut fields = message.redacted_fields.clone();
        let context: ErrorContext = context
            .iter()
            .map(|(k, v)| (k.clone(), redact_value(v, &mut fields)))
            .collect();

        let record = ErrorRecord {
            correlation_id: error.correlation_id().to_string(),
            collaborator: error.collaborator().to_string(),
            code: error.code().to_string(),
            category: error.category().as_str().to_string(),
            severity: error.severity().as_str().to_string(),
            message: message.redacted_text,
            context,
            redacted_fields: fields,
            logged_at: Utc::now(),
        };

        let line = serde_json::to_string(&record).unwrap_or_else(|e| {
            format!(
                "{{\"correlationId\":\"{}\",\"serializeError\":\"{}\"}}",
                record.correlation_id, e
            )
        });
        log::log!(error.severity().log_level(), "TransportError: {}", line);

        self.push(record.clone());
        record
    }

    fn push(&self, record: ErrorRecord) {
        if self.history_limit == 0 {
            return;
        }
        let mut history = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        history.push_front(record);
        while history.len() > self.history_limit {
            history.pop_back();
        }
    }

    /// Logged errors, newest first
    pub fn history(&self) -> Vec<ErrorRecord> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear_history(&self) {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}
