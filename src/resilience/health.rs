//! Per-collaborator health tracking

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// Health snapshot for one collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub collaborator: String,
    pub is_healthy: bool,
    pub error_count: u64,
    pub consecutive_errors: u32,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl ServiceHealth {
    fn new(collaborator: &str) -> Self {
        Self {
            collaborator: collaborator.to_string(),
            is_healthy: true,
            error_count: 0,
            consecutive_errors: 0,
            last_error_at: None,
        }
    }
}

/// Rolling error counters per collaborator
///
/// The tracker is the only writer of [`ServiceHealth`]; callers get clones.
pub struct ServiceHealthTracker {
    threshold: u32,
    services: Mutex<HashMap<String, ServiceHealth>>,
}

impl ServiceHealthTracker {
    /// `threshold` consecutive errors flip a collaborator to unhealthy
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            services: Mutex::new(HashMap::new()),
        }
    }

    fn with_entry<R>(&self, collaborator: &str, f: impl FnOnce(&mut ServiceHealth) -> R) -> R {
        let mut services = self
            .services
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = services
            .entry(collaborator.to_string())
            .or_insert_with(|| ServiceHealth::new(collaborator));
        f(entry)
    }

    pub fn record_error(&self, collaborator: &str) -> ServiceHealth {
        let threshold = self.threshold;
        self.with_entry(collaborator, |health| {
            health.error_count += 1;
            health.consecutive_errors += 1;
            health.last_error_at = Some(Utc::now());

            if health.is_healthy && health.consecutive_errors >= threshold {
                health.is_healthy = false;
                log::warn!(
                    "ServiceHealth: {} marked unhealthy after {} consecutive errors",
                    collaborator,
                    health.consecutive_errors
                );
            }
            health.clone()
        })
    }

    pub fn record_success(&self, collaborator: &str) -> ServiceHealth {
        self.with_entry(collaborator, |health| {
            if !health.is_healthy {
                log::info!("ServiceHealth: {} recovered", collaborator);
            }
            health.consecutive_errors = 0;
            health.is_healthy = true;
            health.clone()
        })
    }

    /// Operator override after manual remediation
    pub fn mark_healthy(&self, collaborator: &str) -> ServiceHealth {
        log::info!("ServiceHealth: {} marked healthy by operator", collaborator);
        self.with_entry(collaborator, |health| {
            health.is_healthy = true;
            health.consecutive_errors = 0;
            health.clone()
        })
    }

    /// Unknown collaborators report as healthy
    pub fn health(&self, collaborator: &str) -> ServiceHealth {
        let services = self
            .services
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        services
            .get(collaborator)
            .cloned()
            .unwrap_or_else(|| ServiceHealth::new(collaborator))
    }

    pub fn is_healthy(&self, collaborator: &str) -> bool {
        self.health(collaborator).is_healthy
    }

    /// All tracked collaborators, sorted by ID
    pub fn snapshot(&self) -> Vec<ServiceHealth> {
        let services = self
            .services
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut all: Vec<_> = services.values().cloned().collect();
        all.sort_by(|a, b| a.collaborator.cmp(&b.collaborator));
        all
    }
}
