//! Recovery strategy selection

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::circuit_breaker::CircuitBreakerRegistry;
use super::classifier::ErrorClassifier;
use super::error::{EnhancedError, ErrorCategory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryStrategy {
    /// Try again with bounded exponential backoff
    Retry,
    /// Switch to the configured alternate collaborator
    Fallback,
    /// Stop calling the collaborator until its breaker cools down
    CircuitBreaker,
    /// Carry on without the collaborator's capability
    GracefulDegradation,
    /// Needs the user or an operator; never retried automatically
    ManualIntervention,
    /// Surface immediately
    None,
}

/// Decision for one classified error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryPlan {
    pub strategy: RecoveryStrategy,
    /// Alternate collaborator, set for [`RecoveryStrategy::Fallback`]
    pub fallback: Option<String>,
    pub auto_recoverable: bool,
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Chooses how to react to a classified error
pub struct RecoveryStrategist {
    retry: RetrySettings,
    classifier: Arc<ErrorClassifier>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl RecoveryStrategist {
    pub fn new(
        retry: RetrySettings,
        classifier: Arc<ErrorClassifier>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            retry,
            classifier,
            breakers,
        }
    }

    pub fn retry_settings(&self) -> &RetrySettings {
        &self.retry
    }

    /// Category → strategy table, with the fallback lookup for availability failures
    pub fn strategy_for(&self, category: ErrorCategory, collaborator: &str) -> RecoveryStrategy {
        match category {
            ErrorCategory::Network | ErrorCategory::Timeout => RecoveryStrategy::Retry,
            ErrorCategory::ServiceUnavailable => {
                if self.classifier.fallback_for(collaborator).is_some() {
                    RecoveryStrategy::Fallback
                } else {
                    RecoveryStrategy::GracefulDegradation
                }
            }
            ErrorCategory::Authentication | ErrorCategory::Permission => {
                RecoveryStrategy::ManualIntervention
            }
            ErrorCategory::RateLimit => RecoveryStrategy::CircuitBreaker,
            ErrorCategory::Validation | ErrorCategory::Unknown => RecoveryStrategy::None,
        }
    }

    pub fn decide(&self, error: &EnhancedError) -> RecoveryPlan {
        let strategy = self.strategy_for(error.category(), error.collaborator());
        let fallback = match strategy {
            RecoveryStrategy::Fallback => self
                .classifier
                .fallback_for(error.collaborator())
                .map(str::to_string),
            _ => None,
        };

        RecoveryPlan {
            strategy,
            fallback,
            auto_recoverable: self.can_auto_recover(error),
        }
    }

    /// True for RETRY, and for CIRCUIT_BREAKER while the breaker would admit a call
    pub fn can_auto_recover(&self, error: &EnhancedError) -> bool {
        match self.strategy_for(error.category(), error.collaborator()) {
            RecoveryStrategy::Retry => true,
            RecoveryStrategy::CircuitBreaker => {
                self.breakers.has_available_slot(error.collaborator())
            }
            _ => false,
        }
    }

    /// Delay before retry number `attempt` (0-based): base × 2^attempt, capped
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.retry
            .base_delay
            .saturating_mul(factor)
            .min(self.retry.max_delay)
    }
}
