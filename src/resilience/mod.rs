//! Error classification and recovery
//!
//! [`ErrorHandler`] is the single entry point the rest of the core reports
//! failures to. One handler is built per session (see
//! [`TransportContext`](crate::TransportContext)) and shared by reference.
//!
//! ```text
//! failure ──▶ ErrorClassifier ──▶ ServiceHealthTracker ──▶ RedactingLogger
//!                                   CircuitBreakerRegistry        │
//!                                                                 ▼
//!                                   RecoveryStrategist ──▶ retry / fallback /
//!                                                          degrade / surface
//! ```

mod circuit_breaker;
mod classifier;
mod error;
mod health;
mod recovery;

pub use circuit_breaker::{BreakerSettings, CircuitBreakerRegistry, CircuitOpen, CircuitState};
pub use classifier::{severity_for, ErrorClassifier};
pub use error::{EnhancedError, ErrorCategory, ErrorContext, RawError, Severity};
pub use health::{ServiceHealth, ServiceHealthTracker};
pub use recovery::{RecoveryPlan, RecoveryStrategist, RecoveryStrategy, RetrySettings};

use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::TransportConfig;
use crate::redact::RedactingLogger;

/// Capacity of the surfaced-error broadcast channel
const SURFACED_CHANNEL_CAPACITY: usize = 64;

/// Failure returned by [`ErrorHandler::execute_with_retry`]
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// Not retryable; returned after the first attempt
    #[error("{0}")]
    Failed(Box<EnhancedError>),
    #[error("gave up after {attempts} attempts: {error}")]
    Exhausted {
        attempts: u32,
        error: Box<EnhancedError>,
    },
    /// Refused by the collaborator's circuit breaker without calling it
    #[error("{0}")]
    CircuitOpen(Box<EnhancedError>),
    #[error("operation cancelled")]
    Cancelled,
}

impl RecoveryError {
    /// The classified error, unless the operation was cancelled
    pub fn enhanced(&self) -> Option<&EnhancedError> {
        match self {
            RecoveryError::Failed(e) | RecoveryError::CircuitOpen(e) => Some(e),
            RecoveryError::Exhausted { error, .. } => Some(error),
            RecoveryError::Cancelled => None,
        }
    }
}

/// Session-wide resilience facade
pub struct ErrorHandler {
    classifier: Arc<ErrorClassifier>,
    health: ServiceHealthTracker,
    breakers: Arc<CircuitBreakerRegistry>,
    strategist: RecoveryStrategist,
    logger: RedactingLogger,
    surfaced: broadcast::Sender<EnhancedError>,
}

impl ErrorHandler {
    pub fn new(config: &TransportConfig) -> Self {
        let resilience = &config.resilience;
        let classifier = Arc::new(ErrorClassifier::new(&config.collaborators));
        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerSettings {
            failure_threshold: resilience.circuit_failure_threshold.max(1),
            cooldown: resilience.circuit_cooldown(),
            max_cooldown: resilience.max_circuit_cooldown(),
            cooldown_multiplier: 2,
        }));
        let strategist = RecoveryStrategist::new(
            RetrySettings {
                max_retries: resilience.max_retries,
                base_delay: resilience.retry_base_delay(),
                max_delay: resilience.retry_max_delay(),
            },
            classifier.clone(),
            breakers.clone(),
        );
        let (surfaced, _) = broadcast::channel(SURFACED_CHANNEL_CAPACITY);

        Self {
            classifier,
            health: ServiceHealthTracker::new(resilience.consecutive_error_threshold),
            breakers,
            strategist,
            logger: RedactingLogger::new(resilience.error_history_limit),
            surfaced,
        }
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn health(&self) -> &ServiceHealthTracker {
        &self.health
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn strategist(&self) -> &RecoveryStrategist {
        &self.strategist
    }

    pub fn logger(&self) -> &RedactingLogger {
        &self.logger
    }

    /// Classify, count and log one failure
    pub fn report(
        &self,
        raw: &RawError,
        collaborator: &str,
        context: &ErrorContext,
    ) -> EnhancedError {
        self.record(raw, collaborator, context, true)
    }

    fn record(
        &self,
        raw: &RawError,
        collaborator: &str,
        context: &ErrorContext,
        feed_breaker: bool,
    ) -> EnhancedError {
        let error = self.classifier.classify(raw, collaborator, context);
        self.health.record_error(collaborator);
        if feed_breaker && error.is_retryable() {
            self.breakers.record_failure(collaborator);
        }
        self.logger.log_error(&error, context);
        error
    }

    /// Classify and log a condition that is not the collaborator's fault
    ///
    /// Health counters and breakers are left alone.
    pub fn record_warning(
        &self,
        raw: &RawError,
        collaborator: &str,
        context: &ErrorContext,
    ) -> EnhancedError {
        let error = self.classifier.classify(raw, collaborator, context);
        self.logger.log_error(&error, context);
        error
    }

    /// Report a failure and pick a recovery plan for it
    ///
    /// Errors with no recovery path (no strategy, or manual intervention) are
    /// surfaced to subscribers immediately.
    pub fn handle(
        &self,
        raw: &RawError,
        collaborator: &str,
        context: &ErrorContext,
    ) -> (EnhancedError, RecoveryPlan) {
        let error = self.report(raw, collaborator, context);
        let plan = self.plan(&error);
        (error, plan)
    }

    /// [`handle`](Self::handle) for a caller that paces its own retries
    ///
    /// The collaborator's circuit breaker is left alone.
    pub fn handle_paced(
        &self,
        raw: &RawError,
        collaborator: &str,
        context: &ErrorContext,
    ) -> (EnhancedError, RecoveryPlan) {
        let error = self.record(raw, collaborator, context, false);
        let plan = self.plan(&error);
        (error, plan)
    }

    fn plan(&self, error: &EnhancedError) -> RecoveryPlan {
        let plan = self.strategist.decide(error);
        log::debug!(
            "ErrorHandler: {} -> {:?} (auto: {})",
            error.correlation_id(),
            plan.strategy,
            plan.auto_recoverable
        );
        if matches!(
            plan.strategy,
            RecoveryStrategy::None | RecoveryStrategy::ManualIntervention
        ) {
            self.surface(error);
        }
        plan
    }

    pub fn record_success(&self, collaborator: &str) {
        self.health.record_success(collaborator);
        self.breakers.record_success(collaborator);
    }

    /// Hand an error with no further recovery path to the application
    pub fn surface(&self, error: &EnhancedError) {
        // No subscribers is fine
        let _ = self.surfaced.send(error.clone());
    }

    /// Receive every surfaced error from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EnhancedError> {
        self.surfaced.subscribe()
    }

    /// Run `operation` against `collaborator`, retrying retryable failures
    ///
    /// - Non-retryable failures return after the first attempt.
    /// - Retryable failures are retried up to `max_retries` times with
    ///   exponential delay.
    /// - The collaborator's circuit breaker is consulted before every attempt;
    ///   while it is open the operation is not invoked at all.
    /// - Cancelling `cancel` aborts a pending retry delay.
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        collaborator: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, RecoveryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<RawError>,
    {
        let max_retries = self.strategist.retry_settings().max_retries;
        let mut retries = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(RecoveryError::Cancelled);
            }

            if let Err(open) = self.breakers.try_acquire(collaborator) {
                let error = self.classifier.classify(
                    &RawError::with_code("CIRCUIT_OPEN", open.to_string()),
                    collaborator,
                    &ErrorContext::new(),
                );
                self.logger.log_error(&error, &ErrorContext::new());
                self.surface(&error);
                return Err(RecoveryError::CircuitOpen(Box::new(error)));
            }

            let raw: RawError = match operation().await {
                Ok(value) => {
                    self.record_success(collaborator);
                    return Ok(value);
                }
                Err(e) => e.into(),
            };

            let mut context = ErrorContext::new();
            context.insert("attempt".to_string(), (retries + 1).into());
            let error = self.report(&raw, collaborator, &context);

            if !error.is_retryable() {
                self.breakers.release_probe(collaborator);
                self.surface(&error);
                return Err(RecoveryError::Failed(Box::new(error)));
            }

            if retries >= max_retries {
                log::warn!(
                    "ErrorHandler: {} still failing after {} attempts, giving up",
                    collaborator,
                    retries + 1
                );
                self.surface(&error);
                return Err(RecoveryError::Exhausted {
                    attempts: retries + 1,
                    error: Box::new(error),
                });
            }

            let delay = self.strategist.retry_delay(retries);
            retries += 1;
            log::info!(
                "ErrorHandler: retrying {} in {:?} (retry {}/{})",
                collaborator,
                delay,
                retries,
                max_retries
            );

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    log::debug!("ErrorHandler: retry of {} cancelled", collaborator);
                    return Err(RecoveryError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
