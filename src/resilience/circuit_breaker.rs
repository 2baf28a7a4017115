//! Per-collaborator circuit breakers
//!
//! ```text
//! Closed ──(threshold consecutive failures)──▶ Open
//! Open ──(cool-down elapsed, next call)──▶ HalfOpen  (one probe admitted)
//! HalfOpen ──(probe succeeds)──▶ Closed
//! HalfOpen ──(probe fails)──▶ Open  (cool-down extended)
//! ```

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub max_cooldown: Duration,
    /// Cool-down growth after each failed probe
    pub cooldown_multiplier: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
            cooldown_multiplier: 2,
        }
    }
}

/// Returned when a call is refused without being attempted
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit open for {collaborator} (retry in {retry_in:?})")]
pub struct CircuitOpen {
    pub collaborator: String,
    /// Zero when a probe is already in flight
    pub retry_in: Duration,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    cooldown: Duration,
    probe_in_flight: bool,
}

impl Breaker {
    fn new(cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            open_until: None,
            cooldown,
            probe_in_flight: false,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.open_until = Some(now + self.cooldown);
        self.probe_in_flight = false;
    }
}

/// Breakers for every collaborator, created lazily in the CLOSED state
pub struct CircuitBreakerRegistry {
    settings: BreakerSettings,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn with_breaker<R>(&self, collaborator: &str, f: impl FnOnce(&mut Breaker) -> R) -> R {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let breaker = breakers
            .entry(collaborator.to_string())
            .or_insert_with(|| Breaker::new(self.settings.cooldown));
        f(breaker)
    }

    /// Ask permission for one call
    ///
    /// While OPEN and cooling down the call is refused. The first call after
    /// the cool-down moves the breaker to HALF_OPEN and is admitted as the
    /// probe; further calls are refused until the probe reports back.
    pub fn try_acquire(&self, collaborator: &str) -> Result<(), CircuitOpen> {
        let now = Instant::now();
        self.with_breaker(collaborator, |b| match b.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let open_until = b.open_until.unwrap_or(now);
                if now >= open_until {
                    log::info!("CircuitBreaker: {} half-open, admitting probe", collaborator);
                    b.state = CircuitState::HalfOpen;
                    b.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(CircuitOpen {
                        collaborator: collaborator.to_string(),
                        retry_in: open_until - now,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if b.probe_in_flight {
                    Err(CircuitOpen {
                        collaborator: collaborator.to_string(),
                        retry_in: Duration::ZERO,
                    })
                } else {
                    b.probe_in_flight = true;
                    Ok(())
                }
            }
        })
    }

    /// Whether [`try_acquire`](Self::try_acquire) would currently succeed
    pub fn has_available_slot(&self, collaborator: &str) -> bool {
        let now = Instant::now();
        self.with_breaker(collaborator, |b| match b.state {
            CircuitState::Closed => true,
            CircuitState::Open => b.open_until.map_or(true, |until| now >= until),
            CircuitState::HalfOpen => !b.probe_in_flight,
        })
    }

    pub fn record_success(&self, collaborator: &str) {
        let base = self.settings.cooldown;
        self.with_breaker(collaborator, |b| {
            if b.state != CircuitState::Closed {
                log::info!("CircuitBreaker: {} closed after successful probe", collaborator);
            }
            b.state = CircuitState::Closed;
            b.consecutive_failures = 0;
            b.open_until = None;
            b.probe_in_flight = false;
            b.cooldown = base;
        })
    }

    /// Returns the state after recording
    pub fn record_failure(&self, collaborator: &str) -> CircuitState {
        let now = Instant::now();
        let settings = &self.settings;
        self.with_breaker(collaborator, |b| {
            b.consecutive_failures += 1;
            match b.state {
                CircuitState::HalfOpen => {
                    let extended = b.cooldown.saturating_mul(settings.cooldown_multiplier);
                    b.cooldown = extended.min(settings.max_cooldown);
                    b.open(now);
                    log::warn!(
                        "CircuitBreaker: {} probe failed, reopened for {:?}",
                        collaborator,
                        b.cooldown
                    );
                }
                CircuitState::Closed if b.consecutive_failures >= settings.failure_threshold => {
                    b.open(now);
                    log::warn!(
                        "CircuitBreaker: {} opened after {} consecutive failures ({:?} cool-down)",
                        collaborator,
                        b.consecutive_failures,
                        b.cooldown
                    );
                }
                _ => {}
            }
            b.state
        })
    }

    /// Give back a HALF_OPEN probe slot without counting a result
    pub fn release_probe(&self, collaborator: &str) {
        self.with_breaker(collaborator, |b| {
            if b.state == CircuitState::HalfOpen {
                b.probe_in_flight = false;
            }
        })
    }

    pub fn state(&self, collaborator: &str) -> CircuitState {
        self.with_breaker(collaborator, |b| b.state)
    }

    /// Force a breaker back to CLOSED
    pub fn reset(&self, collaborator: &str) {
        self.record_success(collaborator);
    }
}
