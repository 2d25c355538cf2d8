//! Per-service rate limiting with exponential backoff (spec component C2).
//!
//! Each configured service gets an independent token-bucket-style limiter:
//! a reservoir that refreshes at the window boundary, a minimum inter-request
//! spacing, a concurrency cap, and — for services with a token budget — a
//! secondary per-window and per-day token dimension. Depleting the reservoir
//! arms an exponential backoff; acquisitions are admitted in arrival order
//! within a service via a per-service async mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use swarmforge_core::{Event, EventBus, OrchestratorError};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

/// Configuration surface for one service's limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_window: u32,
    pub window: Duration,
    pub tokens_per_window: Option<u64>,
    pub tokens_per_day: Option<u64>,
    pub max_concurrent: u32,
    pub burst_allowance: f64,
    pub reserve_fraction: f64,
    pub backoff_multiplier: f64,
    pub backoff_cap: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 60,
            window: Duration::from_secs(60),
            tokens_per_window: None,
            tokens_per_day: None,
            max_concurrent: 16,
            burst_allowance: 1.2,
            reserve_fraction: 0.10,
            backoff_multiplier: 2.0,
            backoff_cap: Duration::from_secs(60),
        }
    }
}

/// Outcome of [`RateGovernor::acquire`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquireOutcome {
    pub granted: bool,
    pub wait_hint: Option<Duration>,
}

/// Snapshot of one service's limiter state, as returned by
/// [`RateGovernor::status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub service: String,
    pub requests_in_window: u32,
    pub request_limit: u32,
    pub window_ms: u64,
    pub tokens_in_window: Option<u64>,
    pub token_limit: Option<u64>,
    pub tokens_today: u64,
    pub backoff_attempts: u32,
    pub backoff_remaining_ms: u64,
}

struct ServiceState {
    config: RateLimitConfig,
    window_start: Instant,
    requests_in_window: u32,
    tokens_in_window: u64,
    last_request_at: Option<Instant>,
    in_flight: u32,
    day_start: Instant,
    tokens_today: u64,
    day_warning_emitted: bool,
    backoff_until: Option<Instant>,
    backoff_attempts: u32,
}

impl ServiceState {
    fn new(config: RateLimitConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            window_start: now,
            requests_in_window: 0,
            tokens_in_window: 0,
            last_request_at: None,
            in_flight: 0,
            day_start: now,
            tokens_today: 0,
            day_warning_emitted: false,
            backoff_until: None,
            backoff_attempts: 0,
        }
    }

    fn reservoir_capacity(&self) -> u32 {
        (self.config.requests_per_window as f64 * self.config.burst_allowance).floor() as u32
    }

    fn min_spacing(&self) -> Duration {
        if self.config.requests_per_window == 0 {
            Duration::ZERO
        } else {
            self.config.window / self.config.requests_per_window
        }
    }

    fn maybe_reset_window(&mut self, events: &EventBus, service: &str) {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= self.config.window {
            self.window_start = now;
            self.requests_in_window = 0;
            self.tokens_in_window = 0;
            events.publish(Event::QuotaReset {
                service: service.to_string(),
            });
        }
        if now.duration_since(self.day_start) >= Duration::from_secs(86_400) {
            self.day_start = now;
            self.tokens_today = 0;
            self.day_warning_emitted = false;
        }
    }

    fn arm_backoff(&mut self) -> Duration {
        let attempt = self.backoff_attempts;
        self.backoff_attempts += 1;
        let millis = (1000.0 * self.config.backoff_multiplier.powi(attempt as i32))
            .min(self.config.backoff_cap.as_millis() as f64);
        let backoff = Duration::from_millis(millis as u64);
        self.backoff_until = Some(Instant::now() + backoff);
        backoff
    }

    fn clear_backoff(&mut self) {
        self.backoff_until = None;
        self.backoff_attempts = 0;
    }
}

/// Per-service token-bucket rate limiter with exponential backoff on
/// depletion.
pub struct RateGovernor {
    services: Mutex<HashMap<String, Arc<Mutex<ServiceState>>>>,
    events: Arc<EventBus>,
    stopped: AtomicBool,
}

impl RateGovernor {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
            events,
            stopped: AtomicBool::new(false),
        }
    }

    fn validate_service(name: &str) -> Result<(), OrchestratorError> {
        if name.trim().is_empty() {
            return Err(OrchestratorError::InvalidService(name.to_string()));
        }
        Ok(())
    }

    /// Register or replace a service's limiter configuration.
    pub async fn configure(
        &self,
        service: &str,
        config: RateLimitConfig,
    ) -> Result<(), OrchestratorError> {
        Self::validate_service(service)?;
        let mut services = self.services.lock().await;
        services.insert(service.to_string(), Arc::new(Mutex::new(ServiceState::new(config))));
        Ok(())
    }

    async fn service_handle(
        &self,
        service: &str,
    ) -> Result<Arc<Mutex<ServiceState>>, OrchestratorError> {
        Self::validate_service(service)?;
        let mut services = self.services.lock().await;
        Ok(services
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ServiceState::new(RateLimitConfig::default()))))
            .clone())
    }

    /// `Acquire` — admits or denies a request for `service`, optionally
    /// reserving `estimated_tokens` up front.
    pub async fn acquire(
        &self,
        service: &str,
        estimated_tokens: Option<u64>,
    ) -> Result<AcquireOutcome, OrchestratorError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(AcquireOutcome {
                granted: false,
                wait_hint: Some(Duration::from_secs(1)),
            });
        }

        let handle = self.service_handle(service).await?;
        // Per-service mutex serializes acquisitions in arrival order;
        // independent services proceed in parallel.
        let mut state = handle.lock().await;
        state.maybe_reset_window(&self.events, service);

        if let Some(until) = state.backoff_until {
            let now = Instant::now();
            if now < until {
                return Ok(AcquireOutcome {
                    granted: false,
                    wait_hint: Some(until - now),
                });
            }
            state.clear_backoff();
            self.events.publish(Event::BackoffCleared {
                service: service.to_string(),
            });
        }

        if let Some(tokens_per_day) = state.config.tokens_per_day {
            let estimated = estimated_tokens.unwrap_or(0);
            let projected = state.tokens_today + estimated;
            let fraction = projected as f64 / tokens_per_day as f64;
            if fraction >= 0.80 && !state.day_warning_emitted {
                state.day_warning_emitted = true;
                self.events.publish(Event::QuotaWarning {
                    service: service.to_string(),
                    fraction_used: fraction,
                });
            }
            if projected > tokens_per_day {
                return Err(OrchestratorError::QuotaExceeded(service.to_string()));
            }
        }

        if state.in_flight >= state.config.max_concurrent {
            return Ok(AcquireOutcome {
                granted: false,
                wait_hint: Some(state.min_spacing()),
            });
        }

        if let Some(last) = state.last_request_at {
            let elapsed = Instant::now().duration_since(last);
            let spacing = state.min_spacing();
            if elapsed < spacing {
                return Ok(AcquireOutcome {
                    granted: false,
                    wait_hint: Some(spacing - elapsed),
                });
            }
        }

        if state.requests_in_window >= state.reservoir_capacity() {
            self.events.publish(Event::QuotaDepleted {
                service: service.to_string(),
            });
            let backoff = state.arm_backoff();
            self.events.publish(Event::BackoffSet {
                service: service.to_string(),
                backoff_ms: backoff.as_millis() as u64,
            });
            return Ok(AcquireOutcome {
                granted: false,
                wait_hint: Some(backoff),
            });
        }

        if let Some(tokens_per_window) = state.config.tokens_per_window {
            let estimated = estimated_tokens.unwrap_or(0);
            let allowed = tokens_per_window as f64 * (1.0 - state.config.reserve_fraction);
            if state.tokens_in_window as f64 + estimated as f64 > allowed {
                return Ok(AcquireOutcome {
                    granted: false,
                    wait_hint: Some(state.config.window),
                });
            }
        }

        state.requests_in_window += 1;
        state.in_flight += 1;
        state.last_request_at = Some(Instant::now());
        if let Some(estimated) = estimated_tokens {
            state.tokens_in_window += estimated;
        }

        Ok(AcquireOutcome {
            granted: true,
            wait_hint: None,
        })
    }

    /// `Record` — reports actual token usage (if any) and releases the
    /// in-flight concurrency slot taken by a prior `acquire`.
    pub async fn record(&self, service: &str, tokens_used: Option<u64>) {
        let Ok(handle) = self.service_handle(service).await else {
            warn!(service, "record called for invalid service name");
            return;
        };
        let mut state = handle.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
        if let Some(tokens) = tokens_used {
            state.tokens_today += tokens;
        }
    }

    /// `Status` — point-in-time snapshot of a service's quota.
    pub async fn status(&self, service: &str) -> Result<QuotaSnapshot, OrchestratorError> {
        let handle = self.service_handle(service).await?;
        let mut state = handle.lock().await;
        state.maybe_reset_window(&self.events, service);
        let backoff_remaining_ms = state
            .backoff_until
            .map(|until| until.saturating_duration_since(Instant::now()).as_millis() as u64)
            .unwrap_or(0);

        Ok(QuotaSnapshot {
            service: service.to_string(),
            requests_in_window: state.requests_in_window,
            request_limit: state.reservoir_capacity(),
            window_ms: state.config.window.as_millis() as u64,
            tokens_in_window: state.config.tokens_per_window.map(|_| state.tokens_in_window),
            token_limit: state.config.tokens_per_window,
            tokens_today: state.tokens_today,
            backoff_attempts: state.backoff_attempts,
            backoff_remaining_ms,
        })
    }

    /// Halts all service acquisitions until [`RateGovernor::resume`].
    pub fn emergency_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }
}
