//! Per-dependency circuit breaker
//!
//! ```text
//! closed --(failures >= threshold)--> open --(now >= opened_until)--> half-open
//!    ^                                  ^                                 |
//!    +--------- probe succeeds ---------+---------- probe fails ----------+
//! ```
//!
//! Half-open admits exactly one probe; concurrent callers fail fast until
//! the probe resolves. Only errors where `counts_toward_breaker()` holds are
//! tallied; a not-found answer proves the transport works and resets the
//! tally like a success.

use chrono::{DateTime, Utc};
use serde::Serialize;
use setlist_common::config::BreakerConfig;
use setlist_common::events::{EventBus, ImportEvent};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::adapters::Dependency;
use crate::error::{ImportError, ImportResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub dependency: Dependency,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_until: Option<DateTime<Utc>>,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    opened_until: Option<Instant>,
    opened_until_wall: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    dependency: Dependency,
    failure_threshold: u32,
    open_duration: Duration,
    inner: Mutex<Inner>,
    events: Option<EventBus>,
}

/// Outcome of asking the breaker for permission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// Releases the half-open probe slot if the probing future is dropped
/// before reporting back (timeout or cancellation of the caller).
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(dependency: Dependency, config: &BreakerConfig) -> Self {
        Self {
            dependency,
            failure_threshold: config.failure_threshold.max(1),
            open_duration: Duration::from_millis(config.open_duration_ms),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                opened_until: None,
                opened_until_wall: None,
                probe_in_flight: false,
            }),
            events: None,
        }
    }

    /// Publish state transitions on `bus`
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn dependency(&self) -> Dependency {
        self.dependency
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State stays consistent across a panic: every mutation is a plain
        // field assignment.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.lock();
        self.maybe_transition_to_half_open(&mut inner);
        BreakerSnapshot {
            dependency: self.dependency,
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
            opened_until: inner.opened_until_wall,
        }
    }

    /// Run `f` under breaker protection
    ///
    /// Fails fast with `ImportError::CircuitOpen` without invoking `f` while
    /// open or while another caller holds the half-open probe.
    pub async fn call<F, Fut, T>(&self, f: F) -> ImportResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ImportResult<T>>,
    {
        let admission = self.admit()?;
        let mut slot = ProbeSlot {
            breaker: self,
            armed: admission == Admission::Probe,
        };

        let result = f().await;
        slot.armed = false;

        match &result {
            Err(e) if e.counts_toward_breaker() => self.record_failure(),
            _ => self.record_success(),
        }
        result
    }

    fn admit(&self) -> ImportResult<Admission> {
        let mut inner = self.lock();
        self.maybe_transition_to_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => Err(ImportError::CircuitOpen {
                dependency: self.dependency,
            }),
            CircuitState::HalfOpen if inner.probe_in_flight => Err(ImportError::CircuitOpen {
                dependency: self.dependency,
            }),
            CircuitState::HalfOpen => {
                inner.probe_in_flight = true;
                Ok(Admission::Probe)
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;

        if inner.state != CircuitState::Closed {
            inner.state = CircuitState::Closed;
            inner.opened_until = None;
            inner.opened_until_wall = None;
            drop(inner);
            info!(dependency = %self.dependency, "Circuit closed");
            self.publish(CircuitState::Closed);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_at = Some(Utc::now());
        inner.probe_in_flight = false;

        let should_open = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.failure_threshold,
            CircuitState::Open => false,
        };

        if should_open {
            inner.state = CircuitState::Open;
            inner.opened_until = Some(Instant::now() + self.open_duration);
            inner.opened_until_wall = chrono::Duration::from_std(self.open_duration)
                .ok()
                .map(|d| Utc::now() + d);
            let failures = inner.consecutive_failures;
            drop(inner);
            warn!(
                dependency = %self.dependency,
                consecutive_failures = failures,
                open_for_ms = self.open_duration.as_millis() as u64,
                "Circuit opened"
            );
            self.publish(CircuitState::Open);
        }
    }

    fn maybe_transition_to_half_open(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Open {
            return;
        }
        if let Some(until) = inner.opened_until {
            if Instant::now() >= until {
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = false;
                info!(dependency = %self.dependency, "Circuit half-open, next call probes");
                self.publish(CircuitState::HalfOpen);
            }
        }
    }

    fn publish(&self, state: CircuitState) {
        if let Some(bus) = &self.events {
            bus.emit_lossy(ImportEvent::CircuitStateChanged {
                dependency: self.dependency.to_string(),
                state: state.as_str().to_string(),
                timestamp: Utc::now(),
            });
        }
    }
}

/// One breaker per upstream dependency
#[derive(Clone)]
pub struct BreakerRegistry {
    breakers: Arc<HashMap<Dependency, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: &BreakerConfig, events: Option<EventBus>) -> Self {
        let breakers = Dependency::all()
            .into_iter()
            .map(|dep| {
                let mut breaker = CircuitBreaker::new(dep, config);
                if let Some(bus) = &events {
                    breaker = breaker.with_events(bus.clone());
                }
                (dep, Arc::new(breaker))
            })
            .collect();
        Self {
            breakers: Arc::new(breakers),
        }
    }

    pub fn get(&self, dependency: Dependency) -> Arc<CircuitBreaker> {
        // Populated for every variant in `new`
        match self.breakers.get(&dependency) {
            Some(breaker) => Arc::clone(breaker),
            None => Arc::new(CircuitBreaker::new(dependency, &BreakerConfig::default())),
        }
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        Dependency::all()
            .into_iter()
            .map(|dep| self.get(dep).snapshot())
            .collect()
    }
}
