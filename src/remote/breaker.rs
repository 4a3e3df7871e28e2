//! # Circuit Breaker
//!
//! Per-address fault isolation for remote dialing. Three states: Closed
//! (normal operation), Open (failing fast) and Half-Open (one trial call
//! allowed to test recovery).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::error::{CacheError, Result};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - all calls fail fast without executing
    Open,
    /// Testing recovery - a single call is allowed through
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    /// Open: when to move to half-open. Closed: when to reset the failure count.
    expiry: Option<Instant>,
    trial_in_flight: bool,
}

/// Circuit breaker guarding one remote address.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let name = name.into();
        debug!(
            component = %name,
            failure_threshold = config.failure_threshold,
            open_timeout_ms = config.open_timeout.as_millis() as u64,
            "circuit breaker created"
        );
        let now = Instant::now();
        let expiry = (!config.reset_interval.is_zero()).then(|| now + config.reset_interval);
        Self {
            name,
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                expiry,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, after applying any elapsed timers.
    pub fn state(&self) -> CircuitState {
        self.state_at(Instant::now())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Executes `operation` unless the circuit is open, recording its outcome.
    ///
    /// A call dropped before it completes counts as a failure, so a cancelled
    /// half-open trial reopens the circuit instead of holding the trial slot.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.before_call(Instant::now())?;
        let mut pending = PendingCall {
            breaker: self,
            recorded: false,
        };
        let result = operation().await;
        pending.recorded = true;
        self.after_call(result.is_ok(), Instant::now());
        result
    }

    fn state_at(&self, now: Instant) -> CircuitState {
        let mut inner = self.inner.lock();
        self.advance(&mut inner, now);
        inner.state
    }

    fn advance(&self, inner: &mut BreakerState, now: Instant) {
        match inner.state {
            CircuitState::Closed => {
                if let Some(expiry) = inner.expiry {
                    if expiry <= now {
                        inner.consecutive_failures = 0;
                        inner.expiry = Some(now + self.config.reset_interval);
                    }
                }
            }
            CircuitState::Open => {
                if inner.expiry.map_or(true, |expiry| expiry <= now) {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = false;
                    inner.expiry = None;
                    info!(component = %self.name, "circuit breaker half-open (testing recovery)");
                }
            }
            CircuitState::HalfOpen => {}
        }
    }

    fn before_call(&self, now: Instant) -> Result<()> {
        let mut inner = self.inner.lock();
        self.advance(&mut inner, now);
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Ok(())
            }
            CircuitState::HalfOpen | CircuitState::Open => Err(CacheError::CircuitOpen {
                address: self.name.clone(),
            }),
        }
    }

    fn after_call(&self, success: bool, now: Instant) {
        let mut inner = self.inner.lock();
        self.advance(&mut inner, now);
        match (inner.state, success) {
            (CircuitState::Closed, true) => {
                inner.consecutive_failures = 0;
            }
            (CircuitState::Closed, false) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.trip(&mut inner, now);
                }
            }
            (CircuitState::HalfOpen, true) => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.trial_in_flight = false;
                inner.expiry = (!self.config.reset_interval.is_zero())
                    .then(|| now + self.config.reset_interval);
                info!(component = %self.name, "circuit breaker closed (recovered)");
            }
            (CircuitState::HalfOpen, false) => {
                self.trip(&mut inner, now);
            }
            (CircuitState::Open, _) => {}
        }
    }

    fn trip(&self, inner: &mut BreakerState, now: Instant) {
        inner.state = CircuitState::Open;
        inner.trial_in_flight = false;
        inner.expiry = Some(now + self.config.open_timeout);
        warn!(
            component = %self.name,
            consecutive_failures = inner.consecutive_failures,
            failure_threshold = self.config.failure_threshold,
            open_timeout_ms = self.config.open_timeout.as_millis() as u64,
            "circuit breaker opened (failing fast)"
        );
    }
}

/// Records a failure for a call whose future was dropped mid-flight.
struct PendingCall<'a> {
    breaker: &'a CircuitBreaker,
    recorded: bool,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            debug!(component = %self.breaker.name, "breaker call abandoned");
            self.breaker.after_call(false, Instant::now());
        }
    }
}

// == Breaker Registry ==
/// Lazily created breakers keyed by remote address.
///
/// The map lock is only held for lookups; each breaker guards its own state.
#[derive(Debug)]
pub struct Breakers {
    config: BreakerConfig,
    by_address: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Breakers {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            by_address: Mutex::new(HashMap::new()),
        }
    }

    /// Breaker for `address`, or `None` when breakers are disabled.
    pub fn get(&self, address: &str) -> Option<Arc<CircuitBreaker>> {
        if self.config.failure_threshold == 0 {
            return None;
        }
        let mut map = self.by_address.lock();
        let breaker = map
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(address, self.config.clone())));
        Some(breaker.clone())
    }

    /// Drops breakers for addresses not in `current`, keeping the rest untouched.
    pub fn retain(&self, current: &[String]) {
        let mut map = self.by_address.lock();
        map.retain(|address, _| current.iter().any(|c| c == address));
    }

    pub fn len(&self) -> usize {
        self.by_address.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
