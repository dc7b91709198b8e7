//! Manual-mode circuit breaker.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: target assumed down, calls fail fast
//! - Half-Open: one trial call is let through to test recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= failure_threshold
//! Open → Half-Open: reset_timeout elapsed, next call becomes the trial
//! Half-Open → Closed: trial succeeds
//! Half-Open → Open: trial fails
//! ```
//!
//! Callers drive the breaker by hand: one `ManualModeTask` per call, checked
//! with `fail_if_open` before dispatch and told about exactly one outcome
//! afterwards.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::client::error::CallError;
use crate::config::CircuitBreakerConfig;
use crate::observability::metrics;
use crate::resilience::scheduler::Scheduler;

/// The breaker refused the call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker '{breaker_id}' is open")]
pub struct BreakerOpenError {
    pub breaker_id: String,
}

/// The breaker could not record an outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BreakerError {
    #[error("an outcome was already reported to breaker '{0}' for this call")]
    AlreadyReported(String),

    #[error("circuit breaker malfunction: {0}")]
    Malfunction(String),
}

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    /// Gauge value exported for the state.
    pub fn as_gauge(&self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::HalfOpen => 1.0,
            BreakerState::Open => 2.0,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A breaker guarding calls whose outcomes are events of type `E`.
pub trait CircuitBreaker<E>: Send + Sync {
    /// A fresh per-call handle into this breaker.
    fn new_manual_mode_task(&self) -> Box<dyn ManualModeTask<E>>;
}

/// Per-call handle used to consult a breaker and report one outcome.
pub trait ManualModeTask<E>: Send {
    fn fail_if_open(&mut self) -> Result<(), BreakerOpenError>;

    fn handle_event(&mut self, event: &E) -> Result<(), BreakerError>;

    fn handle_exception(&mut self, error: &CallError) -> Result<(), BreakerError>;
}

type FailurePredicate<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;
type StateListener = Arc<dyn Fn(&str, BreakerState) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { opened_at: Instant },
    /// `trial` identifies the task allowed to decide the next state.
    HalfOpen { trial_started: Instant, trial: u64 },
}

impl State {
    fn public(&self) -> BreakerState {
        match self {
            State::Closed { .. } => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }
}

struct BreakerInner<E> {
    id: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    call_timeout: Option<Duration>,
    scheduler: Scheduler,
    is_failure: FailurePredicate<E>,
    state: Mutex<State>,
    trials: AtomicU64,
    listeners: Mutex<Vec<StateListener>>,
}

/// Consecutive-failure breaker with a single half-open trial.
pub struct DefaultCircuitBreaker<E> {
    inner: Arc<BreakerInner<E>>,
}

impl<E> Clone for DefaultCircuitBreaker<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: 'static> DefaultCircuitBreaker<E> {
    /// Create a breaker. `is_failure` decides which events count against the target.
    pub fn new(
        id: impl Into<String>,
        config: &CircuitBreakerConfig,
        scheduler: Scheduler,
        is_failure: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(BreakerInner {
                id: id.into(),
                failure_threshold: config.failure_threshold.max(1),
                reset_timeout: config.reset_timeout(),
                call_timeout: config.call_timeout(),
                scheduler,
                is_failure: Box::new(is_failure),
                state: Mutex::new(State::Closed {
                    consecutive_failures: 0,
                }),
                trials: AtomicU64::new(0),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock_state().public()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Register a callback for state changes. Callbacks run on the breaker's scheduler.
    pub fn on_state_change(&self, listener: impl Fn(&str, BreakerState) + Send + Sync + 'static) {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }
}

impl<E> BreakerInner<E> {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a call. Returns the trial id when the call is the half-open trial.
    fn try_acquire(&self) -> Result<Option<u64>, BreakerOpenError> {
        let mut state = self.lock_state();
        match *state {
            State::Closed { .. } => Ok(None),
            State::Open { opened_at } if opened_at.elapsed() >= self.reset_timeout => {
                let trial = self.trials.fetch_add(1, Ordering::Relaxed);
                *state = State::HalfOpen {
                    trial_started: Instant::now(),
                    trial,
                };
                drop(state);
                self.transitioned(BreakerState::HalfOpen);
                Ok(Some(trial))
            }
            // A trial that never reported back must not wedge the breaker.
            State::HalfOpen { trial_started, .. } if trial_started.elapsed() >= self.reset_timeout => {
                let trial = self.trials.fetch_add(1, Ordering::Relaxed);
                *state = State::HalfOpen {
                    trial_started: Instant::now(),
                    trial,
                };
                Ok(Some(trial))
            }
            State::Open { .. } | State::HalfOpen { .. } => Err(BreakerOpenError {
                breaker_id: self.id.clone(),
            }),
        }
    }

    /// Apply one call outcome. In half-open only the current trial's outcome counts.
    fn record(&self, failed: bool, trial: Option<u64>) {
        let mut state = self.lock_state();
        let next = match (*state, failed) {
            (State::Closed { .. }, false) => State::Closed {
                consecutive_failures: 0,
            },
            (State::Closed { consecutive_failures }, true) => {
                let consecutive_failures = consecutive_failures.saturating_add(1);
                if consecutive_failures >= self.failure_threshold {
                    State::Open {
                        opened_at: Instant::now(),
                    }
                } else {
                    State::Closed {
                        consecutive_failures,
                    }
                }
            }
            // Late outcomes from calls admitted before the breaker opened.
            (half_open @ State::HalfOpen { trial: current, .. }, _) if trial != Some(current) => half_open,
            (State::HalfOpen { .. }, false) => State::Closed {
                consecutive_failures: 0,
            },
            (State::HalfOpen { .. }, true) => State::Open {
                opened_at: Instant::now(),
            },
            // Late outcomes from calls dispatched before the breaker opened.
            (open @ State::Open { .. }, _) => open,
        };

        let changed = next.public() != state.public();
        *state = next;
        drop(state);

        if changed {
            self.transitioned(next.public());
        }
    }

    fn transitioned(&self, to: BreakerState) {
        match to {
            BreakerState::Open => tracing::warn!(breaker = %self.id, state = %to, "Circuit breaker opened"),
            _ => tracing::info!(breaker = %self.id, state = %to, "Circuit breaker state changed"),
        }
        metrics::record_breaker_state(&self.id, to);

        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if listeners.is_empty() {
            return;
        }
        let id = self.id.clone();
        self.scheduler.execute(move || {
            for listener in &listeners {
                listener(&id, to);
            }
        });
    }
}

impl<E: 'static> CircuitBreaker<E> for DefaultCircuitBreaker<E> {
    fn new_manual_mode_task(&self) -> Box<dyn ManualModeTask<E>> {
        Box::new(DefaultManualModeTask {
            breaker: self.inner.clone(),
            started_at: Instant::now(),
            trial: None,
            reported: false,
        })
    }
}

struct DefaultManualModeTask<E> {
    breaker: Arc<BreakerInner<E>>,
    started_at: Instant,
    trial: Option<u64>,
    reported: bool,
}

impl<E> DefaultManualModeTask<E> {
    fn report(&mut self, failed: bool) -> Result<(), BreakerError> {
        if self.reported {
            return Err(BreakerError::AlreadyReported(self.breaker.id.clone()));
        }
        self.reported = true;
        self.breaker.record(failed, self.trial);
        Ok(())
    }

    fn timed_out(&self) -> bool {
        self.breaker
            .call_timeout
            .is_some_and(|limit| self.started_at.elapsed() > limit)
    }
}

impl<E: 'static> ManualModeTask<E> for DefaultManualModeTask<E> {
    fn fail_if_open(&mut self) -> Result<(), BreakerOpenError> {
        self.started_at = Instant::now();
        self.trial = self.breaker.try_acquire()?;
        Ok(())
    }

    fn handle_event(&mut self, event: &E) -> Result<(), BreakerError> {
        let failed = self.timed_out() || (self.breaker.is_failure)(event);
        self.report(failed)
    }

    fn handle_exception(&mut self, _error: &CallError) -> Result<(), BreakerError> {
        self.report(true)
    }
}

/// Adapts a breaker over events `D` to calls producing events `E`.
pub struct CircuitBreakerDelegate<E, D> {
    delegate: Arc<dyn CircuitBreaker<D>>,
    mapper: Arc<dyn Fn(&E) -> D + Send + Sync>,
}

impl<E, D> CircuitBreakerDelegate<E, D> {
    pub fn new(
        delegate: Arc<dyn CircuitBreaker<D>>,
        mapper: impl Fn(&E) -> D + Send + Sync + 'static,
    ) -> Self {
        Self {
            delegate,
            mapper: Arc::new(mapper),
        }
    }
}

impl<E: 'static, D: 'static> CircuitBreaker<E> for CircuitBreakerDelegate<E, D> {
    fn new_manual_mode_task(&self) -> Box<dyn ManualModeTask<E>> {
        Box::new(DelegateTask {
            task: self.delegate.new_manual_mode_task(),
            mapper: self.mapper.clone(),
        })
    }
}

struct DelegateTask<E, D> {
    task: Box<dyn ManualModeTask<D>>,
    mapper: Arc<dyn Fn(&E) -> D + Send + Sync>,
}

impl<E: 'static, D: 'static> ManualModeTask<E> for DelegateTask<E, D> {
    fn fail_if_open(&mut self) -> Result<(), BreakerOpenError> {
        self.task.fail_if_open()
    }

    fn handle_event(&mut self, event: &E) -> Result<(), BreakerError> {
        let mapped = (self.mapper)(event);
        self.task.handle_event(&mapped)
    }

    fn handle_exception(&mut self, error: &CallError) -> Result<(), BreakerError> {
        self.task.handle_exception(error)
    }
}
