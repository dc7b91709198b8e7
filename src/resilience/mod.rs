//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Downstream call setup:
//!     → selector.rs (disabled? custom breaker? default breaker for the host)
//!     → registry.rs (get-or-create the per-host default breaker)
//!     → circuit_breaker.rs (fresh manual mode task; fail fast when open)
//!
//! Downstream call completion:
//!     → manual mode task notified exactly once (event or exception)
//!     → scheduler.rs delivers state-change notifications
//! ```
//!
//! # Design Decisions
//! - Per-host breaker by default; callers may supply their own or opt out
//! - Fail fast in Open state; a single trial call is let through in Half-Open
//! - Only HTTP 5xx statuses count as failures for default breakers

pub mod circuit_breaker;
pub mod registry;
pub mod scheduler;
pub mod selector;

pub use circuit_breaker::{
    BreakerError, BreakerOpenError, BreakerState, CircuitBreaker, CircuitBreakerDelegate,
    DefaultCircuitBreaker, ManualModeTask,
};
pub use registry::CircuitBreakerRegistry;
pub use scheduler::{Scheduler, WorkerAffinity};
pub use selector::CircuitBreakerSelector;
