//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Downstream calls produce:
//!     → logging.rs (structured log events, finished spans)
//!     → metrics.rs (call counters, latencies, breaker state)
//!     → propagation.rs (B3 headers on every outgoing request)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape, optional)
//!     → Downstream services continuing the trace
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Trace and span ids flow into every log line emitted during a call
//! - Metrics are cheap; recording without an installed exporter is a no-op

pub mod logging;
pub mod metrics;
pub mod propagation;
