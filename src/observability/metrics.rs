//! Metrics collection and exposition.
//!
//! # Metrics
//! - `downstream_calls_total` (counter): calls by method, host, outcome
//! - `downstream_call_duration_seconds` (histogram): dispatch-to-completion latency
//! - `downstream_breaker_rejections_total` (counter): calls refused by an open breaker
//! - `downstream_breaker_state` (gauge): 0=closed, 1=half-open, 2=open

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::resilience::circuit_breaker::BreakerState;

/// Start the Prometheus scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

/// Outcome label for a finished call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    ServerError,
    Failure,
}

impl CallOutcome {
    pub fn for_status(status: u16) -> Self {
        if status >= 500 {
            CallOutcome::ServerError
        } else {
            CallOutcome::Success
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::ServerError => "server_error",
            CallOutcome::Failure => "failure",
        }
    }
}

pub fn record_call(method: &str, host: &str, outcome: CallOutcome, elapsed: Duration) {
    metrics::counter!(
        "downstream_calls_total",
        "method" => method.to_string(),
        "host" => host.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
    metrics::histogram!(
        "downstream_call_duration_seconds",
        "method" => method.to_string(),
        "host" => host.to_string()
    )
    .record(elapsed.as_secs_f64());
}

pub fn record_breaker_rejection(host: &str) {
    metrics::counter!("downstream_breaker_rejections_total", "host" => host.to_string()).increment(1);
}

pub fn record_breaker_state(breaker: &str, state: BreakerState) {
    metrics::gauge!("downstream_breaker_state", "breaker" => breaker.to_string()).set(state.as_gauge());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_for_status() {
        assert_eq!(CallOutcome::for_status(200), CallOutcome::Success);
        assert_eq!(CallOutcome::for_status(404), CallOutcome::Success);
        assert_eq!(CallOutcome::for_status(503), CallOutcome::ServerError);
    }
}
