//! Chooses the circuit breaker (if any) that guards a downstream call.

use std::sync::Arc;

use crate::client::request::DownstreamRequest;
use crate::client::response::DownstreamResponse;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerDelegate};
use crate::resilience::registry::CircuitBreakerRegistry;
use crate::resilience::scheduler::Scheduler;

/// Breaker guarding calls that produce a `DownstreamResponse`.
pub type ResponseBreaker = Arc<dyn CircuitBreaker<DownstreamResponse>>;

/// Picks the breaker for a request.
///
/// Precedence: breaking disabled → none; custom breaker → that breaker;
/// otherwise the registry's default breaker for the request's host.
#[derive(Clone)]
pub struct CircuitBreakerSelector {
    registry: Arc<CircuitBreakerRegistry>,
}

impl CircuitBreakerSelector {
    pub fn new(registry: Arc<CircuitBreakerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.registry
    }

    pub fn select(&self, request: &DownstreamRequest) -> Option<ResponseBreaker> {
        if request.circuit_breaking_disabled() {
            return None;
        }

        if let Some(custom) = request.custom_circuit_breaker() {
            return Some(custom.clone());
        }

        let scheduler = Scheduler::for_affinity(request.bound_affinity());
        let default_breaker = self
            .registry
            .get_or_create_for_host(request.host(), scheduler);

        Some(Arc::new(CircuitBreakerDelegate::<DownstreamResponse, u16>::new(
            Arc::new(default_breaker) as Arc<dyn CircuitBreaker<u16>>,
            DownstreamResponse::status_code,
        )))
    }
}

impl Default for CircuitBreakerSelector {
    fn default() -> Self {
        Self::new(CircuitBreakerRegistry::global())
    }
}
