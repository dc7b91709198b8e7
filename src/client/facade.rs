//! The client applications hold.
//!
//! # Responsibilities
//! - Build the transport with no ambient tracing context on the building thread
//! - Create requests (`new_request`) that route through the round-robin resolver
//! - Funnel the three `execute` flavours into the completion orchestrator

use std::sync::Arc;
use std::time::Duration;

use crate::client::completion::{CompletionOrchestrator, ResponseHandler};
use crate::client::error::{BoxError, BuildError, CallError};
use crate::client::future::CallFuture;
use crate::client::naming::{DefaultSpanNamingAndTaggingStrategy, SpanNamingAndTaggingStrategy};
use crate::client::processing_state::ProcessingState;
use crate::client::request::{DownstreamRequest, RequestSigner};
use crate::client::response::DownstreamResponse;
use crate::client::transport::{HttpTransport, HyperTransport, TransportSettings};
use crate::config::{ClientConfig, HttpClientConfig};
use crate::context::ContextSnapshot;
use crate::net::RoundRobinResolver;
use crate::resilience::registry::CircuitBreakerRegistry;
use crate::resilience::selector::{CircuitBreakerSelector, ResponseBreaker};

/// Traced, circuit-broken asynchronous HTTP client.
///
/// Create one per process (or per category of downstream with distinct pool
/// requirements); each instance owns its own I/O runtime and connection pool.
pub struct DownstreamClient {
    orchestrator: CompletionOrchestrator,
}

impl DownstreamClient {
    pub fn builder() -> DownstreamClientBuilder {
        DownstreamClientBuilder::default()
    }

    /// A client with default settings.
    pub fn new() -> Result<Self, BuildError> {
        Self::builder().build()
    }

    /// Start a request guarded by the default breaker for its host.
    pub fn new_request(&self, url: impl Into<String>, method: &str) -> Result<DownstreamRequest, CallError> {
        self.new_request_with_breaker(url, method, None, false)
    }

    /// Start a request with a custom breaker, or with circuit breaking disabled.
    pub fn new_request_with_breaker(
        &self,
        url: impl Into<String>,
        method: &str,
        custom_circuit_breaker: Option<ResponseBreaker>,
        disable_circuit_breaker: bool,
    ) -> Result<DownstreamRequest, CallError> {
        Ok(DownstreamRequest::new(url, method)?
            .with_custom_circuit_breaker(custom_circuit_breaker)
            .with_circuit_breaking_disabled(disable_circuit_breaker))
    }

    /// Execute under the current thread's tracing and logging context.
    pub fn execute<T, F>(&self, request: DownstreamRequest, handler: F) -> CallFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(DownstreamResponse) -> Result<T, BoxError> + Send + 'static,
    {
        self.orchestrator
            .execute(request, Box::new(handler), ContextSnapshot::capture())
    }

    /// Execute under the context of the request being served, binding the
    /// call's breaker bookkeeping to that request's I/O worker.
    ///
    /// Fails the returned future with `MissingProcessingState` if `state` is absent.
    pub fn execute_in_context<T, F>(
        &self,
        mut request: DownstreamRequest,
        handler: F,
        state: Option<&ProcessingState>,
    ) -> CallFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(DownstreamResponse) -> Result<T, BoxError> + Send + 'static,
    {
        let Some(state) = state else {
            tracing::error!(
                method = %request.http_method(),
                url = %request.url(),
                "Cannot execute downstream call: no processing state supplied"
            );
            return CallFuture::failed(CallError::MissingProcessingState);
        };

        request.bind_affinity(state.affinity().clone());
        self.orchestrator
            .execute(request, Box::new(handler), state.snapshot())
    }

    /// Execute under an explicitly supplied context.
    pub fn execute_with_snapshot<T, F>(
        &self,
        request: DownstreamRequest,
        handler: F,
        snapshot: ContextSnapshot,
    ) -> CallFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(DownstreamResponse) -> Result<T, BoxError> + Send + 'static,
    {
        let handler: ResponseHandler<T> = Box::new(handler);
        self.orchestrator.execute(request, handler, snapshot)
    }

    pub fn subspans_enabled(&self) -> bool {
        self.orchestrator.subspans_enabled()
    }
}

/// Builder for `DownstreamClient`.
pub struct DownstreamClientBuilder {
    http: HttpClientConfig,
    strategy: Arc<dyn SpanNamingAndTaggingStrategy>,
    resolver: Option<RoundRobinResolver>,
    signer: Option<Arc<dyn RequestSigner>>,
    registry: Option<Arc<CircuitBreakerRegistry>>,
    transport: Option<Arc<dyn HttpTransport>>,
}

impl Default for DownstreamClientBuilder {
    fn default() -> Self {
        Self {
            http: HttpClientConfig::default(),
            strategy: Arc::new(DefaultSpanNamingAndTaggingStrategy),
            resolver: None,
            signer: None,
            registry: None,
            transport: None,
        }
    }
}

impl DownstreamClientBuilder {
    /// Settings from a loaded configuration, with a registry for its breaker settings.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            http: config.client.clone(),
            registry: Some(Arc::new(CircuitBreakerRegistry::new(
                config.circuit_breaker.clone(),
            ))),
            ..Self::default()
        }
    }

    /// Wrap each call in its own child span (default: on).
    pub fn perform_subspans(mut self, enabled: bool) -> Self {
        self.http.perform_subspans = enabled;
        self
    }

    pub fn span_naming_strategy(mut self, strategy: Arc<dyn SpanNamingAndTaggingStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.http.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.http.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// How long idle pooled connections live before they are re-established.
    pub fn connection_ttl(mut self, ttl: Duration) -> Self {
        self.http.connection_ttl_ms = ttl.as_millis() as u64;
        self
    }

    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.http.worker_threads = threads;
        self
    }

    pub fn max_response_bytes(mut self, limit: usize) -> Self {
        self.http.max_response_bytes = limit;
        self
    }

    pub fn resolver(mut self, resolver: RoundRobinResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn request_signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn circuit_breaker_registry(mut self, registry: Arc<CircuitBreakerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use `transport` instead of building a hyper transport.
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<DownstreamClient, BuildError> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                // The transport's worker threads must never start out wearing the
                // builder thread's trace.
                let _clean = ContextSnapshot::empty().attach();
                let settings = TransportSettings {
                    worker_threads: self.http.effective_worker_threads(),
                    request_timeout: self.http.request_timeout(),
                    connect_timeout: self.http.connect_timeout(),
                    connection_ttl: self.http.connection_ttl(),
                    max_response_bytes: self.http.max_response_bytes,
                    resolver: self.resolver.unwrap_or_else(RoundRobinResolver::shared_default),
                };
                Arc::new(HyperTransport::new(settings)?) as Arc<dyn HttpTransport>
            }
        };

        let registry = self.registry.unwrap_or_else(CircuitBreakerRegistry::global);

        Ok(DownstreamClient {
            orchestrator: CompletionOrchestrator::new(
                transport,
                CircuitBreakerSelector::new(registry),
                self.strategy,
                self.http.perform_subspans,
                self.signer,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::request::RequestBuilder;
    use crate::client::transport::CompletionHandler;
    use crate::context::{tracer, Span, SpanPurpose};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Parked {
        calls: Mutex<Vec<(RequestBuilder, Box<dyn CompletionHandler>)>>,
    }

    impl HttpTransport for Parked {
        fn execute(&self, request: RequestBuilder, handler: Box<dyn CompletionHandler>) {
            self.calls.lock().unwrap().push((request, handler));
        }
    }

    fn client(transport: Arc<Parked>) -> DownstreamClient {
        DownstreamClient::builder()
            .transport(transport)
            .circuit_breaker_registry(Arc::new(CircuitBreakerRegistry::default()))
            .build()
            .unwrap()
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(future)
    }

    #[test]
    fn test_new_request_with_breaker_settings() {
        let client = client(Arc::new(Parked::default()));
        let request = client
            .new_request_with_breaker("http://svc/x", "DELETE", None, true)
            .unwrap();
        assert!(request.circuit_breaking_disabled());
        assert_eq!(request.http_method().as_str(), "DELETE");
        assert!(client.new_request("::nope::", "GET").is_err());
    }

    #[test]
    fn test_missing_processing_state_fails_future() {
        let transport = Arc::new(Parked::default());
        let client = client(transport.clone());
        let request = client.new_request("http://svc/x", "GET").unwrap();

        let future = client.execute_in_context(request, |r: DownstreamResponse| Ok(r.status_code()), None);

        assert!(matches!(block_on(future), Err(CallError::MissingProcessingState)));
        assert!(transport.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_processing_state_supplies_context() {
        ContextSnapshot::clear();
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let serving = Span::new_root("serving", SpanPurpose::Server);
        let state = ProcessingState::new(
            vec![serving.clone()],
            Default::default(),
            crate::resilience::WorkerAffinity::new(runtime.handle().clone()),
        );
        let transport = Arc::new(Parked::default());
        let client = client(transport.clone());

        let request = client.new_request("http://svc/x", "GET").unwrap();
        let _future = client.execute_in_context(request, |r: DownstreamResponse| Ok(r.status_code()), Some(&state));

        let calls = transport.calls.lock().unwrap();
        let (builder, _) = &calls[0];
        assert_eq!(builder.headers()["x-b3-traceid"], serving.trace_id());
        assert_eq!(builder.headers()["x-b3-parentspanid"], serving.span_id());
        assert!(tracer::current_span().is_none());
    }

    #[test]
    fn test_build_leaves_caller_context_intact() {
        ContextSnapshot::clear();
        let ambient = tracer::start_span_in_current_context("building", SpanPurpose::Local);
        let client = DownstreamClient::builder().worker_threads(1).build().unwrap();
        assert!(client.subspans_enabled());
        assert_eq!(tracer::current_span(), Some(ambient));
        ContextSnapshot::clear();
    }
}
