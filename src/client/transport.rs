//! HTTP transport seam and the hyper-based implementation.
//!
//! # Responsibilities
//! - Send a built request and report exactly one outcome to its handler
//! - Own the fixed-size I/O runtime that completion callbacks run on
//! - Pool connections with an idle TTL so DNS rotation takes effect
//!
//! # Design Decisions
//! - Handlers are consumed by value: `on_result` and `on_error` are mutually exclusive
//! - A handler dropped without an outcome (runtime shutdown) is told `Shutdown`
//! - Response bodies are read fully, bounded by a size limit

use std::time::Duration;

use axum::body::Body;
use axum::http::header::CONTENT_LENGTH;
use axum::http::{HeaderValue, Request, Uri};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tokio::runtime::{Handle, Runtime};

use crate::client::error::{BuildError, TransportError};
use crate::client::request::RequestBuilder;
use crate::client::response::DownstreamResponse;
use crate::net::RoundRobinResolver;

/// Receives the outcome of one dispatched request.
pub trait CompletionHandler: Send {
    fn on_result(self: Box<Self>, response: DownstreamResponse);

    fn on_error(self: Box<Self>, error: TransportError);
}

/// Sends requests. Completion is reported to the handler, usually on another thread.
pub trait HttpTransport: Send + Sync {
    fn execute(&self, request: RequestBuilder, handler: Box<dyn CompletionHandler>);
}

/// Settings for `HyperTransport`.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub worker_threads: usize,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub connection_ttl: Duration,
    pub max_response_bytes: usize,
    pub resolver: RoundRobinResolver,
}

/// hyper-util pooled client running on its own multi-thread runtime.
pub struct HyperTransport {
    runtime: Option<Runtime>,
    handle: Handle,
    client: Client<HttpConnector<RoundRobinResolver>, Body>,
    request_timeout: Duration,
    max_response_bytes: usize,
}

impl HyperTransport {
    pub fn new(settings: TransportSettings) -> Result<Self, BuildError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(settings.worker_threads.max(1))
            .thread_name("downstream-io")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        let client = {
            let _entered = runtime.enter();
            let mut connector = HttpConnector::new_with_resolver(settings.resolver);
            connector.set_connect_timeout(Some(settings.connect_timeout));
            connector.set_nodelay(true);

            Client::builder(TokioExecutor::new())
                .pool_timer(TokioTimer::new())
                .timer(TokioTimer::new())
                .pool_idle_timeout(settings.connection_ttl)
                .build(connector)
        };

        tracing::debug!(
            worker_threads = settings.worker_threads,
            request_timeout_ms = settings.request_timeout.as_millis() as u64,
            connection_ttl_ms = settings.connection_ttl.as_millis() as u64,
            "Downstream transport started"
        );

        Ok(Self {
            runtime: Some(runtime),
            handle,
            client,
            request_timeout: settings.request_timeout,
            max_response_bytes: settings.max_response_bytes,
        })
    }

    /// Handle of the I/O runtime that completion callbacks run on.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl HttpTransport for HyperTransport {
    fn execute(&self, request: RequestBuilder, handler: Box<dyn CompletionHandler>) {
        let mut handler = PendingHandler(Some(handler));

        let request = match into_hyper_request(request) {
            Ok(request) => request,
            Err(e) => {
                handler.error(e);
                return;
            }
        };

        let client = self.client.clone();
        let timeout = self.request_timeout;
        let limit = self.max_response_bytes;

        self.handle.spawn(async move {
            let exchange = async {
                let response: hyper::Response<Incoming> = client.request(request).await?;
                let (parts, body) = response.into_parts();
                let body = axum::body::to_bytes(Body::new(body), limit)
                    .await
                    .map_err(TransportError::Body)?;
                Ok::<_, TransportError>(DownstreamResponse::new(parts.status, parts.headers, body))
            };

            match tokio::time::timeout(timeout, exchange).await {
                Ok(Ok(response)) => handler.result(response),
                Ok(Err(e)) => handler.error(e),
                Err(_) => handler.error(TransportError::Timeout(timeout)),
            }
        });
    }
}

impl Drop for HyperTransport {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn into_hyper_request(builder: RequestBuilder) -> Result<Request<Body>, TransportError> {
    let (method, url, mut headers, body, permits_body) = builder.into_parts();
    let uri: Uri = url
        .parse()
        .map_err(|e| TransportError::InvalidRequest(format!("invalid uri '{url}': {e}")))?;

    if permits_body && body.is_empty() && !headers.contains_key(CONTENT_LENGTH) {
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    }

    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::from(body))
        .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
    *request.headers_mut() = headers;
    Ok(request)
}

/// Makes sure a handler hears about its call even if the task is dropped.
struct PendingHandler(Option<Box<dyn CompletionHandler>>);

impl PendingHandler {
    fn result(&mut self, response: DownstreamResponse) {
        if let Some(handler) = self.0.take() {
            handler.on_result(response);
        }
    }

    fn error(&mut self, error: TransportError) {
        if let Some(handler) = self.0.take() {
            handler.on_error(error);
        }
    }
}

impl Drop for PendingHandler {
    fn drop(&mut self) {
        if let Some(handler) = self.0.take() {
            tracing::debug!("Downstream call abandoned before completing");
            handler.on_error(TransportError::Shutdown);
        }
    }
}
