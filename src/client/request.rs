//! Outbound request model.
//!
//! # Responsibilities
//! - Build requests through a method → builder factory table
//! - Carry breaker settings and the optional worker affinity with the request
//! - Keep the request's URL/method and its builder in sync

use std::fmt;

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use url::Url;

use crate::client::error::{BoxError, CallError};
use crate::resilience::scheduler::WorkerAffinity;
use crate::resilience::selector::ResponseBreaker;

/// Mutable description of an HTTP request that has not been sent yet.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Bytes,
    permits_body: bool,
}

impl RequestBuilder {
    fn with_method(method: Method, url: String, permits_body: bool) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            permits_body,
        }
    }

    pub fn get(url: String) -> Self {
        Self::with_method(Method::GET, url, false)
    }

    pub fn head(url: String) -> Self {
        Self::with_method(Method::HEAD, url, false)
    }

    pub fn delete(url: String) -> Self {
        Self::with_method(Method::DELETE, url, false)
    }

    pub fn options(url: String) -> Self {
        Self::with_method(Method::OPTIONS, url, false)
    }

    pub fn trace(url: String) -> Self {
        Self::with_method(Method::TRACE, url, false)
    }

    pub fn connect(url: String) -> Self {
        Self::with_method(Method::CONNECT, url, false)
    }

    pub fn post(url: String) -> Self {
        Self::with_method(Method::POST, url, true)
    }

    pub fn put(url: String) -> Self {
        Self::with_method(Method::PUT, url, true)
    }

    pub fn patch(url: String) -> Self {
        Self::with_method(Method::PATCH, url, true)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    /// Whether this builder sends an (possibly empty) entity body.
    pub fn permits_body(&self) -> bool {
        self.permits_body
    }

    /// Set a header, replacing any existing values.
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) -> &mut Self {
        self.headers.insert(name, value);
        self
    }

    /// Set a header from strings.
    pub fn header(&mut self, name: &str, value: &str) -> Result<&mut Self, BoxError> {
        let name = HeaderName::from_bytes(name.as_bytes())?;
        let value = HeaderValue::from_str(value)?;
        Ok(self.set_header(name, value))
    }

    pub fn body(&mut self, body: impl Into<Bytes>) -> &mut Self {
        self.body = body.into();
        self
    }

    /// Serialize `value` as the JSON body and set the content type.
    pub fn json<T: serde::Serialize>(&mut self, value: &T) -> Result<&mut Self, serde_json::Error> {
        let encoded = serde_json::to_vec(value)?;
        self.headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.body = Bytes::from(encoded);
        Ok(self)
    }

    pub(crate) fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub(crate) fn set_url(&mut self, url: String) {
        self.url = url;
    }

    pub(crate) fn into_parts(self) -> (Method, String, HeaderMap, Bytes, bool) {
        (self.method, self.url, self.headers, self.body, self.permits_body)
    }
}

type BuilderFactory = fn(String) -> RequestBuilder;

const BUILDER_FACTORIES: &[(&str, BuilderFactory)] = &[
    ("CONNECT", RequestBuilder::connect),
    ("DELETE", RequestBuilder::delete),
    ("GET", RequestBuilder::get),
    ("HEAD", RequestBuilder::head),
    ("POST", RequestBuilder::post),
    ("OPTIONS", RequestBuilder::options),
    ("PUT", RequestBuilder::put),
    ("PATCH", RequestBuilder::patch),
    ("TRACE", RequestBuilder::trace),
];

/// Builder for `method`. Non-standard verbs get a POST-style builder with the verb forced onto it.
pub fn builder_for(method: &Method, url: String) -> RequestBuilder {
    if let Some((_, factory)) = BUILDER_FACTORIES
        .iter()
        .find(|(name, _)| *name == method.as_str())
    {
        return factory(url);
    }

    tracing::warn!(
        method = %method,
        url = %url,
        "Non-standard HTTP method; using a generic POST-style builder with the method forced onto it"
    );
    let mut builder = RequestBuilder::post(url);
    builder.set_method(method.clone());
    builder
}

/// A downstream call waiting to be executed.
pub struct DownstreamRequest {
    url: String,
    host: String,
    http_method: Method,
    builder: RequestBuilder,
    custom_circuit_breaker: Option<ResponseBreaker>,
    circuit_breaking_disabled: bool,
    bound_affinity: Option<WorkerAffinity>,
}

impl DownstreamRequest {
    /// Validate `url`, parse `method` and create the matching builder.
    pub fn new(url: impl Into<String>, method: &str) -> Result<Self, CallError> {
        let url = url.into();
        let http_method = parse_method(method)?;
        let host = host_of(&url)?;
        let builder = builder_for(&http_method, url.clone());
        Ok(Self {
            url,
            host,
            http_method,
            builder,
            custom_circuit_breaker: None,
            circuit_breaking_disabled: false,
            bound_affinity: None,
        })
    }

    pub fn with_custom_circuit_breaker(mut self, breaker: Option<ResponseBreaker>) -> Self {
        self.custom_circuit_breaker = breaker;
        self
    }

    pub fn with_circuit_breaking_disabled(mut self, disabled: bool) -> Self {
        self.circuit_breaking_disabled = disabled;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Host component of the URL, used to key the default circuit breaker.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn http_method(&self) -> &Method {
        &self.http_method
    }

    pub fn builder(&self) -> &RequestBuilder {
        &self.builder
    }

    /// The underlying builder, for setting headers and body.
    pub fn builder_mut(&mut self) -> &mut RequestBuilder {
        &mut self.builder
    }

    /// Point the request (and its builder) at a new URL.
    pub fn set_url(&mut self, url: impl Into<String>) -> Result<(), CallError> {
        let url = url.into();
        self.host = host_of(&url)?;
        self.builder.set_url(url.clone());
        self.url = url;
        Ok(())
    }

    /// Change the method on the request and its builder.
    pub fn set_http_method(&mut self, method: Method) {
        self.builder.set_method(method.clone());
        self.http_method = method;
    }

    pub fn custom_circuit_breaker(&self) -> Option<&ResponseBreaker> {
        self.custom_circuit_breaker.as_ref()
    }

    pub fn set_custom_circuit_breaker(&mut self, breaker: Option<ResponseBreaker>) {
        self.custom_circuit_breaker = breaker;
    }

    pub fn circuit_breaking_disabled(&self) -> bool {
        self.circuit_breaking_disabled
    }

    pub fn set_circuit_breaking_disabled(&mut self, disabled: bool) {
        self.circuit_breaking_disabled = disabled;
    }

    pub fn bound_affinity(&self) -> Option<&WorkerAffinity> {
        self.bound_affinity.as_ref()
    }

    /// Bind the call to an I/O worker. Only the first binding sticks; returns
    /// whether this call attached it.
    pub fn bind_affinity(&mut self, affinity: WorkerAffinity) -> bool {
        if self.bound_affinity.is_some() {
            return false;
        }
        self.bound_affinity = Some(affinity);
        true
    }

    /// Method and URL only; never the body.
    pub fn summary(&self) -> RequestSummary {
        RequestSummary {
            method: Some(self.http_method.as_str().to_string()),
            url: Some(self.url.clone()),
        }
    }

    pub(crate) fn into_builder(self) -> RequestBuilder {
        self.builder
    }
}

impl fmt::Debug for DownstreamRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownstreamRequest")
            .field("url", &self.url)
            .field("http_method", &self.http_method)
            .field("custom_circuit_breaker", &self.custom_circuit_breaker.is_some())
            .field("circuit_breaking_disabled", &self.circuit_breaking_disabled)
            .field("bound_affinity", &self.bound_affinity.is_some())
            .finish()
    }
}

/// Copy of the parts of a request that naming and logging need.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestSummary {
    pub method: Option<String>,
    pub url: Option<String>,
}

impl RequestSummary {
    /// Path component of the URL, if it parses.
    pub fn path(&self) -> Option<String> {
        let url = self.url.as_deref()?;
        Url::parse(url).ok().map(|u| u.path().to_string())
    }
}

/// Last-step hook that may rewrite a request before it is sent (e.g. to sign it).
pub trait RequestSigner: Send + Sync {
    fn sign(&self, builder: &mut RequestBuilder) -> Result<(), BoxError>;
}

fn parse_method(method: &str) -> Result<Method, CallError> {
    Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
        .map_err(|e| CallError::Setup(format!("invalid HTTP method '{method}': {e}")))
}

fn host_of(url: &str) -> Result<String, CallError> {
    let invalid = |reason: String| CallError::InvalidUrl {
        url: url.to_string(),
        reason,
    };
    let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", parsed.scheme())));
    }
    parsed
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase())
        .ok_or_else(|| invalid("missing host".to_string()))
}
