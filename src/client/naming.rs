//! Span naming and tagging for downstream calls.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::client::error::CallError;
use crate::client::request::RequestSummary;
use crate::client::response::DownstreamResponse;
use crate::context::Span;

/// Prefix of generated subspan names.
pub const DEFAULT_SUBSPAN_PREFIX: &str = "async_downstream_call";

/// Stands in for the HTTP method when it is not known.
pub const UNKNOWN_HTTP_METHOD: &str = "UNKNOWN_HTTP_METHOD";

/// Value of the `span.handler` tag on subspans.
pub const SPAN_HANDLER_TAG_VALUE: &str = "downstream_http.client";

pub mod tags {
    pub const HTTP_METHOD: &str = "http.method";
    pub const HTTP_URL: &str = "http.url";
    pub const HTTP_PATH: &str = "http.path";
    pub const HTTP_STATUS_CODE: &str = "http.status_code";
    pub const ERROR: &str = "error";
    pub const SPAN_HANDLER: &str = "span.handler";
}

/// Pluggable naming and tagging of the subspan around a downstream call.
pub trait SpanNamingAndTaggingStrategy: Send + Sync {
    /// Name for the subspan. `None` or blank falls back to a generated name.
    fn initial_span_name(&self, request: &RequestSummary) -> Option<String>;

    fn handle_request_tagging(&self, span: &Span, request: &RequestSummary);

    /// Called once with either the response or the error, before the span is closed.
    fn handle_response_tagging_and_final_span_name(
        &self,
        span: &Span,
        request: &RequestSummary,
        response: Option<&DownstreamResponse>,
        error: Option<&CallError>,
    );
}

/// `"<prefix>-<METHOD>"`, with `UNKNOWN_HTTP_METHOD` standing in for a missing method.
pub fn fallback_span_name(prefix: &str, http_method: Option<&str>) -> String {
    let method = http_method
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(UNKNOWN_HTTP_METHOD);
    format!("{prefix}-{method}")
}

/// Name for a call's subspan: the strategy's choice, or the fallback when it has none.
pub fn subspan_name(strategy: &dyn SpanNamingAndTaggingStrategy, request: &RequestSummary) -> String {
    guarded("initial_span_name", || strategy.initial_span_name(request))
        .flatten()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| fallback_span_name(DEFAULT_SUBSPAN_PREFIX, request.method.as_deref()))
}

/// Run a strategy callback, containing any panic.
pub(crate) fn guarded<R>(operation: &'static str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(panic) => {
            tracing::error!(
                operation,
                panic = %panic_message(&*panic),
                "Span naming strategy panicked; ignoring"
            );
            None
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Zipkin-style tags; the method becomes the span name.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSpanNamingAndTaggingStrategy;

impl DefaultSpanNamingAndTaggingStrategy {
    fn method_or_unknown(request: &RequestSummary) -> &str {
        request
            .method
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(UNKNOWN_HTTP_METHOD)
    }
}

impl SpanNamingAndTaggingStrategy for DefaultSpanNamingAndTaggingStrategy {
    fn initial_span_name(&self, request: &RequestSummary) -> Option<String> {
        request.method.clone()
    }

    fn handle_request_tagging(&self, span: &Span, request: &RequestSummary) {
        if let Some(method) = &request.method {
            span.put_tag(tags::HTTP_METHOD, method.as_str());
        }
        if let Some(url) = &request.url {
            span.put_tag(tags::HTTP_URL, url.as_str());
        }
        if let Some(path) = request.path() {
            span.put_tag(tags::HTTP_PATH, path);
        }
        span.put_tag(tags::SPAN_HANDLER, SPAN_HANDLER_TAG_VALUE);
    }

    fn handle_response_tagging_and_final_span_name(
        &self,
        span: &Span,
        request: &RequestSummary,
        response: Option<&DownstreamResponse>,
        error: Option<&CallError>,
    ) {
        let status = response.map(DownstreamResponse::status_code);
        if let Some(status) = status {
            span.put_tag(tags::HTTP_STATUS_CODE, status.to_string());
        }

        match (error, status) {
            (Some(error), _) => span.put_tag(tags::ERROR, error.to_string()),
            (None, Some(status)) if !(100..500).contains(&status) => {
                span.put_tag(tags::ERROR, status.to_string())
            }
            _ => {}
        }

        let method = Self::method_or_unknown(request);
        match status {
            Some(300..=399) => span.set_name(format!("{method} redirected")),
            Some(404) => span.set_name(format!("{method} not_found")),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SpanPurpose;
    use axum::body::Bytes;
    use axum::http::{HeaderMap, StatusCode};

    struct Named(Option<&'static str>);

    impl SpanNamingAndTaggingStrategy for Named {
        fn initial_span_name(&self, _request: &RequestSummary) -> Option<String> {
            self.0.map(str::to_string)
        }

        fn handle_request_tagging(&self, _span: &Span, _request: &RequestSummary) {}

        fn handle_response_tagging_and_final_span_name(
            &self,
            _span: &Span,
            _request: &RequestSummary,
            _response: Option<&DownstreamResponse>,
            _error: Option<&CallError>,
        ) {
        }
    }

    struct Panicking;

    impl SpanNamingAndTaggingStrategy for Panicking {
        fn initial_span_name(&self, _request: &RequestSummary) -> Option<String> {
            panic!("naming exploded")
        }

        fn handle_request_tagging(&self, _span: &Span, _request: &RequestSummary) {}

        fn handle_response_tagging_and_final_span_name(
            &self,
            _span: &Span,
            _request: &RequestSummary,
            _response: Option<&DownstreamResponse>,
            _error: Option<&CallError>,
        ) {
        }
    }

    fn get_request() -> RequestSummary {
        RequestSummary {
            method: Some("GET".to_string()),
            url: Some("http://svc-a/x?q=1".to_string()),
        }
    }

    fn response(status: StatusCode) -> DownstreamResponse {
        DownstreamResponse::new(status, HeaderMap::new(), Bytes::new())
    }

    #[test]
    fn test_fallback_names() {
        assert_eq!(
            fallback_span_name(DEFAULT_SUBSPAN_PREFIX, Some("GET")),
            "async_downstream_call-GET"
        );
        assert_eq!(
            fallback_span_name(DEFAULT_SUBSPAN_PREFIX, None),
            "async_downstream_call-UNKNOWN_HTTP_METHOD"
        );
        assert_eq!(
            fallback_span_name(DEFAULT_SUBSPAN_PREFIX, Some("  ")),
            "async_downstream_call-UNKNOWN_HTTP_METHOD"
        );
    }

    #[test]
    fn test_subspan_name_prefers_strategy() {
        assert_eq!(subspan_name(&Named(Some("custom")), &get_request()), "custom");
        assert_eq!(
            subspan_name(&Named(Some("   ")), &get_request()),
            "async_downstream_call-GET"
        );
        assert_eq!(
            subspan_name(&Named(None), &RequestSummary::default()),
            "async_downstream_call-UNKNOWN_HTTP_METHOD"
        );
    }

    #[test]
    fn test_panicking_strategy_falls_back() {
        assert_eq!(subspan_name(&Panicking, &get_request()), "async_downstream_call-GET");
    }

    #[test]
    fn test_default_request_tags() {
        let span = Span::new_root("GET", SpanPurpose::Client);
        DefaultSpanNamingAndTaggingStrategy.handle_request_tagging(&span, &get_request());
        assert_eq!(span.tag(tags::HTTP_METHOD).as_deref(), Some("GET"));
        assert_eq!(span.tag(tags::HTTP_URL).as_deref(), Some("http://svc-a/x?q=1"));
        assert_eq!(span.tag(tags::HTTP_PATH).as_deref(), Some("/x"));
        assert_eq!(span.tag(tags::SPAN_HANDLER).as_deref(), Some(SPAN_HANDLER_TAG_VALUE));
    }

    #[test]
    fn test_default_final_names() {
        let strategy = DefaultSpanNamingAndTaggingStrategy;
        let request = get_request();

        let ok = Span::new_root("GET", SpanPurpose::Client);
        strategy.handle_response_tagging_and_final_span_name(&ok, &request, Some(&response(StatusCode::OK)), None);
        assert_eq!(ok.name(), "GET");
        assert_eq!(ok.tag(tags::HTTP_STATUS_CODE).as_deref(), Some("200"));
        assert!(ok.tag(tags::ERROR).is_none());

        let moved = Span::new_root("GET", SpanPurpose::Client);
        strategy.handle_response_tagging_and_final_span_name(&moved, &request, Some(&response(StatusCode::FOUND)), None);
        assert_eq!(moved.name(), "GET redirected");

        let missing = Span::new_root("GET", SpanPurpose::Client);
        strategy.handle_response_tagging_and_final_span_name(&missing, &request, Some(&response(StatusCode::NOT_FOUND)), None);
        assert_eq!(missing.name(), "GET not_found");

        let failed = Span::new_root("GET", SpanPurpose::Client);
        strategy.handle_response_tagging_and_final_span_name(&failed, &request, Some(&response(StatusCode::BAD_GATEWAY)), None);
        assert_eq!(failed.tag(tags::ERROR).as_deref(), Some("502"));
    }

    #[test]
    fn test_error_tagged() {
        let span = Span::new_root("GET", SpanPurpose::Client);
        DefaultSpanNamingAndTaggingStrategy.handle_response_tagging_and_final_span_name(
            &span,
            &get_request(),
            None,
            Some(&CallError::Setup("connection reset".into())),
        );
        assert!(span.tag(tags::ERROR).unwrap().contains("connection reset"));
        assert!(span.tag(tags::HTTP_STATUS_CODE).is_none());
    }
}
