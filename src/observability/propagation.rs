//! B3 trace-context propagation onto outgoing requests.

use axum::http::{HeaderName, HeaderValue};

use crate::client::error::CallError;
use crate::client::request::RequestBuilder;
use crate::context::Span;

pub const TRACE_ID: &str = "x-b3-traceid";
pub const SPAN_ID: &str = "x-b3-spanid";
pub const PARENT_SPAN_ID: &str = "x-b3-parentspanid";
pub const SAMPLED: &str = "x-b3-sampled";
pub const SPAN_NAME: &str = "x-b3-spanname";

/// Set the B3 headers describing `span` on `builder`.
///
/// The parent header is only sent when the span has a parent. A span name
/// that is not a valid header value is left off rather than failing the call.
pub fn propagate_tracing_headers(span: &Span, builder: &mut RequestBuilder) -> Result<(), CallError> {
    set(builder, SAMPLED, if span.is_sampleable() { "true" } else { "false" })?;
    set(builder, TRACE_ID, span.trace_id())?;
    set(builder, SPAN_ID, span.span_id())?;
    if let Some(parent) = span.parent_span_id() {
        set(builder, PARENT_SPAN_ID, parent)?;
    }

    let name = span.name();
    match HeaderValue::from_str(&name) {
        Ok(value) => {
            builder.set_header(HeaderName::from_static(SPAN_NAME), value);
        }
        Err(_) => tracing::debug!(span_name = %name, "Span name is not a valid header value; not propagating it"),
    }
    Ok(())
}

fn set(builder: &mut RequestBuilder, name: &'static str, value: &str) -> Result<(), CallError> {
    let value = HeaderValue::from_str(value)
        .map_err(|e| CallError::Setup(format!("invalid value for header {name}: {e}")))?;
    builder.set_header(HeaderName::from_static(name), value);
    Ok(())
}
