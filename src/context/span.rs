//! Distributed tracing spans.
//!
//! A `Span` is a shared handle: cloning it (or copying a span stack) yields another
//! handle onto the same span, so renaming or closing through any handle is visible
//! through all of them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::context::tracer;

/// What a span measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanPurpose {
    /// An outbound call to another service.
    Client,
    /// Handling of an inbound request.
    Server,
    /// Local work that does not cross a process boundary.
    Local,
}

/// A named, timed unit of distributed-tracing work.
#[derive(Clone)]
pub struct Span {
    inner: Arc<SpanInner>,
}

struct SpanInner {
    trace_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    sampleable: bool,
    purpose: SpanPurpose,
    started_at: Instant,
    start_epoch_micros: u128,
    name: Mutex<String>,
    tags: Mutex<BTreeMap<String, String>>,
    duration: Mutex<Option<Duration>>,
    closed: AtomicBool,
}

impl Span {
    /// Start a new trace.
    pub fn new_root(name: impl Into<String>, purpose: SpanPurpose) -> Self {
        Self::build(generate_id(), None, true, name.into(), purpose)
    }

    /// Start a child of this span within the same trace.
    pub fn new_child(&self, name: impl Into<String>, purpose: SpanPurpose) -> Self {
        Self::build(
            self.inner.trace_id.clone(),
            Some(self.inner.span_id.clone()),
            self.inner.sampleable,
            name.into(),
            purpose,
        )
    }

    fn build(
        trace_id: String,
        parent_span_id: Option<String>,
        sampleable: bool,
        name: String,
        purpose: SpanPurpose,
    ) -> Self {
        let start_epoch_micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros();
        Self {
            inner: Arc::new(SpanInner {
                trace_id,
                span_id: generate_id(),
                parent_span_id,
                sampleable,
                purpose,
                started_at: Instant::now(),
                start_epoch_micros,
                name: Mutex::new(name),
                tags: Mutex::new(BTreeMap::new()),
                duration: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.inner.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.inner.span_id
    }

    pub fn parent_span_id(&self) -> Option<&str> {
        self.inner.parent_span_id.as_deref()
    }

    pub fn is_sampleable(&self) -> bool {
        self.inner.sampleable
    }

    pub fn purpose(&self) -> SpanPurpose {
        self.inner.purpose
    }

    /// Wall-clock start time in microseconds since the Unix epoch.
    pub fn start_epoch_micros(&self) -> u128 {
        self.inner.start_epoch_micros
    }

    pub fn name(&self) -> String {
        self.inner.name.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Rename the span. Ignored once the span is closed.
    pub fn set_name(&self, name: impl Into<String>) {
        if self.is_closed() {
            return;
        }
        *self.inner.name.lock().unwrap_or_else(PoisonError::into_inner) = name.into();
    }

    /// Add or replace a tag. Ignored once the span is closed.
    pub fn put_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        if self.is_closed() {
            return;
        }
        self.inner
            .tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    pub fn tag(&self, key: &str) -> Option<String> {
        self.inner
            .tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn tags(&self) -> BTreeMap<String, String> {
        self.inner.tags.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Duration of the span, available once closed.
    pub fn duration(&self) -> Option<Duration> {
        *self.inner.duration.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Complete the span.
    ///
    /// Closing is idempotent. If this span is the current span of the calling thread it
    /// is popped off that thread's span stack.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.inner.duration.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(self.inner.started_at.elapsed());
        tracer::span_closed(self);
    }

    /// True if both handles refer to the same span.
    pub fn ptr_eq(&self, other: &Span) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Span {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Span {}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("trace_id", &self.inner.trace_id)
            .field("span_id", &self.inner.span_id)
            .field("parent_span_id", &self.inner.parent_span_id)
            .field("name", &self.name())
            .field("purpose", &self.inner.purpose)
            .field("sampleable", &self.inner.sampleable)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Random 64-bit id rendered as 16 lower-case hex characters.
fn generate_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_span_has_no_parent() {
        let span = Span::new_root("root", SpanPurpose::Server);
        assert!(span.parent_span_id().is_none());
        assert_eq!(span.trace_id().len(), 16);
        assert_eq!(span.span_id().len(), 16);
        assert!(span.is_sampleable());
    }

    #[test]
    fn test_child_shares_trace() {
        let root = Span::new_root("root", SpanPurpose::Server);
        let child = root.new_child("child", SpanPurpose::Client);
        assert_eq!(child.trace_id(), root.trace_id());
        assert_eq!(child.parent_span_id(), Some(root.span_id()));
        assert_ne!(child.span_id(), root.span_id());
    }

    #[test]
    fn test_name_frozen_after_close() {
        let span = Span::new_root("before", SpanPurpose::Local);
        span.set_name("renamed");
        span.put_tag("k", "v");
        span.close();
        span.set_name("after");
        span.put_tag("k2", "v2");

        assert_eq!(span.name(), "renamed");
        assert_eq!(span.tag("k").as_deref(), Some("v"));
        assert!(span.tag("k2").is_none());
        assert!(span.duration().is_some());
    }

    #[test]
    fn test_clones_share_state() {
        let span = Span::new_root("a", SpanPurpose::Local);
        let other = span.clone();
        other.set_name("b");
        assert_eq!(span.name(), "b");
        assert_eq!(span, other);
    }
}
