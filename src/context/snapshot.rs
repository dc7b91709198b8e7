//! Capture and re-application of tracing/logging context.
//!
//! # Responsibilities
//! - Capture the current thread's span stack and logging context as a value
//! - Install a captured value onto whatever thread runs the next piece of work
//! - Restore (or clear) the previous state afterwards so nothing leaks
//!
//! # Design Decisions
//! - `apply` always returns what was installed before, so callers can bracket
//! - `attach` wraps the bracket in an RAII guard; the guard is `!Send`

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::span::Span;
use crate::context::{logging_context, tracer};

/// Key/value logging context (MDC).
pub type LoggingContext = HashMap<String, String>;

/// Immutable capture of a thread's span stack and logging context.
///
/// Either half may be absent, meaning "no active trace" or "no logging context".
#[derive(Clone, Default)]
pub struct ContextSnapshot {
    span_stack: Option<Arc<Vec<Span>>>,
    logging_context: Option<Arc<LoggingContext>>,
}

impl ContextSnapshot {
    /// Build a snapshot from explicit parts. Empty parts are normalised to absent.
    pub fn new(span_stack: Option<Vec<Span>>, logging_context: Option<LoggingContext>) -> Self {
        Self {
            span_stack: span_stack.filter(|s| !s.is_empty()).map(Arc::new),
            logging_context: logging_context.filter(|m| !m.is_empty()).map(Arc::new),
        }
    }

    /// A snapshot with no trace and no logging context.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Read the current thread's state without modifying it.
    pub fn capture() -> Self {
        Self::new(
            Some(tracer::current_span_stack()),
            logging_context::copy_current(),
        )
    }

    /// Install this snapshot on the current thread and return the one it replaced.
    pub fn apply(&self) -> ContextSnapshot {
        let previous = Self::new(
            Some(tracer::unregister_from_thread()),
            Some(logging_context::take()),
        );

        if let Some(stack) = &self.span_stack {
            tracer::register_with_thread(stack.as_ref().clone());
        }
        if let Some(map) = &self.logging_context {
            logging_context::set_map(map.as_ref().clone());
        }

        previous
    }

    /// Remove all tracing and logging state from the current thread.
    pub fn clear() {
        tracer::unregister_from_thread();
        logging_context::clear();
    }

    /// Put `previous` back on the current thread, clearing instead if it is empty.
    pub fn restore(previous: &ContextSnapshot) {
        if previous.is_empty() {
            Self::clear();
        } else {
            previous.apply();
        }
    }

    /// Apply this snapshot for the lifetime of the returned guard.
    pub fn attach(&self) -> ContextGuard {
        let previous = self.apply();
        let log_span = tracing::info_span!(
            "downstream_context",
            trace_id = tracing::field::Empty,
            span_id = tracing::field::Empty,
            logging_context = tracing::field::Empty,
        );
        if let Some(span) = self.current_span() {
            log_span.record("trace_id", span.trace_id());
            log_span.record("span_id", span.span_id());
        }
        if let Some(map) = &self.logging_context {
            log_span.record("logging_context", tracing::field::debug(map.as_ref()));
        }

        ContextGuard {
            previous,
            _entered: log_span.entered(),
        }
    }

    /// The span on top of the captured stack.
    pub fn current_span(&self) -> Option<&Span> {
        self.span_stack.as_ref().and_then(|stack| stack.last())
    }

    pub fn span_stack(&self) -> &[Span] {
        self.span_stack.as_deref().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn logging_context(&self) -> Option<&LoggingContext> {
        self.logging_context.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.span_stack.is_none() && self.logging_context.is_none()
    }

    /// True if both snapshots share the same underlying captures.
    pub fn ptr_eq(&self, other: &ContextSnapshot) -> bool {
        let spans = match (&self.span_stack, &other.span_stack) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        let logging = match (&self.logging_context, &other.logging_context) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        spans && logging
    }
}

impl std::fmt::Debug for ContextSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextSnapshot")
            .field("span_stack", &self.span_stack())
            .field("logging_context", &self.logging_context)
            .finish()
    }
}

/// Restores the previously active context when dropped.
pub struct ContextGuard {
    previous: ContextSnapshot,
    _entered: tracing::span::EnteredSpan,
}

impl ContextGuard {
    /// The snapshot that was active before this guard was created.
    pub fn previous(&self) -> &ContextSnapshot {
        &self.previous
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        ContextSnapshot::restore(&self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::span::SpanPurpose;

    fn reset_thread() {
        ContextSnapshot::clear();
    }

    #[test]
    fn test_apply_capture_round_trip() {
        reset_thread();
        let span = tracer::start_span_in_current_context("ambient", SpanPurpose::Server);
        logging_context::put("user", "42");

        let before_stack = tracer::current_span_stack();
        let before_map = logging_context::copy_current();

        ContextSnapshot::capture().apply();

        assert_eq!(tracer::current_span_stack(), before_stack);
        assert_eq!(logging_context::copy_current(), before_map);
        assert_eq!(tracer::current_span(), Some(span));
        reset_thread();
    }

    #[test]
    fn test_apply_returns_previous() {
        reset_thread();
        let ambient = tracer::start_span_in_current_context("ambient", SpanPurpose::Server);
        logging_context::put("k", "ambient");

        let other = Span::new_root("other", SpanPurpose::Local);
        let snapshot = ContextSnapshot::new(
            Some(vec![other.clone()]),
            Some(LoggingContext::from([("k".to_string(), "other".to_string())])),
        );

        let previous = snapshot.apply();
        assert_eq!(tracer::current_span(), Some(other));
        assert_eq!(logging_context::get("k").as_deref(), Some("other"));
        assert_eq!(previous.current_span(), Some(&ambient));

        ContextSnapshot::restore(&previous);
        assert_eq!(tracer::current_span(), Some(ambient));
        assert_eq!(logging_context::get("k").as_deref(), Some("ambient"));
        reset_thread();
    }

    #[test]
    fn test_guard_clears_when_previous_empty() {
        reset_thread();
        let span = Span::new_root("call", SpanPurpose::Client);
        let snapshot = ContextSnapshot::new(Some(vec![span.clone()]), None);
        {
            let guard = snapshot.attach();
            assert!(guard.previous().is_empty());
            assert_eq!(tracer::current_span(), Some(span));
        }
        assert!(tracer::current_span().is_none());
        assert!(logging_context::copy_current().is_none());
    }

    #[test]
    fn test_empty_parts_normalised() {
        let snapshot = ContextSnapshot::new(Some(Vec::new()), Some(LoggingContext::new()));
        assert!(snapshot.is_empty());
        assert!(snapshot.current_span().is_none());
        assert!(snapshot.span_stack().is_empty());
    }

    #[test]
    fn test_ptr_eq_tracks_identity() {
        let span = Span::new_root("x", SpanPurpose::Local);
        let a = ContextSnapshot::new(Some(vec![span.clone()]), None);
        let b = a.clone();
        let c = ContextSnapshot::new(Some(vec![span]), None);
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
    }
}
