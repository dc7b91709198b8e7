//! Thread-local span stack.
//!
//! # Responsibilities
//! - Hold the current thread's span stack (top = current span)
//! - Start child spans in the current context
//! - Detach/attach whole stacks so work can hop threads
//! - Report completed spans to listeners and to the log

use std::cell::RefCell;
use std::sync::{Arc, PoisonError, RwLock};

use crate::context::span::{Span, SpanPurpose};

thread_local! {
    static SPAN_STACK: RefCell<Vec<Span>> = const { RefCell::new(Vec::new()) };
}

static LISTENERS: RwLock<Vec<Arc<dyn SpanListener>>> = RwLock::new(Vec::new());

/// Observer of span lifecycle events.
pub trait SpanListener: Send + Sync {
    fn span_started(&self, _span: &Span) {}

    fn span_completed(&self, span: &Span);
}

/// Register a listener for all spans started or completed in this process.
pub fn register_listener(listener: Arc<dyn SpanListener>) {
    LISTENERS
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .push(listener);
}

/// Copy of the current thread's span stack, bottom first.
pub fn current_span_stack() -> Vec<Span> {
    SPAN_STACK.with(|stack| stack.borrow().clone())
}

/// The span on top of the current thread's stack.
pub fn current_span() -> Option<Span> {
    SPAN_STACK.with(|stack| stack.borrow().last().cloned())
}

/// Start a span as a child of the current span, or as a new trace if there is none,
/// and make it the current span.
pub fn start_span_in_current_context(name: impl Into<String>, purpose: SpanPurpose) -> Span {
    let span = match current_span() {
        Some(parent) => parent.new_child(name, purpose),
        None => Span::new_root(name, purpose),
    };
    SPAN_STACK.with(|stack| stack.borrow_mut().push(span.clone()));
    notify(|listener| listener.span_started(&span));
    span
}

/// Remove and return the current thread's span stack, leaving it empty.
pub fn unregister_from_thread() -> Vec<Span> {
    SPAN_STACK.with(|stack| std::mem::take(&mut *stack.borrow_mut()))
}

/// Replace the current thread's span stack.
pub fn register_with_thread(spans: Vec<Span>) {
    SPAN_STACK.with(|stack| *stack.borrow_mut() = spans);
}

pub(crate) fn span_closed(span: &Span) {
    SPAN_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        match stack.last() {
            Some(top) if top.ptr_eq(span) => {
                stack.pop();
            }
            Some(_) if stack.iter().any(|s| s.ptr_eq(span)) => {
                tracing::warn!(
                    trace_id = %span.trace_id(),
                    span_id = %span.span_id(),
                    "Closed a span that is not the current span; leaving the stack untouched"
                );
            }
            _ => {}
        }
    });

    if span.is_sampleable() {
        tracing::info!(
            target: "downstream_http::span",
            trace_id = %span.trace_id(),
            span_id = %span.span_id(),
            parent_span_id = span.parent_span_id().unwrap_or("null"),
            name = %span.name(),
            purpose = ?span.purpose(),
            start_epoch_micros = span.start_epoch_micros() as u64,
            duration_us = span.duration().map(|d| d.as_micros() as u64).unwrap_or_default(),
            tags = ?span.tags(),
            "Span completed"
        );
    }

    notify(|listener| listener.span_completed(span));
}

fn notify(f: impl Fn(&dyn SpanListener)) {
    let listeners = LISTENERS.read().unwrap_or_else(PoisonError::into_inner);
    for listener in listeners.iter() {
        f(listener.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_start_span_without_parent_creates_trace() {
        unregister_from_thread();
        let span = start_span_in_current_context("first", SpanPurpose::Local);
        assert!(span.parent_span_id().is_none());
        assert_eq!(current_span(), Some(span.clone()));
        span.close();
        assert!(current_span().is_none());
    }

    #[test]
    fn test_nested_spans_pop_in_order() {
        unregister_from_thread();
        let outer = start_span_in_current_context("outer", SpanPurpose::Server);
        let inner = start_span_in_current_context("inner", SpanPurpose::Client);
        assert_eq!(inner.parent_span_id(), Some(outer.span_id()));
        assert_eq!(current_span_stack().len(), 2);

        inner.close();
        assert_eq!(current_span(), Some(outer.clone()));
        outer.close();
        assert!(current_span_stack().is_empty());
    }

    #[test]
    fn test_closing_non_current_span_keeps_stack() {
        unregister_from_thread();
        let outer = start_span_in_current_context("outer", SpanPurpose::Server);
        let inner = start_span_in_current_context("inner", SpanPurpose::Client);
        outer.close();
        assert_eq!(current_span(), Some(inner.clone()));
        assert_eq!(current_span_stack().len(), 2);
        unregister_from_thread();
    }

    #[test]
    fn test_unregister_and_register() {
        unregister_from_thread();
        let span = start_span_in_current_context("moving", SpanPurpose::Local);
        let stack = unregister_from_thread();
        assert!(current_span().is_none());

        register_with_thread(stack);
        assert_eq!(current_span(), Some(span));
        unregister_from_thread();
    }

    struct Recorder {
        trace_id: String,
        completed: Mutex<Vec<String>>,
    }

    impl SpanListener for Recorder {
        fn span_completed(&self, span: &Span) {
            if span.trace_id() == self.trace_id {
                self.completed.lock().unwrap().push(span.name());
            }
        }
    }

    #[test]
    fn test_listener_sees_completed_span() {
        let span = Span::new_root("observed", SpanPurpose::Local);
        let recorder = Arc::new(Recorder {
            trace_id: span.trace_id().to_string(),
            completed: Mutex::new(Vec::new()),
        });
        register_listener(recorder.clone());

        span.close();
        span.close();

        assert_eq!(*recorder.completed.lock().unwrap(), vec!["observed".to_string()]);
    }
}
