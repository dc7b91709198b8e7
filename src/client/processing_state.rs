//! Per-connection processing state handed to calls made while serving a request.

use crate::context::{logging_context, tracer, ContextSnapshot, LoggingContext, Span};
use crate::resilience::scheduler::WorkerAffinity;

/// Trace stack, logging context and I/O worker of the request being served.
#[derive(Debug, Clone)]
pub struct ProcessingState {
    trace_stack: Vec<Span>,
    logging_context: LoggingContext,
    affinity: WorkerAffinity,
}

impl ProcessingState {
    pub fn new(trace_stack: Vec<Span>, logging_context: LoggingContext, affinity: WorkerAffinity) -> Self {
        Self {
            trace_stack,
            logging_context,
            affinity,
        }
    }

    /// State of the current thread, bound to the runtime driving it.
    ///
    /// Returns `None` outside a tokio runtime.
    pub fn capture_current() -> Option<Self> {
        let affinity = WorkerAffinity::current()?;
        Some(Self::new(
            tracer::current_span_stack(),
            logging_context::copy_current().unwrap_or_default(),
            affinity,
        ))
    }

    pub fn distributed_trace_stack(&self) -> &[Span] {
        &self.trace_stack
    }

    pub fn logging_context(&self) -> &LoggingContext {
        &self.logging_context
    }

    pub fn affinity(&self) -> &WorkerAffinity {
        &self.affinity
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot::new(Some(self.trace_stack.clone()), Some(self.logging_context.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SpanPurpose;

    #[tokio::test]
    async fn test_capture_current_copies_thread_state() {
        ContextSnapshot::clear();
        let span = tracer::start_span_in_current_context("serving", SpanPurpose::Server);
        logging_context::put("request_id", "r-1");

        let state = ProcessingState::capture_current().unwrap();
        ContextSnapshot::clear();

        assert_eq!(state.distributed_trace_stack(), &[span.clone()]);
        let snapshot = state.snapshot();
        assert_eq!(snapshot.current_span(), Some(&span));
        assert_eq!(
            snapshot.logging_context().and_then(|m| m.get("request_id")).map(String::as_str),
            Some("r-1")
        );
    }

    #[test]
    fn test_no_runtime_no_state() {
        assert!(ProcessingState::capture_current().is_none());
    }
}
