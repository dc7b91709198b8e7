//! Per-call state machine: breaker check, subspan, dispatch, completion.
//!
//! # States
//! ```text
//! CREATED → BREAKER_CHECKED → REJECTED     (breaker open, or setup failed)
//!                           → DISPATCHED → COMPLETED (on_result | on_error)
//! ```
//!
//! # Design Decisions
//! - Setup never returns an error to the caller directly; every failure travels
//!   through the returned `CallFuture`
//! - The breaker is told about every dispatched call exactly once, even when an
//!   external timeout already resolved the future
//! - Completion runs wearing the call's context and restores the worker's
//!   previous context afterwards

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use crate::client::error::{BoxError, CallError, TransportError};
use crate::client::future::{CallCompleter, CallFuture};
use crate::client::naming::{guarded, panic_message, subspan_name, SpanNamingAndTaggingStrategy};
use crate::client::request::{DownstreamRequest, RequestBuilder, RequestSigner, RequestSummary};
use crate::client::response::DownstreamResponse;
use crate::client::transport::{CompletionHandler, HttpTransport};
use crate::context::{tracer, ContextSnapshot, Span, SpanPurpose};
use crate::observability::metrics::{self, CallOutcome};
use crate::observability::propagation::propagate_tracing_headers;
use crate::resilience::circuit_breaker::{BreakerError, ManualModeTask};
use crate::resilience::selector::CircuitBreakerSelector;

/// Turns a successful downstream response into the caller's result.
pub type ResponseHandler<T> = Box<dyn FnOnce(DownstreamResponse) -> Result<T, BoxError> + Send>;

type BreakerTask = Box<dyn ManualModeTask<DownstreamResponse>>;

/// Everything a dispatched call needs when its outcome arrives.
pub(crate) struct CompletionState<T> {
    completer: CallCompleter<T>,
    handler: ResponseHandler<T>,
    subspan: bool,
    snapshot: ContextSnapshot,
    breaker_task: Option<BreakerTask>,
    request: RequestSummary,
    strategy: Arc<dyn SpanNamingAndTaggingStrategy>,
    host: String,
    started_at: Instant,
}

impl<T> CompletionState<T> {
    /// Build the state, opening the subspan if requested.
    ///
    /// The subspan is started under `snapshot` and the resulting context is
    /// captured for the call; the calling thread's context is left as it was.
    #[allow(clippy::too_many_arguments)]
    fn new(
        completer: CallCompleter<T>,
        handler: ResponseHandler<T>,
        subspan: bool,
        request: &DownstreamRequest,
        breaker_task: Option<BreakerTask>,
        snapshot: ContextSnapshot,
        strategy: Arc<dyn SpanNamingAndTaggingStrategy>,
    ) -> Self {
        let summary = request.summary();

        let snapshot = if subspan {
            let _guard = snapshot.attach();
            let name = subspan_name(strategy.as_ref(), &summary);
            let span = tracer::start_span_in_current_context(name, SpanPurpose::Client);
            guarded("handle_request_tagging", || {
                strategy.handle_request_tagging(&span, &summary)
            });
            ContextSnapshot::capture()
        } else {
            snapshot
        };

        Self {
            completer,
            handler,
            subspan,
            snapshot,
            breaker_task,
            request: summary,
            strategy,
            host: request.host().to_string(),
            started_at: Instant::now(),
        }
    }

    /// The span the call runs under (the subspan, or the caller's current span).
    fn span_for_call(&self) -> Option<&Span> {
        self.snapshot.current_span()
    }

    /// Close the subspan of a call that failed after its state was built.
    fn abandon(self, error: &CallError) {
        if !self.subspan {
            return;
        }
        let _guard = self.snapshot.attach();
        finish_subspan(self.strategy.as_ref(), &self.request, None, Some(error));
    }
}

impl<T: Send + 'static> CompletionHandler for CompletionState<T> {
    fn on_result(self: Box<Self>, response: DownstreamResponse) {
        let CompletionState {
            completer,
            handler,
            subspan,
            snapshot,
            breaker_task,
            request,
            strategy,
            host,
            started_at,
        } = *self;
        let _guard = snapshot.attach();

        if let Some(mut task) = breaker_task {
            notify_breaker("handle_event", || task.handle_event(&response));
        }

        if subspan {
            finish_subspan(strategy.as_ref(), &request, Some(&response), None);
        }

        metrics::record_call(
            method_label(&request),
            &host,
            CallOutcome::for_status(response.status_code()),
            started_at.elapsed(),
        );

        if completer.is_done() {
            tracing::debug!(
                status = response.status_code(),
                "Call already resolved before the downstream response arrived; skipping response handler"
            );
            return;
        }

        match catch_unwind(AssertUnwindSafe(|| handler(response))) {
            Ok(Ok(value)) => {
                completer.complete(value);
            }
            Ok(Err(e)) => {
                completer.complete_with_error(CallError::Handler(e));
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                completer.complete_with_error(CallError::Handler(
                    format!("response handler panicked: {message}").into(),
                ));
            }
        }
    }

    fn on_error(self: Box<Self>, error: TransportError) {
        let CompletionState {
            completer,
            subspan,
            snapshot,
            breaker_task,
            request,
            strategy,
            host,
            started_at,
            ..
        } = *self;
        let _guard = snapshot.attach();
        let error = CallError::Downstream(error);

        if let Some(mut task) = breaker_task {
            notify_breaker("handle_exception", || task.handle_exception(&error));
        }

        if subspan {
            finish_subspan(strategy.as_ref(), &request, None, Some(&error));
        }

        metrics::record_call(
            method_label(&request),
            &host,
            CallOutcome::Failure,
            started_at.elapsed(),
        );

        if completer.is_done() {
            tracing::debug!(error = %error, "Call already resolved before the downstream error arrived");
            return;
        }
        completer.complete_with_error(error);
    }
}

fn method_label(request: &RequestSummary) -> &str {
    request.method.as_deref().unwrap_or("UNKNOWN")
}

/// Report to the breaker. A failing or panicking breaker never breaks the call.
fn notify_breaker(operation: &'static str, notify: impl FnOnce() -> Result<(), BreakerError>) {
    match catch_unwind(AssertUnwindSafe(notify)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(
            operation,
            error = %e,
            "Circuit breaker failed to record the call outcome; ignoring"
        ),
        Err(panic) => tracing::error!(
            operation,
            panic = %panic_message(&*panic),
            "Circuit breaker panicked while recording the call outcome; ignoring"
        ),
    }
}

/// Tag, rename and close the current span (the call's subspan).
fn finish_subspan(
    strategy: &dyn SpanNamingAndTaggingStrategy,
    request: &RequestSummary,
    response: Option<&DownstreamResponse>,
    error: Option<&CallError>,
) {
    let Some(span) = tracer::current_span() else {
        tracing::warn!("No current span to close for downstream call");
        return;
    };
    guarded("handle_response_tagging_and_final_span_name", || {
        strategy.handle_response_tagging_and_final_span_name(&span, request, response, error)
    });
    span.close();
}

/// Runs downstream calls: breaker, subspan, headers, dispatch.
pub struct CompletionOrchestrator {
    transport: Arc<dyn HttpTransport>,
    selector: CircuitBreakerSelector,
    strategy: Arc<dyn SpanNamingAndTaggingStrategy>,
    subspans: bool,
    signer: Option<Arc<dyn RequestSigner>>,
}

impl CompletionOrchestrator {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        selector: CircuitBreakerSelector,
        strategy: Arc<dyn SpanNamingAndTaggingStrategy>,
        subspans: bool,
        signer: Option<Arc<dyn RequestSigner>>,
    ) -> Self {
        Self {
            transport,
            selector,
            strategy,
            subspans,
            signer,
        }
    }

    pub fn subspans_enabled(&self) -> bool {
        self.subspans
    }

    /// Run `request` under `snapshot`. The returned future resolves exactly once.
    pub fn execute<T: Send + 'static>(
        &self,
        request: DownstreamRequest,
        handler: ResponseHandler<T>,
        snapshot: ContextSnapshot,
    ) -> CallFuture<T> {
        let (future, completer) = CallFuture::pending();
        let method = request.http_method().clone();
        let url = request.url().to_string();
        let host = request.host().to_string();

        if let Err(error) = self.dispatch(request, handler, snapshot, completer.clone()) {
            if error.is_breaker_open() {
                tracing::debug!(method = %method, url = %url, error = %error, "Downstream call rejected by circuit breaker");
                metrics::record_breaker_rejection(&host);
            } else {
                tracing::error!(
                    method = %method,
                    url = %url,
                    error = %error,
                    "Failed to set up downstream call"
                );
            }
            completer.complete_with_error(error);
        }

        future
    }

    fn dispatch<T: Send + 'static>(
        &self,
        request: DownstreamRequest,
        handler: ResponseHandler<T>,
        snapshot: ContextSnapshot,
        completer: CallCompleter<T>,
    ) -> Result<(), CallError> {
        let breaker_task = self.check_breaker(&request)?;

        let state = CompletionState::new(
            completer,
            handler,
            self.subspans,
            &request,
            breaker_task,
            snapshot,
            self.strategy.clone(),
        );

        let mut builder = request.into_builder();
        if let Err(error) = self.prepare(&state, &mut builder) {
            state.abandon(&error);
            return Err(error);
        }

        self.transport.execute(builder, Box::new(state));
        Ok(())
    }

    fn check_breaker(&self, request: &DownstreamRequest) -> Result<Option<BreakerTask>, CallError> {
        let checked = catch_unwind(AssertUnwindSafe(|| {
            self.selector
                .select(request)
                .map(|breaker| {
                    let mut task = breaker.new_manual_mode_task();
                    task.fail_if_open().map(|_| task)
                })
                .transpose()
        }));

        match checked {
            Ok(result) => result.map_err(CallError::from),
            Err(panic) => Err(CallError::Setup(format!(
                "circuit breaker check panicked: {}",
                panic_message(&*panic)
            ))),
        }
    }

    fn prepare<T>(&self, state: &CompletionState<T>, builder: &mut RequestBuilder) -> Result<(), CallError> {
        if let Some(span) = state.span_for_call() {
            propagate_tracing_headers(span, builder)?;
        }
        if let Some(signer) = &self.signer {
            signer
                .sign(builder)
                .map_err(|e| CallError::Setup(format!("request signing failed: {e}")))?;
        }
        Ok(())
    }
}
