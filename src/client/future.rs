//! Single-assignment call future.
//!
//! A `CallFuture` is resolved through any of its `CallCompleter`s. The first
//! resolution wins; later attempts are ignored and report `false`, which is
//! how the completion path detects that an external actor (a timeout, a
//! caller cancelling) got there first.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::task::AtomicWaker;

use crate::client::error::CallError;

enum Slot<T> {
    Pending,
    Ready(Result<T, CallError>),
    Taken,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    waker: AtomicWaker,
}

/// Future of a downstream call's outcome.
pub struct CallFuture<T> {
    shared: Arc<Shared<T>>,
}

/// Write side of a `CallFuture`.
pub struct CallCompleter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for CallCompleter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> CallFuture<T> {
    /// A pending future and the completer that resolves it.
    pub fn pending() -> (CallFuture<T>, CallCompleter<T>) {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::Pending),
            waker: AtomicWaker::new(),
        });
        (
            CallFuture {
                shared: shared.clone(),
            },
            CallCompleter { shared },
        )
    }

    /// A future that has already failed.
    pub fn failed(error: CallError) -> Self {
        let (future, completer) = Self::pending();
        completer.complete_with_error(error);
        future
    }

    /// Another completer for this future, e.g. to cancel it from outside.
    pub fn completer(&self) -> CallCompleter<T> {
        CallCompleter {
            shared: self.shared.clone(),
        }
    }

    pub fn is_done(&self) -> bool {
        !matches!(*self.shared.lock(), Slot::Pending)
    }
}

impl<T: Send + 'static> CallFuture<T> {
    /// Fail the future with `CallError::Timeout` if nothing resolves it within `timeout`.
    ///
    /// Needs a tokio runtime on the current thread; without one the future is
    /// returned unchanged.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(?timeout, "No runtime available; call timeout not armed");
            return self;
        };

        let completer = self.completer();
        handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            if completer.complete_with_error(CallError::Timeout(timeout)) {
                tracing::debug!(?timeout, "Call future timed out before the downstream response arrived");
            }
        });
        self
    }
}

impl<T> CallCompleter<T> {
    /// Resolve with a value. Returns false if the future was already resolved.
    pub fn complete(&self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    /// Resolve with an error. Returns false if the future was already resolved.
    pub fn complete_with_error(&self, error: CallError) -> bool {
        self.resolve(Err(error))
    }

    pub fn is_done(&self) -> bool {
        !matches!(*self.shared.lock(), Slot::Pending)
    }

    fn resolve(&self, result: Result<T, CallError>) -> bool {
        {
            let mut slot = self.shared.lock();
            if !matches!(*slot, Slot::Pending) {
                return false;
            }
            *slot = Slot::Ready(result);
        }
        self.shared.waker.wake();
        true
    }
}

impl<T> Shared<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Future for CallFuture<T> {
    type Output = Result<T, CallError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.shared.waker.register(cx.waker());

        let mut slot = self.shared.lock();
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(result) => Poll::Ready(result),
            Slot::Pending => {
                *slot = Slot::Pending;
                Poll::Pending
            }
            Slot::Taken => Poll::Ready(Err(CallError::Setup(
                "call future polled after completion".to_string(),
            ))),
        }
    }
}

impl<T> std::fmt::Debug for CallFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallFuture")
            .field("done", &self.is_done())
            .finish()
    }
}
