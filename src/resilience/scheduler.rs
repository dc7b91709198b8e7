//! Where circuit breaker bookkeeping runs.
//!
//! A breaker created for a call that is bound to an I/O worker runs its
//! notifications on that worker's runtime; otherwise it uses a small
//! process-wide runtime that is started on first use.

use std::sync::OnceLock;

use tokio::runtime::{Handle, Runtime};

/// Affinity token binding work to a specific runtime (I/O worker).
#[derive(Clone, Debug)]
pub struct WorkerAffinity {
    handle: Handle,
}

impl WorkerAffinity {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Affinity for the runtime driving the current thread, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

/// Executor for breaker state-change notifications.
#[derive(Clone, Debug, Default)]
pub enum Scheduler {
    /// Process-wide scheduler shared by all unbound breakers.
    #[default]
    Shared,
    /// Runs on the runtime of a specific I/O worker.
    Bound(WorkerAffinity),
}

impl Scheduler {
    pub fn for_affinity(affinity: Option<&WorkerAffinity>) -> Self {
        match affinity {
            Some(affinity) => Scheduler::Bound(affinity.clone()),
            None => Scheduler::Shared,
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self, Scheduler::Bound(_))
    }

    /// Run `task` asynchronously on this scheduler.
    ///
    /// Falls back to running inline if the shared runtime could not be started.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            Scheduler::Bound(affinity) => {
                affinity.handle.spawn(async move { task() });
            }
            Scheduler::Shared => match shared_handle() {
                Some(handle) => {
                    handle.spawn(async move { task() });
                }
                None => task(),
            },
        }
    }
}

fn shared_handle() -> Option<&'static Handle> {
    static SHARED: OnceLock<Option<Runtime>> = OnceLock::new();
    SHARED
        .get_or_init(|| {
            match tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("breaker-scheduler")
                .enable_time()
                .build()
            {
                Ok(runtime) => Some(runtime),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to start shared breaker scheduler; running notifications inline");
                    None
                }
            }
        })
        .as_ref()
        .map(Runtime::handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_shared_scheduler_runs_off_thread() {
        let (tx, rx) = mpsc::channel();
        Scheduler::Shared.execute(move || {
            let name = std::thread::current().name().map(str::to_string);
            let _ = tx.send(name);
        });
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("breaker-scheduler"));
    }

    #[test]
    fn test_bound_scheduler_uses_worker_runtime() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("bound-worker")
            .build()
            .unwrap();
        let scheduler = Scheduler::for_affinity(Some(&WorkerAffinity::new(runtime.handle().clone())));
        assert!(scheduler.is_bound());

        let (tx, rx) = mpsc::channel();
        scheduler.execute(move || {
            let name = std::thread::current().name().map(str::to_string);
            let _ = tx.send(name);
        });
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("bound-worker"));
    }
}
