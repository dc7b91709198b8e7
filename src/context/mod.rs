//! Tracing and logging context subsystem.
//!
//! # Data Flow
//! ```text
//! Calling thread
//!     → snapshot.rs (capture span stack + logging context)
//!     → ContextSnapshot travels with the call as a plain value
//!
//! Worker thread (completion callback)
//!     → snapshot.rs (attach: install snapshot, remember previous)
//!     → tracer.rs / logging_context.rs (thread-local state)
//!     → guard dropped: previous state restored or cleared
//! ```
//!
//! # Design Decisions
//! - Thread-local state is only ever touched inside a capture/apply/restore bracket
//! - Snapshots are immutable and cheap to clone (shared `Arc`s)
//! - Spans are shared handles; closing is idempotent

pub mod logging_context;
pub mod snapshot;
pub mod span;
pub mod tracer;

pub use snapshot::{ContextGuard, ContextSnapshot, LoggingContext};
pub use span::{Span, SpanPurpose};
pub use tracer::SpanListener;
