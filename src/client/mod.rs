//! Downstream HTTP client subsystem.
//!
//! # Data Flow
//! ```text
//! Caller (request-serving thread)
//!     → facade.rs (new_request / execute*)
//!     → completion.rs (breaker check, subspan, B3 headers, signer)
//!     → transport.rs (hyper pooled client on the I/O runtime)
//!
//! I/O worker (completion)
//!     → completion.rs (attach caller context, report to breaker,
//!                      finish subspan, run the response handler)
//!     → future.rs (CallFuture resolved exactly once)
//! ```
//!
//! # Design Decisions
//! - Breaker rejection never touches the network
//! - The handler sees the caller's span stack and logging context
//! - Worker threads are left exactly as they were found after every callback

pub mod aws;
pub mod completion;
pub mod error;
pub mod facade;
pub mod future;
pub mod naming;
pub mod processing_state;
pub mod request;
pub mod response;
pub mod transport;

pub use aws::{AppInfo, AwsMetadata};
pub use completion::{CompletionOrchestrator, ResponseHandler};
pub use error::{BoxError, BuildError, CallError, TransportError};
pub use facade::{DownstreamClient, DownstreamClientBuilder};
pub use future::{CallCompleter, CallFuture};
pub use naming::{DefaultSpanNamingAndTaggingStrategy, SpanNamingAndTaggingStrategy};
pub use processing_state::ProcessingState;
pub use request::{DownstreamRequest, RequestBuilder, RequestSigner, RequestSummary};
pub use response::DownstreamResponse;
pub use transport::{CompletionHandler, HttpTransport, HyperTransport, TransportSettings};
