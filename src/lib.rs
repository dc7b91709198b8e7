//! Traced, circuit-broken downstream HTTP client library.

pub mod client;
pub mod config;
pub mod context;
pub mod net;
pub mod observability;
pub mod resilience;

pub use client::{CallError, CallFuture, DownstreamClient, DownstreamRequest, DownstreamResponse};
pub use config::schema::ClientConfig;
pub use context::ContextSnapshot;
