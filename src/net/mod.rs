//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! HttpConnector needs an address for "svc-a"
//!     → resolver.rs (look up ALL addresses for the host)
//!     → per-host counter picks the next one
//!     → connector dials that address
//! ```
//!
//! # Design Decisions
//! - Every lookup is fresh; rotation happens on each new connection
//! - Counters are shared process-wide per resolver instance

pub mod resolver;

pub use resolver::{AddressLookup, RoundRobinResolver, StaticLookup, SystemLookup};
