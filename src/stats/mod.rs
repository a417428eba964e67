//! Traffic statistics subsystem.
//!
//! # Data Flow
//! ```text
//! Relay handlers produce:
//!     → RequestRecord (one per proxied exchange)
//!     → registry.rs (aggregate counters + bounded recent-log ring)
//!
//! Consumers:
//!     → reporter.rs (periodic one-line summary)
//!     → export (JSON document with stats + retained records)
//! ```
//!
//! # Design Decisions
//! - All mutation goes through one mutex-guarded critical section
//! - Reads hand out owned snapshots; callers never hold the lock
//! - The ring is FIFO-bounded; the oldest record is evicted on overflow

pub mod model;
pub mod registry;
pub mod reporter;

pub use model::{Method, RequestRecord, StatsSnapshot};
pub use registry::StatsRegistry;
pub use reporter::StatsReporter;
