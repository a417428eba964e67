//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Relay handlers / reporter produce:
//!     → TrafficLog (operator console lines, one per exchange)
//!     → tracing events (structured diagnostics)
//!
//! Consumers:
//!     → stdout (pretty format)
//!     → optional log file (non-blocking appender)
//! ```
//!
//! # Design Decisions
//! - The traffic log is an explicitly constructed component handed by
//!   `Arc` into the relays and the reporter, not an ambient registry
//! - Operator lines keep a fixed, grep-friendly shape
//! - The file writer is non-blocking so slow disks never stall relays

pub mod logging;

pub use logging::{init_logging, TrafficLog};
