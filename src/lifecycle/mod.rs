//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Parse CLI → load config → init logging → bind listener → run
//!
//! Shutdown (shutdown.rs):
//!     SIGINT/SIGTERM → broadcast → accept loop stops → export → exit
//! ```
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Shutdown is fire-and-forget: in-flight relays and tunnels are not
//!   drained, matching the per-request isolation model
//! - The export (when configured) happens after the accept loop stops

pub mod shutdown;

pub use shutdown::Shutdown;
