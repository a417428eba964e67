//! Network layer subsystem.
//!
//! # Responsibilities
//! - Bind the proxy's TCP listener
//! - Accept inbound client connections with backpressure
//!
//! Everything after accept (request-line routing, relaying) lives in
//! the relay and server modules.

pub mod listener;

pub use listener::{Listener, ListenerError};
