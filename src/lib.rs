//! Traffic-recording forward proxy for sandboxed VMs.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌───────────────────────────────────────────────┐
//!                    │                FORWARD PROXY                  │
//!                    │                                               │
//!   VM request       │  ┌──────────┐   ┌─────────────────────────┐  │
//!   ─────────────────┼─▶│   net    │──▶│         relay           │  │
//!                    │  │ listener │   │  CONNECT → tunnel.rs    │──┼──▶ Destination
//!                    │  └──────────┘   │  others  → http.rs      │  │
//!                    │                 └───────────┬─────────────┘  │
//!                    │                             │ RequestRecord  │
//!                    │                             ▼                │
//!                    │  ┌───────────────────────────────────────┐   │
//!                    │  │    stats (registry, reporter, export) │   │
//!                    │  └───────────────────────────────────────┘   │
//!                    │                                               │
//!                    │  Cross-cutting: config, observability,        │
//!                    │  lifecycle (shutdown/signals)                 │
//!                    └───────────────────────────────────────────────┘
//! ```
//!
//! Plain HTTP requests are relayed and measured; CONNECT requests become
//! opaque byte tunnels. Every exchange produces one request record in
//! the stats registry, which the reporter summarizes and the export
//! serializes to JSON.

// Core subsystems
pub mod config;
pub mod net;
pub mod relay;
pub mod server;
pub mod stats;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::ProxyConfig;
pub use lifecycle::Shutdown;
pub use server::ProxyServer;
