//! Relay subsystem.
//!
//! # Data Flow
//! ```text
//! accepted connection
//!     → head.rs (read request head, parse request line)
//!     → route on method:
//!         CONNECT   → tunnel.rs (raw byte splice)
//!         otherwise → http.rs (buffered request/response relay)
//!     → RequestRecord → stats registry
//! ```
//!
//! # Design Decisions
//! - Every per-request failure is contained in its connection task
//! - The client always gets a gateway-style error response on failure,
//!   written best-effort so a dead client cannot crash the relay
//! - One proxied exchange per client connection; the proxy closes after
//!   answering

pub mod head;
pub mod http;
pub mod tunnel;

pub use head::RequestHead;
pub use http::HttpRelay;
pub use tunnel::TunnelRelay;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::stats::Method;

/// Error type for relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("malformed request: {0}")]
    Malformed(String),
    /// Header fields failed to parse after a valid request line; the
    /// method and target are kept so the exchange can still be recorded.
    #[error("malformed header field: {detail}")]
    MalformedHeaders {
        method: Method,
        target: String,
        detail: String,
    },
    #[error("unsupported method '{0}'")]
    UnsupportedMethod(String),
    #[error("invalid target '{0}'")]
    InvalidTarget(String),
    #[error("connect to {host} failed: {source}")]
    Connect {
        host: String,
        source: std::io::Error,
    },
    #[error("timed out after {0}s")]
    Timeout(u64),
    #[error("upstream error: {0}")]
    Upstream(std::io::Error),
    #[error("client error: {0}")]
    Client(std::io::Error),
    #[error("bad upstream response: {0}")]
    BadResponse(String),
}

/// Split `host[:port]` into hostname and port, with bracketed IPv6 support.
pub(crate) fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16), RelayError> {
    let invalid = || RelayError::InvalidTarget(authority.to_string());

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
        return match after.strip_prefix(':') {
            Some(port) => Ok((host.to_string(), port.parse().map_err(|_| invalid())?)),
            None if after.is_empty() => Ok((host.to_string(), default_port)),
            None => Err(invalid()),
        };
    }

    match authority.rsplit_once(':') {
        // A second colon means an unbracketed IPv6 literal.
        Some((host, _)) if host.contains(':') => Err(invalid()),
        Some((host, port)) if !host.is_empty() => {
            Ok((host.to_string(), port.parse().map_err(|_| invalid())?))
        }
        Some(_) => Err(invalid()),
        None if authority.is_empty() => Err(invalid()),
        None => Ok((authority.to_string(), default_port)),
    }
}

/// Best-effort error response to the client. Failures here are ignored;
/// the connection is closing either way.
pub(crate) async fn write_error_response<W>(client: &mut W, status: u16, reason: &str, message: &str)
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{message}",
        message.len(),
    );
    let _ = client.write_all(response.as_bytes()).await;
    let _ = client.flush().await;
}

/// Gateway error for a failed relay, mirroring the operator log message.
pub(crate) async fn write_gateway_error<W>(client: &mut W, error: &RelayError)
where
    W: AsyncWrite + Unpin,
{
    write_error_response(client, 502, "Bad Gateway", &format!("Proxy Error: {error}")).await;
}
