//! Request-head reading and parsing.
//!
//! # Responsibilities
//! - Read bytes up to the blank line ending a message head
//! - Parse the request line (method, target, version) and header fields
//! - Hand back any bytes read past the head, untouched
//!
//! Routing only ever looks at the request line; the header fields are
//! carried along for whichever relay wins the dispatch.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::relay::RelayError;
use crate::stats::Method;

/// Upper bound on a message head. Anything larger is rejected rather
/// than buffered.
pub(crate) const MAX_HEAD_BYTES: usize = 32 * 1024;

/// A parsed request head: the request line plus header fields.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    /// Raw request target: absolute URL, origin-form path, or the
    /// `host:port` authority of a CONNECT.
    pub target: String,
    pub version: String,
    /// Header fields in arrival order, original casing preserved.
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Case-insensitive header lookup, first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Declared request body length. Absent or non-numeric means 0; the
    /// relay does not support chunked request bodies.
    pub fn content_length(&self) -> u64 {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// Read raw bytes until the `\r\n\r\n` ending a message head.
///
/// Returns the head bytes (terminator included) and whatever was read
/// past it. Used for both the client request and the upstream response.
pub(crate) async fn read_head_bytes<R>(stream: &mut R) -> std::io::Result<(Vec<u8>, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut acc: Vec<u8> = Vec::with_capacity(1024);
    let mut buf = [0u8; 1024];

    loop {
        // Only the unseen tail can contain the terminator start.
        let search_from = acc.len().saturating_sub(3);
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before end of message head",
            ));
        }
        acc.extend_from_slice(&buf[..n]);

        if let Some(pos) = find_terminator(&acc, search_from) {
            let leftover = acc.split_off(pos + 4);
            return Ok((acc, leftover));
        }
        if acc.len() > MAX_HEAD_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "message head exceeds maximum size",
            ));
        }
    }
}

fn find_terminator(haystack: &[u8], from: usize) -> Option<usize> {
    haystack[from..]
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| from + i)
}

/// Read and parse one request head from the client.
pub async fn read_head<R>(stream: &mut R) -> Result<(RequestHead, Vec<u8>), RelayError>
where
    R: AsyncRead + Unpin,
{
    let (bytes, leftover) = read_head_bytes(stream)
        .await
        .map_err(|e| RelayError::Malformed(e.to_string()))?;
    let head = parse_head(&bytes)?;
    Ok((head, leftover))
}

/// Parse head bytes into a request line and header fields.
pub(crate) fn parse_head(bytes: &[u8]) -> Result<RequestHead, RelayError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| RelayError::Malformed("request head is not valid UTF-8".to_string()))?;
    let mut lines = text.split("\r\n");

    let request_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| RelayError::Malformed("empty request line".to_string()))?;

    let mut parts = request_line.split_ascii_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v), None) => (m, t, v),
        _ => {
            return Err(RelayError::Malformed(format!(
                "bad request line '{request_line}'"
            )))
        }
    };

    let method: Method = method
        .parse()
        .map_err(|_| RelayError::UnsupportedMethod(method.to_string()))?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        // The request line already parsed; keep it with the error so the
        // caller can answer and record against it.
        let (name, value) = match line.split_once(':') {
            Some(parsed) => parsed,
            None => {
                return Err(RelayError::MalformedHeaders {
                    method,
                    target: target.to_string(),
                    detail: format!("bad header field '{line}'"),
                })
            }
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(RequestHead {
        method,
        target: target.to_string(),
        version: version.to_string(),
        headers,
    })
}
