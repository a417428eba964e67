//! Plaintext HTTP relay.
//!
//! # Responsibilities
//! - Resolve the upstream authority from the target URL or Host header
//! - Forward the request with hop-by-hop headers stripped
//! - Buffer the upstream response and replay it to the client
//! - Produce one RequestRecord per exchange, success or failure
//!
//! # Design Decisions
//! - Responses are fully buffered, never streamed; chunked bodies are
//!   decoded and re-framed with an accurate Content-Length
//! - Request bodies are streamed upstream in fixed-size chunks up to the
//!   declared Content-Length (0 when absent or non-numeric); chunked
//!   request bodies are not supported
//! - Declared lengths are never allocated up front; buffers only grow
//!   with bytes actually received, so a hostile Content-Length or chunk
//!   size ends in an error, not an allocation failure
//! - The whole upstream exchange runs under one request timeout

use std::io::Cursor;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use url::Url;

use crate::config::TimeoutConfig;
use crate::relay::head::{read_head_bytes, RequestHead};
use crate::relay::{split_host_port, write_gateway_error, RelayError};
use crate::stats::{Method, RequestRecord};

const DEFAULT_HTTP_PORT: u16 = 80;
const BODY_CHUNK: usize = 8 * 1024;

/// Where an exchange is headed, resolved before any network activity.
struct Target {
    /// Authority as recorded in stats (`hostname[:port]`).
    authority: String,
    hostname: String,
    port: u16,
    /// Origin-form path (plus query) forwarded upstream.
    path: String,
}

/// Relay for GET/POST/PUT/DELETE/HEAD exchanges.
pub struct HttpRelay {
    connect_timeout: Duration,
    request_timeout: Duration,
    request_secs: u64,
}

impl HttpRelay {
    pub fn new(timeouts: &TimeoutConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(timeouts.connect_secs),
            request_timeout: Duration::from_secs(timeouts.request_secs),
            request_secs: timeouts.request_secs,
        }
    }

    /// Relay one exchange. Always returns a record; failures carry the
    /// error message and have already been signaled to the client with a
    /// best-effort 502.
    pub async fn handle(&self, mut client: TcpStream, head: RequestHead, leftover: Vec<u8>) -> RequestRecord {
        let start = Instant::now();

        let target = resolve_target(&head);
        let (authority, path) = match &target {
            Ok(t) => (t.authority.clone(), t.path.clone()),
            // Keep whatever partial routing information we have.
            Err(_) => (
                head.header("host").unwrap_or_default().to_string(),
                head.target.clone(),
            ),
        };
        let mut record = RequestRecord::begin(
            head.method,
            format!("http://{authority}{path}"),
            authority,
            path,
        );

        let outcome = match target {
            Ok(target) => {
                match tokio::time::timeout(
                    self.request_timeout,
                    self.exchange(&mut client, &head, leftover, &target, &mut record),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(RelayError::Timeout(self.request_secs)),
                }
            }
            Err(err) => Err(err),
        };

        record.duration_ms = start.elapsed().as_millis() as u64;
        if let Err(err) = outcome {
            write_gateway_error(&mut client, &err).await;
            record.error = Some(err.to_string());
        }
        record
    }

    /// The full upstream round trip. Fills in `status_code` as soon as an
    /// upstream status line is parsed, so an error later in the exchange
    /// still preserves it.
    async fn exchange(
        &self,
        client: &mut TcpStream,
        head: &RequestHead,
        leftover: Vec<u8>,
        target: &Target,
        record: &mut RequestRecord,
    ) -> Result<(), RelayError> {
        let mut upstream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((target.hostname.as_str(), target.port)),
        )
        .await
        .map_err(|_| RelayError::Connect {
            host: target.authority.clone(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
        })?
        .map_err(|e| RelayError::Connect {
            host: target.authority.clone(),
            source: e,
        })?;

        upstream
            .write_all(&build_upstream_head(head, target))
            .await
            .map_err(RelayError::Upstream)?;

        // The declared request body, streamed in chunks. Leftover bytes
        // read past the head come first.
        let mut client_reader = Cursor::new(leftover).chain(&mut *client);
        copy_request_body(&mut client_reader, &mut upstream, head.content_length()).await?;
        upstream.flush().await.map_err(RelayError::Upstream)?;

        // Upstream response head.
        let (response_head, response_leftover) = read_head_bytes(&mut upstream)
            .await
            .map_err(RelayError::Upstream)?;
        let (status, reason, response_headers) = parse_response_head(&response_head)?;
        record.status_code = Some(status);

        let response_body = read_response_body(
            head.method,
            status,
            &response_headers,
            response_leftover,
            &mut upstream,
        )
        .await?;

        // Replay to the client: status line, filtered headers, body.
        let client_head = build_client_head(status, &reason, &response_headers, head.method, response_body.len());
        client.write_all(&client_head).await.map_err(RelayError::Client)?;
        client
            .write_all(&response_body)
            .await
            .map_err(RelayError::Client)?;
        client.flush().await.map_err(RelayError::Client)?;

        record.response_size = response_body.len() as u64;
        Ok(())
    }
}

/// Stream up to `declared` request-body bytes from the client to the
/// upstream. The declared length only bounds the copy; a client that
/// closes early yields an error, and nothing is allocated for bytes
/// that never arrive.
async fn copy_request_body<R, W>(client: &mut R, upstream: &mut W, declared: u64) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; BODY_CHUNK];
    let mut remaining = declared;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = client.read(&mut buf[..want]).await.map_err(RelayError::Client)?;
        if n == 0 {
            return Err(RelayError::Client(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "client closed before end of request body",
            )));
        }
        upstream.write_all(&buf[..n]).await.map_err(RelayError::Upstream)?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Derive the upstream target from an absolute-form URL, falling back to
/// the Host header for origin-form requests. Default port is 80.
fn resolve_target(head: &RequestHead) -> Result<Target, RelayError> {
    if let Ok(url) = Url::parse(&head.target) {
        if url.has_host() {
            if url.scheme() != "http" {
                return Err(RelayError::InvalidTarget(head.target.clone()));
            }
            let hostname = url.host_str().unwrap_or_default().to_string();
            let port = url.port().unwrap_or(DEFAULT_HTTP_PORT);
            let authority = match url.port() {
                Some(port) => format!("{hostname}:{port}"),
                None => hostname.clone(),
            };
            let mut path = url.path().to_string();
            if path.is_empty() {
                path = "/".to_string();
            }
            if let Some(query) = url.query() {
                path = format!("{path}?{query}");
            }
            return Ok(Target {
                authority,
                hostname,
                port,
                path,
            });
        }
    }

    // Origin-form request; the Host header names the destination.
    let authority = head
        .header("host")
        .filter(|h| !h.is_empty())
        .ok_or_else(|| RelayError::InvalidTarget(head.target.clone()))?
        .to_string();
    let (hostname, port) = split_host_port(&authority, DEFAULT_HTTP_PORT)?;
    Ok(Target {
        authority,
        hostname,
        port,
        path: head.target.clone(),
    })
}

/// Serialize the request head for upstream: origin-form request line,
/// hop-by-hop headers dropped, Host guaranteed, Connection pinned to close.
fn build_upstream_head(head: &RequestHead, target: &Target) -> Vec<u8> {
    let mut out = format!("{} {} HTTP/1.1\r\n", head.method, target.path).into_bytes();

    let mut saw_host = false;
    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("proxy-connection") || name.eq_ignore_ascii_case("connection") {
            continue;
        }
        if name.eq_ignore_ascii_case("host") {
            saw_host = true;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if !saw_host {
        out.extend_from_slice(format!("Host: {}\r\n", target.authority).as_bytes());
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out
}

/// Parse an upstream status line and header fields.
fn parse_response_head(bytes: &[u8]) -> Result<(u16, String, Vec<(String, String)>), RelayError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| RelayError::BadResponse("response head is not valid UTF-8".to_string()))?;
    let mut lines = text.split("\r\n");

    let status_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| RelayError::BadResponse("empty status line".to_string()))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(RelayError::BadResponse(format!("bad status line '{status_line}'")));
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| RelayError::BadResponse(format!("bad status line '{status_line}'")))?;
    let reason = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| RelayError::BadResponse(format!("bad header field '{line}'")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok((status, reason, headers))
}

fn response_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Buffer the whole response body, honoring the upstream framing.
async fn read_response_body<R>(
    method: Method,
    status: u16,
    headers: &[(String, String)],
    leftover: Vec<u8>,
    upstream: &mut R,
) -> Result<Vec<u8>, RelayError>
where
    R: AsyncRead + Unpin,
{
    if method == Method::Head || status == 204 || status == 304 {
        return Ok(Vec::new());
    }

    let chunked = response_header(headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    let mut reader = BufReader::new(Cursor::new(leftover).chain(upstream));

    if chunked {
        return read_chunked_body(&mut reader).await;
    }

    match response_header(headers, "content-length").and_then(|v| v.trim().parse::<u64>().ok()) {
        Some(length) => {
            // The buffer grows with received bytes only; the declared
            // length is a limit, not an allocation.
            let mut body = Vec::new();
            reader
                .take(length)
                .read_to_end(&mut body)
                .await
                .map_err(RelayError::Upstream)?;
            if (body.len() as u64) < length {
                return Err(RelayError::Upstream(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "upstream closed before the declared content length",
                )));
            }
            Ok(body)
        }
        None => {
            // No framing information; the upstream signals the end by
            // closing (we always send Connection: close).
            let mut body = Vec::new();
            reader.read_to_end(&mut body).await.map_err(RelayError::Upstream)?;
            Ok(body)
        }
    }
}

/// Decode a chunked body into its plain bytes.
async fn read_chunked_body<R>(reader: &mut R) -> Result<Vec<u8>, RelayError>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut body = Vec::new();
    loop {
        let mut size_line = String::new();
        reader
            .read_line(&mut size_line)
            .await
            .map_err(RelayError::Upstream)?;
        let size_field = size_line
            .trim_end()
            .split(';')
            .next()
            .unwrap_or_default();
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| RelayError::BadResponse(format!("bad chunk size '{}'", size_line.trim_end())))?;

        if size == 0 {
            // Consume trailer fields through the final blank line.
            loop {
                let mut trailer = String::new();
                let n = reader.read_line(&mut trailer).await.map_err(RelayError::Upstream)?;
                if n == 0 || trailer == "\r\n" || trailer == "\n" {
                    break;
                }
            }
            return Ok(body);
        }

        // Incremental read; a lying chunk size ends in UnexpectedEof
        // rather than a giant allocation.
        let mut chunk = [0u8; BODY_CHUNK];
        let mut remaining = size;
        while remaining > 0 {
            let want = remaining.min(chunk.len());
            let n = reader.read(&mut chunk[..want]).await.map_err(RelayError::Upstream)?;
            if n == 0 {
                return Err(RelayError::Upstream(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "upstream closed mid-chunk",
                )));
            }
            body.extend_from_slice(&chunk[..n]);
            remaining -= n;
        }

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await.map_err(RelayError::Upstream)?;
        if &crlf != b"\r\n" {
            return Err(RelayError::BadResponse("missing chunk terminator".to_string()));
        }
    }
}

/// Serialize the response head for the client. Transfer-Encoding is
/// dropped (the body is no longer chunked); Content-Length is rewritten
/// to the buffered size, except for HEAD where upstream's declared
/// length is forwarded untouched.
fn build_client_head(
    status: u16,
    reason: &str,
    headers: &[(String, String)],
    method: Method,
    body_len: usize,
) -> Vec<u8> {
    let mut out = if reason.is_empty() {
        format!("HTTP/1.1 {status}\r\n").into_bytes()
    } else {
        format!("HTTP/1.1 {status} {reason}\r\n").into_bytes()
    };

    for (name, value) in headers {
        if name.eq_ignore_ascii_case("transfer-encoding") || name.eq_ignore_ascii_case("connection") {
            continue;
        }
        if name.eq_ignore_ascii_case("content-length") && method != Method::Head {
            continue;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if method != Method::Head {
        out.extend_from_slice(format!("Content-Length: {body_len}\r\n").as_bytes());
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out
}
