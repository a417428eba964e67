//! CONNECT tunnel relay.
//!
//! # Responsibilities
//! - Open a raw TCP connection to the CONNECT target, time-bounded
//! - Acknowledge the tunnel with `200 Connection Established`
//! - Splice bytes both ways until either side closes
//!
//! # Design Decisions
//! - Payloads are opaque; nothing is decrypted or inspected
//! - Both sockets are torn down as soon as either copy direction ends,
//!   so a close on one side promptly unblocks the other's read
//! - A tunnel torn down mid-stream is still a success: the record keeps
//!   `status_code = 200` and only pre-tunnel connect failures set `error`
//! - Per-direction byte counts are logged at debug; `response_size`
//!   stays 0 for tunnel records

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::TimeoutConfig;
use crate::relay::head::RequestHead;
use crate::relay::{split_host_port, write_gateway_error, RelayError};
use crate::stats::{Method, RequestRecord};

const DEFAULT_TLS_PORT: u16 = 443;
const SPLICE_CHUNK: usize = 8 * 1024;

const TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Relay for CONNECT exchanges.
pub struct TunnelRelay {
    connect_timeout: Duration,
}

impl TunnelRelay {
    pub fn new(timeouts: &TimeoutConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(timeouts.connect_secs),
        }
    }

    /// Establish and run one tunnel. The returned record carries the
    /// establishment outcome; how the byte stream ends afterwards does
    /// not change it.
    pub async fn handle(&self, mut client: TcpStream, head: RequestHead, leftover: Vec<u8>) -> RequestRecord {
        let authority = head.target.clone();
        let mut record = RequestRecord::begin(
            Method::Connect,
            format!("https://{authority}"),
            authority.clone(),
            String::new(),
        );
        let start = Instant::now();

        let mut upstream = match self.establish(&authority).await {
            Ok(upstream) => upstream,
            Err(err) => {
                record.duration_ms = start.elapsed().as_millis() as u64;
                write_gateway_error(&mut client, &err).await;
                record.error = Some(err.to_string());
                return record;
            }
        };

        if let Err(err) = client.write_all(TUNNEL_ESTABLISHED).await {
            // The tunnel was never usable; treat like a failed establish.
            let err = RelayError::Client(err);
            record.duration_ms = start.elapsed().as_millis() as u64;
            record.error = Some(err.to_string());
            return record;
        }

        record.status_code = Some(200);
        // Establishment time; a long-lived tunnel would otherwise dwarf
        // every other duration in the stats.
        record.duration_ms = start.elapsed().as_millis() as u64;

        // Bytes the client pipelined past the CONNECT head belong to the
        // tunnel payload.
        if !leftover.is_empty() && upstream.write_all(&leftover).await.is_err() {
            return record;
        }

        let (client_to_upstream, upstream_to_client) = splice(client, upstream).await;
        tracing::debug!(
            target_host = %record.host,
            client_to_upstream,
            upstream_to_client,
            "Tunnel closed"
        );
        record
    }

    async fn establish(&self, authority: &str) -> Result<TcpStream, RelayError> {
        let (hostname, port) = split_host_port(authority, DEFAULT_TLS_PORT)?;
        tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((hostname.as_str(), port)),
        )
        .await
        .map_err(|_| RelayError::Connect {
            host: authority.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
        })?
        .map_err(|e| RelayError::Connect {
            host: authority.to_string(),
            source: e,
        })
    }
}

/// Copy bytes both ways until either direction ends, then drop both
/// streams. Dropping closes the sockets, which is what unblocks a peer
/// still mid-read. Returns (client→upstream, upstream→client) byte counts.
async fn splice(mut client: TcpStream, mut upstream: TcpStream) -> (u64, u64) {
    let client_to_upstream = AtomicU64::new(0);
    let upstream_to_client = AtomicU64::new(0);

    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();

    tokio::select! {
        _ = copy_chunks(&mut client_read, &mut upstream_write, &client_to_upstream) => {}
        _ = copy_chunks(&mut upstream_read, &mut client_write, &upstream_to_client) => {}
    }

    (
        client_to_upstream.into_inner(),
        upstream_to_client.into_inner(),
    )
}

/// One copy direction: fixed-size chunks until EOF or error.
async fn copy_chunks<R, W>(src: &mut R, dst: &mut W, copied: &AtomicU64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; SPLICE_CHUNK];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return dst.shutdown().await;
        }
        dst.write_all(&buf[..n]).await?;
        copied.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn copy_chunks_counts_bytes() {
        let payload = vec![7u8; 20_000];
        let mut src = std::io::Cursor::new(payload.clone());
        let mut dst = Vec::new();
        let copied = AtomicU64::new(0);

        copy_chunks(&mut src, &mut dst, &copied).await.unwrap();
        assert_eq!(copied.into_inner(), 20_000);
        assert_eq!(dst, payload);
    }

    #[tokio::test]
    async fn splice_ends_when_client_closes() {
        // Echo upstream.
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = upstream_listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if socket.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let proxy_side_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_side_listener.local_addr().unwrap();

        let mut peer = TcpStream::connect(proxy_addr).await.unwrap();
        let (client, _) = proxy_side_listener.accept().await.unwrap();
        let upstream = TcpStream::connect(upstream_addr).await.unwrap();

        let splice_task = tokio::spawn(splice(client, upstream));

        peer.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        peer.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        drop(peer);
        let (sent, received) = tokio::time::timeout(Duration::from_secs(2), splice_task)
            .await
            .expect("splice did not end after the client closed")
            .unwrap();
        assert_eq!(sent, 4);
        assert_eq!(received, 4);
    }
}
