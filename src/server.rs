//! Proxy server: accept loop and per-connection dispatch.
//!
//! # Responsibilities
//! - Accept client connections from the bounded listener
//! - Read one request line per connection and route on the method
//! - Run each connection as an independent task; one slow or broken
//!   client never delays another
//! - Report every completed exchange to the stats registry and the
//!   operator traffic log

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use url::Url;

use crate::config::ProxyConfig;
use crate::net::{Listener, ListenerError};
use crate::observability::TrafficLog;
use crate::relay::{head, write_error_response, HttpRelay, RelayError, TunnelRelay};
use crate::stats::{Method, RequestRecord, StatsRegistry, StatsReporter};

/// The forward proxy: listener-facing accept loop plus the shared
/// registry and relays.
pub struct ProxyServer {
    config: ProxyConfig,
    stats: Arc<StatsRegistry>,
    traffic_log: Arc<TrafficLog>,
    http_relay: Arc<HttpRelay>,
    tunnel_relay: Arc<TunnelRelay>,
}

impl ProxyServer {
    /// Create a server with the given configuration.
    pub fn new(config: ProxyConfig) -> Self {
        let stats = Arc::new(StatsRegistry::new(config.stats.log_capacity));
        let traffic_log = Arc::new(TrafficLog::new());
        let http_relay = Arc::new(HttpRelay::new(&config.timeouts));
        let tunnel_relay = Arc::new(TunnelRelay::new(&config.timeouts));

        Self {
            config,
            stats,
            traffic_log,
            http_relay,
            tunnel_relay,
        }
    }

    /// Handle to the registry, for the exporter and for tests.
    pub fn stats(&self) -> Arc<StatsRegistry> {
        Arc::clone(&self.stats)
    }

    /// Accept and dispatch connections until the shutdown signal fires.
    ///
    /// Connection tasks outlive the loop; shutdown is fire-and-forget
    /// for anything already in flight.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ListenerError> {
        let reporter = StatsReporter::new(
            Arc::clone(&self.stats),
            Arc::clone(&self.traffic_log),
            Duration::from_secs(self.config.stats.summary_interval_secs),
        );
        tokio::spawn(reporter.run(shutdown.resubscribe()));

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => {
                    let (stream, peer, permit) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };

                    let http_relay = Arc::clone(&self.http_relay);
                    let tunnel_relay = Arc::clone(&self.tunnel_relay);
                    let stats = Arc::clone(&self.stats);
                    let traffic_log = Arc::clone(&self.traffic_log);
                    tokio::spawn(async move {
                        handle_connection(stream, peer, http_relay, tunnel_relay, stats, traffic_log).await;
                        drop(permit);
                    });
                }
            }
        }

        tracing::info!("Stopped accepting connections");
        Ok(())
    }
}

/// One client connection: read the request head, route on the method,
/// relay, report.
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    http_relay: Arc<HttpRelay>,
    tunnel_relay: Arc<TunnelRelay>,
    stats: Arc<StatsRegistry>,
    traffic_log: Arc<TrafficLog>,
) {
    let (request_head, leftover) = match head::read_head(&mut stream).await {
        Ok(parsed) => parsed,
        Err(RelayError::UnsupportedMethod(method)) => {
            tracing::debug!(peer_addr = %peer, method = %method, "Unsupported method");
            write_error_response(
                &mut stream,
                501,
                "Not Implemented",
                &format!("Unsupported method ({method})"),
            )
            .await;
            return;
        }
        // The request line parsed, so the exchange is attributable even
        // though the header fields did not.
        Err(RelayError::MalformedHeaders { method, target, detail }) => {
            tracing::debug!(
                peer_addr = %peer,
                method = %method,
                target = %target,
                error = %detail,
                "Malformed header fields"
            );
            write_error_response(&mut stream, 400, "Bad Request", &detail).await;
            let mut record = partial_record(method, &target);
            record.error = Some(format!("malformed header field: {detail}"));
            traffic_log.request(&record);
            stats.record(record);
            return;
        }
        // Routing never determined a method/target; drop without a record.
        Err(e) => {
            tracing::debug!(peer_addr = %peer, error = %e, "Dropping unroutable connection");
            return;
        }
    };

    tracing::debug!(
        peer_addr = %peer,
        method = %request_head.method,
        target = %request_head.target,
        "Dispatching request"
    );

    let record = match request_head.method {
        Method::Connect => tunnel_relay.handle(stream, request_head, leftover).await,
        _ => http_relay.handle(stream, request_head, leftover).await,
    };

    traffic_log.request(&record);
    stats.record(record);
}

/// Record for a request whose head never parsed past the request line.
/// The target is the only routing information available; the host is
/// derived from it where the form allows.
fn partial_record(method: Method, target: &str) -> RequestRecord {
    let (url, host) = match method {
        Method::Connect => (format!("https://{target}"), target.to_string()),
        _ => {
            let host = Url::parse(target)
                .ok()
                .and_then(|u| {
                    u.host_str().map(|h| match u.port() {
                        Some(port) => format!("{h}:{port}"),
                        None => h.to_string(),
                    })
                })
                .unwrap_or_default();
            (target.to_string(), host)
        }
    };
    RequestRecord::begin(method, url, host, String::new())
}
