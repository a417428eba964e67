//! Record and snapshot types shared by the relays, registry and reporter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

/// HTTP methods the proxy relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Connect,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Connect => "CONNECT",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "HEAD" => Ok(Method::Head),
            "CONNECT" => Ok(Method::Connect),
            _ => Err(()),
        }
    }
}

/// One proxied exchange. Immutable once handed to the registry.
///
/// Exactly one terminal outcome per record: either `error` is set, or the
/// exchange completed and `status_code` holds whatever upstream produced
/// (the tunnel-established acknowledgment counts as a completion).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub timestamp: DateTime<Utc>,
    pub method: Method,
    pub url: String,
    /// Destination authority (`hostname[:port]`), the stats grouping key.
    pub host: String,
    pub path: String,
    pub status_code: Option<u16>,
    /// Response body bytes written back to the client. Always 0 for tunnels.
    pub response_size: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl RequestRecord {
    /// Start a record for an exchange beginning now. Outcome fields are
    /// filled in by the relay before the record is reported.
    pub fn begin(method: Method, url: String, host: String, path: String) -> Self {
        Self {
            timestamp: Utc::now(),
            method,
            url,
            host,
            path,
            status_code: None,
            response_size: 0,
            duration_ms: 0,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Point-in-time aggregate over every record the registry has seen.
///
/// Safe to read without synchronization once produced; `successful_requests
/// + failed_requests == total_requests` holds for every snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Sum of `response_size` over successful records only.
    pub total_bytes: u64,
    pub unique_hosts: BTreeSet<String>,
    pub requests_by_host: BTreeMap<String, u64>,
    pub uptime_seconds: f64,
}
