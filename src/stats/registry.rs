//! Aggregate counters and the bounded recent-log ring.
//!
//! # Responsibilities
//! - Single source of truth for traffic statistics
//! - Serialize all mutation through one critical section
//! - Evict the oldest record once the ring is at capacity
//! - Export `{stats, logs}` as a JSON document on demand

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use crate::stats::model::{RequestRecord, StatsSnapshot};

/// Error type for export operations.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("failed to write export file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize export document: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Shape of the on-disk export document.
#[derive(Serialize)]
struct ExportDocument<'a> {
    stats: &'a StatsSnapshot,
    logs: &'a [RequestRecord],
}

/// State behind the mutex. One in-flight connection per caller, so the
/// critical sections stay short: a handful of counter updates per record.
struct Counters {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    total_bytes: u64,
    requests_by_host: BTreeMap<String, u64>,
    ring: VecDeque<RequestRecord>,
}

/// Owns the mutable traffic statistics for the process lifetime.
///
/// Created once at proxy startup and shared via `Arc` with every
/// connection task and the reporter.
pub struct StatsRegistry {
    inner: Mutex<Counters>,
    capacity: usize,
    started: Instant,
}

impl StatsRegistry {
    /// Create a registry retaining at most `capacity` recent records.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Counters {
                total_requests: 0,
                successful_requests: 0,
                failed_requests: 0,
                total_bytes: 0,
                requests_by_host: BTreeMap::new(),
                ring: VecDeque::with_capacity(capacity),
            }),
            capacity,
            started: Instant::now(),
        }
    }

    /// Fold one completed exchange into the aggregates and the ring.
    ///
    /// A task that panicked while holding the lock poisons it; the
    /// counters are still usable in that state, so the poison is cleared
    /// rather than cascaded to every later caller.
    pub fn record(&self, record: RequestRecord) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        inner.total_requests += 1;
        *inner
            .requests_by_host
            .entry(record.host.clone())
            .or_insert(0) += 1;

        if record.is_success() {
            inner.successful_requests += 1;
            inner.total_bytes += record.response_size;
        } else {
            inner.failed_requests += 1;
        }

        if inner.ring.len() == self.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(record);
    }

    /// Copy out the current aggregates. The caller never holds the lock.
    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        StatsSnapshot {
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            total_bytes: inner.total_bytes,
            unique_hosts: inner.requests_by_host.keys().cloned().collect(),
            requests_by_host: inner.requests_by_host.clone(),
            uptime_seconds: self.started.elapsed().as_secs_f64(),
        }
    }

    /// Up to the last `n` records, oldest first.
    pub fn recent(&self, n: usize) -> Vec<RequestRecord> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = inner.ring.len().saturating_sub(n);
        inner.ring.iter().skip(skip).cloned().collect()
    }

    /// Number of records currently retained in the ring.
    pub fn retained(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).ring.len()
    }

    /// Write `{stats, logs}` to `path` as pretty-printed JSON.
    pub fn export(&self, path: &Path) -> Result<(), ExportError> {
        let snapshot = self.snapshot();
        let logs = self.recent(self.capacity);
        let document = ExportDocument {
            stats: &snapshot,
            logs: &logs,
        };

        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, &document)?;

        tracing::info!(path = %path.display(), records = logs.len(), "Traffic log exported");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::model::Method;
    use std::sync::Arc;

    fn record_for(host: &str, size: u64, error: Option<&str>) -> RequestRecord {
        let mut record = RequestRecord::begin(
            Method::Get,
            format!("http://{host}/"),
            host.to_string(),
            "/".to_string(),
        );
        record.response_size = size;
        record.status_code = error.is_none().then_some(200);
        record.error = error.map(str::to_string);
        record
    }

    #[test]
    fn counters_stay_consistent() {
        let registry = StatsRegistry::new(10);
        registry.record(record_for("a.test", 10, None));
        registry.record(record_for("b.test", 20, None));
        registry.record(record_for("a.test", 0, Some("connect refused")));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.successful_requests, 2);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(
            snapshot.successful_requests + snapshot.failed_requests,
            snapshot.total_requests
        );
        // Failed records contribute to counts but not bytes.
        assert_eq!(snapshot.total_bytes, 30);
        assert_eq!(snapshot.unique_hosts.len(), 2);
        assert_eq!(snapshot.requests_by_host["a.test"], 2);
        assert_eq!(snapshot.requests_by_host["b.test"], 1);
    }

    #[test]
    fn unique_hosts_match_per_host_keys() {
        let registry = StatsRegistry::new(10);
        for host in ["x.test", "y.test", "x.test", "z.test"] {
            registry.record(record_for(host, 1, None));
        }
        let snapshot = registry.snapshot();
        let keys: Vec<_> = snapshot.requests_by_host.keys().cloned().collect();
        let hosts: Vec<_> = snapshot.unique_hosts.iter().cloned().collect();
        assert_eq!(keys, hosts);
    }

    #[test]
    fn ring_evicts_oldest_at_capacity() {
        let registry = StatsRegistry::new(3);
        for i in 0..5u64 {
            registry.record(record_for(&format!("h{i}.test"), i, None));
        }

        let recent = registry.recent(10);
        assert_eq!(recent.len(), 3);
        let hosts: Vec<_> = recent.iter().map(|r| r.host.as_str()).collect();
        assert_eq!(hosts, ["h2.test", "h3.test", "h4.test"]);

        // Aggregates are not affected by eviction.
        assert_eq!(registry.snapshot().total_requests, 5);
    }

    #[test]
    fn recent_returns_last_n_in_order() {
        let registry = StatsRegistry::new(10);
        for i in 0..4u64 {
            registry.record(record_for(&format!("h{i}.test"), i, None));
        }
        let last_two = registry.recent(2);
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].host, "h2.test");
        assert_eq!(last_two[1].host, "h3.test");
    }

    #[test]
    fn poisoned_lock_does_not_stop_recording() {
        let registry = Arc::new(StatsRegistry::new(10));
        let poisoner = Arc::clone(&registry);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.inner.lock().unwrap();
            panic!("holding the stats lock");
        })
        .join();

        registry.record(record_for("alive.test", 1, None));
        assert_eq!(registry.snapshot().total_requests, 1);
        assert_eq!(registry.recent(1).len(), 1);
        assert_eq!(registry.retained(), 1);
    }

    #[test]
    fn export_round_trips() {
        let registry = StatsRegistry::new(3);
        for i in 0..5u64 {
            registry.record(record_for("roundtrip.test", i, None));
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        registry.export(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let document: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(document["stats"]["total_requests"], 5);
        assert_eq!(document["logs"].as_array().unwrap().len(), 3);
        assert_eq!(document["logs"][0]["method"], "GET");
        assert_eq!(document["logs"][0]["host"], "roundtrip.test");
    }

    #[test]
    fn concurrent_recording_loses_nothing() {
        let registry = Arc::new(StatsRegistry::new(1000));
        let mut handles = Vec::new();
        for t in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    registry.record(record_for(&format!("t{t}.test"), 1, None));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.total_requests, 800);
        assert_eq!(snapshot.successful_requests, 800);
        assert_eq!(snapshot.total_bytes, 800);
        assert_eq!(snapshot.unique_hosts.len(), 8);
        assert_eq!(registry.retained(), 800);
    }
}
