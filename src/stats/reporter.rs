//! Periodic traffic summary task.
//!
//! # Responsibilities
//! - Emit one summary line per interval via the traffic log
//! - Never block relay traffic (its only registry access is `snapshot()`)
//! - Stop silently on the shutdown signal

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::Level;

use crate::observability::TrafficLog;
use crate::stats::registry::StatsRegistry;

/// Background task summarizing registry state at a fixed interval.
pub struct StatsReporter {
    stats: Arc<StatsRegistry>,
    traffic_log: Arc<TrafficLog>,
    interval: Duration,
}

impl StatsReporter {
    pub fn new(stats: Arc<StatsRegistry>, traffic_log: Arc<TrafficLog>, interval: Duration) -> Self {
        Self {
            stats,
            traffic_log,
            interval,
        }
    }

    /// Run until the shutdown signal fires. Consumes only snapshots, so
    /// there is nothing to drain on exit.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick completes immediately; skip it so the first
        // summary lands one full interval after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.emit_summary(),
                _ = shutdown.recv() => break,
            }
        }
    }

    fn emit_summary(&self) {
        let snapshot = self.stats.snapshot();
        self.traffic_log.record(
            Level::INFO,
            &format!(
                "Stats: {} requests, {} unique hosts, {:.2} MB transferred",
                snapshot.total_requests,
                snapshot.unique_hosts.len(),
                snapshot.total_bytes as f64 / 1024.0 / 1024.0,
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Shutdown;

    #[tokio::test]
    async fn reporter_stops_on_shutdown() {
        let stats = Arc::new(StatsRegistry::new(10));
        let traffic_log = Arc::new(TrafficLog::new());
        let reporter = StatsReporter::new(stats, traffic_log, Duration::from_millis(10));

        let shutdown = Shutdown::new();
        let handle = tokio::spawn(reporter.run(shutdown.subscribe()));

        tokio::time::sleep(Duration::from_millis(35)).await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reporter did not stop after shutdown")
            .unwrap();
    }
}
