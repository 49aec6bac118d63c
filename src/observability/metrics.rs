//! Process-wide connectivity counters
//!
//! Lock-free atomics for the hot paths (consumption, settlement, publishing)
//! and a bounded, mutex-protected sample of connect durations. There is no
//! exporter; callers take a [`MetricsSnapshot`] and ship it where they like.

use crate::transport::Disposition;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Connect durations kept for percentile calculation
const MAX_DURATION_SAMPLES: usize = 1000;

pub static METRICS: Lazy<ConnectivityMetrics> = Lazy::new(ConnectivityMetrics::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static ConnectivityMetrics {
    &METRICS
}

pub struct ConnectivityMetrics {
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    session_recoveries: AtomicU64,
    messages_consumed: AtomicU64,
    settled_accepted: AtomicU64,
    settled_rejected: AtomicU64,
    settled_released: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    queue_full_drops: AtomicU64,
    backoff_rejects: AtomicU64,
    producer_backoffs: AtomicU64,
    started_at: AtomicU64,
    connect_times: Mutex<Vec<u64>>,
}

impl Default for ConnectivityMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityMetrics {
    pub fn new() -> Self {
        Self {
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            session_recoveries: AtomicU64::new(0),
            messages_consumed: AtomicU64::new(0),
            settled_accepted: AtomicU64::new(0),
            settled_rejected: AtomicU64::new(0),
            settled_released: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            queue_full_drops: AtomicU64::new(0),
            backoff_rejects: AtomicU64::new(0),
            producer_backoffs: AtomicU64::new(0),
            started_at: AtomicU64::new(current_timestamp()),
            connect_times: Mutex::new(Vec::new()),
        }
    }

    pub fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_established(&self, duration: Duration) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut times) = self.connect_times.lock() {
            times.push(duration.as_millis() as u64);
            if times.len() > MAX_DURATION_SAMPLES {
                times.remove(0);
            }
        }
    }

    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_recovery(&self) {
        self.session_recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_consumed(&self) {
        self.messages_consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_settlement(&self, disposition: Disposition) {
        let counter = match disposition {
            Disposition::Accepted => &self.settled_accepted,
            Disposition::Rejected => &self.settled_rejected,
            Disposition::Released => &self.settled_released,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_full_drop(&self) {
        self.queue_full_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backoff_reject(&self) {
        self.backoff_rejects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_producer_backoff(&self) {
        self.producer_backoffs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (connect_avg_ms, connect_p95_ms) = match self.connect_times.lock() {
            Ok(times) if !times.is_empty() => {
                let mut sorted = times.clone();
                sorted.sort_unstable();
                let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
                (avg, percentile(&sorted, 95.0))
            }
            _ => (0.0, 0.0),
        };
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        MetricsSnapshot {
            timestamp: current_timestamp(),
            uptime_seconds: current_timestamp().saturating_sub(load(&self.started_at)),
            connections: ConnectionMetrics {
                attempts: load(&self.connection_attempts),
                established: load(&self.connections_established),
                failures: load(&self.connection_failures),
                session_recoveries: load(&self.session_recoveries),
                connect_avg_ms,
                connect_p95_ms,
            },
            inbound: InboundMetrics {
                consumed: load(&self.messages_consumed),
                accepted: load(&self.settled_accepted),
                rejected: load(&self.settled_rejected),
                released: load(&self.settled_released),
            },
            outbound: OutboundMetrics {
                published: load(&self.messages_published),
                failures: load(&self.publish_failures),
                queue_full_drops: load(&self.queue_full_drops),
                backoff_rejects: load(&self.backoff_rejects),
                producer_backoffs: load(&self.producer_backoffs),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub connections: ConnectionMetrics,
    pub inbound: InboundMetrics,
    pub outbound: OutboundMetrics,
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub attempts: u64,
    pub established: u64,
    pub failures: u64,
    pub session_recoveries: u64,
    pub connect_avg_ms: f64,
    pub connect_p95_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InboundMetrics {
    pub consumed: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub released: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundMetrics {
    pub published: u64,
    pub failures: u64,
    pub queue_full_drops: u64,
    pub backoff_rejects: u64,
    pub producer_backoffs: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Nearest-rank percentile of an ascending slice
fn percentile(sorted: &[u64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)] as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settlement_counters() {
        let metrics = ConnectivityMetrics::new();
        metrics.record_settlement(Disposition::Accepted);
        metrics.record_settlement(Disposition::Accepted);
        metrics.record_settlement(Disposition::Released);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.inbound.accepted, 2);
        assert_eq!(snapshot.inbound.rejected, 0);
        assert_eq!(snapshot.inbound.released, 1);
    }

    #[test]
    fn test_connect_duration_statistics() {
        let metrics = ConnectivityMetrics::new();
        for ms in [10, 20, 30, 40, 100] {
            metrics.record_connection_established(Duration::from_millis(ms));
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections.established, 5);
        assert!((snapshot.connections.connect_avg_ms - 40.0).abs() < f64::EPSILON);
        assert!((snapshot.connections.connect_p95_ms - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_duration_samples_are_bounded() {
        let metrics = ConnectivityMetrics::new();
        for _ in 0..(MAX_DURATION_SAMPLES + 10) {
            metrics.record_connection_established(Duration::from_millis(1));
        }
        assert_eq!(
            metrics.connect_times.lock().map(|t| t.len()).unwrap_or(0),
            MAX_DURATION_SAMPLES
        );
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = ConnectivityMetrics::new();
        metrics.record_queue_full_drop();
        let json = metrics.snapshot().to_json();
        assert_eq!(json["outbound"]["queue_full_drops"], 1);
    }

    #[test]
    fn test_percentile() {
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(percentile(&[5], 99.0), 5.0);
        assert_eq!(percentile(&[1, 2, 3, 4, 5], 50.0), 3.0);
    }
}
