//! Per-peer traffic statistics.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::protocol::TrafficSnapshot;

/// Interval at which traffic counters are folded into rates.
pub const STAT_INTERVAL: Duration = Duration::from_secs(5);

/// Snapshot of one connected peer, as handed to the metrics hook.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerMetrics {
    pub hash: String,
    pub peer_address: String,
    /// Unix seconds.
    pub moment_connected: u64,
    /// Unix seconds.
    pub last_receive: u64,
    /// Unix seconds.
    pub last_send: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub incoming: bool,
    pub protocol_version: u16,
    /// Messages per second received.
    pub mps_down: f64,
    /// Messages per second sent.
    pub mps_up: f64,
    /// Bytes per second received.
    pub bps_down: f64,
    /// Bytes per second sent.
    pub bps_up: f64,
    pub send_fill_ratio: f64,
    pub dropped: u64,
}

/// Running totals and rates of a peer, guarded by the peer's metrics lock.
#[derive(Debug, Clone)]
pub struct PeerStats {
    pub connected: SystemTime,
    pub last_receive: SystemTime,
    pub last_send: SystemTime,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub mps_down: f64,
    pub mps_up: f64,
    pub bps_down: f64,
    pub bps_up: f64,
}

impl PeerStats {
    pub fn new(now: SystemTime) -> Self {
        Self {
            connected: now,
            last_receive: now,
            last_send: now,
            bytes_received: 0,
            bytes_sent: 0,
            messages_received: 0,
            messages_sent: 0,
            mps_down: 0.0,
            mps_up: 0.0,
            bps_down: 0.0,
            bps_up: 0.0,
        }
    }

    /// Fold counters collected over `elapsed` into totals and rates.
    pub fn update(&mut self, snapshot: TrafficSnapshot, elapsed: Duration) {
        self.bytes_received += snapshot.bytes_read;
        self.bytes_sent += snapshot.bytes_written;
        self.messages_received += snapshot.messages_read;
        self.messages_sent += snapshot.messages_written;

        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bps_down = snapshot.bytes_read as f64 / secs;
            self.bps_up = snapshot.bytes_written as f64 / secs;
            self.mps_down = snapshot.messages_read as f64 / secs;
            self.mps_up = snapshot.messages_written as f64 / secs;
        }
    }
}

pub(crate) fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_accumulates_and_rates() {
        let mut stats = PeerStats::new(SystemTime::now());
        let snapshot = TrafficSnapshot {
            bytes_read: 500,
            bytes_written: 1000,
            messages_read: 5,
            messages_written: 10,
        };

        stats.update(snapshot, STAT_INTERVAL);
        stats.update(snapshot, STAT_INTERVAL);

        assert_eq!(stats.bytes_received, 1000);
        assert_eq!(stats.bytes_sent, 2000);
        assert_eq!(stats.messages_received, 10);
        assert_eq!(stats.messages_sent, 20);
        assert_eq!(stats.bps_down, 100.0);
        assert_eq!(stats.bps_up, 200.0);
        assert_eq!(stats.mps_down, 1.0);
        assert_eq!(stats.mps_up, 2.0);

        stats.update(TrafficSnapshot::default(), STAT_INTERVAL);
        assert_eq!(stats.bps_down, 0.0);
        assert_eq!(stats.bytes_received, 1000);
    }

    #[test]
    fn test_metrics_serialize() {
        let metrics = PeerMetrics {
            hash: "127.0.0.1:8108 00000001".to_string(),
            incoming: true,
            protocol_version: 11,
            ..Default::default()
        };
        let json = serde_json::to_string(&metrics).unwrap();
        assert!(json.contains("\"incoming\":true"));
        assert!(json.contains("\"protocol_version\":11"));
    }
}
