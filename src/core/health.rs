use hdrhistogram::Histogram;
use std::time::Duration;
use tokio::time::Instant;

use super::types::ConnectionStats;

/// Health monitor for the realtime socket, owned by the connection actor.
#[derive(Debug)]
pub struct ConnectionHealth {
    connection_started: Instant,
    last_message_received: Instant,
    messages_received: u64,
    frames_sent: u64,
    reconnects: u64,
    heartbeat_histogram: Histogram<u64>,
}

impl ConnectionHealth {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            connection_started: now,
            last_message_received: now,
            messages_received: 0,
            frames_sent: 0,
            reconnects: 0,
            heartbeat_histogram: Histogram::new_with_bounds(1, 60_000_000, 3)
                .expect("histogram bounds are valid"),
        }
    }

    /// Called on every successful open; counters survive, timestamps restart.
    pub fn reset(&mut self) {
        let now = Instant::now();
        self.connection_started = now;
        self.last_message_received = now;
    }

    pub fn record_message(&mut self) {
        self.last_message_received = Instant::now();
        self.messages_received = self.messages_received.saturating_add(1);
    }

    pub fn record_sent(&mut self) {
        self.frames_sent = self.frames_sent.saturating_add(1);
    }

    pub fn record_rtt(&mut self, rtt: Duration) {
        let micros = rtt.as_micros().min(u64::MAX as u128) as u64;
        let _ = self.heartbeat_histogram.record(micros.max(1));
    }

    pub fn increment_reconnect(&mut self) {
        self.reconnects = self.reconnects.saturating_add(1);
    }

    pub fn get_stats(&self) -> ConnectionStats {
        let samples = self.heartbeat_histogram.len();
        let (p50, p99) = if samples == 0 {
            (0, 0)
        } else {
            (
                self.heartbeat_histogram.value_at_percentile(50.0),
                self.heartbeat_histogram.value_at_percentile(99.0),
            )
        };

        ConnectionStats {
            uptime: self.connection_started.elapsed(),
            messages_received: self.messages_received,
            frames_sent: self.frames_sent,
            reconnects: self.reconnects,
            last_message_age: self.last_message_received.elapsed(),
            p50_heartbeat_rtt_us: p50,
            p99_heartbeat_rtt_us: p99,
            heartbeat_samples: samples,
        }
    }
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_rtt_percentiles() {
        let mut health = ConnectionHealth::new();
        health.record_rtt(Duration::from_micros(100));
        health.record_rtt(Duration::from_micros(200));
        health.record_rtt(Duration::from_micros(300));

        let stats = health.get_stats();
        assert_eq!(stats.heartbeat_samples, 3);
        assert_eq!(stats.p50_heartbeat_rtt_us, 200);
        assert_eq!(stats.p99_heartbeat_rtt_us, 300);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_keeps_counters_but_restarts_clock() {
        let mut health = ConnectionHealth::new();
        health.record_message();
        health.record_sent();
        health.increment_reconnect();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(health.get_stats().last_message_age, Duration::from_secs(10));

        health.reset();
        let stats = health.get_stats();
        assert_eq!(stats.uptime, Duration::ZERO);
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.reconnects, 1);
    }
}
