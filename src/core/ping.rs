use std::time::Duration;

use tokio::time::Instant;

/// Application-level heartbeat: `{"type":"ping"}` out, `{"type":"pong"}` back.
///
/// There is no pong deadline. The server side and the socket's own liveness
/// detection close dead connections; this only measures round-trips.
#[derive(Debug)]
pub struct JsonHeartbeat {
    interval: Duration,
    last_ping: Option<Instant>,
    last_pong: Option<Instant>,
}

/// Wire form of an outbound ping envelope.
pub const PING_PAYLOAD: &str = r#"{"type":"ping"}"#;

impl JsonHeartbeat {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_ping: None,
            last_pong: None,
        }
    }

    /// Mark a ping as sent; the next pong is timed against it.
    pub fn record_ping(&mut self) {
        self.last_ping = Some(Instant::now());
    }

    /// Record a pong; returns the round-trip when it answers an outstanding ping.
    pub fn on_pong(&mut self) -> Option<Duration> {
        let now = Instant::now();
        let rtt = match (self.last_ping, self.last_pong) {
            (Some(sent), Some(prev)) if prev >= sent => None,
            (Some(sent), _) => Some(now.saturating_duration_since(sent)),
            (None, _) => None,
        };
        self.last_pong = Some(now);
        rtt
    }

    pub fn reset(&mut self) {
        self.last_ping = None;
        self.last_pong = None;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn pong_reports_rtt_once_per_ping() {
        let mut heartbeat = JsonHeartbeat::new(Duration::from_secs(30));
        assert!(heartbeat.on_pong().is_none(), "unsolicited pong has no rtt");

        heartbeat.record_ping();

        tokio::time::advance(Duration::from_millis(40)).await;
        assert_eq!(heartbeat.on_pong(), Some(Duration::from_millis(40)));
        assert!(heartbeat.on_pong().is_none(), "duplicate pong is ignored");

        heartbeat.reset();
        assert!(heartbeat.on_pong().is_none());
    }
}
