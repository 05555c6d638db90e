use std::time::Duration;

use url::Url;

use crate::core::{LinkError, LinkResult};
use crate::location::LocationAccuracy;

pub const DEFAULT_API_HOST: &str = "http://localhost:8000";
pub const DEFAULT_REALTIME_PATH: &str = "/api/v1/ws";

/// Socket policy for the connection actor.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub heartbeat_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_reconnect_attempts: u32,
    /// Reason sent with the normal-closure frame on `Disconnect`.
    pub close_reason: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            backoff_base: Duration::from_millis(1_000),
            backoff_max: Duration::from_millis(30_000),
            max_reconnect_attempts: 10,
            close_reason: "Driver went offline".to_string(),
        }
    }
}

/// Sampling and watchdog policy for the location reporter.
#[derive(Debug, Clone)]
pub struct TrackingConfig {
    pub accuracy: LocationAccuracy,
    pub sample_interval: Duration,
    /// Zero so a parked device still reports.
    pub min_distance_m: f64,
    pub watchdog_period: Duration,
    pub stale_threshold: Duration,
    pub restart_delay: Duration,
    /// Log every n-th sample at info level.
    pub log_every: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            accuracy: LocationAccuracy::Balanced,
            sample_interval: Duration::from_secs(10),
            min_distance_m: 0.0,
            watchdog_period: Duration::from_secs(20),
            stale_threshold: Duration::from_secs(45),
            restart_delay: Duration::from_secs(1),
            log_every: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// HTTP base of the driver API; the realtime URL is derived from it.
    pub api_host: String,
    /// Full realtime base (`ws://host/api/v1/ws`) overriding the derived one.
    pub realtime_base: Option<String>,
    pub realtime_path: String,
    pub connection: ConnectionConfig,
    pub tracking: TrackingConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            api_host: DEFAULT_API_HOST.to_string(),
            realtime_base: None,
            realtime_path: DEFAULT_REALTIME_PATH.to_string(),
            connection: ConnectionConfig::default(),
            tracking: TrackingConfig::default(),
        }
    }
}

impl LinkConfig {
    /// Defaults overlaid with `API_HOST` and `WS_BASE_URL` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(host) = non_empty_env("API_HOST") {
            config.api_host = host;
        }
        config.realtime_base = non_empty_env("WS_BASE_URL");
        config
    }

    pub fn validate(&self) -> LinkResult<()> {
        if self.connection.heartbeat_interval.is_zero() {
            return Err(LinkError::InvalidConfig(
                "heartbeat interval must be non-zero".to_string(),
            ));
        }
        if self.tracking.watchdog_period.is_zero() {
            return Err(LinkError::InvalidConfig(
                "watchdog period must be non-zero".to_string(),
            ));
        }
        self.realtime_base_url().map(|_| ())
    }

    /// Realtime base URL: the override if present, else the API host with its
    /// scheme swapped (`http` to `ws`, `https` to `wss`) plus the realtime path.
    pub fn realtime_base_url(&self) -> LinkResult<Url> {
        if let Some(base) = self.realtime_base.as_deref() {
            return Url::parse(base)
                .map_err(|err| LinkError::InvalidConfig(format!("WS_BASE_URL: {err}")));
        }

        let mut url = Url::parse(&self.api_host)
            .map_err(|err| LinkError::InvalidConfig(format!("API_HOST: {err}")))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(LinkError::InvalidConfig(format!(
                    "unsupported API scheme {other}"
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| LinkError::InvalidConfig("cannot switch to realtime scheme".into()))?;
        url.set_path(&self.realtime_path);
        url.set_query(None);
        Ok(url)
    }

    /// `<base>/driver/<driver_id>?token=<token>`
    pub fn realtime_url(&self, driver_id: &str, token: &str) -> LinkResult<Url> {
        let mut url = self.realtime_base_url()?;
        url.path_segments_mut()
            .map_err(|_| LinkError::InvalidConfig("realtime base cannot carry a path".into()))?
            .pop_if_empty()
            .push("driver")
            .push(driver_id);
        url.query_pairs_mut().clear().append_pair("token", token);
        Ok(url)
    }
}

/// Render a realtime URL for logs with the bearer token masked.
pub fn redact_token(url: &Url) -> String {
    let mut redacted = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let value = if k == "token" { "***".to_string() } else { v.into_owned() };
            (k.into_owned(), value)
        })
        .collect();
    if pairs.is_empty() {
        return redacted.to_string();
    }
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_host_maps_to_ws_driver_path() {
        let config = LinkConfig::default();
        let url = config.realtime_url("driver-42", "abc").unwrap();
        assert_eq!(
            url.as_str(),
            "ws://localhost:8000/api/v1/ws/driver/driver-42?token=abc"
        );
    }

    #[test]
    fn https_host_maps_to_wss() {
        let config = LinkConfig {
            api_host: "https://api.example.com".to_string(),
            ..LinkConfig::default()
        };
        let url = config.realtime_url("7", "t").unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/api/v1/ws/driver/7");
    }

    #[test]
    fn override_base_is_used_verbatim() {
        let config = LinkConfig {
            realtime_base: Some("wss://rt.example.com/socket/".to_string()),
            ..LinkConfig::default()
        };
        let url = config.realtime_url("9", "t").unwrap();
        assert_eq!(url.as_str(), "wss://rt.example.com/socket/driver/9?token=t");
    }

    #[test]
    fn token_is_query_encoded_and_redacted() {
        let config = LinkConfig::default();
        let url = config.realtime_url("1", "a b&c").unwrap();
        assert_eq!(url.query(), Some("token=a+b%26c"));
        let shown = redact_token(&url);
        assert!(!shown.contains("a+b"));
        assert!(shown.ends_with("token=***") || shown.ends_with("token=%2A%2A%2A"));
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let config = LinkConfig {
            api_host: "ftp://example.com".to_string(),
            ..LinkConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(LinkError::InvalidConfig(_))
        ));
    }
}
