use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::Stream;
use thiserror::Error;

use super::sample::PositionFix;
use crate::config::TrackingConfig;

pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Continuous position feed. Dropping the stream ends the device subscription.
pub type PositionStream = Pin<Box<dyn Stream<Item = PositionFix> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocationAccuracy {
    Lowest,
    Low,
    #[default]
    Balanced,
    High,
    Highest,
}

/// Subscription parameters handed to [`PositionProvider::watch_position`].
#[derive(Debug, Clone, PartialEq)]
pub struct WatchOptions {
    pub accuracy: LocationAccuracy,
    pub interval: Duration,
    pub min_distance_m: f64,
}

impl From<&TrackingConfig> for WatchOptions {
    fn from(config: &TrackingConfig) -> Self {
        Self {
            accuracy: config.accuracy,
            interval: config.sample_interval,
            min_distance_m: config.min_distance_m,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LocationError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Position unavailable: {0}")]
    Unavailable(String),

    #[error("Actor error: {0}")]
    ActorError(String),
}

/// Device position source (GPS / fused provider).
pub trait PositionProvider: Send + Sync + 'static {
    fn request_permission(&self) -> ProviderFuture<'_, bool>;

    /// One immediate fix.
    fn current_position(&self) -> ProviderFuture<'_, Result<PositionFix, LocationError>>;

    fn watch_position(
        &self,
        options: WatchOptions,
    ) -> ProviderFuture<'_, Result<PositionStream, LocationError>>;

    /// Battery percentage, when the platform exposes it.
    fn battery_level(&self) -> Option<u8> {
        None
    }
}
