//! Position sampling and forwarding.

pub mod provider;
pub mod reporter;
pub mod sample;

pub use provider::{
    LocationAccuracy, LocationError, PositionProvider, PositionStream, ProviderFuture,
    WatchOptions,
};
pub use reporter::{
    GetLastSample, IsTracking, LocationReporter, LocationReporterArgs, LocationSink,
    ResendLastSample, SetActiveJob, StartTracking, StopTracking, TrackingStart,
};
pub use sample::{
    DEFAULT_BATTERY_LEVEL, JobReference, LocationPayload, LocationSample, LocationUpdate,
    PositionFix, speed_to_kmh,
};
