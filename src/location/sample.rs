use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::credentials::DriverStatus;

/// Battery level reported when the device cannot provide one.
pub const DEFAULT_BATTERY_LEVEL: u8 = 100;

const MPS_TO_KMH: f64 = 3.6;

/// Raw fix as produced by the device position provider.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy in meters.
    pub accuracy: Option<f64>,
    pub heading: Option<f64>,
    /// Ground speed in m/s; platforms report negative values when unknown.
    pub speed: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

impl PositionFix {
    pub fn new(latitude: f64, longitude: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: None,
            heading: None,
            speed: None,
            captured_at,
        }
    }
}

/// A normalized position observation, ready to be tagged and sent.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub heading: f64,
    /// Always finite and non-negative.
    pub speed_kmh: f64,
    pub battery_level: Option<u8>,
    pub captured_at: DateTime<Utc>,
}

impl LocationSample {
    pub fn from_fix(fix: &PositionFix, battery_level: Option<u8>) -> Self {
        Self {
            latitude: fix.latitude,
            longitude: fix.longitude,
            accuracy: finite_or_zero(fix.accuracy),
            heading: finite_or_zero(fix.heading),
            speed_kmh: speed_to_kmh(fix.speed),
            battery_level,
            captured_at: fix.captured_at,
        }
    }
}

/// m/s to km/h, clamping unknown or negative readings to zero.
pub fn speed_to_kmh(speed_mps: Option<f64>) -> f64 {
    match speed_mps {
        Some(speed) if speed.is_finite() && speed > 0.0 => speed * MPS_TO_KMH,
        _ => 0.0,
    }
}

fn finite_or_zero(value: Option<f64>) -> f64 {
    value.filter(|v| v.is_finite()).unwrap_or(0.0)
}

/// Order or pool a sample is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobReference {
    Numeric(u64),
    Text(String),
}

impl fmt::Display for JobReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobReference::Numeric(id) => write!(f, "{id}"),
            JobReference::Text(id) => f.write_str(id),
        }
    }
}

impl From<u64> for JobReference {
    fn from(id: u64) -> Self {
        JobReference::Numeric(id)
    }
}

impl From<&str> for JobReference {
    fn from(id: &str) -> Self {
        JobReference::Text(id.to_string())
    }
}

/// A sample tagged with the driver's status and active job at send time.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationUpdate {
    pub sample: LocationSample,
    pub status: DriverStatus,
    pub job: Option<JobReference>,
}

impl LocationUpdate {
    pub fn payload(&self) -> LocationPayload<'_> {
        LocationPayload {
            lat: self.sample.latitude,
            lng: self.sample.longitude,
            status: &self.status,
            order_id: self.job.as_ref(),
            accuracy: self.sample.accuracy,
            heading: self.sample.heading,
            speed: self.sample.speed_kmh,
            battery_level: self.sample.battery_level.unwrap_or(DEFAULT_BATTERY_LEVEL),
            timestamp: self
                .sample
                .captured_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// Wire shape of the `data` object of a `location_update` message.
#[derive(Debug, Serialize)]
pub struct LocationPayload<'a> {
    pub lat: f64,
    pub lng: f64,
    pub status: &'a DriverStatus,
    pub order_id: Option<&'a JobReference>,
    pub accuracy: f64,
    pub heading: f64,
    pub speed: f64,
    pub battery_level: u8,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sonic_rs::JsonValueTrait;

    fn fix(speed: Option<f64>) -> PositionFix {
        PositionFix {
            latitude: 52.52,
            longitude: 13.405,
            accuracy: Some(8.5),
            heading: None,
            speed,
            captured_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn speed_is_converted_to_kmh() {
        let sample = LocationSample::from_fix(&fix(Some(10.0)), None);
        assert!((sample.speed_kmh - 36.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_or_negative_speed_becomes_zero() {
        assert_eq!(speed_to_kmh(None), 0.0);
        assert_eq!(speed_to_kmh(Some(-1.0)), 0.0);
        assert_eq!(speed_to_kmh(Some(f64::NAN)), 0.0);
    }

    #[test]
    fn payload_fills_defaults() {
        let update = LocationUpdate {
            sample: LocationSample::from_fix(&fix(Some(2.5)), None),
            status: DriverStatus::Online,
            job: Some(JobReference::Numeric(981)),
        };
        let json: sonic_rs::Value = sonic_rs::from_str(
            &sonic_rs::to_string(&update.payload()).unwrap(),
        )
        .unwrap();

        assert_eq!(json["status"].as_str(), Some("ONLINE"));
        assert_eq!(json["order_id"].as_u64(), Some(981));
        assert_eq!(json["heading"].as_f64(), Some(0.0));
        let speed = json["speed"].as_f64().unwrap();
        assert!((speed - 9.0).abs() < 1e-9);
        assert_eq!(json["battery_level"].as_u64(), Some(100));
        assert_eq!(json["timestamp"].as_str(), Some("2024-05-01T12:00:00.000Z"));
    }

    #[test]
    fn missing_job_serializes_as_null() {
        let update = LocationUpdate {
            sample: LocationSample::from_fix(&fix(None), Some(42)),
            status: DriverStatus::Offline,
            job: None,
        };
        let text = sonic_rs::to_string(&update.payload()).unwrap();
        assert!(text.contains(r#""order_id":null"#));
        assert!(text.contains(r#""battery_level":42"#));
    }
}
