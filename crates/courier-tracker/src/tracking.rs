//! Core tracking types for courier-tracker.
//!
//! This module defines the persisted tracking state, location fixes and the
//! delivery status vocabulary shared by every other module.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(String);

impl DeliveryId {
    /// Create a delivery identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeliveryId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeliveryId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The delivery currently being tracked, as persisted across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingRecord {
    /// Delivery being tracked.
    pub delivery_id: DeliveryId,
    /// When tracking began for this delivery.
    pub start_time: DateTime<Utc>,
}

impl TrackingRecord {
    /// Create a record for a delivery starting now.
    #[must_use]
    pub fn starting_now(delivery_id: DeliveryId) -> Self {
        Self {
            delivery_id,
            start_time: Utc::now(),
        }
    }
}

/// A single GPS reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// When the reading was taken.
    pub timestamp: DateTime<Utc>,
}

impl LocationFix {
    /// Create a fix.
    #[must_use]
    pub fn new(latitude: f64, longitude: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            timestamp,
        }
    }

    /// Check that the coordinates are finite and within WGS84 bounds.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Great-circle distance to another fix in metres.
    #[must_use]
    pub fn distance_m(&self, other: &Self) -> f64 {
        const EARTH_RADIUS_M: f64 = 6_371_000.0;
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let d_lat = lat2 - lat1;
        let d_lon = (other.longitude - self.longitude).to_radians();
        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().asin()
    }
}

/// Server-side status of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Assigned to a courier, not yet picked up.
    Assigned,
    /// Picked up and on the way.
    InTransit,
    /// Handed over at the destination.
    Delivered,
    /// Abandoned after a failed attempt.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl DeliveryStatus {
    /// Whether no further tracking can ever apply to this delivery.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Assigned => write!(f, "assigned"),
            Self::InTransit => write!(f, "in_transit"),
            Self::Delivered => write!(f, "delivered"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Time elapsed between the last known activity and a resume.
///
/// The last activity is the later of the last fix and the tracking start.
/// A clock that moved backwards yields zero rather than a negative gap.
#[must_use]
pub fn downtime(
    resume_time: DateTime<Utc>,
    start_time: DateTime<Utc>,
    last_fix: Option<&LocationFix>,
) -> Duration {
    let last_activity = last_fix.map_or(start_time, |fix| fix.timestamp.max(start_time));
    (resume_time - last_activity).max(Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_delivery_status_terminal() {
        assert!(!DeliveryStatus::Assigned.is_terminal());
        assert!(!DeliveryStatus::InTransit.is_terminal());
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(DeliveryStatus::Failed.is_terminal());
        assert!(DeliveryStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_delivery_status_wire_names() {
        let status: DeliveryStatus = serde_json::from_str("\"in_transit\"").unwrap();
        assert_eq!(status, DeliveryStatus::InTransit);
        assert_eq!(DeliveryStatus::InTransit.to_string(), "in_transit");
        assert!(serde_json::from_str::<DeliveryStatus>("\"lost\"").is_err());
    }

    #[test]
    fn test_delivery_id_is_transparent() {
        let id = DeliveryId::from("DEL9");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"DEL9\"");
        assert_eq!(id.to_string(), "DEL9");
    }

    #[test]
    fn test_downtime_uses_last_fix() {
        let fix = LocationFix::new(10.75, 106.66, t0() + Duration::seconds(300));
        let gap = downtime(t0() + Duration::seconds(900), t0(), Some(&fix));
        assert_eq!(gap, Duration::seconds(600));
    }

    #[test]
    fn test_downtime_without_fix_uses_start() {
        let gap = downtime(t0() + Duration::seconds(120), t0(), None);
        assert_eq!(gap, Duration::seconds(120));
    }

    #[test]
    fn test_downtime_ignores_fix_older_than_start() {
        let stale = LocationFix::new(1.0, 2.0, t0() - Duration::hours(2));
        let gap = downtime(t0() + Duration::seconds(60), t0(), Some(&stale));
        assert_eq!(gap, Duration::seconds(60));
    }

    #[test]
    fn test_downtime_never_negative() {
        let gap = downtime(t0() - Duration::seconds(5), t0(), None);
        assert_eq!(gap, Duration::zero());
    }

    #[test]
    fn test_fix_validity() {
        assert!(LocationFix::new(10.75, 106.66, t0()).is_valid());
        assert!(!LocationFix::new(91.0, 0.0, t0()).is_valid());
        assert!(!LocationFix::new(0.0, f64::NAN, t0()).is_valid());
    }

    #[test]
    fn test_fix_distance() {
        let a = LocationFix::new(10.75, 106.66, t0());
        let b = LocationFix::new(10.76, 106.66, t0());
        let d = a.distance_m(&b);
        assert!((d - 1112.0).abs() < 5.0, "unexpected distance {d}");
        assert!(a.distance_m(&a) < f64::EPSILON);
    }

    #[test]
    fn test_record_ignores_unknown_fields() {
        let json = r#"{"delivery_id":"DEL1","start_time":"2024-05-01T08:00:00Z","vehicle":"van-2"}"#;
        let record: TrackingRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.delivery_id, DeliveryId::from("DEL1"));
        assert_eq!(record.start_time, t0());
    }
}
