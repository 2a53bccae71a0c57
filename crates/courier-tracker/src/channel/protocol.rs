//! Wire format of the event channel.
//!
//! Every frame is a JSON text message of the form
//! `{"event": "<name>", "data": { ... }}`. Payload fields use camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tracking::{DeliveryId, LocationFix};

/// A location report for the armed delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationEvent {
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Delivery the fix belongs to.
    pub delivery_id: DeliveryId,
    /// When the fix was taken.
    pub timestamp: DateTime<Utc>,
}

impl LocationEvent {
    /// Build the wire event for a fix attributed to a delivery.
    #[must_use]
    pub fn from_fix(delivery_id: DeliveryId, fix: &LocationFix) -> Self {
        Self {
            latitude: fix.latitude,
            longitude: fix.longitude,
            delivery_id,
            timestamp: fix.timestamp,
        }
    }
}

/// A bare coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
}

impl From<&LocationFix> for Coordinates {
    fn from(fix: &LocationFix) -> Self {
        Self {
            latitude: fix.latitude,
            longitude: fix.longitude,
        }
    }
}

/// Announcement that tracking resumed for a delivery after a gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeAnnouncement {
    /// Delivery being resumed.
    pub delivery_id: DeliveryId,
    /// Last position reported before the gap.
    pub last_location: Coordinates,
    /// When tracking originally started.
    pub start_time: DateTime<Utc>,
    /// When tracking resumed.
    pub resume_time: DateTime<Utc>,
}

/// Events sent from the device to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum OutboundEvent {
    /// Periodic position report.
    #[serde(rename = "transporter:location")]
    Location(LocationEvent),
    /// Tracking resumed after a gap.
    #[serde(rename = "transporter:resume_tracking")]
    ResumeTracking(ResumeAnnouncement),
}

impl OutboundEvent {
    /// The wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Location(_) => "transporter:location",
            Self::ResumeTracking(_) => "transporter:resume_tracking",
        }
    }
}

/// Events sent from the server to the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum InboundEvent {
    /// The server accepted a resume announcement.
    #[serde(rename = "tracking:resumed")]
    TrackingResumed {
        /// Downtime computed by the server, in seconds.
        #[serde(default)]
        downtime: Option<f64>,
    },
    /// A non-fatal error reported by the server.
    #[serde(rename = "error")]
    Error {
        /// Server-provided description.
        #[serde(default)]
        message: String,
    },
    /// The server accepted the session credential.
    #[serde(rename = "authenticated")]
    Authenticated {
        /// Server-provided greeting.
        #[serde(default)]
        message: String,
    },
}

/// Decode an inbound text frame.
///
/// # Errors
///
/// Returns an error for malformed frames and for event names this client
/// does not handle.
pub fn decode_inbound(text: &str) -> serde_json::Result<InboundEvent> {
    serde_json::from_str(text)
}
