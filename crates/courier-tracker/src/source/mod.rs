//! Location sources feeding the background emitter.
//!
//! A [`LocationSource`] stands in for the platform location service: it
//! answers permission requests and produces a [`FixStream`] of fix batches.
//! Batches are deferred to save power, so a batch may contain several
//! fixes of which only the newest matters to the emitter.

pub mod gpsd;
pub mod replay;

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::Result;
use crate::tracking::LocationFix;

pub use gpsd::GpsdSource;
pub use replay::ReplaySource;

/// Outcome of a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    /// The permission is granted.
    Granted,
    /// The user or platform refused the permission.
    Denied,
}

impl PermissionState {
    /// Whether the permission is granted.
    #[must_use]
    pub fn is_granted(self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Terminal failures of a running subscription.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// Location permission was withdrawn after the subscription started.
    #[error("location permission revoked")]
    PermissionRevoked,

    /// The location service went away.
    #[error("location service unavailable: {0}")]
    Unavailable(String),
}

/// Delivery cadence requested from a source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateOptions {
    /// How long fixes are accumulated before a batch is delivered.
    pub deferred_interval: Duration,
    /// Minimum movement in metres between consecutive accepted fixes.
    pub distance_interval_m: f64,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            deferred_interval: Duration::from_secs(30),
            distance_interval_m: 0.0,
        }
    }
}

/// One item of a [`FixStream`]; an `Err` ends the subscription.
pub type FixBatch = std::result::Result<Vec<LocationFix>, SourceError>;

/// A live location subscription.
///
/// Dropping the stream cancels the subscription.
#[derive(Debug)]
pub struct FixStream {
    rx: mpsc::Receiver<FixBatch>,
    producer: Option<AbortHandle>,
}

impl FixStream {
    /// Create a stream and the sender a producer feeds it through.
    #[must_use]
    pub fn channel(capacity: usize) -> (mpsc::Sender<FixBatch>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx, producer: None })
    }

    /// Abort `producer` when this stream is dropped.
    #[must_use]
    pub fn with_producer(mut self, producer: AbortHandle) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Wait for the next batch. `None` means the source finished normally.
    pub async fn next(&mut self) -> Option<FixBatch> {
        self.rx.recv().await
    }
}

impl Drop for FixStream {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

/// A provider of location fixes.
#[async_trait::async_trait]
pub trait LocationSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Ask for permission to receive fixes while in the foreground.
    ///
    /// # Errors
    ///
    /// Returns an error if the permission state cannot be determined.
    async fn request_foreground_permission(&self) -> Result<PermissionState>;

    /// Ask for permission to keep receiving fixes in the background.
    ///
    /// # Errors
    ///
    /// Returns an error if the permission state cannot be determined.
    async fn request_background_permission(&self) -> Result<PermissionState>;

    /// Start delivering fix batches.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be created.
    async fn subscribe(&self, options: UpdateOptions) -> Result<FixStream>;
}

/// Accumulates fixes between deliveries and applies the distance filter.
#[derive(Debug)]
pub(crate) struct Batcher {
    distance_interval_m: f64,
    last_accepted: Option<LocationFix>,
    pending: Vec<LocationFix>,
}

impl Batcher {
    pub(crate) fn new(options: &UpdateOptions) -> Self {
        Self {
            distance_interval_m: options.distance_interval_m.max(0.0),
            last_accepted: None,
            pending: Vec::new(),
        }
    }

    /// Queue a fix unless it is invalid or too close to the previous one.
    pub(crate) fn push(&mut self, fix: LocationFix) -> bool {
        if !fix.is_valid() {
            return false;
        }
        if let Some(last) = &self.last_accepted {
            if fix.distance_m(last) < self.distance_interval_m {
                return false;
            }
        }
        self.last_accepted = Some(fix);
        self.pending.push(fix);
        true
    }

    /// Take the accumulated batch, if any.
    pub(crate) fn take(&mut self) -> Option<Vec<LocationFix>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}
