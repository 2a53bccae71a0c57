//! `courier-tracker` - Courier location tracking with durable resume
//!
//! This library streams a courier's GPS fixes to a tracking server over an
//! authenticated event channel, persists enough state to survive restarts,
//! and reconciles that state with the server whenever the channel connects.
//! [`Tracker`] is the entry point.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod channel;
pub mod cli;
pub mod config;
pub mod emitter;
pub mod error;
pub mod logging;
pub mod reconcile;
pub mod registry;
pub mod source;
pub mod status;
pub mod storage;
pub mod tracker;
pub mod tracking;

#[cfg(test)]
mod testing;

pub use channel::{ChannelNotice, ConnectionManager, ConnectionState, Credential};
pub use config::Config;
pub use emitter::{ArmState, LocationEmitter, TrackingHandle, TrackingMode};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use storage::{Storage, TrackingSnapshot};
pub use tracker::Tracker;
pub use tracking::{DeliveryId, DeliveryStatus, LocationFix, TrackingRecord};
