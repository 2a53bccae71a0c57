//! Error types for courier-tracker.
//!
//! This module defines all error types used throughout the crate, grouped by
//! the subsystem that raises them.

use std::path::PathBuf;
use thiserror::Error;

use crate::tracking::DeliveryId;

/// The main error type for courier-tracker operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    /// A persisted value could not be decoded.
    #[error("corrupt persisted value under '{key}': {source}")]
    CorruptRecord {
        /// The store key holding the value.
        key: &'static str,
        /// The underlying decode error.
        #[source]
        source: serde_json::Error,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Location Errors ===
    /// Location permission was denied.
    #[error("location permission denied: {permission}")]
    PermissionDenied {
        /// Which permission was refused.
        permission: &'static str,
    },

    /// The location subscription could not be created or failed.
    #[error("location subscription failed: {0}")]
    LocationSubscription(String),

    /// The background location task has not been registered.
    #[error("background task '{0}' is not registered")]
    TaskNotRegistered(&'static str),

    // === Channel Errors ===
    /// Failed to open the event channel.
    #[error("failed to connect event channel to {url}: {message}")]
    ChannelConnect {
        /// The endpoint that was dialled.
        url: String,
        /// Description of what went wrong.
        message: String,
    },

    /// No live session is available for sending.
    #[error("event channel is not connected")]
    ChannelDown,

    /// The outbound queue of the live session is full.
    #[error("event channel outbound queue is full")]
    ChannelFull,

    // === Status Query Errors ===
    /// The delivery was not found by the status service.
    #[error("delivery {0} not found")]
    DeliveryNotFound(DeliveryId),

    /// The status service could not be reached or answered ambiguously.
    #[error("delivery status query failed: {0}")]
    StatusQuery(String),

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for courier-tracker operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a location subscription error.
    #[must_use]
    pub fn subscription(message: impl Into<String>) -> Self {
        Self::LocationSubscription(message.into())
    }

    /// Create a status query error.
    #[must_use]
    pub fn status_query(message: impl Into<String>) -> Self {
        Self::StatusQuery(message.into())
    }

    /// Create a channel connect error.
    #[must_use]
    pub fn channel_connect(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ChannelConnect {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Check if this error is a permission issue.
    #[must_use]
    pub fn is_permission_error(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }

    /// Check if this error is recoverable by retrying later.
    ///
    /// Network-facing failures are transient; permission, configuration and
    /// storage failures are not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ChannelConnect { .. } | Self::ChannelDown | Self::ChannelFull | Self::StatusQuery(_)
        )
    }
}
