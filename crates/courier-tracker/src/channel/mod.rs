//! Authenticated event channel between the device and the tracking server.
//!
//! The [`ConnectionManager`] owns the one live channel, bound to the current
//! [`Credential`]. Transports are pluggable through the [`Transport`] trait;
//! [`WebSocketTransport`] is the production implementation.

mod manager;
pub mod protocol;
pub mod session;
mod websocket;

use tokio::sync::mpsc;

pub use manager::{ConnectionManager, ReconnectPolicy};
pub use protocol::{InboundEvent, OutboundEvent};
pub use session::{session_slot, SessionView, SessionWriter};
pub use websocket::WebSocketTransport;

use crate::error::Result;

/// Bearer credential for the event channel and status API.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a bearer token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for building request headers.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Lifecycle state of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No channel is open.
    #[default]
    Disconnected,
    /// A channel is being opened.
    Connecting,
    /// A channel is open and a session is live.
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Notifications published to channel subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelNotice {
    /// The channel changed state.
    State(ConnectionState),
    /// The server acknowledged a resume, with its computed downtime in seconds.
    TrackingResumed {
        /// Downtime reported by the server.
        downtime: Option<f64>,
    },
    /// The server reported a non-fatal error.
    ServerError {
        /// Server-provided description.
        message: String,
    },
    /// The server confirmed authentication.
    Authenticated {
        /// Server-provided greeting.
        message: String,
    },
}

/// Both directions of an opened channel.
///
/// The channel is considered lost when `inbound` yields `None`.
#[derive(Debug)]
pub struct Link {
    /// Events to send to the server.
    pub outbound: mpsc::Sender<OutboundEvent>,
    /// Events received from the server.
    pub inbound: mpsc::Receiver<InboundEvent>,
}

/// A way to open an authenticated channel.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Open a channel authenticated with `credential`.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be established.
    async fn open(&self, credential: &Credential) -> Result<Link>;
}

/// Callback invoked once for every transition into [`ConnectionState::Connected`].
#[async_trait::async_trait]
pub trait ConnectedHook: Send + Sync {
    /// Called after the session for `session_id` has been published.
    ///
    /// `credential` is the one the session is bound to.
    async fn on_connected(&self, session_id: u64, credential: &Credential);
}
