//! The live-session slot shared between the connection manager and its readers.
//!
//! [`session_slot`] returns a single [`SessionWriter`], held only by the
//! connection manager, and a cloneable [`SessionView`] handed to every
//! component that needs to emit on the channel.

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;

use super::protocol::OutboundEvent;
use crate::error::{Error, Result};

/// An established channel as seen by emitters.
#[derive(Debug, Clone)]
pub struct LiveSession {
    /// Monotonic identifier, unique per Connected transition.
    pub id: u64,
    outbound: mpsc::Sender<OutboundEvent>,
}

/// Write half of the session slot.
#[derive(Debug)]
pub struct SessionWriter {
    tx: watch::Sender<Option<LiveSession>>,
}

/// Read half of the session slot.
#[derive(Debug, Clone)]
pub struct SessionView {
    rx: watch::Receiver<Option<LiveSession>>,
}

/// Create an empty session slot.
#[must_use]
pub fn session_slot() -> (SessionWriter, SessionView) {
    let (tx, rx) = watch::channel(None);
    (SessionWriter { tx }, SessionView { rx })
}

impl SessionWriter {
    /// Publish a newly established session.
    pub(crate) fn install(&self, id: u64, outbound: mpsc::Sender<OutboundEvent>) {
        self.tx.send_replace(Some(LiveSession { id, outbound }));
    }

    /// Withdraw the current session, dropping its outbound sender.
    pub(crate) fn withdraw(&self) -> Option<u64> {
        self.tx.send_replace(None).map(|session| session.id)
    }

    /// Create another reader for this slot.
    #[must_use]
    pub fn view(&self) -> SessionView {
        SessionView {
            rx: self.tx.subscribe(),
        }
    }
}

impl SessionView {
    /// Whether a session is currently live.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Identifier of the live session, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<u64> {
        self.rx.borrow().as_ref().map(|session| session.id)
    }

    /// Queue an event on the live session without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelDown`] when no session is live or it has
    /// closed, and [`Error::ChannelFull`] when its outbound queue is full.
    pub fn emit(&self, event: OutboundEvent) -> Result<()> {
        let slot = self.rx.borrow();
        let Some(session) = slot.as_ref() else {
            return Err(Error::ChannelDown);
        };
        session.outbound.try_send(event).map_err(|err| match err {
            TrySendError::Full(_) => Error::ChannelFull,
            TrySendError::Closed(_) => Error::ChannelDown,
        })
    }
}
