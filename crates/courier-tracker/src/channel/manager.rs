//! Connection lifecycle: one authenticated channel per credential.
//!
//! `connect` opens the first channel inline so that the caller sees
//! authentication and network failures directly. A supervisor task then owns
//! the channel: it runs the connected hook, dispatches inbound events to
//! subscribers and reopens the channel with exponential backoff when it is
//! lost. Every successful (re)open is a fresh `Connected` transition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::InboundEvent;
use super::session::SessionWriter;
use super::{ChannelNotice, ConnectedHook, ConnectionState, Credential, Link, Transport};
use crate::error::Result;

/// Capacity of the notice broadcast buffer.
const NOTICE_CAPACITY: usize = 64;

/// Backoff bounds for reopening a lost channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first reopen attempt.
    pub initial: Duration,
    /// Upper bound for the doubling delay.
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

struct Shared {
    transport: Arc<dyn Transport>,
    session: SessionWriter,
    state: watch::Sender<ConnectionState>,
    notices: broadcast::Sender<ChannelNotice>,
    hook: Option<Arc<dyn ConnectedHook>>,
    policy: ReconnectPolicy,
    next_session_id: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Channel state changed");
            let _ = self.notices.send(ChannelNotice::State(state));
        }
    }

    fn install(&self, outbound: mpsc::Sender<super::OutboundEvent>) -> u64 {
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.session.install(id, outbound);
        self.set_state(ConnectionState::Connected);
        info!(session = id, "Event channel connected");
        id
    }

    fn withdraw(&self) {
        if let Some(id) = self.session.withdraw() {
            info!(session = id, "Event channel session closed");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn dispatch(&self, event: InboundEvent) {
        let notice = match event {
            InboundEvent::TrackingResumed { downtime } => {
                info!(?downtime, "Server acknowledged tracking resume");
                ChannelNotice::TrackingResumed { downtime }
            }
            InboundEvent::Error { message } => {
                warn!(%message, "Server reported an error");
                ChannelNotice::ServerError { message }
            }
            InboundEvent::Authenticated { message } => {
                debug!(%message, "Server confirmed authentication");
                ChannelNotice::Authenticated { message }
            }
        };
        // Nobody listening is fine.
        let _ = self.notices.send(notice);
    }
}

struct Supervisor {
    credential: Credential,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Supervisor {
    async fn shutdown(self, shared: &Shared) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                warn!("Channel supervisor panicked: {}", e);
            }
        }
        shared.withdraw();
    }
}

/// Owner of the single authenticated event channel.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &*self.shared.state.borrow())
            .field("policy", &self.shared.policy)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager that publishes sessions through `session`.
    ///
    /// `hook` runs once per transition into `Connected`.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        session: SessionWriter,
        policy: ReconnectPolicy,
        hook: Option<Arc<dyn ConnectedHook>>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                transport,
                session,
                state,
                notices,
                hook,
                policy,
                next_session_id: AtomicU64::new(0),
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Open the channel for `credential`.
    ///
    /// A call with the credential already in use is a no-op. Any session
    /// bound to a different credential is torn down first.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be opened; the manager is left
    /// `Disconnected`.
    pub async fn connect(&self, credential: Credential) -> Result<()> {
        let mut supervisor = self.supervisor.lock().await;

        if let Some(current) = supervisor.as_ref() {
            if current.credential == credential && !current.task.is_finished() {
                debug!("Channel already bound to this credential");
                return Ok(());
            }
        }
        if let Some(previous) = supervisor.take() {
            debug!("Tearing down previous session before reconnecting");
            previous.shutdown(&self.shared).await;
        }

        self.shared.set_state(ConnectionState::Connecting);
        let Link { outbound, inbound } = match self.shared.transport.open(&credential).await {
            Ok(link) => link,
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        let session_id = self.shared.install(outbound);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(
            Arc::clone(&self.shared),
            credential.clone(),
            session_id,
            inbound,
            cancel.clone(),
        ));
        *supervisor = Some(Supervisor {
            credential,
            cancel,
            task,
        });
        Ok(())
    }

    /// Close the channel and stop reconnecting. Safe to call when disconnected.
    pub async fn disconnect(&self) {
        let mut supervisor = self.supervisor.lock().await;
        if let Some(current) = supervisor.take() {
            current.shutdown(&self.shared).await;
            info!("Event channel disconnected");
        } else {
            self.shared.withdraw();
        }
    }

    /// Current channel state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch channel state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Subscribe to inbound events and state changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelNotice> {
        self.shared.notices.subscribe()
    }
}

async fn supervise(
    shared: Arc<Shared>,
    credential: Credential,
    mut session_id: u64,
    mut inbound: mpsc::Receiver<InboundEvent>,
    cancel: CancellationToken,
) {
    loop {
        if let Some(hook) = &shared.hook {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = hook.on_connected(session_id, &credential) => {}
            }
        }

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                event = inbound.recv() => match event {
                    Some(event) => shared.dispatch(event),
                    None => break,
                },
            }
        }

        warn!(session = session_id, "Event channel lost");
        shared.withdraw();

        let mut delay = shared.policy.initial;
        let link = loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            shared.set_state(ConnectionState::Connecting);
            match shared.transport.open(&credential).await {
                Ok(link) => break link,
                Err(e) => {
                    delay = shared.policy.next(delay);
                    warn!(retry_in = ?delay, "Reconnect failed: {}", e);
                    shared.set_state(ConnectionState::Disconnected);
                }
            }
        };

        if cancel.is_cancelled() {
            return;
        }
        session_id = shared.install(link.outbound);
        inbound = link.inbound;
    }
}
