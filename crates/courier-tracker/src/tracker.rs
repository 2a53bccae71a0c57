//! The tracker context.
//!
//! [`Tracker`] owns every long-lived piece of the pipeline and is the only
//! entry point the front end needs. It wires the session slot so that the
//! connection manager is its single writer while the emitter and the
//! reconciler only read it.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use crate::channel::{
    session_slot, ChannelNotice, ConnectedHook, ConnectionManager, ConnectionState, Credential,
    Transport, WebSocketTransport,
};
use crate::config::Config;
use crate::emitter::{EmitterStatus, LocationEmitter, TrackingHandle};
use crate::error::Result;
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::registry::TaskRegistry;
use crate::source::LocationSource;
use crate::status::{DeliveryStatusQuery, HttpStatusClient};
use crate::storage::{Storage, TrackingSnapshot};
use crate::tracking::DeliveryId;

/// Owned context of the tracking pipeline.
#[derive(Debug)]
pub struct Tracker {
    storage: Arc<Storage>,
    registry: TaskRegistry,
    emitter: LocationEmitter,
    manager: ConnectionManager,
    reconciler: Arc<Reconciler>,
}

impl Tracker {
    /// Assemble a tracker from its collaborators.
    ///
    /// Reconnect backoff and fix cadence are taken from `config`.
    #[must_use]
    pub fn new(
        storage: Arc<Storage>,
        source: Arc<dyn LocationSource>,
        transport: Arc<dyn Transport>,
        status: Arc<dyn DeliveryStatusQuery>,
        config: &Config,
    ) -> Self {
        let (writer, view) = session_slot();
        let emitter = LocationEmitter::new(
            Arc::clone(&storage),
            source,
            view.clone(),
            config.update_options(),
        );
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&storage),
            emitter.clone(),
            status,
            view,
        ));
        let hook: Arc<dyn ConnectedHook> = reconciler.clone();
        let manager = ConnectionManager::new(transport, writer, config.reconnect_policy(), Some(hook));

        Self {
            storage,
            registry: TaskRegistry::new(),
            emitter,
            manager,
            reconciler,
        }
    }

    /// Build the production tracker: SQLite storage, WebSocket channel,
    /// HTTP status lookups and the configured location source.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the
    /// configuration names an unusable endpoint or source.
    pub fn from_config(config: &Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(config.database_path())?);
        let source = config.location_source()?;
        let transport = Arc::new(WebSocketTransport::new(
            config.channel_url()?,
            config.channel.outbound_buffer,
        ));
        let status = Arc::new(HttpStatusClient::new(
            config.api_base_url()?,
            config.request_timeout(),
        )?);
        Ok(Self::new(storage, source, transport, status, config))
    }

    /// Register the background fix handler. Call once at startup; repeated
    /// calls are no-ops returning `false`.
    pub fn init(&self) -> bool {
        self.emitter.register(&self.registry)
    }

    /// Open the event channel for `credential`. Reconciliation runs as soon
    /// as the channel connects and again after every reconnect.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be opened.
    pub async fn sign_in(&self, credential: Credential) -> Result<()> {
        self.manager.connect(credential).await
    }

    /// Close the event channel. Tracking state is kept for the next sign-in.
    pub async fn sign_out(&self) {
        self.manager.disconnect().await;
    }

    /// Begin tracking a delivery.
    ///
    /// # Errors
    ///
    /// See [`LocationEmitter::start`].
    pub async fn start_tracking(&self, delivery_id: DeliveryId) -> Result<TrackingHandle> {
        self.emitter.start(delivery_id).await
    }

    /// Stop tracking and clear persisted tracking state.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted state cannot be cleared.
    pub async fn stop_tracking(&self) -> Result<()> {
        self.emitter.stop().await
    }

    /// Inbound server events and channel state changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelNotice> {
        self.manager.subscribe()
    }

    /// Outcomes of future reconciliation passes.
    #[must_use]
    pub fn reconcile_outcomes(&self) -> broadcast::Receiver<ReconcileOutcome> {
        self.reconciler.outcomes()
    }

    /// Current channel state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Snapshot of the emitter.
    pub async fn emitter_status(&self) -> EmitterStatus {
        self.emitter.status().await
    }

    /// Persisted tracking state.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn snapshot(&self) -> Result<TrackingSnapshot> {
        self.storage.snapshot()
    }

    /// Stop all background work. Persisted state is kept so that the next
    /// process resumes where this one left off.
    pub async fn shutdown(&self) {
        self.manager.disconnect().await;
        self.emitter.shutdown();
        self.registry.shutdown();
        info!("Tracker shut down");
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::channel::OutboundEvent;
    use crate::emitter::{ArmState, BACKGROUND_LOCATION_TASK};
    use crate::testing::{FakeStatus, FakeTransport, ScriptedSource, ServerEnd};
    use crate::tracking::{DeliveryStatus, LocationFix, TrackingRecord};

    struct Harness {
        storage: Arc<Storage>,
        source: Arc<ScriptedSource>,
        status: Arc<FakeStatus>,
        transport: Arc<FakeTransport>,
        ends: tokio::sync::mpsc::UnboundedReceiver<ServerEnd>,
        tracker: Tracker,
    }

    fn harness() -> Harness {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let source = ScriptedSource::new();
        let status = FakeStatus::new();
        let (transport, ends) = FakeTransport::new();
        let mut config = Config::default();
        config.channel.reconnect_initial_ms = 5;
        config.channel.reconnect_max_ms = 20;

        let tracker = Tracker::new(
            Arc::clone(&storage),
            source.clone(),
            transport.clone(),
            status.clone(),
            &config,
        );
        Harness {
            storage,
            source,
            status,
            transport,
            ends,
            tracker,
        }
    }

    /// Sign in with nothing persisted and wait for the first pass to finish.
    async fn sign_in_idle(h: &mut Harness) -> ServerEnd {
        let mut outcomes = h.tracker.reconcile_outcomes();
        h.tracker.sign_in(Credential::new("token")).await.unwrap();
        assert_eq!(outcomes.recv().await.unwrap(), ReconcileOutcome::Idle);
        h.ends.recv().await.unwrap()
    }

    async fn next_event(end: &mut ServerEnd) -> OutboundEvent {
        tokio::time::timeout(std::time::Duration::from_secs(2), end.received.recv())
            .await
            .expect("timed out waiting for event")
            .expect("session closed")
    }

    #[tokio::test]
    async fn test_init_registers_once() {
        let h = harness();
        assert!(h.tracker.init());
        assert!(!h.tracker.init());
        assert!(h.tracker.registry.is_registered(BACKGROUND_LOCATION_TASK));
    }

    #[tokio::test]
    async fn test_start_before_init_fails() {
        let h = harness();
        assert!(h.tracker.start_tracking(DeliveryId::from("D1")).await.is_err());
    }

    #[tokio::test]
    async fn test_sign_in_resumes_persisted_delivery() {
        let mut h = harness();
        h.tracker.init();
        let start = Utc::now() - Duration::minutes(15);
        h.storage
            .save_tracking_record(&TrackingRecord {
                delivery_id: DeliveryId::from("DEL9"),
                start_time: start,
            })
            .unwrap();
        h.storage
            .save_last_fix(&LocationFix::new(10.75, 106.66, start + Duration::minutes(5)))
            .unwrap();
        h.status.set("DEL9", Ok(DeliveryStatus::InTransit));
        let mut outcomes = h.tracker.reconcile_outcomes();

        h.tracker.sign_in(Credential::new("token")).await.unwrap();
        let mut end = h.ends.recv().await.unwrap();

        let OutboundEvent::ResumeTracking(announcement) = next_event(&mut end).await else {
            panic!("expected a resume announcement");
        };
        assert_eq!(announcement.delivery_id, DeliveryId::from("DEL9"));
        assert_eq!(announcement.start_time, start);
        let outcome = outcomes.recv().await.unwrap();
        let ReconcileOutcome::Resumed { downtime_secs, .. } = outcome else {
            panic!("expected resume, got {outcome:?}");
        };
        assert!((599..=601).contains(&downtime_secs));

        h.source
            .push(vec![LocationFix::new(10.8, 106.7, Utc::now())])
            .await;
        let OutboundEvent::Location(event) = next_event(&mut end).await else {
            panic!("expected a location event");
        };
        assert_eq!(event.delivery_id, DeliveryId::from("DEL9"));
        assert_eq!(h.status.last_credential(), Some(Credential::new("token")));
    }

    #[tokio::test]
    async fn test_start_and_stop_while_signed_in() {
        let mut h = harness();
        h.tracker.init();
        let mut end = sign_in_idle(&mut h).await;
        assert_eq!(h.tracker.connection_state(), ConnectionState::Connected);

        let mut handle = h.tracker.start_tracking(DeliveryId::from("D1")).await.unwrap();
        h.source.push(vec![LocationFix::new(1.0, 2.0, Utc::now())]).await;
        let OutboundEvent::Location(event) = next_event(&mut end).await else {
            panic!("expected a location event");
        };
        assert_eq!(event.delivery_id, DeliveryId::from("D1"));
        assert_eq!(h.tracker.emitter_status().await.fixes_handled, 1);

        h.tracker.stop_tracking().await.unwrap();
        assert_eq!(handle.terminated().await, ArmState::Stopped);
        let snapshot = h.tracker.snapshot().unwrap();
        assert!(snapshot.record.is_none());
        assert!(snapshot.last_fix.is_none());
    }

    #[tokio::test]
    async fn test_reconnect_reconciles_again() {
        let mut h = harness();
        h.tracker.init();
        let first = sign_in_idle(&mut h).await;
        let mut outcomes = h.tracker.reconcile_outcomes();

        h.tracker.start_tracking(DeliveryId::from("D1")).await.unwrap();
        h.status.set("D1", Ok(DeliveryStatus::Delivered));
        drop(first);
        let _second = h.ends.recv().await.unwrap();

        assert!(matches!(
            outcomes.recv().await.unwrap(),
            ReconcileOutcome::Discarded { .. }
        ));
        assert!(h.tracker.snapshot().unwrap().record.is_none());
        assert!(h.tracker.emitter_status().await.delivery_id.is_none());
        assert_eq!(h.transport.open_count(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_keeps_state_for_next_process() {
        let mut h = harness();
        h.tracker.init();
        let _end = sign_in_idle(&mut h).await;
        h.tracker.start_tracking(DeliveryId::from("D1")).await.unwrap();

        h.tracker.shutdown().await;

        assert_eq!(h.tracker.connection_state(), ConnectionState::Disconnected);
        let record = h.tracker.snapshot().unwrap().record.unwrap();
        assert_eq!(record.delivery_id, DeliveryId::from("D1"));
    }
}
