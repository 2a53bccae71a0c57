//! Background location emitter.
//!
//! The emitter owns the single armed-delivery slot. Arming subscribes to the
//! [`LocationSource`] and spawns a pump that forwards fix batches, tagged with
//! the arming's generation, to the fix-handling task registered at startup.
//! The handler persists the newest fix of each batch and emits it on the live
//! session, attributing it to whatever delivery the slot holds. Batches from
//! a cancelled or superseded arming are dropped before anything is written.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::channel::protocol::{LocationEvent, OutboundEvent};
use crate::channel::SessionView;
use crate::error::{Error, Result};
use crate::registry::TaskRegistry;
use crate::source::{FixStream, LocationSource, PermissionState, SourceError, UpdateOptions};
use crate::storage::Storage;
use crate::tracking::{DeliveryId, LocationFix, TrackingRecord};

/// Registry name of the fix-handling task.
pub const BACKGROUND_LOCATION_TASK: &str = "background-location";

/// Capacity of the queue between subscription pumps and the handler.
const HANDLER_QUEUE: usize = 16;

/// Whether fixes keep flowing while the process is in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingMode {
    /// Foreground and background permission granted.
    Background,
    /// Background permission refused; fixes only arrive while in the foreground.
    ForegroundOnly,
}

/// Lifecycle of one arming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArmState {
    /// Fixes are being handled.
    Active,
    /// Disarmed by `stop` or by stale-state cleanup.
    Stopped,
    /// Replaced by an arming for another delivery.
    Superseded,
    /// The location subscription failed; persisted state was kept.
    Failed(String),
}

/// Caller's view of an arming.
#[derive(Debug, Clone)]
pub struct TrackingHandle {
    delivery_id: DeliveryId,
    mode: TrackingMode,
    state: watch::Receiver<ArmState>,
}

impl TrackingHandle {
    /// Delivery this arming tracks.
    #[must_use]
    pub fn delivery_id(&self) -> &DeliveryId {
        &self.delivery_id
    }

    /// Permission mode the arming runs in.
    #[must_use]
    pub fn mode(&self) -> TrackingMode {
        self.mode
    }

    /// Current state of the arming.
    #[must_use]
    pub fn state(&self) -> ArmState {
        self.state.borrow().clone()
    }

    /// Wait until the arming ends and return how it ended.
    pub async fn terminated(&mut self) -> ArmState {
        let _ = self
            .state
            .wait_for(|state| !matches!(state, ArmState::Active))
            .await;
        match self.state.borrow().clone() {
            ArmState::Active => ArmState::Stopped,
            ended => ended,
        }
    }
}

/// Snapshot of the armed-delivery slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitterStatus {
    /// Whether the fix handler is registered.
    pub registered: bool,
    /// Armed delivery, if any.
    pub delivery_id: Option<DeliveryId>,
    /// Mode of the current arming.
    pub mode: Option<TrackingMode>,
    /// Fixes handled by the current arming.
    pub fixes_handled: u64,
}

#[derive(Debug)]
struct TaggedBatch {
    generation: u64,
    fixes: Vec<LocationFix>,
}

#[derive(Debug)]
struct Arming {
    delivery_id: DeliveryId,
    generation: u64,
    mode: TrackingMode,
    cancel: CancellationToken,
    state: watch::Sender<ArmState>,
    fixes_handled: u64,
}

impl Arming {
    fn handle(&self) -> TrackingHandle {
        TrackingHandle {
            delivery_id: self.delivery_id.clone(),
            mode: self.mode,
            state: self.state.subscribe(),
        }
    }

    fn finish(self, outcome: ArmState) {
        self.cancel.cancel();
        self.state.send_replace(outcome);
    }
}

struct Shared {
    storage: Arc<Storage>,
    source: Arc<dyn LocationSource>,
    session: SessionView,
    options: UpdateOptions,
    slot: Mutex<Option<Arming>>,
    generation: AtomicU64,
    handler_tx: mpsc::Sender<TaggedBatch>,
    handler_rx: std::sync::Mutex<Option<mpsc::Receiver<TaggedBatch>>>,
    registered: AtomicBool,
    root: CancellationToken,
}

/// Arms, disarms and feeds location tracking for one delivery at a time.
#[derive(Clone)]
pub struct LocationEmitter {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LocationEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationEmitter")
            .field("source", &self.shared.source.name())
            .field("options", &self.shared.options)
            .field("registered", &self.shared.registered.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl LocationEmitter {
    /// Create an emitter. It must be registered before it can be armed.
    #[must_use]
    pub fn new(
        storage: Arc<Storage>,
        source: Arc<dyn LocationSource>,
        session: SessionView,
        options: UpdateOptions,
    ) -> Self {
        let (handler_tx, handler_rx) = mpsc::channel(HANDLER_QUEUE);
        Self {
            shared: Arc::new(Shared {
                storage,
                source,
                session,
                options,
                slot: Mutex::new(None),
                generation: AtomicU64::new(0),
                handler_tx,
                handler_rx: std::sync::Mutex::new(Some(handler_rx)),
                registered: AtomicBool::new(false),
                root: CancellationToken::new(),
            }),
        }
    }

    /// Register the fix-handling task under [`BACKGROUND_LOCATION_TASK`].
    ///
    /// Returns `false` if it was already registered.
    pub fn register(&self, registry: &TaskRegistry) -> bool {
        let shared = Arc::clone(&self.shared);
        let registered = registry.register(BACKGROUND_LOCATION_TASK, move || {
            let rx = shared
                .handler_rx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            async move {
                if let Some(rx) = rx {
                    run_handler(shared, rx).await;
                }
            }
        });
        if registered {
            self.shared.registered.store(true, Ordering::SeqCst);
        }
        registered
    }

    /// Begin tracking `delivery_id`, persisting a new tracking record.
    ///
    /// Arming the delivery that is already armed returns a handle to the
    /// existing arming. Arming a different delivery supersedes the current one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotRegistered`] before registration,
    /// [`Error::PermissionDenied`] without foreground permission, and any
    /// storage or subscription error. A failed subscription leaves no
    /// tracking record behind.
    pub async fn start(&self, delivery_id: DeliveryId) -> Result<TrackingHandle> {
        let mode = self.prepare().await?;
        let mut slot = self.shared.slot.lock().await;
        self.arm_locked(&mut slot, TrackingRecord::starting_now(delivery_id), true, mode)
            .await
    }

    /// Re-arm tracking for a persisted record, keeping its start time.
    ///
    /// # Errors
    ///
    /// As [`LocationEmitter::start`], except that the persisted record is
    /// never removed on failure.
    pub async fn resume(&self, record: TrackingRecord) -> Result<TrackingHandle> {
        let mode = self.prepare().await?;
        let mut slot = self.shared.slot.lock().await;
        self.arm_locked(&mut slot, record, false, mode).await
    }

    /// Re-arm `record` only if it is still the persisted tracking record.
    ///
    /// The check and the arming happen under one slot lock, so a `stop` or a
    /// `start` that landed after `record` was read wins. Returns `None` in
    /// that case and leaves everything untouched.
    ///
    /// # Errors
    ///
    /// As [`LocationEmitter::resume`].
    pub async fn resume_if_current(&self, record: &TrackingRecord) -> Result<Option<TrackingHandle>> {
        let mode = self.prepare().await?;
        let mut slot = self.shared.slot.lock().await;
        let persisted = self.shared.with_storage(Storage::tracking_record).await?;
        if persisted.as_ref() != Some(record) {
            debug!(
                delivery = %record.delivery_id,
                persisted = persisted.as_ref().map(|r| r.delivery_id.as_str()),
                "Tracking record changed, not resuming"
            );
            return Ok(None);
        }
        self.arm_locked(&mut slot, record.clone(), false, mode)
            .await
            .map(Some)
    }

    async fn prepare(&self) -> Result<TrackingMode> {
        if !self.shared.registered.load(Ordering::SeqCst) {
            return Err(Error::TaskNotRegistered(BACKGROUND_LOCATION_TASK));
        }
        self.request_permissions().await
    }

    async fn arm_locked(
        &self,
        slot: &mut Option<Arming>,
        record: TrackingRecord,
        fresh: bool,
        mode: TrackingMode,
    ) -> Result<TrackingHandle> {
        let shared = &self.shared;
        if let Some(current) = slot.as_ref() {
            if current.delivery_id == record.delivery_id && !current.cancel.is_cancelled() {
                debug!(delivery = %record.delivery_id, "Delivery already armed");
                return Ok(current.handle());
            }
        }

        let switching = match slot.take() {
            Some(previous) if previous.delivery_id != record.delivery_id => {
                info!(from = %previous.delivery_id, to = %record.delivery_id, "Switching tracked delivery");
                previous.finish(ArmState::Superseded);
                true
            }
            Some(previous) => {
                previous.finish(ArmState::Stopped);
                false
            }
            None => false,
        };
        // A leftover fix belongs to some earlier delivery.
        if fresh || switching {
            shared.with_storage(Storage::clear_last_fix).await?;
        }
        let saved = record.clone();
        shared
            .with_storage(move |storage| storage.save_tracking_record(&saved))
            .await?;

        let stream = match shared.source.subscribe(shared.options).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(delivery = %record.delivery_id, "Location subscription failed: {}", e);
                if fresh {
                    if let Err(rollback) = shared.with_storage(Storage::clear_tracking_state).await {
                        warn!("Failed to roll back tracking record: {}", rollback);
                    }
                }
                return Err(e);
            }
        };

        let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = shared.root.child_token();
        let (state, _) = watch::channel(ArmState::Active);
        tokio::spawn(pump(Arc::clone(shared), generation, stream, cancel.clone()));

        let arming = Arming {
            delivery_id: record.delivery_id,
            generation,
            mode,
            cancel,
            state,
            fixes_handled: 0,
        };
        info!(
            delivery = %arming.delivery_id,
            generation,
            ?mode,
            resumed = !fresh,
            "Location tracking armed"
        );
        let handle = arming.handle();
        *slot = Some(arming);
        Ok(handle)
    }

    async fn request_permissions(&self) -> Result<TrackingMode> {
        let source = &self.shared.source;
        if !source.request_foreground_permission().await?.is_granted() {
            warn!(source = source.name(), "Foreground location permission denied");
            return Err(Error::PermissionDenied {
                permission: "foreground location",
            });
        }
        match source.request_background_permission().await {
            Ok(PermissionState::Granted) => Ok(TrackingMode::Background),
            Ok(PermissionState::Denied) => {
                warn!("Background location permission denied, tracking in foreground-only mode");
                Ok(TrackingMode::ForegroundOnly)
            }
            Err(e) => {
                warn!("Background permission request failed, tracking in foreground-only mode: {}", e);
                Ok(TrackingMode::ForegroundOnly)
            }
        }
    }

    /// Stop tracking and clear persisted tracking state. Safe to call when idle.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted state cannot be cleared.
    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.shared.slot.lock().await;
        if let Some(arming) = slot.take() {
            info!(delivery = %arming.delivery_id, "Location tracking stopped");
            arming.finish(ArmState::Stopped);
        } else {
            debug!("Stop requested while not tracking");
        }
        self.shared.with_storage(Storage::clear_tracking_state).await
    }

    /// Drop tracking for a delivery found to be stale.
    ///
    /// Disarms if `delivery_id` is armed and clears persisted state if the
    /// persisted record still names it. Returns whether state was cleared.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted state cannot be read or cleared.
    pub async fn discard(&self, delivery_id: &DeliveryId) -> Result<bool> {
        let mut slot = self.shared.slot.lock().await;
        if slot
            .as_ref()
            .is_some_and(|arming| arming.delivery_id == *delivery_id)
        {
            if let Some(arming) = slot.take() {
                arming.finish(ArmState::Stopped);
            }
        }

        let id = delivery_id.clone();
        let cleared = self
            .shared
            .with_storage(move |storage| match storage.tracking_record()? {
                Some(record) if record.delivery_id == id => {
                    storage.clear_tracking_state()?;
                    Ok(true)
                }
                _ => Ok(false),
            })
            .await?;
        if cleared {
            info!(delivery = %delivery_id, "Discarded stale tracking state");
        }
        Ok(cleared)
    }

    /// The armed delivery, if any.
    pub async fn armed_delivery(&self) -> Option<DeliveryId> {
        self.shared
            .slot
            .lock()
            .await
            .as_ref()
            .map(|arming| arming.delivery_id.clone())
    }

    /// Snapshot of the emitter.
    pub async fn status(&self) -> EmitterStatus {
        let slot = self.shared.slot.lock().await;
        EmitterStatus {
            registered: self.shared.registered.load(Ordering::SeqCst),
            delivery_id: slot.as_ref().map(|a| a.delivery_id.clone()),
            mode: slot.as_ref().map(|a| a.mode),
            fixes_handled: slot.as_ref().map_or(0, |a| a.fixes_handled),
        }
    }

    /// Cancel every subscription and the fix handler, keeping persisted state
    /// so that the next process can resume.
    pub fn shutdown(&self) {
        self.shared.root.cancel();
    }
}

impl Shared {
    /// Run a store operation on the blocking pool. Callers keep holding the
    /// slot lock across it.
    async fn with_storage<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Storage) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let storage = Arc::clone(&self.storage);
        tokio::task::spawn_blocking(move || op(&storage))
            .await
            .map_err(|e| Error::internal(format!("storage task failed: {e}")))?
    }

    async fn handle_batch(&self, batch: TaggedBatch) {
        let Some(fix) = batch.fixes.last().copied() else {
            return;
        };
        if batch.fixes.len() > 1 {
            trace!(superseded = batch.fixes.len() - 1, "Keeping newest fix of batch");
        }

        let mut slot = self.slot.lock().await;
        let Some(arming) = slot
            .as_mut()
            .filter(|a| a.generation == batch.generation && !a.cancel.is_cancelled())
        else {
            debug!(generation = batch.generation, "Dropping fix from a cancelled subscription");
            return;
        };

        if let Err(e) = self.with_storage(move |storage| storage.save_last_fix(&fix)).await {
            error!(delivery = %arming.delivery_id, "Failed to persist location fix: {}", e);
        }
        arming.fixes_handled += 1;

        let event = OutboundEvent::Location(LocationEvent::from_fix(arming.delivery_id.clone(), &fix));
        match self.session.emit(event) {
            Ok(()) => trace!(delivery = %arming.delivery_id, "Location emitted"),
            Err(Error::ChannelDown) => {
                debug!(delivery = %arming.delivery_id, "Channel down, fix persisted but not emitted");
            }
            Err(e) => warn!(delivery = %arming.delivery_id, "Location not emitted: {}", e),
        }
    }

    async fn subscription_failed(&self, generation: u64, failure: &SourceError) {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|a| a.generation == generation) {
            if let Some(arming) = slot.take() {
                error!(delivery = %arming.delivery_id, "Location subscription ended: {}", failure);
                arming.finish(ArmState::Failed(failure.to_string()));
            }
        }
    }
}

async fn pump(shared: Arc<Shared>, generation: u64, mut stream: FixStream, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            item = stream.next() => match item {
                Some(Ok(fixes)) => {
                    let batch = TaggedBatch { generation, fixes };
                    if shared.handler_tx.send(batch).await.is_err() {
                        break;
                    }
                }
                Some(Err(failure)) => {
                    shared.subscription_failed(generation, &failure).await;
                    break;
                }
                None => {
                    debug!(generation, "Location source finished");
                    break;
                }
            },
        }
    }
}

async fn run_handler(shared: Arc<Shared>, mut rx: mpsc::Receiver<TaggedBatch>) {
    debug!("Fix handler running");
    loop {
        tokio::select! {
            () = shared.root.cancelled() => break,
            batch = rx.recv() => match batch {
                Some(batch) => shared.handle_batch(batch).await,
                None => break,
            },
        }
    }
    debug!("Fix handler stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::channel::session_slot;
    use crate::testing::{wait_until, ScriptedSource};

    struct Fixture {
        storage: Arc<Storage>,
        source: Arc<ScriptedSource>,
        emitter: LocationEmitter,
        registry: TaskRegistry,
        session: crate::channel::SessionWriter,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let source = ScriptedSource::new();
        let (session, view) = session_slot();
        let emitter = LocationEmitter::new(
            Arc::clone(&storage),
            source.clone(),
            view,
            UpdateOptions::default(),
        );
        let registry = TaskRegistry::new();
        assert!(emitter.register(&registry));
        Fixture {
            storage,
            source,
            emitter,
            registry,
            session,
        }
    }

    fn fix(lat: f64, secs: i64) -> LocationFix {
        LocationFix::new(lat, 106.66, Utc.timestamp_opt(1_714_550_400 + secs, 0).unwrap())
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let f = fixture();
        assert!(!f.emitter.register(&f.registry));
        assert!(f.registry.is_registered(BACKGROUND_LOCATION_TASK));
        assert!(f.emitter.status().await.registered);
    }

    #[tokio::test]
    async fn test_start_requires_registration() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let (_writer, view) = session_slot();
        let emitter = LocationEmitter::new(
            Arc::clone(&storage),
            ScriptedSource::new(),
            view,
            UpdateOptions::default(),
        );

        let err = emitter.start(DeliveryId::from("D1")).await.unwrap_err();
        assert!(matches!(err, Error::TaskNotRegistered(BACKGROUND_LOCATION_TASK)));
        assert!(storage.tracking_record().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_writes_record_before_any_fix() {
        let f = fixture();
        let handle = f.emitter.start(DeliveryId::from("D1")).await.unwrap();

        let record = f.storage.tracking_record().unwrap().unwrap();
        assert_eq!(record.delivery_id, DeliveryId::from("D1"));
        assert!(f.storage.last_fix().unwrap().is_none());
        assert_eq!(handle.state(), ArmState::Active);
        assert_eq!(handle.mode(), TrackingMode::Background);
    }

    #[tokio::test]
    async fn test_start_twice_is_idempotent() {
        let f = fixture();
        f.emitter.start(DeliveryId::from("D1")).await.unwrap();
        let first_start = f.storage.tracking_record().unwrap().unwrap().start_time;
        let again = f.emitter.start(DeliveryId::from("D1")).await.unwrap();

        assert_eq!(again.state(), ArmState::Active);
        assert_eq!(f.source.subscribe_count(), 1);
        assert_eq!(f.source.active_subscriptions(), 1);
        assert_eq!(
            f.storage.tracking_record().unwrap().unwrap().start_time,
            first_start
        );
    }

    #[tokio::test]
    async fn test_stop_twice_never_errors() {
        let f = fixture();
        f.emitter.stop().await.unwrap();
        let mut handle = f.emitter.start(DeliveryId::from("D1")).await.unwrap();
        f.storage.save_last_fix(&fix(1.0, 0)).unwrap();

        f.emitter.stop().await.unwrap();
        f.emitter.stop().await.unwrap();

        assert_eq!(handle.terminated().await, ArmState::Stopped);
        assert!(f.storage.tracking_record().unwrap().is_none());
        assert!(f.storage.last_fix().unwrap().is_none());
        assert!(f.emitter.armed_delivery().await.is_none());
        wait_until(|| f.source.active_subscriptions() == 0).await;
    }

    #[tokio::test]
    async fn test_foreground_denied_is_terminal() {
        let f = fixture();
        f.source.set_foreground(PermissionState::Denied);

        let err = f.emitter.start(DeliveryId::from("D1")).await.unwrap_err();
        assert!(err.is_permission_error());
        assert!(f.storage.tracking_record().unwrap().is_none());
        assert_eq!(f.source.subscribe_count(), 0);
    }

    #[tokio::test]
    async fn test_background_denied_degrades() {
        let f = fixture();
        f.source.set_background(PermissionState::Denied);

        let handle = f.emitter.start(DeliveryId::from("D1")).await.unwrap();
        assert_eq!(handle.mode(), TrackingMode::ForegroundOnly);
        assert_eq!(
            f.emitter.status().await.mode,
            Some(TrackingMode::ForegroundOnly)
        );
    }

    #[tokio::test]
    async fn test_subscribe_failure_rolls_back_fresh_record() {
        let f = fixture();
        f.source.fail_subscribe(true);

        let err = f.emitter.start(DeliveryId::from("D1")).await.unwrap_err();
        assert!(matches!(err, Error::LocationSubscription(_)));
        assert!(f.storage.tracking_record().unwrap().is_none());
        assert!(f.emitter.armed_delivery().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_failure_keeps_resumed_record() {
        let f = fixture();
        f.source.fail_subscribe(true);
        let record = TrackingRecord::starting_now(DeliveryId::from("D1"));
        f.storage.save_tracking_record(&record).unwrap();

        assert!(f.emitter.resume(record.clone()).await.is_err());
        assert_eq!(f.storage.tracking_record().unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_resume_if_current_requires_unchanged_record() {
        let f = fixture();
        let record = TrackingRecord {
            delivery_id: DeliveryId::from("D1"),
            start_time: Utc.timestamp_opt(1_714_550_400, 0).unwrap(),
        };

        // Nothing persisted.
        assert!(f.emitter.resume_if_current(&record).await.unwrap().is_none());

        // Same delivery, different start time.
        f.storage
            .save_tracking_record(&TrackingRecord::starting_now(DeliveryId::from("D1")))
            .unwrap();
        assert!(f.emitter.resume_if_current(&record).await.unwrap().is_none());
        assert!(f.emitter.armed_delivery().await.is_none());
        assert_eq!(f.source.subscribe_count(), 0);

        f.storage.save_tracking_record(&record).unwrap();
        let handle = f.emitter.resume_if_current(&record).await.unwrap().unwrap();
        assert_eq!(handle.delivery_id(), &DeliveryId::from("D1"));
        assert_eq!(f.storage.tracking_record().unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_only_last_fix_of_batch_is_persisted_and_emitted() {
        let f = fixture();
        let (tx, mut rx) = mpsc::channel(8);
        f.session.install(1, tx);
        f.emitter.start(DeliveryId::from("D1")).await.unwrap();

        f.source.push(vec![fix(10.0, 0), fix(10.1, 10), fix(10.2, 20)]).await;

        let OutboundEvent::Location(event) = rx.recv().await.unwrap() else {
            panic!("expected a location event");
        };
        assert_eq!(event.delivery_id, DeliveryId::from("D1"));
        assert!((event.latitude - 10.2).abs() < f64::EPSILON);
        assert_eq!(f.storage.last_fix().unwrap(), Some(fix(10.2, 20)));
        assert!(rx.try_recv().is_err());
        assert_eq!(f.emitter.status().await.fixes_handled, 1);
    }

    #[tokio::test]
    async fn test_fix_without_session_is_persisted_not_emitted() {
        let f = fixture();
        f.emitter.start(DeliveryId::from("D1")).await.unwrap();

        f.source.push(vec![fix(10.5, 5)]).await;
        wait_until(|| f.storage.last_fix().unwrap().is_some()).await;

        assert_eq!(f.storage.last_fix().unwrap(), Some(fix(10.5, 5)));
        // A session arriving later does not replay the missed fix.
        let (tx, mut rx) = mpsc::channel(8);
        f.session.install(1, tx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_switching_delivery_never_mixes_ids() {
        let f = fixture();
        let (tx, mut rx) = mpsc::channel(8);
        f.session.install(1, tx);

        let mut first = f.emitter.start(DeliveryId::from("A")).await.unwrap();
        f.source.push(vec![fix(1.0, 0)]).await;
        let OutboundEvent::Location(event) = rx.recv().await.unwrap() else {
            panic!("expected a location event");
        };
        assert_eq!(event.delivery_id, DeliveryId::from("A"));

        f.emitter.start(DeliveryId::from("B")).await.unwrap();
        assert_eq!(first.terminated().await, ArmState::Superseded);
        assert!(f.storage.last_fix().unwrap().is_none());

        // A late batch from A's subscription is dropped.
        f.source.push_to(0, vec![fix(2.0, 10)]).await;
        f.source.push(vec![fix(3.0, 20)]).await;

        let OutboundEvent::Location(event) = rx.recv().await.unwrap() else {
            panic!("expected a location event");
        };
        assert_eq!(event.delivery_id, DeliveryId::from("B"));
        assert!((event.latitude - 3.0).abs() < f64::EPSILON);
        assert!(rx.try_recv().is_err());

        let record = f.storage.tracking_record().unwrap().unwrap();
        assert_eq!(record.delivery_id, DeliveryId::from("B"));
        assert_eq!(f.storage.last_fix().unwrap(), Some(fix(3.0, 20)));
        wait_until(|| f.source.active_subscriptions() == 1).await;
    }

    #[tokio::test]
    async fn test_fix_after_stop_does_not_resurrect_state() {
        let f = fixture();
        f.emitter.start(DeliveryId::from("D1")).await.unwrap();

        f.source.push(vec![fix(4.0, 0)]).await;
        f.emitter.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(f.storage.tracking_record().unwrap().is_none());
        assert!(f.storage.last_fix().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscription_failure_surfaces_on_handle() {
        let f = fixture();
        let mut handle = f.emitter.start(DeliveryId::from("D1")).await.unwrap();

        f.source.fail_latest(SourceError::PermissionRevoked).await;

        assert_eq!(
            handle.terminated().await,
            ArmState::Failed("location permission revoked".to_string())
        );
        assert!(f.emitter.armed_delivery().await.is_none());
        // Persisted state is left for the caller to decide on.
        assert!(f.storage.tracking_record().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_discard_only_clears_matching_record() {
        let f = fixture();
        f.emitter.start(DeliveryId::from("D1")).await.unwrap();

        assert!(!f.emitter.discard(&DeliveryId::from("OTHER")).await.unwrap());
        assert_eq!(f.emitter.armed_delivery().await, Some(DeliveryId::from("D1")));

        assert!(f.emitter.discard(&DeliveryId::from("D1")).await.unwrap());
        assert!(f.emitter.armed_delivery().await.is_none());
        assert!(f.storage.tracking_record().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_keeps_persisted_state() {
        let f = fixture();
        f.emitter.start(DeliveryId::from("D1")).await.unwrap();
        f.emitter.shutdown();
        wait_until(|| f.source.active_subscriptions() == 0).await;

        f.source.push(vec![fix(5.0, 0)]).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(f.storage.tracking_record().unwrap().is_some());
        assert!(f.storage.last_fix().unwrap().is_none());
    }
}
