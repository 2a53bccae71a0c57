//! In-process fakes shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Notify};

use crate::channel::{ChannelNotice, Credential, InboundEvent, Link, OutboundEvent, Transport};
use crate::error::{Error, Result};
use crate::source::{FixBatch, FixStream, LocationSource, PermissionState, SourceError, UpdateOptions};
use crate::status::{DeliveryStatusQuery, StatusQueryError};
use crate::tracking::{DeliveryId, DeliveryStatus, LocationFix};

/// Server side of one fake connection.
pub(crate) struct ServerEnd {
    pub credential: Credential,
    pub received: mpsc::Receiver<OutboundEvent>,
    pub push: mpsc::Sender<InboundEvent>,
}

/// Transport whose connections terminate in [`ServerEnd`]s handed to the test.
pub(crate) struct FakeTransport {
    ends: mpsc::UnboundedSender<ServerEnd>,
    fail_next: AtomicUsize,
    opens: AtomicUsize,
}

impl FakeTransport {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (ends, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            ends,
            fail_next: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
        });
        (transport, rx)
    }

    /// Refuse the next `n` connection attempts.
    pub(crate) fn fail_next_opens(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Connection attempts so far, failed ones included.
    pub(crate) fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn open(&self, credential: &Credential) -> Result<Link> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::channel_connect("fake://", "refused"));
        }

        let (outbound, received) = mpsc::channel(16);
        let (push, inbound) = mpsc::channel(16);
        let _ = self.ends.send(ServerEnd {
            credential: credential.clone(),
            received,
            push,
        });
        Ok(Link { outbound, inbound })
    }
}

#[derive(Debug)]
struct SourceState {
    foreground: PermissionState,
    background: PermissionState,
    fail_subscribe: bool,
    subscribes: usize,
    streams: Vec<mpsc::Sender<FixBatch>>,
}

/// Location source driven by the test.
#[derive(Debug)]
pub(crate) struct ScriptedSource {
    state: Mutex<SourceState>,
}

impl ScriptedSource {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SourceState {
                foreground: PermissionState::Granted,
                background: PermissionState::Granted,
                fail_subscribe: false,
                subscribes: 0,
                streams: Vec::new(),
            }),
        })
    }

    pub(crate) fn set_foreground(&self, state: PermissionState) {
        self.state.lock().unwrap().foreground = state;
    }

    pub(crate) fn set_background(&self, state: PermissionState) {
        self.state.lock().unwrap().background = state;
    }

    pub(crate) fn fail_subscribe(&self, fail: bool) {
        self.state.lock().unwrap().fail_subscribe = fail;
    }

    pub(crate) fn subscribe_count(&self) -> usize {
        self.state.lock().unwrap().subscribes
    }

    /// Subscriptions whose stream is still held by a consumer.
    pub(crate) fn active_subscriptions(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .streams
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Deliver a batch on the newest subscription.
    pub(crate) async fn push(&self, fixes: Vec<LocationFix>) {
        self.send_latest(Ok(fixes)).await;
    }

    /// Deliver a batch on the `index`th subscription ever made.
    pub(crate) async fn push_to(&self, index: usize, fixes: Vec<LocationFix>) {
        let tx = self.state.lock().unwrap().streams.get(index).cloned();
        if let Some(tx) = tx {
            let _ = tx.send(Ok(fixes)).await;
        }
    }

    /// End the newest subscription with `failure`.
    pub(crate) async fn fail_latest(&self, failure: SourceError) {
        self.send_latest(Err(failure)).await;
    }

    async fn send_latest(&self, batch: FixBatch) {
        let tx = self.state.lock().unwrap().streams.last().cloned();
        if let Some(tx) = tx {
            let _ = tx.send(batch).await;
        }
    }
}

#[async_trait::async_trait]
impl LocationSource for ScriptedSource {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn request_foreground_permission(&self) -> Result<PermissionState> {
        Ok(self.state.lock().unwrap().foreground)
    }

    async fn request_background_permission(&self) -> Result<PermissionState> {
        Ok(self.state.lock().unwrap().background)
    }

    async fn subscribe(&self, _options: UpdateOptions) -> Result<FixStream> {
        let mut state = self.state.lock().unwrap();
        if state.fail_subscribe {
            return Err(Error::subscription("scripted failure"));
        }
        state.subscribes += 1;
        let (tx, stream) = FixStream::channel(8);
        state.streams.push(tx);
        Ok(stream)
    }
}

/// Status service answering from a fixed table; unknown ids are not found.
#[derive(Debug, Default)]
pub(crate) struct FakeStatus {
    answers: Mutex<HashMap<DeliveryId, std::result::Result<DeliveryStatus, StatusQueryError>>>,
    calls: AtomicUsize,
    last_credential: Mutex<Option<Credential>>,
}

impl FakeStatus {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set(
        &self,
        delivery_id: &str,
        answer: std::result::Result<DeliveryStatus, StatusQueryError>,
    ) {
        self.answers
            .lock()
            .unwrap()
            .insert(DeliveryId::from(delivery_id), answer);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_credential(&self) -> Option<Credential> {
        self.last_credential.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl DeliveryStatusQuery for FakeStatus {
    async fn delivery_status(
        &self,
        credential: &Credential,
        delivery_id: &DeliveryId,
    ) -> std::result::Result<DeliveryStatus, StatusQueryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_credential.lock().unwrap() = Some(credential.clone());
        self.answers
            .lock()
            .unwrap()
            .get(delivery_id)
            .cloned()
            .unwrap_or(Err(StatusQueryError::NotFound))
    }
}

/// Status service that holds each query open until the test releases it.
#[derive(Debug)]
pub(crate) struct GatedStatus {
    answer: std::result::Result<DeliveryStatus, StatusQueryError>,
    entered: Notify,
    release: Notify,
}

impl GatedStatus {
    pub(crate) fn new(answer: std::result::Result<DeliveryStatus, StatusQueryError>) -> Arc<Self> {
        Arc::new(Self {
            answer,
            entered: Notify::new(),
            release: Notify::new(),
        })
    }

    /// Wait until a query is in flight.
    pub(crate) async fn entered(&self) {
        tokio::time::timeout(Duration::from_secs(2), self.entered.notified())
            .await
            .expect("status query never started");
    }

    /// Let the in-flight query answer.
    pub(crate) fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait::async_trait]
impl DeliveryStatusQuery for GatedStatus {
    async fn delivery_status(
        &self,
        _credential: &Credential,
        _delivery_id: &DeliveryId,
    ) -> std::result::Result<DeliveryStatus, StatusQueryError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.answer.clone()
    }
}

/// Next channel notice, failing the test after two seconds.
pub(crate) async fn next_notice(rx: &mut broadcast::Receiver<ChannelNotice>) -> ChannelNotice {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for notice")
        .expect("notice channel closed")
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
