//! Resume reconciliation.
//!
//! Every time the channel connects, persisted tracking state is checked
//! against the server's view of the delivery. An in-transit delivery is
//! re-armed and announced, a finished or unknown one is discarded, and
//! anything ambiguous leaves the persisted state exactly as it was.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::channel::protocol::{Coordinates, OutboundEvent, ResumeAnnouncement};
use crate::channel::{ConnectedHook, Credential, SessionView};
use crate::emitter::LocationEmitter;
use crate::status::{DeliveryStatusQuery, StatusQueryError};
use crate::storage::Storage;
use crate::tracking::{downtime, DeliveryId, DeliveryStatus, LocationFix, TrackingRecord};

/// Result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Nothing was being tracked.
    Idle,
    /// Tracking was re-armed for an in-transit delivery.
    Resumed {
        /// Resumed delivery.
        delivery_id: DeliveryId,
        /// Seconds since the last known activity.
        downtime_secs: i64,
        /// Whether a resume announcement was emitted.
        announced: bool,
    },
    /// Persisted state was stale and has been removed.
    Discarded {
        /// Delivery whose state was removed.
        delivery_id: DeliveryId,
        /// Why the state was considered stale.
        reason: String,
    },
    /// No decision could be made; persisted state is untouched.
    Deferred {
        /// Delivery concerned, when the record could be read.
        delivery_id: Option<DeliveryId>,
        /// Why reconciliation was deferred.
        reason: String,
    },
}

/// Reconciles persisted tracking state with the server on each connection.
pub struct Reconciler {
    storage: Arc<Storage>,
    emitter: LocationEmitter,
    status: Arc<dyn DeliveryStatusQuery>,
    session: SessionView,
    outcomes: broadcast::Sender<ReconcileOutcome>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("emitter", &self.emitter)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Create a reconciler.
    #[must_use]
    pub fn new(
        storage: Arc<Storage>,
        emitter: LocationEmitter,
        status: Arc<dyn DeliveryStatusQuery>,
        session: SessionView,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(16);
        Self {
            storage,
            emitter,
            status,
            session,
            outcomes,
        }
    }

    /// Receive the outcome of every future pass.
    #[must_use]
    pub fn outcomes(&self) -> broadcast::Receiver<ReconcileOutcome> {
        self.outcomes.subscribe()
    }

    /// Reconcile now.
    pub async fn reconcile(&self, credential: &Credential) -> ReconcileOutcome {
        self.reconcile_at(credential, Utc::now()).await
    }

    /// Reconcile as if resuming at `now`.
    pub async fn reconcile_at(&self, credential: &Credential, now: DateTime<Utc>) -> ReconcileOutcome {
        let outcome = self.decide(credential, now).await;
        match &outcome {
            ReconcileOutcome::Idle => debug!("No tracking state to reconcile"),
            ReconcileOutcome::Resumed {
                delivery_id,
                downtime_secs,
                announced,
            } => info!(
                delivery = %delivery_id,
                downtime_secs,
                announced,
                "Tracking resumed"
            ),
            ReconcileOutcome::Discarded { delivery_id, reason } => {
                info!(delivery = %delivery_id, reason = %reason, "Stale tracking state discarded");
            }
            ReconcileOutcome::Deferred { delivery_id, reason } => warn!(
                delivery = delivery_id.as_ref().map(DeliveryId::as_str),
                reason = %reason,
                "Reconciliation deferred"
            ),
        }
        let _ = self.outcomes.send(outcome.clone());
        outcome
    }

    async fn decide(&self, credential: &Credential, now: DateTime<Utc>) -> ReconcileOutcome {
        let record = match self.storage.tracking_record() {
            Ok(Some(record)) => record,
            Ok(None) => return ReconcileOutcome::Idle,
            Err(e) => {
                return ReconcileOutcome::Deferred {
                    delivery_id: None,
                    reason: format!("tracking record unreadable: {e}"),
                }
            }
        };
        let last_fix = match self.storage.last_fix() {
            Ok(fix) => fix,
            Err(e) => {
                warn!(delivery = %record.delivery_id, "Ignoring unreadable last fix: {}", e);
                None
            }
        };

        let delivery_id = record.delivery_id.clone();
        match self.status.delivery_status(credential, &delivery_id).await {
            Ok(DeliveryStatus::InTransit) => self.resume(record, last_fix, now).await,
            Ok(status) if status.is_terminal() => {
                self.discard(delivery_id, format!("delivery is {status}")).await
            }
            Ok(status) => ReconcileOutcome::Deferred {
                delivery_id: Some(delivery_id),
                reason: format!("delivery is {status}"),
            },
            Err(StatusQueryError::NotFound) => {
                self.discard(delivery_id, "delivery not found".to_string()).await
            }
            Err(StatusQueryError::Transient(message)) => ReconcileOutcome::Deferred {
                delivery_id: Some(delivery_id),
                reason: format!("status lookup failed: {message}"),
            },
        }
    }

    async fn resume(
        &self,
        record: TrackingRecord,
        last_fix: Option<LocationFix>,
        now: DateTime<Utc>,
    ) -> ReconcileOutcome {
        let delivery_id = record.delivery_id.clone();
        let start_time = record.start_time;
        match self.emitter.resume_if_current(&record).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return ReconcileOutcome::Deferred {
                    delivery_id: Some(delivery_id),
                    reason: "tracking state changed during reconciliation".to_string(),
                }
            }
            Err(e) => {
                return ReconcileOutcome::Deferred {
                    delivery_id: Some(delivery_id),
                    reason: format!("could not re-arm tracking: {e}"),
                }
            }
        }

        let gap = downtime(now, start_time, last_fix.as_ref());
        let announced = match last_fix {
            Some(fix) => {
                let announcement = ResumeAnnouncement {
                    delivery_id: delivery_id.clone(),
                    last_location: Coordinates::from(&fix),
                    start_time,
                    resume_time: now,
                };
                match self.session.emit(OutboundEvent::ResumeTracking(announcement)) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(delivery = %delivery_id, "Resume announcement not sent: {}", e);
                        false
                    }
                }
            }
            None => {
                debug!(delivery = %delivery_id, "No last fix, resuming without announcement");
                false
            }
        };

        ReconcileOutcome::Resumed {
            delivery_id,
            downtime_secs: gap.num_seconds(),
            announced,
        }
    }

    async fn discard(&self, delivery_id: DeliveryId, reason: String) -> ReconcileOutcome {
        match self.emitter.discard(&delivery_id).await {
            Ok(_) => ReconcileOutcome::Discarded { delivery_id, reason },
            Err(e) => ReconcileOutcome::Deferred {
                delivery_id: Some(delivery_id),
                reason: format!("{reason}, but clearing state failed: {e}"),
            },
        }
    }
}

#[async_trait::async_trait]
impl ConnectedHook for Reconciler {
    async fn on_connected(&self, session_id: u64, credential: &Credential) {
        debug!(session_id, "Reconciling tracking state");
        self.reconcile(credential).await;
    }
}
