//! Fusion state and snapshot publication
//!
//! [`FusionState`] holds the latest accepted position and reference and
//! builds each [`SyncSnapshot`] whole. [`SnapshotPublisher`] swaps the
//! published snapshot atomically and fans it out to subscribers, so a reader
//! never sees a half-applied update.

use chrono::{DateTime, Utc};
use homeward_common::config::EngineConfig;
use homeward_common::events::TrackingEvent;
use homeward_common::model::{
    Freshness, InputStamp, Position, ReferenceLocation, ReferenceState, Route, StreamError,
    SubjectId, SyncSnapshot,
};
use homeward_common::time::millis_to_chrono;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::error::FetchError;

/// Event channel buffer; slow receivers lag rather than block the engine
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Freshness thresholds
#[derive(Debug, Clone)]
pub struct FreshnessPolicy {
    pub position_stale_after: chrono::Duration,
    /// None: the reference never goes stale
    pub reference_stale_after: Option<chrono::Duration>,
    pub epsilon: f64,
}

impl From<&EngineConfig> for FreshnessPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            position_stale_after: millis_to_chrono(config.position_stale_after_ms),
            reference_stale_after: config.reference_stale_after_ms.map(millis_to_chrono),
            epsilon: config.route_coordinate_epsilon,
        }
    }
}

impl FreshnessPolicy {
    /// Stale strictly after the threshold
    pub fn classify_age(
        since: DateTime<Utc>,
        now: DateTime<Utc>,
        threshold: chrono::Duration,
    ) -> Freshness {
        if now.signed_duration_since(since) > threshold {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }

    pub fn classify_position(&self, position: Option<&Position>, now: DateTime<Utc>) -> Freshness {
        match position {
            Some(p) => Self::classify_age(p.observed_at, now, self.position_stale_after),
            None => Freshness::Unknown,
        }
    }

    pub fn classify_reference(
        &self,
        reference: &ReferenceState,
        resolved_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Freshness {
        let ReferenceState::Configured(_) = reference else {
            return Freshness::Unknown;
        };
        match (self.reference_stale_after, resolved_at) {
            (Some(threshold), Some(at)) => Self::classify_age(at, now, threshold),
            _ => Freshness::Fresh,
        }
    }

    /// Stale once the carried path no longer matches the current inputs
    pub fn classify_route(
        &self,
        route: Option<&Route>,
        position: Option<&Position>,
        reference: Option<&ReferenceLocation>,
    ) -> Freshness {
        let Some(route) = route.filter(|r| r.has_result()) else {
            return Freshness::Unknown;
        };
        match (position, reference) {
            (Some(p), Some(r)) => {
                if route.stamp().materially_differs(&InputStamp::of(p, r), self.epsilon) {
                    Freshness::Stale
                } else {
                    Freshness::Fresh
                }
            }
            _ => Freshness::Stale,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PositionUpdate {
    Accepted,
    /// Older than the held position; snapshot unchanged
    Dropped { current_sequence: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceUpdate {
    /// `changed` is false when the same location was resolved again
    Updated { changed: bool },
    NotConfigured { changed: bool },
    /// Older `updated_at` than the held reference
    Dropped,
}

/// Latest accepted inputs; mutated only by the engine event loop
pub struct FusionState {
    policy: FreshnessPolicy,
    subject: Option<SubjectId>,
    position: Option<Position>,
    reference: ReferenceState,
    reference_resolved_at: Option<DateTime<Utc>>,
    position_error: Option<StreamError>,
    reference_error: Option<StreamError>,
    revision: u64,
}

impl FusionState {
    pub fn new(policy: FreshnessPolicy, subject: Option<SubjectId>) -> Self {
        Self {
            policy,
            subject,
            position: None,
            reference: ReferenceState::Unresolved,
            reference_resolved_at: None,
            position_error: None,
            reference_error: None,
            revision: 0,
        }
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn reference(&self) -> Option<&ReferenceLocation> {
        self.reference.location()
    }

    pub fn apply_position(&mut self, mut position: Position) -> PositionUpdate {
        if let Some(current) = &self.position {
            if position.is_older_than(current) {
                return PositionUpdate::Dropped {
                    current_sequence: current.sequence,
                };
            }
            // Wall clock stepped back; published timestamps must not regress
            if position.observed_at < current.observed_at {
                position.observed_at = current.observed_at;
            }
        }
        self.position = Some(position);
        self.position_error = None;
        PositionUpdate::Accepted
    }

    pub fn apply_reference(
        &mut self,
        reference: Option<ReferenceLocation>,
        now: DateTime<Utc>,
    ) -> ReferenceUpdate {
        let update = match reference {
            None => {
                let changed = self.reference != ReferenceState::NotConfigured;
                self.reference = ReferenceState::NotConfigured;
                ReferenceUpdate::NotConfigured { changed }
            }
            Some(location) => {
                if let ReferenceState::Configured(current) = &self.reference {
                    if location.updated_at < current.updated_at {
                        return ReferenceUpdate::Dropped;
                    }
                }
                let next = ReferenceState::Configured(location);
                let changed = self.reference != next;
                self.reference = next;
                ReferenceUpdate::Updated { changed }
            }
        };

        self.reference_resolved_at = Some(now);
        self.reference_error = None;
        update
    }

    pub fn record_position_error(&mut self, error: &FetchError, now: DateTime<Utc>) {
        self.position_error = Some(stream_error(error, now));
    }

    pub fn record_reference_error(&mut self, error: &FetchError, now: DateTime<Utc>) {
        self.reference_error = Some(stream_error(error, now));
    }

    pub fn classify(
        &self,
        route: Option<&Route>,
        now: DateTime<Utc>,
    ) -> (Freshness, Freshness, Freshness) {
        (
            self.policy.classify_position(self.position.as_ref(), now),
            self.policy
                .classify_reference(&self.reference, self.reference_resolved_at, now),
            self.policy
                .classify_route(route, self.position.as_ref(), self.reference.location()),
        )
    }

    /// Build the next snapshot revision
    pub fn build(&mut self, route: Option<&Route>, now: DateTime<Utc>) -> SyncSnapshot {
        self.revision += 1;
        let (position_freshness, reference_freshness, route_freshness) = self.classify(route, now);

        SyncSnapshot {
            revision: self.revision,
            subject: self.subject.clone(),
            position: self.position.clone(),
            reference: self.reference.clone(),
            reference_resolved_at: self.reference_resolved_at,
            route: route.cloned(),
            position_freshness,
            reference_freshness,
            route_freshness,
            position_error: self.position_error.clone(),
            reference_error: self.reference_error.clone(),
            built_at: Some(now),
        }
    }
}

fn stream_error(error: &FetchError, now: DateTime<Utc>) -> StreamError {
    StreamError {
        kind: error.kind(),
        message: error.to_string(),
        at: now,
    }
}

/// Snapshot subscriber; invoked on the engine task after every publish
pub type SnapshotCallback = Arc<dyn Fn(&Arc<SyncSnapshot>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

struct Subscribers {
    next_id: u64,
    callbacks: Vec<(SubscriptionId, SnapshotCallback)>,
}

/// Publishes snapshots and tracking events
pub struct SnapshotPublisher {
    snapshot_tx: watch::Sender<Arc<SyncSnapshot>>,
    event_tx: broadcast::Sender<TrackingEvent>,
    subscribers: Mutex<Subscribers>,
}

impl SnapshotPublisher {
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(SyncSnapshot::default()));
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            snapshot_tx,
            event_tx,
            subscribers: Mutex::new(Subscribers {
                next_id: 0,
                callbacks: Vec::new(),
            }),
        }
    }

    /// Replace the published snapshot, then notify callbacks
    pub fn publish(&self, snapshot: SyncSnapshot) {
        let snapshot = Arc::new(snapshot);
        self.snapshot_tx.send_replace(Arc::clone(&snapshot));

        // Called outside the lock so a callback may (un)subscribe
        let callbacks: Vec<SnapshotCallback> = self
            .lock_subscribers()
            .callbacks
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(&snapshot);
        }
    }

    /// Broadcast an event (no receivers is fine)
    pub fn emit(&self, event: TrackingEvent) {
        debug!(event = event.event_type(), "Tracking event");
        let _ = self.event_tx.send(event);
    }

    pub fn current(&self) -> Arc<SyncSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Arc<SyncSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<TrackingEvent> {
        self.event_tx.subscribe()
    }

    pub fn subscribe(&self, callback: SnapshotCallback) -> SubscriptionId {
        let mut subscribers = self.lock_subscribers();
        subscribers.next_id += 1;
        let id = SubscriptionId(subscribers.next_id);
        subscribers.callbacks.push((id, callback));
        id
    }

    /// Returns false when `id` was not subscribed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock_subscribers();
        let before = subscribers.callbacks.len();
        subscribers.callbacks.retain(|(sub, _)| *sub != id);
        subscribers.callbacks.len() != before
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Subscribers> {
        // A panicking callback must not disable publication
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new()
    }
}
