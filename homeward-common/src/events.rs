//! Event types for the tracking event channel
//!
//! Every fetch failure, dropped sample and route transition is reported here,
//! so presentation and logs can observe what the engine did without the engine
//! ever returning an error to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{FetchErrorKind, Freshness, RouteFailureKind, SubjectId};

/// Tracking event types
///
/// Broadcast by the engine and serialized for SSE transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TrackingEvent {
    /// Engine run started for a subject
    EngineStarted {
        run_id: Uuid,
        subject: SubjectId,
        timestamp: DateTime<Utc>,
    },

    /// Engine run stopped; no further events for this run
    EngineStopped {
        run_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// A new position was accepted into the snapshot
    PositionUpdated {
        sequence: u64,
        latitude: f64,
        longitude: f64,
        timestamp: DateTime<Utc>,
    },

    /// An out-of-order position was dropped
    PositionDropped {
        sequence: u64,
        current_sequence: u64,
        timestamp: DateTime<Utc>,
    },

    /// Position fetch failed; polling continues on schedule
    PositionFetchFailed {
        kind: FetchErrorKind,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Reference location replaced
    ReferenceUpdated {
        label: String,
        updated_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// Source reports no reference configured for the subject
    ReferenceNotConfigured { timestamp: DateTime<Utc> },

    /// A reference older than the held one was dropped
    ReferenceDropped {
        updated_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// Reference fetch failed; previous value retained
    ReferenceFetchFailed {
        kind: FetchErrorKind,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Route computation issued
    RouteRequested {
        request_id: u64,
        for_position: u64,
        for_reference: DateTime<Utc>,
        /// Issued by the backoff timer or a manual retry
        retry: bool,
        timestamp: DateTime<Utc>,
    },

    /// Trigger arrived while a request was in flight; folded into one catch-up
    RouteCoalesced {
        in_flight_request_id: u64,
        timestamp: DateTime<Utc>,
    },

    /// Route computation succeeded and was applied
    RouteReady {
        request_id: u64,
        distance_meters: f64,
        duration_seconds: f64,
        timestamp: DateTime<Utc>,
    },

    /// Route computation failed and was applied as Failed
    RouteFailed {
        request_id: u64,
        kind: RouteFailureKind,
        message: String,
        /// None when the failure is terminal for the current inputs
        retry_in_ms: Option<u64>,
        timestamp: DateTime<Utc>,
    },

    /// Response arrived for superseded inputs and was discarded
    RouteDiscarded {
        request_id: u64,
        timestamp: DateTime<Utc>,
    },

    /// A freshness classification changed without new input
    FreshnessChanged {
        position: Freshness,
        reference: Freshness,
        route: Freshness,
        timestamp: DateTime<Utc>,
    },
}

impl TrackingEvent {
    /// Event type string for the SSE event field
    pub fn event_type(&self) -> &'static str {
        match self {
            TrackingEvent::EngineStarted { .. } => "EngineStarted",
            TrackingEvent::EngineStopped { .. } => "EngineStopped",
            TrackingEvent::PositionUpdated { .. } => "PositionUpdated",
            TrackingEvent::PositionDropped { .. } => "PositionDropped",
            TrackingEvent::PositionFetchFailed { .. } => "PositionFetchFailed",
            TrackingEvent::ReferenceUpdated { .. } => "ReferenceUpdated",
            TrackingEvent::ReferenceNotConfigured { .. } => "ReferenceNotConfigured",
            TrackingEvent::ReferenceDropped { .. } => "ReferenceDropped",
            TrackingEvent::ReferenceFetchFailed { .. } => "ReferenceFetchFailed",
            TrackingEvent::RouteRequested { .. } => "RouteRequested",
            TrackingEvent::RouteCoalesced { .. } => "RouteCoalesced",
            TrackingEvent::RouteReady { .. } => "RouteReady",
            TrackingEvent::RouteFailed { .. } => "RouteFailed",
            TrackingEvent::RouteDiscarded { .. } => "RouteDiscarded",
            TrackingEvent::FreshnessChanged { .. } => "FreshnessChanged",
        }
    }
}
