//! Tracking data model
//!
//! Entities produced by the pollers and the route synchronizer, and the fused
//! [`SyncSnapshot`] that presentation reads. Every entity is immutable once
//! published: a newer value supersedes it, nothing mutates it in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::geo;

/// Identifier of the tracked subject (the patient id on the care API)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A latitude/longitude pair in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// True when either coordinate differs from `other` by more than `epsilon` degrees
    pub fn differs_from(&self, other: &GeoPoint, epsilon: f64) -> bool {
        (self.latitude - other.latitude).abs() > epsilon
            || (self.longitude - other.longitude).abs() > epsilon
    }
}

/// Raw position sample as returned by a position source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Device report time, when the source provides one
    pub reported_at: Option<DateTime<Utc>>,
}

/// Subject position accepted from the position poller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Engine clock time at which the sample was received; clamped so it
    /// never precedes the previously accepted sample
    pub observed_at: DateTime<Utc>,
    /// Device report time from the source ("Last updated" on the dashboard)
    pub reported_at: Option<DateTime<Utc>>,
    /// Strictly increasing per engine run
    pub sequence: u64,
}

impl Position {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    /// True when `self` precedes `current` by sequence, or by device report
    /// time when both carry one.
    ///
    /// `observed_at` is not an ordering key: it comes from the engine's wall
    /// clock, which may step backwards.
    pub fn is_older_than(&self, current: &Position) -> bool {
        if self.sequence < current.sequence {
            return true;
        }
        matches!(
            (self.reported_at, current.reported_at),
            (Some(new), Some(old)) if new < old
        )
    }
}

/// Raw reference location as returned by a reference source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceFix {
    pub latitude: f64,
    pub longitude: f64,
    pub label: String,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Fixed reference point (home) the subject is compared against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub label: String,
    pub updated_at: DateTime<Utc>,
}

impl ReferenceLocation {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    /// Same coordinates and label, ignoring `updated_at`
    pub fn same_place_as(&self, fix: &ReferenceFix) -> bool {
        self.latitude == fix.latitude && self.longitude == fix.longitude && self.label == fix.label
    }
}

/// Reference stream state
///
/// `NotConfigured` is the caregiver-has-not-set-a-home state. It is a normal
/// snapshot state, not an error.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "location", rename_all = "snake_case")]
pub enum ReferenceState {
    /// No resolve has completed yet
    #[default]
    Unresolved,
    /// Source answered: no reference configured
    NotConfigured,
    Configured(ReferenceLocation),
}

impl ReferenceState {
    pub fn location(&self) -> Option<&ReferenceLocation> {
        match self {
            ReferenceState::Configured(location) => Some(location),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    Pending,
    Ready,
    Failed,
}

/// Route failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteFailureKind {
    /// Transient; retried after the normal backoff
    NetworkError,
    /// Terminal for this input pair; not retried until inputs change
    NoRouteFound,
    /// Retried after the longer rate-limit backoff
    RateLimited,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteFailure {
    pub kind: RouteFailureKind,
    pub message: String,
}

/// Output of a route provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSolution {
    pub path: Vec<GeoPoint>,
    pub distance_meters: f64,
    pub duration_seconds: f64,
}

/// Identities of the inputs a route was computed (or requested) for
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InputStamp {
    pub position_sequence: u64,
    pub origin: GeoPoint,
    pub reference_updated_at: DateTime<Utc>,
}

impl InputStamp {
    pub fn of(position: &Position, reference: &ReferenceLocation) -> Self {
        Self {
            position_sequence: position.sequence,
            origin: position.point(),
            reference_updated_at: reference.updated_at,
        }
    }

    /// Material change: origin moved beyond `epsilon` degrees or reference replaced
    pub fn materially_differs(&self, other: &InputStamp, epsilon: f64) -> bool {
        self.reference_updated_at != other.reference_updated_at
            || self.origin.differs_from(&other.origin, epsilon)
    }
}

/// Route between the subject and the reference
///
/// `for_position`, `for_reference` and `origin` always describe the `path`
/// carried. While `Pending` or `Failed` the last `Ready` path and its stamps
/// are retained for display continuity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub path: Vec<GeoPoint>,
    pub distance_meters: f64,
    pub duration_seconds: f64,
    /// None until a computation has succeeded
    pub computed_at: Option<DateTime<Utc>>,
    pub for_position: u64,
    pub for_reference: DateTime<Utc>,
    pub origin: GeoPoint,
    pub status: RouteStatus,
    pub failure: Option<RouteFailure>,
}

impl Route {
    /// Placeholder for a first request with nothing to display yet
    pub fn pending(stamp: InputStamp) -> Self {
        Self {
            path: Vec::new(),
            distance_meters: 0.0,
            duration_seconds: 0.0,
            computed_at: None,
            for_position: stamp.position_sequence,
            for_reference: stamp.reference_updated_at,
            origin: stamp.origin,
            status: RouteStatus::Pending,
            failure: None,
        }
    }

    pub fn ready(solution: RouteSolution, stamp: InputStamp, computed_at: DateTime<Utc>) -> Self {
        Self {
            path: solution.path,
            distance_meters: solution.distance_meters,
            duration_seconds: solution.duration_seconds,
            computed_at: Some(computed_at),
            for_position: stamp.position_sequence,
            for_reference: stamp.reference_updated_at,
            origin: stamp.origin,
            status: RouteStatus::Ready,
            failure: None,
        }
    }

    pub fn stamp(&self) -> InputStamp {
        InputStamp {
            position_sequence: self.for_position,
            origin: self.origin,
            reference_updated_at: self.for_reference,
        }
    }

    /// True once a computation has succeeded for the carried stamps
    pub fn has_result(&self) -> bool {
        self.computed_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    Stale,
    #[default]
    Unknown,
}

/// Kind of a transient fetch failure on a polled stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    Network,
    Api,
    Parse,
}

/// Last fetch failure on a polled stream, cleared by the next success
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamError {
    pub kind: FetchErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// The fused, externally visible tracking state
///
/// Rebuilt whole on every input event and published atomically.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncSnapshot {
    /// Increases by one per published rebuild
    pub revision: u64,
    pub subject: Option<SubjectId>,
    pub position: Option<Position>,
    pub reference: ReferenceState,
    /// Time of the last successful reference resolve
    pub reference_resolved_at: Option<DateTime<Utc>>,
    pub route: Option<Route>,
    pub position_freshness: Freshness,
    pub reference_freshness: Freshness,
    pub route_freshness: Freshness,
    pub position_error: Option<StreamError>,
    pub reference_error: Option<StreamError>,
    pub built_at: Option<DateTime<Utc>>,
}

impl SyncSnapshot {
    /// Freshness triple, used to detect classification changes
    pub fn freshness(&self) -> (Freshness, Freshness, Freshness) {
        (
            self.position_freshness,
            self.reference_freshness,
            self.route_freshness,
        )
    }

    /// Display summary for the dashboard header and map
    pub fn summary(&self) -> RouteSummary {
        RouteSummary::from_snapshot(self)
    }
}

/// Render-ready values derived from a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSummary {
    /// e.g. "12.3 km", or "—" without a computed route
    pub distance_label: String,
    /// e.g. "15 min", or "—" without a computed route
    pub eta_label: String,
    /// Midpoint of position and reference, else the position
    pub map_center: Option<GeoPoint>,
    /// Great-circle distance when both points are known
    pub straight_line_meters: Option<f64>,
}

const NO_VALUE: &str = "—";

impl RouteSummary {
    pub fn from_snapshot(snapshot: &SyncSnapshot) -> Self {
        let computed = snapshot.route.as_ref().filter(|route| route.has_result());

        let distance_label = computed
            .filter(|route| route.distance_meters > 0.0)
            .map(|route| format!("{:.1} km", route.distance_meters / 1000.0))
            .unwrap_or_else(|| NO_VALUE.to_string());
        let eta_label = computed
            .filter(|route| route.duration_seconds > 0.0)
            .map(|route| format!("{} min", (route.duration_seconds / 60.0).round() as i64))
            .unwrap_or_else(|| NO_VALUE.to_string());

        let position = snapshot.position.as_ref().map(Position::point);
        let reference = snapshot.reference.location().map(ReferenceLocation::point);

        let (map_center, straight_line_meters) = match (position, reference) {
            (Some(p), Some(r)) => (Some(geo::midpoint(p, r)), Some(geo::distance_meters(p, r))),
            (Some(p), None) => (Some(p), None),
            _ => (None, None),
        };

        Self {
            distance_label,
            eta_label,
            map_center,
            straight_line_meters,
        }
    }
}
