//! Route synchronizer
//!
//! Decides when a route must be (re)computed and what to do with each
//! response. Pure state machine: the engine event loop feeds it inputs and
//! completions and performs whatever request it hands back.
//!
//! Rules:
//! - a route is requested only with both a position and a reference, and only
//!   when they differ materially from the last attempted pair
//! - at most one request is in flight; triggers during a fetch coalesce and
//!   are re-evaluated once it completes
//! - a response computed for inputs that have since moved is discarded
//! - a transient failure gets exactly one automatic retry after a backoff;
//!   `NoRouteFound` waits for the inputs to change

use chrono::{DateTime, Utc};
use homeward_common::config::EngineConfig;
use homeward_common::model::{
    InputStamp, Position, ReferenceLocation, Route, RouteFailure, RouteFailureKind, RouteSolution,
    RouteStatus,
};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::RouteError;

#[derive(Debug, Clone)]
pub struct RouteSyncConfig {
    pub epsilon: f64,
    pub retry_backoff: Duration,
    pub rate_limited_backoff: Duration,
}

impl From<&EngineConfig> for RouteSyncConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            epsilon: config.route_coordinate_epsilon,
            retry_backoff: config.route_retry_backoff(),
            rate_limited_backoff: config.route_rate_limited_backoff(),
        }
    }
}

/// A route computation the engine must perform
#[derive(Debug, Clone, PartialEq)]
pub struct RouteRequest {
    pub id: u64,
    pub from: Position,
    pub to: ReferenceLocation,
    pub stamp: InputStamp,
    /// True for the automatic retry after a failure
    pub retry: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Nothing to do
    Idle,
    /// A request is already in flight; re-evaluated when it completes
    Coalesced { in_flight: u64 },
    Issue(RouteRequest),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Ready,
    Failed {
        failure: RouteFailure,
        retry_in: Option<Duration>,
    },
    /// Computed for inputs that have since moved
    Discarded,
    /// Not the in-flight request (aborted or already superseded)
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub outcome: Outcome,
    pub follow_up: Trigger,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteSyncStats {
    pub requests_issued: u64,
    pub coalesced_triggers: u64,
    pub discarded_responses: u64,
    pub failures: u64,
    pub retries_scheduled: u64,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    id: u64,
    stamp: InputStamp,
    retry: bool,
}

pub struct RouteSynchronizer {
    config: RouteSyncConfig,
    route: Option<Route>,
    last_attempt: Option<InputStamp>,
    in_flight: Option<InFlight>,
    retry_at: Option<Instant>,
    next_id: u64,
    stats: RouteSyncStats,
}

impl RouteSynchronizer {
    pub fn new(config: RouteSyncConfig) -> Self {
        Self {
            config,
            route: None,
            last_attempt: None,
            in_flight: None,
            retry_at: None,
            next_id: 0,
            stats: RouteSyncStats::default(),
        }
    }

    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    /// When the scheduled retry falls due, if one is pending
    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn stats(&self) -> RouteSyncStats {
        self.stats
    }

    /// Re-evaluate after either input changed
    pub fn evaluate(
        &mut self,
        position: Option<&Position>,
        reference: Option<&ReferenceLocation>,
    ) -> Trigger {
        let (Some(position), Some(reference)) = (position, reference) else {
            return Trigger::Idle;
        };
        let stamp = InputStamp::of(position, reference);

        if let Some(last) = &self.last_attempt {
            if !last.materially_differs(&stamp, self.config.epsilon) {
                return Trigger::Idle;
            }
        }

        if let Some(in_flight) = self.in_flight {
            self.stats.coalesced_triggers += 1;
            return Trigger::Coalesced {
                in_flight: in_flight.id,
            };
        }

        Trigger::Issue(self.issue(position, reference, false))
    }

    /// Apply a provider response.
    ///
    /// `position`/`reference` are the current inputs, used both to detect a
    /// superseded response and to produce the follow-up request.
    pub fn complete(
        &mut self,
        request_id: u64,
        result: Result<RouteSolution, RouteError>,
        position: Option<&Position>,
        reference: Option<&ReferenceLocation>,
        now: Instant,
        wall_now: DateTime<Utc>,
    ) -> Completion {
        let request = match self.in_flight {
            Some(in_flight) if in_flight.id == request_id => in_flight,
            _ => {
                return Completion {
                    outcome: Outcome::Unknown,
                    follow_up: Trigger::Idle,
                }
            }
        };
        self.in_flight = None;

        let superseded = match (position, reference) {
            (Some(p), Some(r)) => InputStamp::of(p, r).materially_differs(&request.stamp, self.config.epsilon),
            _ => true,
        };

        let outcome = if superseded {
            self.stats.discarded_responses += 1;
            Outcome::Discarded
        } else {
            self.apply(request, result, now, wall_now)
        };

        Completion {
            outcome,
            follow_up: self.evaluate(position, reference),
        }
    }

    /// Issue the scheduled retry if it is due and nothing is in flight
    pub fn poll_retry(
        &mut self,
        position: Option<&Position>,
        reference: Option<&ReferenceLocation>,
        now: Instant,
    ) -> Trigger {
        match self.retry_at {
            Some(at) if at <= now => {}
            _ => return Trigger::Idle,
        }
        self.retry_at = None;
        // The in-flight request already covers it
        if self.in_flight.is_some() {
            return Trigger::Idle;
        }

        match (position, reference) {
            (Some(p), Some(r)) => Trigger::Issue(self.issue(p, r, true)),
            _ => Trigger::Idle,
        }
    }

    /// Recompute now even when the inputs are unchanged
    pub fn retry_now(
        &mut self,
        position: Option<&Position>,
        reference: Option<&ReferenceLocation>,
    ) -> Trigger {
        if let Some(in_flight) = self.in_flight {
            return Trigger::Coalesced {
                in_flight: in_flight.id,
            };
        }
        match (position, reference) {
            (Some(p), Some(r)) => Trigger::Issue(self.issue(p, r, false)),
            _ => Trigger::Idle,
        }
    }

    /// Forget the route; used when the reference is no longer configured.
    ///
    /// Returns the id of a request that was in flight, which the caller
    /// should abort.
    pub fn clear(&mut self) -> Option<u64> {
        self.route = None;
        self.last_attempt = None;
        self.retry_at = None;
        self.in_flight.take().map(|f| f.id)
    }

    fn issue(&mut self, position: &Position, reference: &ReferenceLocation, retry: bool) -> RouteRequest {
        self.next_id += 1;
        self.stats.requests_issued += 1;

        let stamp = InputStamp::of(position, reference);
        self.last_attempt = Some(stamp);
        self.retry_at = None;
        self.in_flight = Some(InFlight {
            id: self.next_id,
            stamp,
            retry,
        });

        // Keep the last computed path on screen while the new one is fetched
        self.route = Some(match self.route.take() {
            Some(route) if route.has_result() => Route {
                status: RouteStatus::Pending,
                failure: None,
                ..route
            },
            _ => Route::pending(stamp),
        });

        RouteRequest {
            id: self.next_id,
            from: position.clone(),
            to: reference.clone(),
            stamp,
            retry,
        }
    }

    fn apply(
        &mut self,
        request: InFlight,
        result: Result<RouteSolution, RouteError>,
        now: Instant,
        wall_now: DateTime<Utc>,
    ) -> Outcome {
        let error = match result {
            Ok(solution) => {
                self.retry_at = None;
                self.route = Some(Route::ready(solution, request.stamp, wall_now));
                return Outcome::Ready;
            }
            Err(error) => error,
        };

        self.stats.failures += 1;
        let failure = error.to_failure();

        let retry_in = match failure.kind {
            _ if request.retry => None,
            RouteFailureKind::NetworkError => Some(self.config.retry_backoff),
            RouteFailureKind::RateLimited => Some(self.config.rate_limited_backoff),
            RouteFailureKind::NoRouteFound => None,
        };
        self.retry_at = retry_in.map(|delay| now + delay);
        if retry_in.is_some() {
            self.stats.retries_scheduled += 1;
        }

        let base = match self.route.take() {
            Some(route) if route.has_result() => route,
            _ => Route::pending(request.stamp),
        };
        self.route = Some(Route {
            status: RouteStatus::Failed,
            failure: Some(failure.clone()),
            ..base
        });

        Outcome::Failed { failure, retry_in }
    }
}
