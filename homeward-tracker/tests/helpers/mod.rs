//! Test helpers for homeward-tracker integration tests
//!
//! Scripted fake capabilities:
//! - FakePositionSource: returns fixes by call index (last one repeats)
//! - FakeReferenceSource: returns the currently configured answer
//! - FakeRouteProvider: scripted results, latency, concurrency tracking
//!
//! All fakes sleep on the tokio clock, so they work under paused time.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use homeward_common::config::EngineConfig;
use homeward_common::model::{
    GeoPoint, Position, PositionFix, ReferenceFix, ReferenceLocation, RouteSolution, SubjectId,
};
use homeward_common::time::{Clock, TokioClock};
use homeward_tracker::error::{FetchError, RouteError};
use homeward_tracker::sources::{PositionSource, ReferenceSource, RouteProvider};
use homeward_tracker::{Sources, TrackingEngine};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

pub fn fix(latitude: f64, longitude: f64) -> PositionFix {
    PositionFix {
        latitude,
        longitude,
        reported_at: None,
    }
}

pub fn home(label: &str, latitude: f64, longitude: f64, updated_at: Option<DateTime<Utc>>) -> ReferenceFix {
    ReferenceFix {
        latitude,
        longitude,
        label: label.to_string(),
        updated_at,
    }
}

pub fn solution(distance_meters: f64) -> RouteSolution {
    RouteSolution {
        path: vec![GeoPoint::new(19.076, 72.8777), GeoPoint::new(18.96, 72.83)],
        distance_meters,
        duration_seconds: distance_meters / 10.0,
    }
}

/// Engine config used by most tests (the production defaults)
pub fn test_config() -> EngineConfig {
    EngineConfig::default()
}

/// Let every ready task run; advances paused time by 1ms
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Advance paused time to `secs` after `origin`
pub async fn advance_to(origin: tokio::time::Instant, secs: f64) {
    tokio::time::sleep_until(origin + Duration::from_secs_f64(secs)).await;
}

// ============================================================================
// Position source
// ============================================================================

pub struct FakePositionSource {
    script: Mutex<Vec<Result<PositionFix, FetchError>>>,
    latency: Mutex<Duration>,
    calls: AtomicUsize,
}

impl FakePositionSource {
    /// Returns `fixes[n]` on call `n`; the last entry repeats
    pub fn scripted(fixes: Vec<Result<PositionFix, FetchError>>) -> Arc<Self> {
        assert!(!fixes.is_empty());
        Arc::new(Self {
            script: Mutex::new(fixes),
            latency: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn fixed(latitude: f64, longitude: f64) -> Arc<Self> {
        Self::scripted(vec![Ok(fix(latitude, longitude))])
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PositionSource for FakePositionSource {
    async fn fetch_position(&self, _subject: &SubjectId) -> Result<PositionFix, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let script = self.script.lock().unwrap();
        script[call.min(script.len() - 1)].clone()
    }
}

// ============================================================================
// Reference source
// ============================================================================

pub struct FakeReferenceSource {
    answer: Mutex<Result<Option<ReferenceFix>, FetchError>>,
    calls: AtomicUsize,
}

impl FakeReferenceSource {
    pub fn new(answer: Result<Option<ReferenceFix>, FetchError>) -> Arc<Self> {
        Arc::new(Self {
            answer: Mutex::new(answer),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn configured(reference: ReferenceFix) -> Arc<Self> {
        Self::new(Ok(Some(reference)))
    }

    pub fn set(&self, answer: Result<Option<ReferenceFix>, FetchError>) {
        *self.answer.lock().unwrap() = answer;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReferenceSource for FakeReferenceSource {
    async fn fetch_reference(&self, _subject: &SubjectId) -> Result<Option<ReferenceFix>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.lock().unwrap().clone()
    }
}

// ============================================================================
// Route provider
// ============================================================================

/// What a route request was computed for
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub from: Position,
    pub to: ReferenceLocation,
}

pub struct FakeRouteProvider {
    script: Mutex<VecDeque<Result<RouteSolution, RouteError>>>,
    latency: Mutex<Duration>,
    requests: Mutex<Vec<RecordedRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeRouteProvider {
    /// Answers from `script` in order, then `Ok(solution(1000.0))`
    pub fn scripted(script: Vec<Result<RouteSolution, RouteError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            latency: Mutex::new(Duration::ZERO),
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::scripted(Vec::new())
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RouteProvider for FakeRouteProvider {
    async fn compute_route(
        &self,
        from: &Position,
        to: &ReferenceLocation,
    ) -> Result<RouteSolution, RouteError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            from: from.clone(),
            to: to.clone(),
        });

        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(solution(1000.0)))
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Paused-time clock whose wall reading can be stepped, like an NTP correction
pub struct SteppingClock {
    inner: TokioClock,
    offset: Mutex<chrono::Duration>,
}

impl SteppingClock {
    pub fn anchored_at(wall: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            inner: TokioClock::anchored_at(wall),
            offset: Mutex::new(chrono::Duration::zero()),
        })
    }

    pub fn step(&self, by: chrono::Duration) {
        *self.offset.lock().unwrap() += by;
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.now() + *self.offset.lock().unwrap()
    }
}

// ============================================================================
// Engine harness
// ============================================================================

pub struct Harness {
    pub engine: Arc<TrackingEngine>,
    pub positions: Arc<FakePositionSource>,
    pub references: Arc<FakeReferenceSource>,
    pub routes: Arc<FakeRouteProvider>,
    pub origin: tokio::time::Instant,
}

impl Harness {
    /// Build an engine over the given fakes; call inside a paused runtime
    pub fn new(
        config: EngineConfig,
        positions: Arc<FakePositionSource>,
        references: Arc<FakeReferenceSource>,
        routes: Arc<FakeRouteProvider>,
    ) -> Self {
        Self::with_clock(
            config,
            positions,
            references,
            routes,
            Arc::new(TokioClock::anchored_at(at(0))),
        )
    }

    pub fn with_clock(
        config: EngineConfig,
        positions: Arc<FakePositionSource>,
        references: Arc<FakeReferenceSource>,
        routes: Arc<FakeRouteProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let sources = Sources::new(positions.clone(), references.clone(), routes.clone());
        let engine = TrackingEngine::new(config, sources, clock).expect("valid config");
        Self {
            engine: Arc::new(engine),
            positions,
            references,
            routes,
            origin: tokio::time::Instant::now(),
        }
    }

    /// Fixed position, configured home, always-succeeding router
    pub fn standard() -> Self {
        Self::new(
            test_config(),
            FakePositionSource::fixed(19.076, 72.8777),
            FakeReferenceSource::configured(home("12 Marine Drive", 18.96, 72.83, Some(at(-3600)))),
            FakeRouteProvider::succeeding(),
        )
    }

    pub async fn start(&self) {
        self.engine
            .start(SubjectId::new("patient-1"))
            .await
            .expect("engine starts");
        settle().await;
    }

    pub async fn at_secs(&self, secs: f64) {
        advance_to(self.origin, secs).await;
    }
}
