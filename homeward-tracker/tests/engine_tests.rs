//! Tracking engine integration tests
//!
//! Drive a real engine over scripted capabilities with tokio's paused clock,
//! so poll intervals, fetch latencies and backoffs elapse deterministically.

mod helpers;

use helpers::*;
use homeward_common::config::EngineConfig;
use homeward_common::events::TrackingEvent;
use homeward_common::model::{
    FetchErrorKind, Freshness, PositionFix, ReferenceState, RouteFailureKind, RouteStatus,
    SubjectId,
};
use homeward_common::time::SystemClock;
use homeward_tracker::error::{Error, FetchError, RouteError};
use homeward_tracker::{Sources, TrackingEngine};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

fn drain(rx: &mut broadcast::Receiver<TrackingEvent>) -> Vec<TrackingEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn test_route_computed_once_both_inputs_arrive() {
    let h = Harness::standard();
    h.start().await;

    let snapshot = h.engine.snapshot();
    assert_eq!(snapshot.subject, Some(SubjectId::new("patient-1")));
    assert_eq!(snapshot.position.as_ref().map(|p| p.sequence), Some(1));
    assert!(matches!(snapshot.reference, ReferenceState::Configured(ref r) if r.label == "12 Marine Drive"));

    let route = snapshot.route.as_ref().expect("route");
    assert_eq!(route.status, RouteStatus::Ready);
    assert_eq!(route.distance_meters, 1000.0);
    assert_eq!(route.for_position, 1);
    assert_eq!(
        snapshot.freshness(),
        (Freshness::Fresh, Freshness::Fresh, Freshness::Fresh)
    );
    assert_eq!(h.routes.calls(), 1);

    let summary = snapshot.summary();
    assert_eq!(summary.distance_label, "1.0 km");
    assert_eq!(summary.eta_label, "2 min");

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_position_does_not_recompute_route() {
    let h = Harness::standard();
    h.start().await;
    h.at_secs(35.0).await;

    let snapshot = h.engine.snapshot();
    assert_eq!(h.positions.calls(), 4);
    assert_eq!(snapshot.position.as_ref().map(|p| p.sequence), Some(4));
    assert_eq!(h.routes.calls(), 1);

    let route = snapshot.route.as_ref().unwrap();
    assert_eq!(route.for_position, 1);
    assert_eq!(snapshot.route_freshness, Freshness::Fresh);

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_at_most_one_route_request_in_flight() {
    let moving = (0..10)
        .map(|i| Ok(fix(19.0 + 0.01 * i as f64, 72.8)))
        .collect::<Vec<_>>();
    let h = Harness::new(
        test_config(),
        FakePositionSource::scripted(moving),
        FakeReferenceSource::configured(home("Home", 18.96, 72.83, Some(at(-60)))),
        FakeRouteProvider::succeeding(),
    );
    h.routes.set_latency(Duration::from_secs(25));

    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = observed.clone();
    h.engine.subscribe(move |snapshot| {
        if let Some(position) = &snapshot.position {
            sink.lock().unwrap().push(position.observed_at);
        }
    });
    let mut events = h.engine.events();

    h.start().await;
    h.at_secs(130.0).await;

    assert_eq!(h.routes.max_in_flight(), 1);
    assert_eq!(h.routes.calls(), 5);

    let discarded = drain(&mut events)
        .iter()
        .filter(|e| matches!(e, TrackingEvent::RouteDiscarded { .. }))
        .count();
    assert_eq!(discarded, 4);

    let snapshot = h.engine.snapshot();
    let route = snapshot.route.as_ref().unwrap();
    assert_eq!(route.status, RouteStatus::Ready);
    assert!((route.origin.latitude - 19.09).abs() < 1e-9);

    // Published position timestamps never go backwards
    let observed = observed.lock().unwrap();
    assert!(!observed.is_empty());
    assert!(observed.windows(2).all(|w| w[0] <= w[1]));

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_network_error_keeps_ready_route_and_retries_once() {
    let h = Harness::new(
        test_config(),
        FakePositionSource::scripted(vec![Ok(fix(19.0, 72.8)), Ok(fix(19.05, 72.8))]),
        FakeReferenceSource::configured(home("Home", 18.96, 72.83, Some(at(-60)))),
        FakeRouteProvider::scripted(vec![
            Ok(solution(1000.0)),
            Err(RouteError::NetworkError("connection reset".into())),
            Err(RouteError::NetworkError("connection reset".into())),
        ]),
    );
    let mut events = h.engine.events();
    h.start().await;

    h.at_secs(12.0).await;
    let snapshot = h.engine.snapshot();
    let route = snapshot.route.as_ref().unwrap();
    assert_eq!(route.status, RouteStatus::Failed);
    assert_eq!(route.failure.as_ref().map(|f| f.kind), Some(RouteFailureKind::NetworkError));
    assert_eq!(route.distance_meters, 1000.0);
    assert!(!route.path.is_empty());
    assert_eq!(route.for_position, 1);
    assert_eq!(snapshot.summary().distance_label, "1.0 km");
    assert_eq!(h.routes.calls(), 2);

    // Retry 5s after the failure
    h.at_secs(14.0).await;
    assert_eq!(h.routes.calls(), 2);
    h.at_secs(16.0).await;
    assert_eq!(h.routes.calls(), 3);

    // The retry failed too; no further automatic attempts
    h.at_secs(60.0).await;
    assert_eq!(h.routes.calls(), 3);

    let retries: Vec<Option<u64>> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            TrackingEvent::RouteFailed { retry_in_ms, .. } => Some(retry_in_ms),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![Some(5_000), None]);

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_waits_for_longer_backoff() {
    let h = Harness::new(
        test_config(),
        FakePositionSource::fixed(19.0, 72.8),
        FakeReferenceSource::configured(home("Home", 18.96, 72.83, Some(at(-60)))),
        FakeRouteProvider::scripted(vec![Err(RouteError::RateLimited)]),
    );
    h.start().await;

    h.at_secs(29.0).await;
    assert_eq!(h.routes.calls(), 1);
    assert_eq!(
        h.engine.snapshot().route.as_ref().map(|r| r.status),
        Some(RouteStatus::Failed)
    );

    h.at_secs(31.0).await;
    assert_eq!(h.routes.calls(), 2);
    assert_eq!(
        h.engine.snapshot().route.as_ref().map(|r| r.status),
        Some(RouteStatus::Ready)
    );

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_reference_change_discards_pending_route() {
    let h = Harness::new(
        test_config(),
        FakePositionSource::fixed(19.0, 72.8),
        FakeReferenceSource::configured(home("Old flat", 18.96, 72.83, Some(at(-3600)))),
        FakeRouteProvider::succeeding(),
    );
    h.routes.set_latency(Duration::from_secs(20));
    let mut events = h.engine.events();
    h.start().await;
    assert_eq!(h.routes.calls(), 1);

    h.at_secs(5.0).await;
    h.references.set(Ok(Some(home("New house", 19.2, 72.95, Some(at(5))))));
    h.engine.force_refresh_reference().unwrap();
    settle().await;

    let snapshot = h.engine.snapshot();
    assert!(matches!(snapshot.reference, ReferenceState::Configured(ref r) if r.label == "New house"));
    let route = snapshot.route.as_ref().unwrap();
    assert_eq!(route.status, RouteStatus::Pending);
    assert_eq!(snapshot.route_freshness, Freshness::Unknown);

    // First response arrives for the old home and is thrown away
    h.at_secs(30.0).await;
    let snapshot = h.engine.snapshot();
    assert!(!snapshot.route.as_ref().unwrap().has_result());
    assert_eq!(h.routes.calls(), 2);
    assert_eq!(h.routes.requests()[1].to.updated_at, at(5));

    h.at_secs(41.0).await;
    let snapshot = h.engine.snapshot();
    let route = snapshot.route.as_ref().unwrap();
    assert_eq!(route.status, RouteStatus::Ready);
    assert_eq!(route.for_reference, at(5));
    assert_eq!(h.routes.calls(), 2);

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(e, TrackingEvent::RouteCoalesced { .. })));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, TrackingEvent::RouteDiscarded { .. }))
            .count(),
        1
    );

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_position_goes_stale_after_threshold() {
    let config = EngineConfig {
        position_stale_after_ms: 60_000,
        ..test_config()
    };
    let h = Harness::new(
        config,
        FakePositionSource::scripted(vec![
            Ok(fix(19.0, 72.8)),
            Err(FetchError::Network("gateway timeout".into())),
        ]),
        FakeReferenceSource::configured(home("Home", 18.96, 72.83, Some(at(-60)))),
        FakeRouteProvider::succeeding(),
    );
    h.start().await;

    h.at_secs(60.5).await;
    let snapshot = h.engine.snapshot();
    assert_eq!(snapshot.position_freshness, Freshness::Fresh);
    assert_eq!(
        snapshot.position_error.as_ref().map(|e| e.kind),
        Some(FetchErrorKind::Network)
    );

    h.at_secs(61.5).await;
    let snapshot = h.engine.snapshot();
    assert_eq!(snapshot.position_freshness, Freshness::Stale);
    // The last known position is still shown
    assert_eq!(snapshot.position.as_ref().map(|p| p.sequence), Some(1));
    assert_eq!(snapshot.route_freshness, Freshness::Fresh);

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_older_position_leaves_snapshot_unchanged() {
    let newer = PositionFix {
        reported_at: Some(at(100)),
        ..fix(19.0, 72.8)
    };
    let older = PositionFix {
        reported_at: Some(at(50)),
        ..fix(19.5, 72.8)
    };
    let h = Harness::new(
        test_config(),
        FakePositionSource::scripted(vec![Ok(newer), Ok(older)]),
        FakeReferenceSource::configured(home("Home", 18.96, 72.83, Some(at(-60)))),
        FakeRouteProvider::succeeding(),
    );
    let mut events = h.engine.events();
    h.start().await;

    h.at_secs(5.0).await;
    let before = h.engine.snapshot();

    h.at_secs(12.0).await;
    let after = h.engine.snapshot();
    assert_eq!(after.revision, before.revision);
    assert_eq!(after.position, before.position);
    assert_eq!(h.routes.calls(), 1);

    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        TrackingEvent::PositionDropped {
            sequence: 2,
            current_sequence: 1,
            ..
        }
    )));

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_not_configured_reference_clears_route() {
    let h = Harness::standard();
    h.start().await;
    assert!(h.engine.snapshot().route.is_some());

    h.references.set(Ok(None));
    h.engine.force_refresh_reference().unwrap();
    settle().await;

    let snapshot = h.engine.snapshot();
    assert_eq!(snapshot.reference, ReferenceState::NotConfigured);
    assert!(snapshot.route.is_none());
    assert_eq!(snapshot.reference_freshness, Freshness::Unknown);
    assert_eq!(snapshot.route_freshness, Freshness::Unknown);
    assert!(snapshot.reference_error.is_none());

    let summary = snapshot.summary();
    assert_eq!(summary.distance_label, "—");
    assert!(summary.map_center.is_some());

    h.at_secs(30.0).await;
    assert_eq!(h.routes.calls(), 1);

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_home_never_configured() {
    let h = Harness::new(
        test_config(),
        FakePositionSource::fixed(19.0, 72.8),
        FakeReferenceSource::new(Ok(None)),
        FakeRouteProvider::succeeding(),
    );
    h.start().await;
    h.at_secs(30.0).await;

    let snapshot = h.engine.snapshot();
    assert_eq!(snapshot.reference, ReferenceState::NotConfigured);
    assert!(snapshot.route.is_none());
    assert_eq!(snapshot.position_freshness, Freshness::Fresh);
    assert_eq!(h.routes.calls(), 0);

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_reference_failure_keeps_prior_value() {
    let h = Harness::standard();
    h.start().await;

    h.references
        .set(Err(FetchError::Api(500, "Internal Server Error".into())));
    h.engine.force_refresh_reference().unwrap();
    settle().await;

    let snapshot = h.engine.snapshot();
    assert!(matches!(snapshot.reference, ReferenceState::Configured(_)));
    assert_eq!(
        snapshot.reference_error.as_ref().map(|e| e.kind),
        Some(FetchErrorKind::Api)
    );
    assert_eq!(snapshot.route.as_ref().map(|r| r.status), Some(RouteStatus::Ready));
    assert_eq!(h.references.calls(), 2);

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_position_failures_do_not_stop_polling() {
    let h = Harness::new(
        test_config(),
        FakePositionSource::scripted(vec![Err(FetchError::Network("unreachable".into()))]),
        FakeReferenceSource::configured(home("Home", 18.96, 72.83, None)),
        FakeRouteProvider::succeeding(),
    );
    h.start().await;
    h.at_secs(35.0).await;

    assert!(h.engine.is_running());
    assert_eq!(h.positions.calls(), 4);

    let snapshot = h.engine.snapshot();
    assert!(snapshot.position.is_none());
    assert_eq!(snapshot.position_freshness, Freshness::Unknown);
    assert_eq!(
        snapshot.position_error.as_ref().map(|e| e.kind),
        Some(FetchErrorKind::Network)
    );
    assert_eq!(h.routes.calls(), 0);

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_position_fetch_skips_overlapping_ticks() {
    let h = Harness::standard();
    h.positions.set_latency(Duration::from_secs(25));
    h.start().await;

    h.at_secs(59.0).await;
    // Fetches at 0s and 30s; the 10s and 20s ticks fell due mid-fetch
    assert_eq!(h.positions.calls(), 2);
    assert_eq!(
        h.engine.snapshot().position.as_ref().map(|p| p.sequence),
        Some(2)
    );

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_route_now_recomputes_unchanged_inputs() {
    let h = Harness::standard();
    h.start().await;
    assert_eq!(h.routes.calls(), 1);

    h.engine.retry_route_now().unwrap();
    settle().await;

    assert_eq!(h.routes.calls(), 2);
    assert_eq!(
        h.engine.snapshot().route.as_ref().map(|r| r.status),
        Some(RouteStatus::Ready)
    );

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_callbacks_after_stop() {
    let h = Harness::standard();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    h.engine.subscribe(move |_snapshot| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let mut events = h.engine.events();

    h.start().await;
    h.at_secs(25.0).await;
    assert!(calls.load(Ordering::SeqCst) > 0);

    h.engine.stop().await;
    let after_stop = calls.load(Ordering::SeqCst);
    let polls_after_stop = h.positions.calls();

    h.at_secs(120.0).await;
    assert_eq!(calls.load(Ordering::SeqCst), after_stop);
    assert_eq!(h.positions.calls(), polls_after_stop);

    assert!(!h.engine.is_running());
    assert!(matches!(h.engine.force_refresh_reference(), Err(Error::InvalidState(_))));
    assert!(matches!(h.engine.retry_route_now(), Err(Error::InvalidState(_))));

    // Last snapshot stays readable
    assert!(h.engine.snapshot().route.is_some());

    let events = drain(&mut events);
    assert!(matches!(events.first(), Some(TrackingEvent::EngineStarted { .. })));
    assert!(matches!(events.last(), Some(TrackingEvent::EngineStopped { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_engine_stops_polling() {
    let h = Harness::standard();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    h.engine.subscribe(move |_snapshot| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    h.start().await;
    h.at_secs(15.0).await;

    let Harness {
        engine,
        positions,
        references,
        origin,
        ..
    } = h;
    drop(engine);
    settle().await;

    let polls = positions.calls();
    let resolves = references.calls();
    let callbacks = calls.load(Ordering::SeqCst);

    advance_to(origin, 120.0).await;
    assert_eq!(positions.calls(), polls);
    assert_eq!(references.calls(), resolves);
    assert_eq!(calls.load(Ordering::SeqCst), callbacks);
}

#[tokio::test(start_paused = true)]
async fn test_wall_clock_step_back_does_not_freeze_position() {
    let moving = (0..6)
        .map(|i| Ok(fix(19.0 + 0.01 * i as f64, 72.8)))
        .collect::<Vec<_>>();
    let clock = SteppingClock::anchored_at(at(0));
    let h = Harness::with_clock(
        test_config(),
        FakePositionSource::scripted(moving),
        FakeReferenceSource::configured(home("Home", 18.96, 72.83, Some(at(-60)))),
        FakeRouteProvider::succeeding(),
        clock.clone(),
    );
    h.start().await;
    h.at_secs(5.0).await;
    let before = h.engine.snapshot().position.clone().unwrap();

    clock.step(chrono::Duration::hours(-1));
    h.at_secs(35.0).await;

    let snapshot = h.engine.snapshot();
    let position = snapshot.position.as_ref().unwrap();
    assert_eq!(position.sequence, 4);
    assert!((position.latitude - 19.03).abs() < 1e-9);
    assert!(position.observed_at >= before.observed_at);
    assert_eq!(snapshot.position_freshness, Freshness::Fresh);
    assert_eq!(
        snapshot.route.as_ref().map(|r| r.for_position),
        Some(4)
    );

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribed_callback_not_invoked() {
    let h = Harness::standard();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let id = h.engine.subscribe(move |_snapshot| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert!(h.engine.unsubscribe(id));

    h.start().await;
    h.at_secs(15.0).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_double_start_rejected_and_restart_allowed() {
    let h = Harness::standard();
    h.start().await;

    let second = h.engine.start(SubjectId::new("patient-1")).await;
    assert!(matches!(second, Err(Error::InvalidState(_))));

    h.engine.stop().await;
    h.engine.stop().await;

    h.engine.start(SubjectId::new("patient-2")).await.unwrap();
    settle().await;
    let snapshot = h.engine.snapshot();
    assert_eq!(snapshot.subject, Some(SubjectId::new("patient-2")));
    assert_eq!(snapshot.position.as_ref().map(|p| p.sequence), Some(1));

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_engines_run_independently() {
    let a = Harness::standard();
    let b = Harness::new(
        test_config(),
        FakePositionSource::fixed(28.61, 77.2),
        FakeReferenceSource::configured(home("Delhi", 28.7, 77.1, Some(at(0)))),
        FakeRouteProvider::scripted(vec![Ok(solution(4200.0))]),
    );
    a.start().await;
    b.start().await;

    assert_eq!(a.engine.snapshot().route.as_ref().unwrap().distance_meters, 1000.0);
    assert_eq!(b.engine.snapshot().route.as_ref().unwrap().distance_meters, 4200.0);

    a.engine.stop().await;
    assert!(b.engine.is_running());
    b.engine.stop().await;
}

#[test]
fn test_invalid_config_rejected() {
    let config = EngineConfig {
        freshness_check_interval_ms: 0,
        ..EngineConfig::default()
    };
    let sources = Sources::new(
        FakePositionSource::fixed(0.0, 0.0),
        FakeReferenceSource::new(Ok(None)),
        FakeRouteProvider::succeeding(),
    );
    let result = TrackingEngine::new(config, sources, Arc::new(SystemClock));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_start_outside_runtime_fails() {
    let sources = Sources::new(
        FakePositionSource::fixed(0.0, 0.0),
        FakeReferenceSource::new(Ok(None)),
        FakeRouteProvider::succeeding(),
    );
    let engine = TrackingEngine::new(EngineConfig::default(), sources, Arc::new(SystemClock)).unwrap();

    let result = futures::executor::block_on(engine.start(SubjectId::new("patient-1")));
    assert!(matches!(result, Err(Error::Scheduler(_))));
    assert!(!engine.is_running());
}
