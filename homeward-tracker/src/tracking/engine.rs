//! Tracking engine
//!
//! [`TrackingEngine`] is the public facade: construct it with a config and the
//! three capabilities, `start()` it for a subject, read snapshots or subscribe,
//! then `stop()` it. Several engines may run side by side; each owns its own
//! tasks and state.
//!
//! One event-loop task per run owns [`FusionState`] and the
//! [`RouteSynchronizer`]. Pollers and route fetch tasks only send messages to
//! its inbox, so every snapshot is built from a single consistent state.

use homeward_common::config::EngineConfig;
use homeward_common::events::TrackingEvent;
use homeward_common::model::{Freshness, SubjectId, SyncSnapshot};
use homeward_common::time::Clock;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::fusion::{
    FreshnessPolicy, FusionState, PositionUpdate, ReferenceUpdate, SnapshotCallback,
    SnapshotPublisher, SubscriptionId,
};
use super::messages::{EngineMessage, INBOX_CAPACITY};
use super::position_poller::PositionPoller;
use super::reference_resolver::ReferenceResolver;
use super::route_sync::{Outcome, RouteRequest, RouteSyncConfig, RouteSynchronizer, Trigger};
use crate::error::{Error, Result};
use crate::scheduler::{ScheduledTask, Scheduler, Ticker};
use crate::sources::{RouteProvider, Sources};

/// Handles for one engine run
struct RunningEngine {
    run_id: Uuid,
    cancel: CancellationToken,
    positions: PositionPoller,
    references: ReferenceResolver,
    event_loop: ScheduledTask,
}

/// Synchronous entry points into a running engine
#[derive(Clone)]
struct EngineControl {
    inbox: mpsc::Sender<EngineMessage>,
    refresh: Arc<Notify>,
}

pub struct TrackingEngine {
    config: EngineConfig,
    sources: Sources,
    clock: Arc<dyn Clock>,
    publisher: Arc<SnapshotPublisher>,
    running: tokio::sync::Mutex<Option<RunningEngine>>,
    control: Mutex<Option<EngineControl>>,
}

impl TrackingEngine {
    /// Fails when the config does not validate
    pub fn new(config: EngineConfig, sources: Sources, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            sources,
            clock,
            publisher: Arc::new(SnapshotPublisher::new()),
            running: tokio::sync::Mutex::new(None),
            control: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start tracking `subject`.
    ///
    /// Publishes an empty snapshot, then begins polling both streams.
    /// Fails with `Error::InvalidState` when already running and with
    /// `Error::Scheduler` outside a tokio runtime.
    pub async fn start(&self, subject: SubjectId) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::InvalidState("engine already running".to_string()));
        }

        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(cancel.clone())?;
        let freshness = scheduler.ticker(self.config.freshness_check_interval())?;
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);

        let mut fusion = FusionState::new(FreshnessPolicy::from(&self.config), Some(subject.clone()));
        let initial = fusion.build(None, self.clock.now());
        let initial_freshness = initial.freshness();
        self.publisher.publish(initial);

        let core = EngineCore {
            fusion,
            routes: RouteSynchronizer::new(RouteSyncConfig::from(&self.config)),
            publisher: Arc::clone(&self.publisher),
            provider: Arc::clone(&self.sources.routes),
            clock: Arc::clone(&self.clock),
            scheduler: scheduler.clone(),
            inbox: inbox_tx.clone(),
            route_task: None,
            last_freshness: initial_freshness,
        };
        let event_loop = scheduler.spawn("engine-event-loop", move |cancel| {
            core.run(inbox_rx, freshness, cancel)
        });

        let run_id = Uuid::new_v4();
        self.publisher.emit(TrackingEvent::EngineStarted {
            run_id,
            subject: subject.clone(),
            timestamp: self.clock.now(),
        });

        let mut positions = PositionPoller::new(
            Arc::clone(&self.sources.position),
            Arc::clone(&self.clock),
            inbox_tx.clone(),
        );
        let mut references = ReferenceResolver::new(
            Arc::clone(&self.sources.reference),
            Arc::clone(&self.clock),
            inbox_tx.clone(),
        );

        let started = positions
            .start(&scheduler, subject.clone(), self.config.position_poll_interval())
            .and_then(|()| {
                references.start(&scheduler, subject.clone(), self.config.reference_poll_interval())
            });
        if let Err(e) = started {
            error!(subject = %subject, "Failed to start tracking: {}", e);
            cancel.cancel();
            positions.stop().await;
            references.stop().await;
            event_loop.shutdown().await;
            self.publisher.emit(TrackingEvent::EngineStopped {
                run_id,
                timestamp: self.clock.now(),
            });
            return Err(e);
        }

        *self.lock_control() = Some(EngineControl {
            inbox: inbox_tx,
            refresh: references.refresh_handle(),
        });

        info!(run_id = %run_id, subject = %subject, "Tracking engine started");

        *running = Some(RunningEngine {
            run_id,
            cancel,
            positions,
            references,
            event_loop,
        });
        Ok(())
    }

    /// Stop all timers and tasks. No subscriber callback fires after this
    /// returns. Stopping an idle engine is a no-op.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(mut run) = running.take() else {
            return;
        };
        *self.lock_control() = None;

        run.cancel.cancel();
        run.positions.stop().await;
        run.references.stop().await;
        run.event_loop.shutdown().await;

        info!(run_id = %run.run_id, "Tracking engine stopped");
        self.publisher.emit(TrackingEvent::EngineStopped {
            run_id: run.run_id,
            timestamp: self.clock.now(),
        });
    }

    pub fn is_running(&self) -> bool {
        self.lock_control().is_some()
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<SyncSnapshot> {
        self.publisher.current()
    }

    pub fn watch(&self) -> watch::Receiver<Arc<SyncSnapshot>> {
        self.publisher.watch()
    }

    pub fn events(&self) -> broadcast::Receiver<TrackingEvent> {
        self.publisher.events()
    }

    /// Register a callback invoked with every published snapshot
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Arc<SyncSnapshot>) + Send + Sync + 'static,
    {
        let callback: SnapshotCallback = Arc::new(callback);
        self.publisher.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.publisher.unsubscribe(id)
    }

    /// Re-resolve the reference now
    pub fn force_refresh_reference(&self) -> Result<()> {
        let control = self.control()?;
        control.refresh.notify_one();
        Ok(())
    }

    /// Recompute the route now, even if the inputs did not change
    pub fn retry_route_now(&self) -> Result<()> {
        let control = self.control()?;
        control
            .inbox
            .try_send(EngineMessage::RetryRouteNow)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    Error::Internal("engine inbox is full; retry not queued".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    Error::InvalidState("engine is not running".to_string())
                }
            })
    }

    fn control(&self) -> Result<EngineControl> {
        self.lock_control()
            .clone()
            .ok_or_else(|| Error::InvalidState("engine is not running".to_string()))
    }

    fn lock_control(&self) -> MutexGuard<'_, Option<EngineControl>> {
        self.control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for TrackingEngine {
    /// Tear down a run that was never stopped. Tasks exit on their next
    /// cancellation check; nothing waits for them here.
    fn drop(&mut self) {
        if let Some(run) = self.running.get_mut().take() {
            debug!(run_id = %run.run_id, "Tracking engine dropped while running; cancelling");
            run.cancel.cancel();
        }
    }
}

/// State owned by the event-loop task
struct EngineCore {
    fusion: FusionState,
    routes: RouteSynchronizer,
    publisher: Arc<SnapshotPublisher>,
    provider: Arc<dyn RouteProvider>,
    clock: Arc<dyn Clock>,
    scheduler: Scheduler,
    /// Route fetch tasks report back through this
    inbox: mpsc::Sender<EngineMessage>,
    route_task: Option<(u64, ScheduledTask)>,
    last_freshness: (Freshness, Freshness, Freshness),
}

impl EngineCore {
    async fn run(
        mut self,
        mut inbox: mpsc::Receiver<EngineMessage>,
        mut freshness: Ticker,
        cancel: CancellationToken,
    ) {
        debug!("Engine event loop started");

        loop {
            let retry_at = self.routes.retry_deadline();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = inbox.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.on_retry_due();
                }
                _ = freshness.tick() => self.sweep_freshness(),
            }
        }

        if let Some((id, task)) = self.route_task.take() {
            debug!(request_id = id, "Aborting in-flight route fetch");
            task.abort();
        }

        let stats = self.routes.stats();
        info!(
            requests_issued = stats.requests_issued,
            coalesced_triggers = stats.coalesced_triggers,
            discarded_responses = stats.discarded_responses,
            failures = stats.failures,
            retries_scheduled = stats.retries_scheduled,
            "Engine event loop exiting"
        );
    }

    fn handle(&mut self, message: EngineMessage) {
        let now = self.clock.now();

        match message {
            EngineMessage::PositionReceived(position) => {
                let sequence = position.sequence;
                let (latitude, longitude) = (position.latitude, position.longitude);
                match self.fusion.apply_position(position) {
                    PositionUpdate::Accepted => {
                        self.publisher.emit(TrackingEvent::PositionUpdated {
                            sequence,
                            latitude,
                            longitude,
                            timestamp: now,
                        });
                        let trigger = self
                            .routes
                            .evaluate(self.fusion.position(), self.fusion.reference());
                        self.dispatch(trigger);
                        self.publish();
                    }
                    PositionUpdate::Dropped { current_sequence } => {
                        warn!(sequence, current_sequence, "Dropping out-of-order position");
                        self.publisher.emit(TrackingEvent::PositionDropped {
                            sequence,
                            current_sequence,
                            timestamp: now,
                        });
                    }
                }
            }

            EngineMessage::PositionFailed(e) => {
                self.fusion.record_position_error(&e, now);
                self.publisher.emit(TrackingEvent::PositionFetchFailed {
                    kind: e.kind(),
                    message: e.to_string(),
                    timestamp: now,
                });
                self.publish();
            }

            EngineMessage::ReferenceResolved(reference) => {
                let summary = reference.as_ref().map(|r| (r.label.clone(), r.updated_at));
                match self.fusion.apply_reference(reference, now) {
                    ReferenceUpdate::Updated { changed } => {
                        if let (true, Some((label, updated_at))) = (changed, summary) {
                            info!(label = %label, updated_at = %updated_at, "Reference location updated");
                            self.publisher.emit(TrackingEvent::ReferenceUpdated {
                                label,
                                updated_at,
                                timestamp: now,
                            });
                        }
                        let trigger = self
                            .routes
                            .evaluate(self.fusion.position(), self.fusion.reference());
                        self.dispatch(trigger);
                        self.publish();
                    }
                    ReferenceUpdate::NotConfigured { changed } => {
                        if changed {
                            info!("No reference location configured for subject");
                            self.publisher
                                .emit(TrackingEvent::ReferenceNotConfigured { timestamp: now });
                        }
                        if let Some(id) = self.routes.clear() {
                            self.abort_route_task(id);
                        }
                        self.publish();
                    }
                    ReferenceUpdate::Dropped => {
                        if let Some((_, updated_at)) = summary {
                            warn!(updated_at = %updated_at, "Dropping reference older than the held one");
                            self.publisher.emit(TrackingEvent::ReferenceDropped {
                                updated_at,
                                timestamp: now,
                            });
                        }
                    }
                }
            }

            EngineMessage::ReferenceFailed(e) => {
                self.fusion.record_reference_error(&e, now);
                self.publisher.emit(TrackingEvent::ReferenceFetchFailed {
                    kind: e.kind(),
                    message: e.to_string(),
                    timestamp: now,
                });
                self.publish();
            }

            EngineMessage::RouteCompleted { request_id, result } => {
                if matches!(&self.route_task, Some((id, _)) if *id == request_id) {
                    self.route_task = None;
                }

                let completion = self.routes.complete(
                    request_id,
                    result,
                    self.fusion.position(),
                    self.fusion.reference(),
                    Instant::now(),
                    now,
                );

                match completion.outcome {
                    Outcome::Ready => {
                        if let Some(route) = self.routes.route() {
                            info!(
                                request_id,
                                distance_meters = route.distance_meters,
                                duration_seconds = route.duration_seconds,
                                "Route ready"
                            );
                            self.publisher.emit(TrackingEvent::RouteReady {
                                request_id,
                                distance_meters: route.distance_meters,
                                duration_seconds: route.duration_seconds,
                                timestamp: now,
                            });
                        }
                    }
                    Outcome::Failed { failure, retry_in } => {
                        warn!(
                            request_id,
                            kind = ?failure.kind,
                            retry_in_ms = retry_in.map(|d| d.as_millis() as u64),
                            "Route computation failed: {}",
                            failure.message
                        );
                        self.publisher.emit(TrackingEvent::RouteFailed {
                            request_id,
                            kind: failure.kind,
                            message: failure.message,
                            retry_in_ms: retry_in.map(|d| d.as_millis() as u64),
                            timestamp: now,
                        });
                    }
                    Outcome::Discarded => {
                        warn!(request_id, "Discarding route computed for superseded inputs");
                        self.publisher.emit(TrackingEvent::RouteDiscarded {
                            request_id,
                            timestamp: now,
                        });
                    }
                    Outcome::Unknown => {
                        debug!(request_id, "Ignoring response for a request no longer in flight");
                        return;
                    }
                }

                self.dispatch(completion.follow_up);
                self.publish();
            }

            EngineMessage::RetryRouteNow => {
                let trigger = self
                    .routes
                    .retry_now(self.fusion.position(), self.fusion.reference());
                let issued = matches!(trigger, Trigger::Issue(_));
                if matches!(trigger, Trigger::Idle) {
                    debug!("Route retry requested without both inputs; ignored");
                }
                self.dispatch(trigger);
                if issued {
                    self.publish();
                }
            }
        }
    }

    fn on_retry_due(&mut self) {
        let trigger = self.routes.poll_retry(
            self.fusion.position(),
            self.fusion.reference(),
            Instant::now(),
        );
        if matches!(trigger, Trigger::Issue(_)) {
            self.dispatch(trigger);
            self.publish();
        }
    }

    fn sweep_freshness(&mut self) {
        let now = self.clock.now();
        let current = self.fusion.classify(self.routes.route(), now);
        if current == self.last_freshness {
            return;
        }

        let (position, reference, route) = current;
        debug!(?position, ?reference, ?route, "Freshness changed");
        self.publisher.emit(TrackingEvent::FreshnessChanged {
            position,
            reference,
            route,
            timestamp: now,
        });
        self.publish();
    }

    fn dispatch(&mut self, trigger: Trigger) {
        match trigger {
            Trigger::Idle => {}
            Trigger::Coalesced { in_flight } => {
                debug!(in_flight, "Route trigger coalesced into in-flight request");
                self.publisher.emit(TrackingEvent::RouteCoalesced {
                    in_flight_request_id: in_flight,
                    timestamp: self.clock.now(),
                });
            }
            Trigger::Issue(request) => self.spawn_fetch(request),
        }
    }

    fn spawn_fetch(&mut self, request: RouteRequest) {
        info!(
            request_id = request.id,
            for_position = request.stamp.position_sequence,
            retry = request.retry,
            "Requesting route"
        );
        self.publisher.emit(TrackingEvent::RouteRequested {
            request_id: request.id,
            for_position: request.stamp.position_sequence,
            for_reference: request.stamp.reference_updated_at,
            retry: request.retry,
            timestamp: self.clock.now(),
        });

        let provider = Arc::clone(&self.provider);
        let inbox = self.inbox.clone();
        let request_id = request.id;
        let task = self.scheduler.spawn("route-fetch", move |cancel| async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = provider.compute_route(&request.from, &request.to) => result,
            };
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = inbox.send(EngineMessage::RouteCompleted { request_id, result }) => {}
            }
        });

        // The synchronizer never issues while a request is in flight
        if let Some((stale_id, stale)) = self.route_task.replace((request_id, task)) {
            debug!(request_id = stale_id, "Replacing finished route fetch handle");
            stale.abort();
        }
    }

    fn abort_route_task(&mut self, request_id: u64) {
        if let Some((id, task)) = self.route_task.take() {
            if id == request_id {
                debug!(request_id, "Aborting route fetch for cleared route");
                task.abort();
            } else {
                self.route_task = Some((id, task));
            }
        }
    }

    fn publish(&mut self) {
        let snapshot = self.fusion.build(self.routes.route(), self.clock.now());
        self.last_freshness = snapshot.freshness();
        self.publisher.publish(snapshot);
    }
}
