//! Reference resolver
//!
//! Resolves the subject's reference (home) location on a slow schedule, and
//! immediately when a refresh is forced. "No reference configured" is an
//! ordinary answer, not an error.

use chrono::{DateTime, Utc};
use homeward_common::model::{ReferenceFix, ReferenceLocation, SubjectId};
use homeward_common::time::Clock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::messages::EngineMessage;
use crate::error::{Error, Result};
use crate::scheduler::{ScheduledTask, Scheduler, Ticker};
use crate::sources::ReferenceSource;

pub struct ReferenceResolver {
    source: Arc<dyn ReferenceSource>,
    clock: Arc<dyn Clock>,
    inbox: mpsc::Sender<EngineMessage>,
    force: Arc<Notify>,
    task: Option<ScheduledTask>,
}

impl ReferenceResolver {
    pub fn new(
        source: Arc<dyn ReferenceSource>,
        clock: Arc<dyn Clock>,
        inbox: mpsc::Sender<EngineMessage>,
    ) -> Self {
        Self {
            source,
            clock,
            inbox,
            force: Arc::new(Notify::new()),
            task: None,
        }
    }

    /// Handle used to request an out-of-schedule resolve
    pub fn refresh_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.force)
    }

    pub fn start(
        &mut self,
        scheduler: &Scheduler,
        subject: SubjectId,
        interval: Duration,
    ) -> Result<()> {
        if self.task.is_some() {
            return Err(Error::InvalidState(
                "reference resolver already running".to_string(),
            ));
        }

        let ticker = scheduler.ticker(interval)?;
        let worker = ResolveWorker {
            source: Arc::clone(&self.source),
            clock: Arc::clone(&self.clock),
            inbox: self.inbox.clone(),
            force: Arc::clone(&self.force),
            subject,
        };

        info!(
            subject = %worker.subject,
            interval_ms = interval.as_millis() as u64,
            "Reference resolver starting"
        );

        self.task = Some(scheduler.spawn("reference-resolver", move |cancel| {
            worker.run(ticker, cancel)
        }));
        Ok(())
    }

    /// Resolve now instead of waiting for the next scheduled tick.
    ///
    /// A request made while a resolve is running is served right after it.
    pub fn force_refresh(&self) {
        self.force.notify_one();
    }

    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.shutdown().await;
            info!("Reference resolver stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

struct ResolveWorker {
    source: Arc<dyn ReferenceSource>,
    clock: Arc<dyn Clock>,
    inbox: mpsc::Sender<EngineMessage>,
    force: Arc<Notify>,
    subject: SubjectId,
}

impl ResolveWorker {
    async fn run(self, mut ticker: Ticker, cancel: CancellationToken) {
        let mut last: Option<ReferenceLocation> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.force.notified() => {
                    debug!("Forced reference refresh");
                }
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.source.fetch_reference(&self.subject) => result,
            };

            let skipped = ticker.skip_missed();
            if skipped > 0 {
                debug!(skipped, "Reference fetch outlasted the poll interval; skipped ticks");
            }

            let message = match result {
                Ok(Some(fix)) => {
                    let location = stamp_reference(fix, last.as_ref(), self.clock.now());
                    last = Some(location.clone());
                    EngineMessage::ReferenceResolved(Some(location))
                }
                Ok(None) => {
                    debug!(subject = %self.subject, "No reference configured");
                    last = None;
                    EngineMessage::ReferenceResolved(None)
                }
                Err(e) => {
                    warn!(subject = %self.subject, "Reference fetch failed: {}", e);
                    EngineMessage::ReferenceFailed(e)
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = self.inbox.send(message) => {
                    if sent.is_err() {
                        debug!("Engine inbox closed; reference resolver exiting");
                        break;
                    }
                }
            }
        }
    }
}

/// Give a fetched reference its `updated_at`.
///
/// A source timestamp wins. Without one, an unchanged place keeps the
/// previous stamp (so re-resolving does not invalidate the route) and a new
/// place is stamped `now`.
pub(crate) fn stamp_reference(
    fix: ReferenceFix,
    previous: Option<&ReferenceLocation>,
    now: DateTime<Utc>,
) -> ReferenceLocation {
    let updated_at = match (fix.updated_at, previous) {
        (Some(updated_at), _) => updated_at,
        (None, Some(prev)) if prev.same_place_as(&fix) => prev.updated_at,
        (None, _) => now,
    };

    ReferenceLocation {
        latitude: fix.latitude,
        longitude: fix.longitude,
        label: fix.label,
        updated_at,
    }
}
