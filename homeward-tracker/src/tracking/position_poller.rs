//! Position poller
//!
//! Fetches the subject's live position once per tick. A tick that falls due
//! while the previous fetch is still running is skipped, so there is never
//! more than one position request in flight. Failures are reported and the
//! schedule continues unchanged; losing one sample is tolerable.

use homeward_common::model::{Position, SubjectId};
use homeward_common::time::Clock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::messages::EngineMessage;
use crate::error::{Error, Result};
use crate::scheduler::{ScheduledTask, Scheduler, Ticker};
use crate::sources::PositionSource;

pub struct PositionPoller {
    source: Arc<dyn PositionSource>,
    clock: Arc<dyn Clock>,
    inbox: mpsc::Sender<EngineMessage>,
    task: Option<ScheduledTask>,
}

impl PositionPoller {
    pub fn new(
        source: Arc<dyn PositionSource>,
        clock: Arc<dyn Clock>,
        inbox: mpsc::Sender<EngineMessage>,
    ) -> Self {
        Self {
            source,
            clock,
            inbox,
            task: None,
        }
    }

    /// Begin polling `subject` every `interval`
    pub fn start(
        &mut self,
        scheduler: &Scheduler,
        subject: SubjectId,
        interval: Duration,
    ) -> Result<()> {
        if self.task.is_some() {
            return Err(Error::InvalidState(
                "position poller already running".to_string(),
            ));
        }

        let ticker = scheduler.ticker(interval)?;
        let source = Arc::clone(&self.source);
        let clock = Arc::clone(&self.clock);
        let inbox = self.inbox.clone();

        info!(
            subject = %subject,
            interval_ms = interval.as_millis() as u64,
            "Position poller starting"
        );

        self.task = Some(scheduler.spawn("position-poller", move |cancel| {
            poll_loop(source, clock, inbox, subject, ticker, cancel)
        }));
        Ok(())
    }

    /// Halt polling; an in-flight fetch is dropped
    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.shutdown().await;
            info!("Position poller stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

async fn poll_loop(
    source: Arc<dyn PositionSource>,
    clock: Arc<dyn Clock>,
    inbox: mpsc::Sender<EngineMessage>,
    subject: SubjectId,
    mut ticker: Ticker,
    cancel: CancellationToken,
) {
    let mut sequence = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = source.fetch_position(&subject) => result,
        };

        let skipped = ticker.skip_missed();
        if skipped > 0 {
            debug!(skipped, "Position fetch outlasted the poll interval; skipped ticks");
        }

        let message = match result {
            Ok(fix) => {
                sequence += 1;
                debug!(
                    sequence,
                    latitude = fix.latitude,
                    longitude = fix.longitude,
                    "Position sample received"
                );
                EngineMessage::PositionReceived(Position {
                    latitude: fix.latitude,
                    longitude: fix.longitude,
                    observed_at: clock.now(),
                    reported_at: fix.reported_at,
                    sequence,
                })
            }
            Err(e) => {
                warn!(subject = %subject, "Position fetch failed: {}", e);
                EngineMessage::PositionFailed(e)
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = inbox.send(message) => {
                if sent.is_err() {
                    debug!("Engine inbox closed; position poller exiting");
                    break;
                }
            }
        }
    }
}
