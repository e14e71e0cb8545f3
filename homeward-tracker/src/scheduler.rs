//! Periodic ticks and cancellable background tasks
//!
//! Every engine task is spawned through a [`Scheduler`] so a single
//! cancellation token tears the whole run down. [`Ticker`] gives each stream
//! its own period and drops ticks that fall due while that stream's previous
//! fetch is still running.

use std::future::Future;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// How long a cancelled task gets to wind down before it is aborted
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Fixed-period ticker; the first tick fires immediately
#[derive(Debug)]
pub struct Ticker {
    period: Duration,
    next: Instant,
}

impl Ticker {
    pub fn new(period: Duration) -> Result<Self> {
        if period.is_zero() {
            return Err(Error::Scheduler(
                "cannot schedule a periodic tick with a zero period".to_string(),
            ));
        }
        Ok(Self {
            period,
            next: Instant::now(),
        })
    }

    /// Wait for the next tick and return its scheduled time
    pub async fn tick(&mut self) -> Instant {
        sleep_until(self.next).await;
        let fired = self.next;
        self.next += self.period;
        fired
    }

    /// Drop every tick that fell due before now.
    ///
    /// Called after a fetch completes; returns how many ticks were skipped.
    /// A tick due exactly now is kept.
    pub fn skip_missed(&mut self) -> u64 {
        let now = Instant::now();
        let mut skipped = 0;
        while self.next < now {
            self.next += self.period;
            skipped += 1;
        }
        skipped
    }
}

/// Spawns engine tasks on the current tokio runtime under one cancellation token
#[derive(Debug, Clone)]
pub struct Scheduler {
    runtime: Handle,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Fails when called outside a tokio runtime
    pub fn new(cancel: CancellationToken) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Scheduler(format!("no tokio runtime available: {}", e)))?;
        Ok(Self { runtime, cancel })
    }

    /// Periodic ticker for a task spawned by this scheduler
    pub fn ticker(&self, period: Duration) -> Result<Ticker> {
        Ticker::new(period)
    }

    /// Spawn a task that receives its own child cancellation token
    pub fn spawn<F, Fut>(&self, name: &'static str, task: F) -> ScheduledTask
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.child_token();
        let handle = self.runtime.spawn(task(cancel.clone()));
        debug!(task = name, "Task spawned");
        ScheduledTask {
            name,
            cancel,
            handle,
        }
    }
}

/// Handle to a spawned engine task
#[derive(Debug)]
pub struct ScheduledTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel and abort without waiting
    pub fn abort(self) {
        self.cancel.cancel();
        self.handle.abort();
    }

    /// Cancel the task and wait until it has exited.
    ///
    /// Aborts it if it does not exit within [`SHUTDOWN_GRACE`]. Either way the
    /// task is no longer running when this returns.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();

        match timeout(SHUTDOWN_GRACE, &mut self.handle).await {
            Ok(Ok(())) => debug!(task = self.name, "Task stopped"),
            Ok(Err(e)) if e.is_cancelled() => debug!(task = self.name, "Task aborted"),
            Ok(Err(e)) => warn!(task = self.name, "Task panicked: {}", e),
            Err(_) => {
                warn!(
                    task = self.name,
                    grace_ms = SHUTDOWN_GRACE.as_millis() as u64,
                    "Task did not stop within grace period; aborting"
                );
                self.handle.abort();
                let _ = (&mut self.handle).await;
            }
        }
    }
}
