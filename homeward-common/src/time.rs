//! Timestamp utilities and engine clocks

use chrono::{DateTime, Utc};

/// Convert milliseconds to duration
pub fn millis_to_duration(millis: u64) -> std::time::Duration {
    std::time::Duration::from_millis(millis)
}

/// Convert milliseconds to a chrono duration (saturating at i64::MAX)
pub fn millis_to_chrono(millis: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(millis).unwrap_or(i64::MAX))
}

/// Source of "now" for sample stamping and freshness classification
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall time anchored at construction, advanced by the tokio clock.
///
/// Follows `tokio::time::pause()`/`advance()`, so paused-time tests can move
/// sample ages forward together with the engine's timers. Must be created
/// inside a tokio runtime.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    anchor_wall: DateTime<Utc>,
    anchor_instant: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::anchored_at(Utc::now())
    }

    /// Clock reading `wall` right now
    pub fn anchored_at(wall: DateTime<Utc>) -> Self {
        Self {
            anchor_wall: wall,
            anchor_instant: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.anchor_instant.elapsed();
        let elapsed = chrono::Duration::from_std(elapsed).unwrap_or_else(|_| millis_to_chrono(u64::MAX));
        self.anchor_wall + elapsed
    }
}
