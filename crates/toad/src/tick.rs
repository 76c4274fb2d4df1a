//! Fixed-cadence tick scheduling.
//!
//! Ticks are scheduled against absolute deadlines: after each fire the
//! deadline moves forward by exactly one period, and the scheduler sleeps
//! only for what is left of it. Slow handlers therefore do not make the
//! cadence drift. A handler that overruns by more than a whole period makes
//! the scheduler skip the missed slots; it never fires them back to back.

use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// The deadline arithmetic behind the scheduler.
#[derive(Debug, Clone)]
pub struct Cadence {
    period: Duration,
    deadline: Instant,
}

impl Cadence {
    /// Starts a cadence whose first deadline is one period after `start`.
    ///
    /// A zero period is raised to one millisecond.
    pub fn new(period: Duration, start: Instant) -> Self {
        let period = period.max(Duration::from_millis(1));
        Self {
            period,
            deadline: start + period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Moves to the next deadline after a fire that finished at `now`,
    /// skipping every slot that already passed. Returns the number of
    /// skipped slots.
    pub fn advance(&mut self, now: Instant) -> u32 {
        self.deadline += self.period;
        if now <= self.deadline {
            return 0;
        }

        let behind = now - self.deadline;
        let skipped = u32::try_from(behind.as_nanos().div_ceil(self.period.as_nanos()))
            .unwrap_or(u32::MAX);
        self.deadline += self.period.saturating_mul(skipped);
        skipped
    }
}

/// Calls `tick` once per `period` until `shutdown` is cancelled.
pub async fn run<F>(period: Duration, shutdown: CancellationToken, mut tick: F)
where
    F: FnMut(),
{
    let mut cadence = Cadence::new(period, Instant::now());
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            _ = sleep_until(cadence.deadline()) => {}
        }

        tick();

        let skipped = cadence.advance(Instant::now());
        if skipped > 0 {
            tracing::debug!(skipped, period = ?cadence.period(), "tick overran, skipping missed ticks");
        }
    }
}
