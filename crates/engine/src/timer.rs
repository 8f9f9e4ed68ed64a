//! The per-session countdown task.
//!
//! Remaining time comes from [`tandem_core::timer::remaining_seconds`] on
//! every tick, so the task holds no counter of its own. It reports
//! [`TimerEvent::Expired`] exactly once and then exits.

use std::sync::Arc;
use std::time::Duration;

use tandem_core::clock::Clock;
use tandem_core::timer::remaining_seconds;
use tandem_core::types::Timestamp;
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Tick { remaining_seconds: u32 },
    Expired,
}

/// Handle used to force an immediate recompute after suspension.
#[derive(Clone)]
pub struct TimerHandle {
    resume: Arc<Notify>,
}

impl TimerHandle {
    pub fn resume(&self) {
        self.resume.notify_one();
    }
}

pub struct SessionTimer {
    clock: Arc<dyn Clock>,
    started_at: Timestamp,
    duration_minutes: u32,
}

impl SessionTimer {
    pub fn new(clock: Arc<dyn Clock>, started_at: Timestamp, duration_minutes: u32) -> Self {
        Self {
            clock,
            started_at,
            duration_minutes,
        }
    }

    pub fn remaining(&self) -> u32 {
        remaining_seconds(self.started_at, self.duration_minutes, self.clock.now())
    }

    /// Build the ticking future. The first tick fires immediately.
    pub fn run(
        self,
        events: mpsc::UnboundedSender<TimerEvent>,
        cancel: CancellationToken,
    ) -> (TimerHandle, impl std::future::Future<Output = ()> + Send + 'static) {
        let resume = Arc::new(Notify::new());
        let handle = TimerHandle {
            resume: resume.clone(),
        };

        let task = async move {
            let mut interval = tokio::time::interval(TICK);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                    _ = resume.notified() => {
                        interval.reset();
                    }
                }

                let remaining = self.remaining();
                if events
                    .send(TimerEvent::Tick {
                        remaining_seconds: remaining,
                    })
                    .is_err()
                {
                    break;
                }
                if remaining == 0 {
                    let _ = events.send(TimerEvent::Expired);
                    break;
                }
            }
        };

        (handle, task)
    }
}
