//! Stage timer scheduler
//!
//! One driver task serves every instance's wait and retry timers:
//!
//! ```text
//! schedule()/cancel() ──▶ TimerQueue (mutex) ──notify──▶ driver task
//!                                                          │ sleep_until(next deadline)
//!                                                          ▼
//!                                          TimerFired { handle } ──▶ coordinator
//! ```
//!
//! A fire is only emitted if the handle is still the live one for its
//! instance at pop time. Receivers must still compare the handle against
//! the one they armed, since a cancel can race a fire already in the
//! channel.

mod queue;

pub use queue::{TimerHandle, TimerQueue};

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TimerError;

/// A timer reached its deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub handle: TimerHandle,
    pub fired_at: Instant,
}

/// Receiving side for fired timers
pub type TimerFireReceiver = mpsc::UnboundedReceiver<TimerFired>;

struct Shared {
    queue: Mutex<TimerQueue>,
    wake: Notify,
    fire_tx: mpsc::UnboundedSender<TimerFired>,
    shutdown: CancellationToken,
}

/// Cloneable handle to the scheduler and its driver task
#[derive(Clone)]
pub struct TimerScheduler {
    shared: Arc<Shared>,
}

impl TimerScheduler {
    /// Create a scheduler and spawn its driver on the current runtime
    pub fn start(shutdown: CancellationToken) -> (Self, TimerFireReceiver, JoinHandle<()>) {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(TimerQueue::new()),
                wake: Notify::new(),
                fire_tx,
                shutdown,
            }),
        };
        let driver = tokio::spawn(scheduler.clone().drive());
        (scheduler, fire_rx, driver)
    }

    /// Fire for `instance_id` after `delay`; supersedes its previous timer
    pub fn schedule(&self, instance_id: &str, delay: Duration) -> Result<TimerHandle, TimerError> {
        let deadline = Instant::now()
            .checked_add(delay)
            .ok_or(TimerError::DelayOutOfRange(delay))?;
        self.schedule_at(instance_id, deadline)
    }

    /// Fire for `instance_id` at an absolute deadline
    pub fn schedule_at(
        &self,
        instance_id: &str,
        deadline: Instant,
    ) -> Result<TimerHandle, TimerError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(TimerError::SchedulerStopped);
        }
        let handle = self.queue()?.schedule(instance_id, deadline);
        self.shared.wake.notify_one();
        debug!(timer = %handle, "Timer scheduled");
        Ok(handle)
    }

    /// Idempotent; `false` when the timer already fired or was cancelled
    pub fn cancel(&self, handle: &TimerHandle) -> Result<bool, TimerError> {
        let cancelled = self.queue()?.cancel(handle);
        if cancelled {
            debug!(timer = %handle, "Timer cancelled");
        }
        Ok(cancelled)
    }

    /// Cancel by instance id, whichever handle is live
    pub fn cancel_instance(&self, instance_id: &str) -> Result<bool, TimerError> {
        let cancelled = self.queue()?.cancel_instance(instance_id);
        if cancelled {
            debug!(instance_id, "Instance timer cancelled");
        }
        Ok(cancelled)
    }

    pub fn is_pending(&self, handle: &TimerHandle) -> bool {
        self.queue().map(|q| q.is_pending(handle)).unwrap_or(false)
    }

    /// Number of live timers
    pub fn pending_count(&self) -> usize {
        self.queue().map(|q| q.len()).unwrap_or(0)
    }

    /// Drop every timer, as after a scheduler restart. Instances left
    /// waiting must be re-armed by their owners.
    pub fn reset(&self) -> Result<usize, TimerError> {
        let mut queue = self.queue()?;
        let dropped = queue.len();
        queue.clear();
        warn!(dropped, "Timer queue reset");
        Ok(dropped)
    }

    fn queue(&self) -> Result<MutexGuard<'_, TimerQueue>, TimerError> {
        self.shared.queue.lock().map_err(|_| TimerError::LockPoisoned)
    }

    async fn drive(self) {
        debug!("Timer driver started");
        loop {
            let next = match self.queue() {
                Ok(mut q) => q.next_deadline(),
                Err(e) => {
                    warn!("Timer driver stopping: {}", e);
                    return;
                }
            };

            match next {
                Some(deadline) => {
                    tokio::select! {
                        _ = self.shared.shutdown.cancelled() => break,
                        _ = self.shared.wake.notified() => continue,
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.shared.shutdown.cancelled() => break,
                        _ = self.shared.wake.notified() => continue,
                    }
                }
            }

            let now = Instant::now();
            let fired = match self.queue() {
                Ok(mut q) => q
                    .pop_expired(now)
                    .into_iter()
                    .map(|handle| TimerFired {
                        handle,
                        fired_at: now,
                    })
                    .collect::<Vec<_>>(),
                Err(e) => {
                    warn!("Timer driver stopping: {}", e);
                    return;
                }
            };

            for fire in fired {
                debug!(timer = %fire.handle, "Timer fired");
                if self.shared.fire_tx.send(fire).is_err() {
                    debug!("Timer fire receiver dropped; driver exiting");
                    return;
                }
            }
        }
        debug!("Timer driver stopped");
    }
}
