//! Per-session idle eviction timer.
//!
//! Each live session owns exactly one [`EvictionTimer`]: a spawned task that
//! sleeps until the current deadline and then reports the expiry to the
//! store's reaper over a channel. [`EvictionTimer::reset`] pushes the deadline
//! out by the full idle period; dropping the timer cancels it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::store::SessionId;

/// Identity of one armed timer, distinguishing successive sessions that
/// reuse the same identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// Atomic generator for monotonically increasing [`TimerId`]s.
pub struct TimerIdGenerator {
    next: AtomicU64,
}

impl TimerIdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`TimerId`].
    pub fn next_id(&self) -> TimerId {
        TimerId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TimerIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Notification that a session's idle deadline elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired {
    /// The session whose timer fired.
    pub session: SessionId,
    /// The timer that fired.
    pub timer: TimerId,
}

/// Single-shot, resettable idle timer bound to one session.
pub struct EvictionTimer {
    id: TimerId,
    idle: Duration,
    deadline_tx: watch::Sender<Instant>,
    task: JoinHandle<()>,
}

impl EvictionTimer {
    /// Arm a timer that reports to `expired_tx` once `idle` passes without a
    /// [`reset`](Self::reset).
    pub fn arm(
        session: SessionId,
        id: TimerId,
        idle: Duration,
        expired_tx: mpsc::UnboundedSender<Expired>,
    ) -> Self {
        let (deadline_tx, deadline_rx) = watch::channel(Instant::now() + idle);
        let task = tokio::spawn(Self::run(session, id, deadline_rx, expired_tx));
        Self {
            id,
            idle,
            deadline_tx,
            task,
        }
    }

    /// This timer's identity.
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Rearm for the full idle period from now.
    pub fn reset(&self) {
        // Fails only once the timer has already fired; nothing left to extend.
        let _ = self.deadline_tx.send(Instant::now() + self.idle);
    }

    /// Whether the timer has fired or been cancelled.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    async fn run(
        session: SessionId,
        id: TimerId,
        mut deadline_rx: watch::Receiver<Instant>,
        expired_tx: mpsc::UnboundedSender<Expired>,
    ) {
        loop {
            let deadline = *deadline_rx.borrow_and_update();
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::debug!("Idle deadline elapsed for session {session}");
                    let _ = expired_tx.send(Expired { session, timer: id });
                    return;
                }
                changed = deadline_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

impl Drop for EvictionTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
