//! # Scheduler Adapters
//!
//! - [`TokioScheduler`]: each timer is a spawned task sleeping on the tokio clock.
//! - [`ManualScheduler`]: virtual clock that only moves on [`ManualScheduler::advance`].

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use crate::ports::{Scheduler, TimerHandle, TimerTask};

/// Timers backed by `tokio::time::sleep`.
///
/// Must be used from within a tokio runtime. Honors `tokio::time::pause`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl TokioScheduler {
    /// Create a scheduler.
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        TimerHandle::new(move || join.abort())
    }
}

struct ManualState {
    now: Instant,
    next_id: u64,
    timers: BTreeMap<(Instant, u64), TimerTask>,
}

/// Deterministic scheduler for tests.
///
/// Timers fire synchronously inside [`advance`](Self::advance), in deadline
/// order, with the clock set to each timer's deadline while it runs. Timers
/// armed by a firing task are picked up in the same `advance` if they fall
/// inside the window.
pub struct ManualScheduler {
    state: Arc<Mutex<ManualState>>,
}

impl ManualScheduler {
    /// Create a scheduler whose clock starts at the current tokio instant.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                now: Instant::now(),
                next_id: 0,
                timers: BTreeMap::new(),
            })),
        }
    }

    /// Move the clock forward by `by`, firing every timer that comes due.
    pub fn advance(&self, by: Duration) {
        let target = self.state.lock().now + by;
        loop {
            let due = {
                let mut state = self.state.lock();
                let next = state.timers.keys().next().copied();
                match next {
                    Some(key) if key.0 <= target => {
                        state.now = state.now.max(key.0);
                        state.timers.remove(&key)
                    }
                    _ => {
                        state.now = target;
                        None
                    }
                }
            };
            match due {
                Some(task) => task(),
                None => break,
            }
        }
    }

    /// Number of armed timers.
    pub fn pending(&self) -> usize {
        self.state.lock().timers.len()
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> Instant {
        self.state.lock().now
    }

    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let key = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            let key = (state.now + delay, id);
            state.timers.insert(key, task);
            key
        };
        trace!(delay_ms = delay.as_millis() as u64, id = key.1, "Manual timer armed");

        let weak: Weak<Mutex<ManualState>> = Arc::downgrade(&self.state);
        TimerHandle::new(move || {
            if let Some(state) = weak.upgrade() {
                let removed = state.lock().timers.remove(&key);
                drop(removed);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> TimerTask) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            let c = Arc::clone(&c);
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn test_manual_fires_only_when_due() {
        let scheduler = ManualScheduler::new();
        let (count, task) = counter();
        let handle = scheduler.schedule(Duration::from_secs(5), task());

        scheduler.advance(Duration::from_secs(4));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        scheduler.advance(Duration::from_secs(1));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
        drop(handle);
    }

    #[tokio::test]
    async fn test_manual_cancel_on_drop() {
        let scheduler = ManualScheduler::new();
        let (count, task) = counter();
        drop(scheduler.schedule(Duration::from_secs(1), task()));
        scheduler.advance(Duration::from_secs(2));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_manual_clock_moves() {
        let scheduler = ManualScheduler::new();
        let start = scheduler.now();
        scheduler.advance(Duration::from_millis(250));
        assert_eq!(scheduler.now() - start, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_manual_rearm_inside_window() {
        let scheduler = Arc::new(ManualScheduler::new());
        let (count, _) = counter();
        let s = Arc::clone(&scheduler);
        let c = Arc::clone(&count);
        scheduler
            .schedule(
                Duration::from_secs(1),
                Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                    let c2 = Arc::clone(&c);
                    s.schedule(
                        Duration::from_secs(1),
                        Box::new(move || {
                            c2.fetch_add(1, Ordering::SeqCst);
                        }),
                    )
                    .detach();
                }),
            )
            .detach();

        scheduler.advance(Duration::from_secs(3));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_fires() {
        let scheduler = TokioScheduler::new();
        let (count, task) = counter();
        let _handle = scheduler.schedule(Duration::from_secs(1), task());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_cancel() {
        let scheduler = TokioScheduler::new();
        let (count, task) = counter();
        scheduler.schedule(Duration::from_secs(1), task()).cancel();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
