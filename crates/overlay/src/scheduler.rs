//! Event scheduling for the overlay.
//!
//! Sessions never block: everything that must happen later — the
//! acceptor's HELLO, handshake expiry, loopback deliveries, registry
//! deregistration — is posted here and runs as its own task. The
//! scheduler is a thin seam over the tokio runtime so tests under paused
//! time get deterministic timers.

use std::time::Duration;

use tokio::task::JoinHandle;

/// Posts callbacks onto the runtime, immediately or after a delay.
#[derive(Clone, Debug, Default)]
pub struct Scheduler {
    _private: (),
}

impl Scheduler {
    /// Create a scheduler for the current runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` at the next opportunity.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        tokio::spawn(async move { f() });
    }

    /// Run `f` after `delay`, unless cancelled first.
    pub fn schedule_after<F>(&self, delay: Duration, f: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
        TimerHandle { handle }
    }
}

/// Cancellation handle for a scheduled callback.
#[derive(Debug)]
pub struct TimerHandle {
    handle: JoinHandle<()>,
}

impl TimerHandle {
    /// Cancel the callback. A callback that already ran is unaffected.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn post_runs_soon() {
        let scheduler = Scheduler::new();
        let hits = Arc::new(AtomicU32::new(0));

        let counter = hits.clone();
        scheduler.post(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timers_fire_after_their_delay() {
        let scheduler = Scheduler::new();
        let hits = Arc::new(AtomicU32::new(0));

        let counter = hits.clone();
        let _timer = scheduler.schedule_after(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timers_never_fire() {
        let scheduler = Scheduler::new();
        let hits = Arc::new(AtomicU32::new(0));

        let counter = hits.clone();
        let timer = scheduler.schedule_after(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        timer.cancel();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
