//! Turns process exits into a stable "turn finished" signal.
//!
//! The CLI may exit and be respawned within a few milliseconds (resume after a
//! tool call, a queued follow-up message). Reporting every exit would make the
//! client flicker between busy and idle, so an exit only schedules an idle
//! notification that fires if nothing else happens for the debounce delay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

/// One pending idle notification per session.
pub struct StreamingDebouncer {
    delay: Duration,
    epoch: AtomicU64,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingDebouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            epoch: AtomicU64::new(0),
            timer: Mutex::new(None),
        }
    }

    /// Calls `on_idle` after the delay unless `schedule` or `cancel` runs again.
    ///
    /// `on_idle` receives the epoch it was scheduled under. Receivers that
    /// hop through a channel should check [`is_current`](Self::is_current)
    /// before acting, since a cancel can land after the timer fired.
    pub fn schedule<F>(&self, on_idle: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let mut timer = self.lock_timer();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        let delay = self.delay;
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_idle(epoch);
        }));
        epoch
    }

    /// Drops the pending notification, if any.
    pub fn cancel(&self) {
        let mut timer = self.lock_timer();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(previous) = timer.take() {
            previous.abort();
            tracing::trace!("Idle notification cancelled");
        }
    }

    /// True when no schedule or cancel happened after `epoch` was handed out.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// True while a notification is waiting to fire.
    pub fn is_pending(&self) -> bool {
        self.lock_timer()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn lock_timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for StreamingDebouncer {
    fn drop(&mut self) {
        if let Some(handle) = self.lock_timer().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn debouncer() -> (StreamingDebouncer, mpsc::UnboundedSender<u64>, mpsc::UnboundedReceiver<u64>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StreamingDebouncer::new(Duration::from_millis(500)), tx, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let (debouncer, tx, mut rx) = debouncer();
        let epoch = debouncer.schedule(move |e| {
            let _ = tx.send(e);
        });
        assert!(debouncer.is_pending());

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(rx.recv().await, Some(epoch));
        assert!(debouncer.is_current(epoch));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_exits_collapse_into_one_notification() {
        let (debouncer, tx, mut rx) = debouncer();

        let mut last = 0;
        for _ in 0..5 {
            let tx = tx.clone();
            last = debouncer.schedule(move |e| {
                let _ = tx.send(e);
            });
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        drop(tx);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(rx.recv().await, Some(last));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_absorbs_pending_notification() {
        let (debouncer, tx, mut rx) = debouncer();
        let epoch = debouncer.schedule(move |e| {
            let _ = tx.send(e);
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        debouncer.cancel();
        assert!(!debouncer.is_pending());
        assert!(!debouncer.is_current(epoch));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_fire_invalidates_epoch() {
        let debouncer = Arc::new(StreamingDebouncer::new(Duration::from_millis(10)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        debouncer.schedule(move |e| {
            let _ = tx.send(e);
        });

        let fired = rx.recv().await.unwrap();
        debouncer.cancel();
        assert!(!debouncer.is_current(fired));
    }
}
