//! Coalesces outbound events into frames.
//!
//! Streaming replies produce many small events in quick succession. Normal
//! events wait in a per-session queue for up to the batch window and leave as
//! one frame. Priority events (errors, results, end-of-stream markers) first
//! flush whatever is queued and then go out on their own, so the client always
//! sees them after everything that preceded them.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use yume_core::{OutboundEvent, OutboundFrame, OutboundPayload};

#[derive(Default)]
struct PendingBatch {
    queue: Vec<OutboundEvent>,
    timer: Option<JoinHandle<()>>,
    /// Identifies the timer allowed to flush; bumped on every flush.
    timer_epoch: u64,
}

struct BatcherShared {
    session_id: String,
    frames: mpsc::UnboundedSender<OutboundFrame>,
    pending: Mutex<PendingBatch>,
}

impl BatcherShared {
    fn lock(&self) -> MutexGuard<'_, PendingBatch> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sends everything queued. Called with the lock held so frames keep
    /// their enqueue order.
    fn flush_locked(&self, pending: &mut PendingBatch) {
        pending.timer_epoch += 1;
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        let mut queue = std::mem::take(&mut pending.queue);
        let payload = match queue.len() {
            0 => return,
            1 => match queue.pop() {
                Some(event) => OutboundPayload::Single(event),
                None => return,
            },
            _ => OutboundPayload::Batch(queue),
        };
        self.send(payload);
    }

    fn send(&self, payload: OutboundPayload) {
        let frame = OutboundFrame {
            session_id: self.session_id.clone(),
            payload,
        };
        if self.frames.send(frame).is_err() {
            tracing::debug!(session_id = %self.session_id, "Outbound channel closed, dropping frame");
        }
    }
}

/// Per-session outbound queue.
#[derive(Clone)]
pub struct OutboundBatcher {
    shared: Arc<BatcherShared>,
    window: Duration,
}

impl OutboundBatcher {
    pub fn new(
        session_id: impl Into<String>,
        frames: mpsc::UnboundedSender<OutboundFrame>,
        window: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(BatcherShared {
                session_id: session_id.into(),
                frames,
                pending: Mutex::new(PendingBatch::default()),
            }),
            window,
        }
    }

    pub fn enqueue(&self, event: OutboundEvent) {
        let mut pending = self.shared.lock();

        if event.is_priority() {
            self.shared.flush_locked(&mut pending);
            self.shared.send(OutboundPayload::Single(event));
            return;
        }

        pending.queue.push(event);
        if pending.timer.is_none() {
            let epoch = pending.timer_epoch;
            let shared = self.shared.clone();
            let window = self.window;
            pending.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(window).await;
                let mut pending = shared.lock();
                // A flush after the sleep ended may have beaten us to the lock
                if pending.timer_epoch == epoch {
                    pending.timer = None;
                    shared.flush_locked(&mut pending);
                }
            }));
        }
    }

    /// Sends everything queued right away.
    pub fn flush_now(&self) {
        let mut pending = self.shared.lock();
        self.shared.flush_locked(&mut pending);
    }

    /// Drops queued events without sending them. Used on teardown.
    pub fn discard(&self) -> usize {
        let mut pending = self.shared.lock();
        pending.timer_epoch += 1;
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        let dropped = pending.queue.len();
        pending.queue.clear();
        if dropped > 0 {
            tracing::debug!(session_id = %self.shared.session_id, dropped, "Discarded queued events");
        }
        dropped
    }

    pub fn queued(&self) -> usize {
        self.shared.lock().queue.len()
    }
}
