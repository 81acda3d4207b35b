use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::TimeoutError;

/// Countdown latch over the output streams of one attach.
///
/// Each configured output stream reports exactly once when its pump stops.
/// The barrier fires once, when the last one reports; a barrier built with
/// a target of zero is complete from the start.
#[derive(Clone)]
pub struct CompletionBarrier {
    inner: Arc<BarrierInner>,
}

struct BarrierInner {
    target: usize,
    remaining: AtomicUsize,
    fired: AtomicBool,
    notify: Notify,
}

impl CompletionBarrier {
    pub fn new(target: usize) -> Self {
        Self {
            inner: Arc::new(BarrierInner {
                target,
                remaining: AtomicUsize::new(target),
                fired: AtomicBool::new(target == 0),
                notify: Notify::new(),
            }),
        }
    }

    pub fn target(&self) -> usize {
        self.inner.target
    }

    pub fn remaining(&self) -> usize {
        self.inner.remaining.load(Ordering::SeqCst)
    }

    pub fn is_complete(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Record that one output stream reached its terminal state.
    ///
    /// Returns `false` when the barrier had nothing left to count down;
    /// such extra signals are ignored.
    pub fn signal_one_stream_done(&self) -> bool {
        let previous = self
            .inner
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));

        match previous {
            Ok(1) => {
                if !self.inner.fired.swap(true, Ordering::SeqCst) {
                    tracing::debug!(streams = self.inner.target, "All output streams drained");
                    self.inner.notify.notify_waiters();
                }
                true
            }
            Ok(left) => {
                tracing::trace!(remaining = left - 1, "Output stream drained");
                true
            }
            Err(_) => {
                tracing::debug!("Extra stream completion ignored");
                false
            }
        }
    }

    /// Wait until every output stream has drained, or `timeout` elapses.
    pub async fn await_completion(&self, timeout: Duration) -> Result<(), TimeoutError> {
        if self.is_complete() {
            return Ok(());
        }

        match tokio::time::timeout(timeout, self.completed()).await {
            Ok(()) => Ok(()),
            Err(_) => Err(TimeoutError {
                timeout,
                remaining: self.remaining(),
            }),
        }
    }

    async fn completed(&self) {
        // Register interest before checking the flag so a signal landing in
        // between is not lost.
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_complete() {
            return;
        }
        notified.await;
    }
}

impl std::fmt::Debug for CompletionBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionBarrier")
            .field("target", &self.target())
            .field("remaining", &self.remaining())
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn zero_target_is_complete_without_signals() {
        let barrier = CompletionBarrier::new(0);
        assert!(barrier.is_complete());

        let start = Instant::now();
        barrier
            .await_completion(Duration::from_secs(5))
            .await
            .expect("zero target completes immediately");
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn completes_after_target_signals() {
        let barrier = CompletionBarrier::new(2);
        let waiter = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.await_completion(Duration::from_secs(5)).await })
        };

        tokio::task::yield_now().await;
        assert!(barrier.signal_one_stream_done());
        assert!(!barrier.is_complete());
        assert!(barrier.signal_one_stream_done());
        assert!(barrier.is_complete());

        waiter.await.unwrap().expect("barrier fires before timeout");
    }

    #[tokio::test]
    async fn signals_before_waiting_are_remembered() {
        let barrier = CompletionBarrier::new(1);
        barrier.signal_one_stream_done();
        barrier
            .await_completion(Duration::from_millis(50))
            .await
            .expect("already complete");
    }

    #[tokio::test]
    async fn times_out_with_remaining_count() {
        let barrier = CompletionBarrier::new(2);
        barrier.signal_one_stream_done();

        let start = Instant::now();
        let err = barrier
            .await_completion(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(90));
        assert_eq!(err.remaining, 1);
        assert_eq!(err.timeout, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn extra_signals_are_ignored() {
        let barrier = CompletionBarrier::new(1);
        assert!(barrier.signal_one_stream_done());
        assert!(!barrier.signal_one_stream_done());
        assert_eq!(barrier.remaining(), 0);
        assert!(barrier.is_complete());
    }
}
