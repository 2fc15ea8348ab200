//! Debounced Apply
//!
//! Accept edits, schedule one delayed apply, and reschedule on every
//! new edit inside the quiet window. Only the last edit is applied;
//! earlier submitters learn they were superseded.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::trace;

/// Why a submitted edit produced no result of its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superseded;

/// Coalesces rapid submissions of `T`, applying only the last one
pub struct Debouncer<T, O> {
    delay: Duration,
    apply: Arc<dyn Fn(T) -> O + Send + Sync>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl<T, O> Debouncer<T, O>
where
    T: Send + 'static,
    O: Send + 'static,
{
    pub fn new(delay: Duration, apply: impl Fn(T) -> O + Send + Sync + 'static) -> Self {
        Self {
            delay,
            apply: Arc::new(apply),
            pending: Mutex::new(None),
        }
    }

    /// Schedule `value` to be applied after the quiet period.
    ///
    /// The receiver yields the apply result, or an error once a newer
    /// submission replaced this one. Must be called inside a tokio runtime.
    pub fn submit(&self, value: T) -> DebouncedResult<O> {
        let (tx, rx) = oneshot::channel();
        let apply = Arc::clone(&self.apply);
        let delay = self.delay;

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let output = apply(value);
            let _ = tx.send(output);
        });

        if let Some(previous) = self.pending.lock().replace(task) {
            trace!("Superseding pending debounced edit");
            previous.abort();
        }
        DebouncedResult { rx }
    }

    /// Apply immediately, cancelling anything pending
    pub fn apply_now(&self, value: T) -> O {
        if let Some(previous) = self.pending.lock().take() {
            previous.abort();
        }
        (self.apply)(value)
    }
}

impl<T, O> Drop for Debouncer<T, O> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.get_mut().take() {
            pending.abort();
        }
    }
}

/// Outcome of one debounced submission
pub struct DebouncedResult<O> {
    rx: oneshot::Receiver<O>,
}

impl<O> DebouncedResult<O> {
    pub async fn wait(self) -> Result<O, Superseded> {
        self.rx.await.map_err(|_| Superseded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_only_last_edit_is_applied() {
        let applied = Arc::new(AtomicUsize::new(0));
        let counter = applied.clone();
        let debouncer = Debouncer::new(Duration::from_millis(1500), move |text: String| {
            counter.fetch_add(1, Ordering::SeqCst);
            text.len()
        });

        let first = debouncer.submit("a".to_string());
        tokio::time::sleep(Duration::from_millis(500)).await;
        let second = debouncer.submit("abc".to_string());

        assert_eq!(first.wait().await, Err(Superseded));
        assert_eq!(second.wait().await, Ok(3));
        assert_eq!(applied.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_separated_edits_both_apply() {
        let debouncer = Debouncer::new(Duration::from_millis(100), |n: u32| n * 2);
        assert_eq!(debouncer.submit(1).wait().await, Ok(2));
        assert_eq!(debouncer.submit(2).wait().await, Ok(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_now_cancels_pending() {
        let debouncer = Debouncer::new(Duration::from_millis(100), |n: u32| n);
        let pending = debouncer.submit(1);
        assert_eq!(debouncer.apply_now(7), 7);
        assert_eq!(pending.wait().await, Err(Superseded));
    }
}
