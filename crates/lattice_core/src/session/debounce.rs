//! Trailing-edge debounce for remote saves.
//!
//! Both the private-mode document save and the relay's server-side persist
//! use cancel-and-reschedule semantics: every new mutation restarts the
//! delay, so a burst of edits produces exactly one save carrying the final
//! state. A forced flush path bounds loss to zero on explicit close.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::BoxFuture;

/// The debounced action. Must be safe to run more than once with the same
/// inputs; it always reads current state when it fires.
pub type DebouncedAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Trailing-edge debouncer.
///
/// `schedule()` cancels any pending run and starts the delay over;
/// `flush()` cancels the timer and runs the action immediately if one was
/// pending. The runtime handle is captured at construction so `schedule()`
/// can be called from synchronous observer callbacks.
pub struct Debouncer {
    delay: Duration,
    action: DebouncedAction,
    handle: tokio::runtime::Handle,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    /// Create a debouncer. Must be called within a tokio runtime.
    pub fn new(delay: Duration, action: DebouncedAction) -> Self {
        Self {
            delay,
            action,
            handle: tokio::runtime::Handle::current(),
            pending: Mutex::new(None),
        }
    }

    /// (Re)schedule the action: cancels the pending timer, starts a new one.
    pub fn schedule(&self) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(task) = pending.take() {
            task.abort();
        }
        let action = Arc::clone(&self.action);
        let delay = self.delay;
        *pending = Some(self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            action().await;
        }));
    }

    /// Drop any pending run without executing it.
    pub fn cancel(&self) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(task) = pending.take() {
            task.abort();
        }
    }

    /// Force the pending action to run now.
    ///
    /// No-op when nothing is pending (the timer already fired and completed,
    /// or nothing was scheduled) - so a clean close never issues a spurious
    /// save.
    pub async fn flush(&self) {
        let rerun = {
            let mut pending = self.pending.lock().unwrap();
            match pending.take() {
                Some(task) => {
                    let already_ran = task.is_finished();
                    task.abort();
                    !already_ran
                }
                None => false,
            }
        };
        if rerun {
            (self.action)().await;
        }
    }

    /// Whether a run is currently scheduled and not yet completed.
    pub fn is_pending(&self) -> bool {
        let pending = self.pending.lock().unwrap();
        pending.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl std::fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("delay", &self.delay)
            .field("pending", &self.is_pending())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_action(counter: Arc<AtomicUsize>) -> DebouncedAction {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn test_burst_coalesces_to_one_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let debouncer = Debouncer::new(Duration::from_millis(30), counting_action(runs.clone()));

        for _ in 0..10 {
            debouncer.schedule();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_separate_windows_each_fire() {
        let runs = Arc::new(AtomicUsize::new(0));
        let debouncer = Debouncer::new(Duration::from_millis(10), counting_action(runs.clone()));

        debouncer.schedule();
        tokio::time::sleep(Duration::from_millis(40)).await;
        debouncer.schedule();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_flush_runs_pending_immediately() {
        let runs = Arc::new(AtomicUsize::new(0));
        let debouncer = Debouncer::new(Duration::from_secs(60), counting_action(runs.clone()));

        debouncer.schedule();
        debouncer.flush().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Flushing again with nothing pending does not re-run.
        debouncer.flush().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_drops_pending_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let debouncer = Debouncer::new(Duration::from_millis(10), counting_action(runs.clone()));

        debouncer.schedule();
        debouncer.cancel();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_is_pending_tracks_lifecycle() {
        let runs = Arc::new(AtomicUsize::new(0));
        let debouncer = Debouncer::new(Duration::from_millis(10), counting_action(runs.clone()));

        assert!(!debouncer.is_pending());
        debouncer.schedule();
        assert!(debouncer.is_pending());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!debouncer.is_pending());
    }
}
