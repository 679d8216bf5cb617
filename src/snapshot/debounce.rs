//! Quiet-interval scheduling of snapshot runs.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How change notifications inside one quiet interval are collapsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebounceMode {
    /// One pending timer. Every notification pushes the run back to
    /// `quiet_interval` after the latest notification, so a burst produces a
    /// single run.
    #[default]
    Trailing,
    /// One independent timer per notification. A burst of N notifications
    /// produces N runs; overlapping runs are resolved by the coordinator
    /// cancelling the older attempt.
    PerEvent,
}

/// Schedules deferred actions according to a `DebounceMode`.
///
/// Owned by the single task consuming the change stream, so it needs no
/// locking of its own.
pub struct Debouncer {
    mode: DebounceMode,
    quiet_interval: Duration,
    // Trailing mode only: the timer that has not fired yet.
    pending: Option<CancellationToken>,
}

impl Debouncer {
    pub fn new(mode: DebounceMode, quiet_interval: Duration) -> Self {
        Self {
            mode,
            quiet_interval,
            pending: None,
        }
    }

    pub fn mode(&self) -> DebounceMode {
        self.mode
    }

    /// Run `action` once `quiet_interval` has elapsed.
    ///
    /// In trailing mode this first cancels the previously scheduled timer if
    /// it is still sleeping. A timer whose action has already started is left
    /// alone.
    pub fn schedule<F, Fut>(&mut self, action: F) -> JoinHandle<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let timer = CancellationToken::new();
        if self.mode == DebounceMode::Trailing {
            if let Some(previous) = self.pending.replace(timer.clone()) {
                previous.cancel();
            }
        }

        let quiet_interval = self.quiet_interval;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = timer.cancelled() => return,
                _ = tokio::time::sleep(quiet_interval) => {}
            }
            action().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_action(count: &Arc<AtomicUsize>) -> impl FnOnce() -> futures::future::Ready<()> {
        let count = Arc::clone(count);
        move || {
            count.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailing_collapses_burst() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut debouncer = Debouncer::new(DebounceMode::Trailing, Duration::from_millis(2000));

        debouncer.schedule(counting_action(&count));
        tokio::time::sleep(Duration::from_millis(500)).await;
        debouncer.schedule(counting_action(&count));
        tokio::time::sleep(Duration::from_millis(500)).await;
        debouncer.schedule(counting_action(&count));

        // t=1000, last notification at 1000 -> fires at 3000
        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_event_runs_every_timer() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut debouncer = Debouncer::new(DebounceMode::PerEvent, Duration::from_millis(2000));

        debouncer.schedule(counting_action(&count));
        tokio::time::sleep(Duration::from_millis(500)).await;
        debouncer.schedule(counting_action(&count));
        tokio::time::sleep(Duration::from_millis(500)).await;
        debouncer.schedule(counting_action(&count));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailing_spaced_events_each_fire() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut debouncer = Debouncer::new(DebounceMode::Trailing, Duration::from_millis(500));

        debouncer.schedule(counting_action(&count));
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        debouncer.schedule(counting_action(&count));
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailing_does_not_abort_started_action() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut debouncer = Debouncer::new(DebounceMode::Trailing, Duration::from_millis(100));

        let finished = Arc::clone(&count);
        debouncer.schedule(move || async move {
            tokio::time::sleep(Duration::from_millis(1000)).await;
            finished.fetch_add(1, Ordering::SeqCst);
        });

        // First action is running (t=200), a new notification must not kill it.
        tokio::time::sleep(Duration::from_millis(200)).await;
        debouncer.schedule(counting_action(&count));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_debounce_mode_deserialize() {
        let trailing: DebounceMode = serde_yaml::from_str("trailing").unwrap();
        let per_event: DebounceMode = serde_yaml::from_str("per_event").unwrap();
        assert_eq!(trailing, DebounceMode::Trailing);
        assert_eq!(per_event, DebounceMode::PerEvent);
        assert_eq!(DebounceMode::default(), DebounceMode::Trailing);
    }
}
