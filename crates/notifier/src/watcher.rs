//! Per-operation watcher.
//!
//! Two tasks cooperate:
//! - the ticker marks the snapshot stale every `periodic_interval`
//! - the refresher waits for a stale mark, sleeps `notify_delay` so a burst of
//!   hints collapses into one pass, clears the mark, asks the supplier for a
//!   fresh snapshot and feeds the hub when it differs from the last one
//!
//! The mark is cleared before the supplier runs, so a hint arriving during the
//! query causes one more pass. Supplier errors are logged and swallowed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use mds_core::Result;

use crate::hub::NotifyHub;

#[derive(Debug, Clone, Copy)]
pub struct WatcherConfig {
    pub periodic_interval: Duration,
    pub notify_delay: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            periodic_interval: Duration::from_secs(5),
            notify_delay: Duration::from_millis(100),
        }
    }
}

/// Computes the current snapshot of whatever a watcher observes.
#[async_trait]
pub trait SnapshotSupplier<T>: Send + Sync {
    async fn snapshot(&self, cancel: &CancellationToken) -> Result<T>;
}

#[derive(Debug, Default)]
struct Stale {
    pending: AtomicBool,
    wake: Notify,
}

impl Stale {
    fn mark(&self) {
        self.pending.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

pub struct Watcher<T> {
    label: String,
    hub: Arc<NotifyHub<T>>,
    stale: Arc<Stale>,
    running: CancellationToken,
    tasks: TaskTracker,
}

impl<T> Watcher<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Spawn the ticker and refresher. The hub starts with `initial`; the first
    /// refresh runs `notify_delay` after start.
    pub fn start(
        label: impl Into<String>,
        initial: T,
        supplier: Arc<dyn SnapshotSupplier<T>>,
        config: WatcherConfig,
    ) -> Self {
        let label = label.into();
        let hub = Arc::new(NotifyHub::new(initial.clone()));
        let stale = Arc::new(Stale::default());
        stale.pending.store(true, Ordering::SeqCst);
        let running = CancellationToken::new();
        let tasks = TaskTracker::new();

        tasks.spawn(tick(stale.clone(), running.clone(), config.periodic_interval));
        tasks.spawn(refresh(
            label.clone(),
            initial,
            supplier,
            hub.clone(),
            stale.clone(),
            running.clone(),
            config.notify_delay,
        ));
        tasks.close();
        debug!(watcher = %label, "watcher started");

        Self {
            label,
            hub,
            stale,
            running,
            tasks,
        }
    }

    /// Hint that the observed state changed. Never blocks.
    pub fn notify_changed(&self) {
        self.stale.mark();
    }

    pub fn hub(&self) -> &NotifyHub<T> {
        &self.hub
    }

    /// Stop both tasks and the hub, and wait until all of them have exited.
    pub async fn shutdown(&self) {
        self.running.cancel();
        self.tasks.wait().await;
        self.hub.close().await;
        debug!(watcher = %self.label, "watcher stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.running.is_cancelled()
    }
}

async fn tick(stale: Arc<Stale>, running: CancellationToken, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = running.cancelled() => return,
            _ = ticker.tick() => stale.mark(),
        }
    }
}

async fn refresh<T>(
    label: String,
    initial: T,
    supplier: Arc<dyn SnapshotSupplier<T>>,
    hub: Arc<NotifyHub<T>>,
    stale: Arc<Stale>,
    running: CancellationToken,
    delay: Duration,
) where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    let mut last = initial;
    loop {
        while !stale.pending.load(Ordering::SeqCst) {
            tokio::select! {
                biased;
                _ = running.cancelled() => return,
                _ = stale.wake.notified() => {}
            }
        }

        tokio::select! {
            biased;
            _ = running.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        stale.pending.store(false, Ordering::SeqCst);
        let fresh = tokio::select! {
            biased;
            _ = running.cancelled() => return,
            fresh = supplier.snapshot(&running) => fresh,
        };
        match fresh {
            Ok(snapshot) if snapshot != last => {
                hub.feed(snapshot.clone());
                last = snapshot;
                debug!(watcher = %label, "snapshot fed");
            }
            Ok(_) => {}
            Err(err) => warn!(watcher = %label, error = %err, "snapshot refresh failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use mds_core::Error;

    use super::*;
    use crate::hub::Listener;

    /// Returns the value of `state`, counting calls; fails while `failing` is set.
    #[derive(Default)]
    struct Source {
        state: Mutex<u32>,
        calls: AtomicUsize,
        failing: AtomicBool,
    }

    impl Source {
        fn set(&self, v: u32) {
            *self.state.lock().unwrap() = v;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SnapshotSupplier<u32> for Source {
        async fn snapshot(&self, _cancel: &CancellationToken) -> Result<u32> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::internal("db down"));
            }
            Ok(*self.state.lock().unwrap())
        }
    }

    #[derive(Default)]
    struct Seen(Mutex<Vec<u32>>);

    #[async_trait]
    impl Listener<u32> for Seen {
        async fn notify(&self, _cancel: &CancellationToken, snapshot: &u32) -> bool {
            self.0.lock().unwrap().push(*snapshot);
            true
        }
    }

    fn config() -> WatcherConfig {
        WatcherConfig {
            periodic_interval: Duration::from_secs(5),
            notify_delay: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_once_after_start() {
        let source = Arc::new(Source::default());
        source.set(3);
        let watcher = Watcher::start("w", 0u32, source.clone(), config());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(source.calls(), 1);
        assert_eq!(*watcher.hub().current(), 3);
        watcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_hints_coalesces_into_one_refresh() {
        let source = Arc::new(Source::default());
        let watcher = Watcher::start("w", 0u32, source.clone(), config());
        tokio::time::sleep(Duration::from_millis(150)).await;
        let before = source.calls();

        for v in 1..=20 {
            source.set(v);
            watcher.notify_changed();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(source.calls() - before, 1);
        assert_eq!(*watcher.hub().current(), 20);
        watcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_tick_refreshes_without_hints() {
        let source = Arc::new(Source::default());
        let watcher = Watcher::start("w", 0u32, source.clone(), config());
        tokio::time::sleep(Duration::from_millis(150)).await;

        source.set(9);
        tokio::time::sleep(Duration::from_millis(5_200)).await;
        assert_eq!(*watcher.hub().current(), 9);
        watcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_snapshot_does_not_wake_listeners() {
        let source = Arc::new(Source::default());
        let watcher = Watcher::start("w", 0u32, source.clone(), config());
        let seen = Arc::new(Seen::default());
        let _handle = watcher.hub().register(seen.clone());

        tokio::time::sleep(Duration::from_millis(150)).await;
        watcher.notify_changed();
        tokio::time::sleep(Duration::from_millis(150)).await;
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(source.calls() >= 4);
        assert_eq!(*seen.0.lock().unwrap(), vec![0]);
        watcher.shutdown().await;
    }

    /// Reads the state when called and answers `lag` later.
    struct Slow {
        inner: Source,
        lag: Duration,
    }

    #[async_trait]
    impl SnapshotSupplier<u32> for Slow {
        async fn snapshot(&self, cancel: &CancellationToken) -> Result<u32> {
            let read = self.inner.snapshot(cancel).await;
            tokio::time::sleep(self.lag).await;
            read
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hint_during_a_refresh_triggers_another_pass() {
        let source = Arc::new(Slow {
            inner: Source::default(),
            lag: Duration::from_millis(50),
        });
        source.inner.set(1);
        let watcher = Watcher::start("w", 0u32, source.clone(), config());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(source.inner.calls(), 1);
        assert_eq!(*watcher.hub().current(), 1);

        source.inner.set(2);
        watcher.notify_changed();
        // Past the notify delay, inside the query.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(source.inner.calls(), 2);
        source.inner.set(3);
        watcher.notify_changed();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(source.inner.calls(), 3);
        assert_eq!(*watcher.hub().current(), 3);
        watcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn supplier_errors_keep_the_last_snapshot() {
        let source = Arc::new(Source::default());
        source.set(1);
        let watcher = Watcher::start("w", 0u32, source.clone(), config());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*watcher.hub().current(), 1);

        source.failing.store(true, Ordering::SeqCst);
        source.set(2);
        watcher.notify_changed();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*watcher.hub().current(), 1);
        assert!(watcher.is_running());

        source.failing.store(false, Ordering::SeqCst);
        watcher.notify_changed();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*watcher.hub().current(), 2);
        watcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_refreshing() {
        let source = Arc::new(Source::default());
        let watcher = Watcher::start("w", 0u32, source.clone(), config());
        watcher.shutdown().await;
        assert!(!watcher.is_running());

        let calls = source.calls();
        watcher.notify_changed();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(source.calls(), calls);
    }
}
