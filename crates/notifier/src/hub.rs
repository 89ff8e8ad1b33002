//! Notify hub: fan-out of the latest snapshot to many listeners.
//!
//! The hub holds exactly one `(snapshot, version)` pair in a `watch` channel;
//! `feed` replaces it in O(1). Every registered listener gets a delivery task
//! that pushes the newest snapshot it has not yet delivered:
//!
//! - a new listener starts with nothing delivered, so it receives the current
//!   snapshot immediately (late joiner)
//! - slow listeners skip intermediate snapshots but always end with the latest
//! - a listener returning `false` keeps its snapshot pending and retries after
//!   `retry_delay` or on the next feed; other listeners are unaffected
//! - at most one `notify` call per listener is in flight

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

/// Default pause before a failed delivery is retried.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Receiver of hub snapshots.
#[async_trait]
pub trait Listener<T>: Send + Sync {
    /// Deliver `snapshot`. Returning `false` asks for the snapshot to be retried.
    async fn notify(&self, cancel: &CancellationToken, snapshot: &T) -> bool;
}

#[derive(Debug)]
struct Feed<T> {
    version: u64,
    updated_at: Instant,
    snapshot: Arc<T>,
}

pub struct NotifyHub<T> {
    feed: watch::Sender<Feed<T>>,
    listeners: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    retry_delay: Duration,
}

impl<T: Send + Sync + 'static> NotifyHub<T> {
    pub fn new(initial: T) -> Self {
        Self::with_retry_delay(initial, DEFAULT_RETRY_DELAY)
    }

    pub fn with_retry_delay(initial: T, retry_delay: Duration) -> Self {
        let (feed, _) = watch::channel(Feed {
            version: 0,
            updated_at: Instant::now(),
            snapshot: Arc::new(initial),
        });
        Self {
            feed,
            listeners: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            retry_delay,
        }
    }

    /// Replace the current snapshot and wake every delivery task.
    pub fn feed(&self, snapshot: T) {
        self.feed.send_modify(|feed| {
            feed.version += 1;
            feed.updated_at = Instant::now();
            feed.snapshot = Arc::new(snapshot);
        });
    }

    pub fn current(&self) -> Arc<T> {
        self.feed.borrow().snapshot.clone()
    }

    pub fn updated_at(&self) -> Instant {
        self.feed.borrow().updated_at
    }

    /// Number of live registrations.
    pub fn listener_count(&self) -> usize {
        self.listeners.load(Ordering::SeqCst)
    }

    /// Register `listener` and start its delivery task.
    pub fn register(&self, listener: Arc<dyn Listener<T>>) -> ListenerHandle {
        let cancel = self.shutdown.child_token();
        self.listeners.fetch_add(1, Ordering::SeqCst);

        let mut rx = self.feed.subscribe();
        let retry_delay = self.retry_delay;
        let task_cancel = cancel.clone();
        self.tasks.spawn(async move {
            deliver(&mut rx, listener.as_ref(), &task_cancel, retry_delay).await;
            trace!("hub listener task exited");
        });

        ListenerHandle {
            cancel,
            stopped: Arc::new(AtomicBool::new(false)),
            listeners: self.listeners.clone(),
        }
    }

    /// Stop every delivery task and wait for them to exit.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        debug!("hub closed");
    }
}

async fn deliver<T>(
    rx: &mut watch::Receiver<Feed<T>>,
    listener: &dyn Listener<T>,
    cancel: &CancellationToken,
    retry_delay: Duration,
) {
    let mut delivered: Option<u64> = None;
    loop {
        let (version, snapshot) = {
            let feed = rx.borrow_and_update();
            (feed.version, feed.snapshot.clone())
        };

        if delivered != Some(version) {
            let ok = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                ok = listener.notify(cancel, &snapshot) => ok,
            };
            if ok {
                delivered = Some(version);
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    changed = rx.changed() => if changed.is_err() { return },
                    _ = tokio::time::sleep(retry_delay) => {}
                }
                continue;
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            changed = rx.changed() => if changed.is_err() { return },
        }
    }
}

/// Registration of one listener; [`ListenerHandle::cancel`] ends it.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    cancel: CancellationToken,
    stopped: Arc<AtomicBool>,
    listeners: Arc<AtomicUsize>,
}

impl ListenerHandle {
    /// Stop the listener. Idempotent; the count drops exactly once.
    pub fn cancel(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.listeners.fetch_sub(1, Ordering::SeqCst);
        }
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Records delivered values; fails while `failing` is set.
    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<u32>>,
        calls: AtomicUsize,
        failing: AtomicBool,
    }

    impl Recording {
        fn seen(&self) -> Vec<u32> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Listener<u32> for Recording {
        async fn notify(&self, _cancel: &CancellationToken, snapshot: &u32) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return false;
            }
            self.seen.lock().unwrap().push(*snapshot);
            true
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn late_joiner_gets_current_snapshot_first() {
        let hub = NotifyHub::new(0u32);
        hub.feed(7);

        let listener = Arc::new(Recording::default());
        let _handle = hub.register(listener.clone());
        settle().await;

        assert_eq!(listener.seen(), vec![7]);
        hub.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn initial_snapshot_is_delivered_without_feed() {
        let hub = NotifyHub::new(0u32);
        let listener = Arc::new(Recording::default());
        let _handle = hub.register(listener.clone());
        settle().await;
        assert_eq!(listener.seen(), vec![0]);
        hub.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn every_listener_ends_with_the_latest_snapshot() {
        let hub = NotifyHub::new(0u32);
        let listeners: Vec<_> = (0..10).map(|_| Arc::new(Recording::default())).collect();
        let _handles: Vec<_> = listeners.iter().map(|l| hub.register(l.clone())).collect();

        for v in 1..=5 {
            hub.feed(v);
        }
        settle().await;

        for l in &listeners {
            let seen = l.seen();
            assert_eq!(seen.last(), Some(&5));
            assert!(seen.windows(2).all(|w| w[0] < w[1]), "not increasing: {seen:?}");
        }
        hub.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failing_listener_retries_without_affecting_others() {
        let hub = NotifyHub::with_retry_delay(0u32, Duration::from_millis(100));
        let healthy = Arc::new(Recording::default());
        let broken = Arc::new(Recording::default());
        broken.failing.store(true, Ordering::SeqCst);
        let _a = hub.register(healthy.clone());
        let _b = hub.register(broken.clone());
        settle().await;

        hub.feed(1);
        settle().await;
        assert_eq!(healthy.seen(), vec![0, 1]);
        assert!(broken.seen().is_empty());
        let calls = broken.calls.load(Ordering::SeqCst);

        tokio::time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert!(broken.calls.load(Ordering::SeqCst) > calls);

        hub.feed(2);
        settle().await;
        assert_eq!(healthy.seen(), vec![0, 1, 2]);

        broken.failing.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(broken.seen(), vec![2]);
        hub.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_delivery_and_counts_once() {
        let hub = NotifyHub::new(0u32);
        let listener = Arc::new(Recording::default());
        let handle = hub.register(listener.clone());
        settle().await;
        assert_eq!(hub.listener_count(), 1);

        handle.cancel();
        handle.cancel();
        assert_eq!(hub.listener_count(), 0);

        hub.feed(1);
        settle().await;
        assert_eq!(listener.seen(), vec![0]);
        hub.close().await;
    }
}
