//! Message router: the mailbox between worker threads and the owning thread.
//!
//! Workers `post` envelopes and never block. The thread that created the
//! router calls `drain` on its own schedule, and every callback and handler
//! runs there. If nobody drains, envelopes accumulate.

use crate::dispatcher::Callback;
use crate::indexer::SyncSummary;
use crate::library::LibraryId;
use crate::query::{QueryId, QueryStatus};
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Who an envelope is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "library", rename_all = "snake_case")]
pub enum TargetId {
    /// Query completions of a library's dispatcher.
    Library(LibraryId),
    /// Lifecycle signals of a library's indexer.
    Indexer(LibraryId),
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetId::Library(id) => write!(f, "library:{}", id),
            TargetId::Indexer(id) => write!(f, "indexer:{}", id),
        }
    }
}

/// A query reached a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryCompletion {
    pub id: QueryId,
    pub name: &'static str,
    pub status: QueryStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Message {
    QueryCompleted(QueryCompletion),
    SynchronizeStart,
    SynchronizeEnd(SyncSummary),
    PathsUpdated,
    TrackRefreshed,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::QueryCompleted(_) => "query_completed",
            Message::SynchronizeStart => "synchronize_start",
            Message::SynchronizeEnd(_) => "synchronize_end",
            Message::PathsUpdated => "paths_updated",
            Message::TrackRefreshed => "track_refreshed",
        }
    }
}

/// One posted message, delivered exactly once.
pub struct Envelope {
    target: TargetId,
    message: Message,
    callback: Option<Callback>,
}

impl Envelope {
    pub fn new(target: TargetId, message: Message) -> Self {
        Self {
            target,
            message,
            callback: None,
        }
    }

    /// Attach a callback that runs on the draining thread, before handlers.
    pub fn with_callback(mut self, callback: Callback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn target(&self) -> TargetId {
        self.target
    }

    pub fn message(&self) -> &Message {
        &self.message
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("target", &self.target)
            .field("message", &self.message.kind())
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

type Handler = Arc<dyn Fn(TargetId, &Message) + Send + Sync>;

struct HandlerEntry {
    id: u64,
    filter: Option<TargetId>,
    handler: Handler,
}

struct RouterInner {
    queue: Mutex<VecDeque<Envelope>>,
    posted: Condvar,
    handlers: Mutex<Vec<HandlerEntry>>,
    next_subscription: AtomicU64,
    owner: ThreadId,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Thread-safe mailbox bound to the thread that created it.
#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRouter {
    /// Create a router owned by the current thread.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RouterInner {
                queue: Mutex::new(VecDeque::new()),
                posted: Condvar::new(),
                handlers: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                owner: thread::current().id(),
            }),
        }
    }

    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.inner.owner
    }

    /// Append an envelope. Never blocks on delivery.
    pub fn post(&self, envelope: Envelope) {
        lock(&self.inner.queue).push_back(envelope);
        self.inner.posted.notify_all();
    }

    /// Number of envelopes waiting for the next drain.
    pub fn pending(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    /// Deliver everything posted so far, in posting order, on this thread.
    ///
    /// Envelopes posted while draining wait for the next call. Returns the
    /// number delivered. Only the owning thread may drain.
    pub fn drain(&self) -> usize {
        if !self.is_owner_thread() {
            warn!("MessageRouter::drain called off the owning thread; ignoring");
            return 0;
        }

        let batch = std::mem::take(&mut *lock(&self.inner.queue));
        let delivered = batch.len();
        for envelope in batch {
            self.deliver(envelope);
        }
        delivered
    }

    /// Wait up to `timeout` for something to be posted, then drain.
    pub fn wait_and_drain(&self, timeout: Duration) -> usize {
        if !self.is_owner_thread() {
            warn!("MessageRouter::wait_and_drain called off the owning thread; ignoring");
            return 0;
        }
        {
            let queue = lock(&self.inner.queue);
            if queue.is_empty() {
                let _ = self
                    .inner
                    .posted
                    .wait_timeout_while(queue, timeout, |queue| queue.is_empty())
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        self.drain()
    }

    fn deliver(&self, envelope: Envelope) {
        let Envelope {
            target,
            message,
            callback,
        } = envelope;

        if let Some(callback) = callback {
            if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                error!(%target, message = message.kind(), "Callback panicked");
            }
        }

        // Snapshot so handlers may subscribe or cancel while being called.
        let handlers: Vec<Handler> = lock(&self.inner.handlers)
            .iter()
            .filter(|entry| entry.filter.map_or(true, |filter| filter == target))
            .map(|entry| Arc::clone(&entry.handler))
            .collect();
        for handler in handlers {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(target, &message))).is_err() {
                error!(%target, message = message.kind(), "Message handler panicked");
            }
        }
    }

    /// Register a handler for every message to `filter` (or to anyone when `None`).
    ///
    /// The handler stays registered until [`Subscription::cancel`] is called;
    /// dropping the subscription does not unsubscribe.
    pub fn subscribe<F>(&self, filter: Option<TargetId>, handler: F) -> Subscription
    where
        F: Fn(TargetId, &Message) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.handlers).push(HandlerEntry {
            id,
            filter,
            handler: Arc::new(handler),
        });
        debug!(subscription = id, ?filter, "Subscribed message handler");
        Subscription {
            id,
            router: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.handlers).len()
    }
}

/// Handle returned by [`MessageRouter::subscribe`].
#[derive(Debug)]
#[must_use = "a subscription can only be cancelled through its handle"]
pub struct Subscription {
    id: u64,
    router: Weak<RouterInner>,
}

impl Subscription {
    /// Remove the handler. False if it was already gone.
    pub fn cancel(self) -> bool {
        let Some(router) = self.router.upgrade() else {
            return false;
        };
        let mut handlers = lock(&router.handlers);
        let before = handlers.len();
        handlers.retain(|entry| entry.id != self.id);
        before != handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const LIB: TargetId = TargetId::Library(LibraryId(1));
    const OTHER: TargetId = TargetId::Library(LibraryId(2));

    #[test]
    fn test_drain_empty_is_noop() {
        let router = MessageRouter::new();
        assert_eq!(router.drain(), 0);
        assert_eq!(router.pending(), 0);
    }

    #[test]
    fn test_drain_delivers_in_post_order() {
        let router = MessageRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for index in 0..3 {
            let seen = Arc::clone(&seen);
            router.post(
                Envelope::new(LIB, Message::TrackRefreshed)
                    .with_callback(Box::new(move || seen.lock().unwrap().push(index))),
            );
        }
        assert_eq!(router.pending(), 3);
        assert_eq!(router.drain(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(router.drain(), 0);
    }

    #[test]
    fn test_callbacks_run_on_owner_thread() {
        let router = MessageRouter::new();
        let owner = thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));

        let poster = router.clone();
        let ran_on_clone = Arc::clone(&ran_on);
        thread::spawn(move || {
            poster.post(
                Envelope::new(LIB, Message::PathsUpdated).with_callback(Box::new(move || {
                    *ran_on_clone.lock().unwrap() = Some(thread::current().id());
                })),
            );
            // Draining off the owning thread is refused.
            assert_eq!(poster.drain(), 0);
        })
        .join()
        .unwrap();

        assert_eq!(router.drain(), 1);
        assert_eq!(*ran_on.lock().unwrap(), Some(owner));
    }

    #[test]
    fn test_subscription_filter_and_cancel() {
        let router = MessageRouter::new();
        let all = Arc::new(AtomicUsize::new(0));
        let filtered = Arc::new(AtomicUsize::new(0));

        let all_clone = Arc::clone(&all);
        let all_sub = router.subscribe(None, move |_, _| {
            all_clone.fetch_add(1, Ordering::SeqCst);
        });
        let filtered_clone = Arc::clone(&filtered);
        let filtered_sub = router.subscribe(Some(LIB), move |_, _| {
            filtered_clone.fetch_add(1, Ordering::SeqCst);
        });

        router.post(Envelope::new(LIB, Message::TrackRefreshed));
        router.post(Envelope::new(OTHER, Message::TrackRefreshed));
        router.drain();
        assert_eq!(all.load(Ordering::SeqCst), 2);
        assert_eq!(filtered.load(Ordering::SeqCst), 1);

        assert!(filtered_sub.cancel());
        router.post(Envelope::new(LIB, Message::TrackRefreshed));
        router.drain();
        assert_eq!(all.load(Ordering::SeqCst), 3);
        assert_eq!(filtered.load(Ordering::SeqCst), 1);

        assert_eq!(router.subscriber_count(), 1);
        assert!(all_sub.cancel());
        assert_eq!(router.subscriber_count(), 0);
    }

    #[test]
    fn test_panicking_callback_does_not_stop_drain() {
        let router = MessageRouter::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        router.post(
            Envelope::new(LIB, Message::TrackRefreshed)
                .with_callback(Box::new(|| panic!("callback failure"))),
        );
        let delivered_clone = Arc::clone(&delivered);
        router.post(
            Envelope::new(LIB, Message::TrackRefreshed).with_callback(Box::new(move || {
                delivered_clone.fetch_add(1, Ordering::SeqCst);
            })),
        );
        assert_eq!(router.drain(), 2);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_and_drain_wakes_on_post() {
        let router = MessageRouter::new();
        let poster = router.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            poster.post(Envelope::new(LIB, Message::SynchronizeStart));
        });
        let delivered = router.wait_and_drain(Duration::from_secs(5));
        handle.join().unwrap();
        assert_eq!(delivered, 1);
    }
}
