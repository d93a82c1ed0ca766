//! Query dispatcher: one priority queue and one worker thread per library.
//!
//! Producers on any thread enqueue queries; the worker executes them one at
//! a time against the store and posts every completion to the message
//! router. The store is only ever touched from the worker thread.
//!
//! # Ordering
//!
//! Entries are ordered by (priority descending, submission order ascending).
//! Priority only affects admission: a running query is never preempted.
//!
//! # Synchronous submissions
//!
//! With [`QueryOptions::SYNCHRONOUS`] the enqueuing thread blocks until that
//! query is terminal. The completion envelope is posted either way. Without
//! [`QueryOptions::AUTO_CALLBACK`] the callback then runs on the unblocked
//! caller; with it, the callback travels in the envelope like an async one.

use crate::error::DispatchError;
use crate::query::{DynQuery, Query, QueryHandle, QueryId, QueryOptions, QueryStatus};
use crate::router::{Envelope, Message, MessageRouter, QueryCompletion, TargetId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracklib_db::DbConnection;

/// Completion callback, run once on the thread that drains the router
/// (or on a synchronous caller).
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Queue admission priority.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Indexer and other bulk maintenance work.
    Background,
    #[default]
    Normal,
    /// Interactive work, selected with [`QueryOptions::PRIORITIZE`].
    High,
}

/// Blocking slot for a synchronous caller.
struct Completion {
    status: Mutex<Option<QueryStatus>>,
    ready: Condvar,
}

impl Completion {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    fn complete(&self, status: QueryStatus) {
        *lock(&self.status) = Some(status);
        self.ready.notify_all();
    }

    /// Wait for completion; `None` if `timeout` elapsed first.
    fn wait(&self, timeout: Option<Duration>) -> Option<QueryStatus> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut status = lock(&self.status);
        loop {
            if let Some(done) = *status {
                return Some(done);
            }
            status = match deadline {
                None => self
                    .ready
                    .wait(status)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.ready
                        .wait_timeout(status, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

struct Entry {
    priority: Priority,
    seq: u64,
    query: Arc<dyn DynQuery>,
    callback: Option<Callback>,
    completion: Option<Arc<Completion>>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap pops the greatest: highest priority, then lowest sequence.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct State {
    queue: BinaryHeap<Entry>,
    next_seq: u64,
    closing: bool,
    /// Set by the worker as its last act.
    stopped: bool,
    running: Option<Arc<dyn DynQuery>>,
}

struct Shared {
    target: TargetId,
    db: DbConnection,
    router: MessageRouter,
    state: Mutex<State>,
    wake: Condvar,
    stopped: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_thread: OnceLock<ThreadId>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a running dispatcher. Clones share the same queue and worker.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("target", &self.shared.target)
            .field("pending", &self.pending())
            .field("closing", &self.is_closing())
            .finish()
    }
}

impl Dispatcher {
    /// Spawn the worker thread for `db`. Completions are posted to `router`
    /// addressed to `target`.
    pub fn start(
        target: TargetId,
        db: DbConnection,
        router: MessageRouter,
    ) -> Result<Self, DispatchError> {
        let shared = Arc::new(Shared {
            target,
            db,
            router,
            state: Mutex::new(State::default()),
            wake: Condvar::new(),
            stopped: Condvar::new(),
            worker: Mutex::new(None),
            worker_thread: OnceLock::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("tracklib-dispatcher".to_string())
            .spawn(move || run_loop(worker_shared))
            .map_err(DispatchError::Spawn)?;
        let _ = shared.worker_thread.set(handle.thread().id());
        *lock(&shared.worker) = Some(handle);

        Ok(Self { shared })
    }

    pub fn target(&self) -> TargetId {
        self.shared.target
    }

    /// Enqueue at normal priority (high with `PRIORITIZE`), without a callback.
    pub fn enqueue<Q: Query>(
        &self,
        query: &QueryHandle<Q>,
        options: QueryOptions,
    ) -> Result<QueryId, DispatchError> {
        self.submit(query.to_dyn(), options, Priority::Normal, None)
    }

    /// Enqueue at normal priority with a callback that receives the finished query.
    pub fn enqueue_with_callback<Q, F>(
        &self,
        query: &QueryHandle<Q>,
        options: QueryOptions,
        callback: F,
    ) -> Result<QueryId, DispatchError>
    where
        Q: Query,
        F: FnOnce(QueryHandle<Q>) + Send + 'static,
    {
        self.enqueue_with(query, options, Priority::Normal, callback)
    }

    /// Enqueue at an explicit priority with a completion callback.
    pub fn enqueue_with<Q, F>(
        &self,
        query: &QueryHandle<Q>,
        options: QueryOptions,
        priority: Priority,
        callback: F,
    ) -> Result<QueryId, DispatchError>
    where
        Q: Query,
        F: FnOnce(QueryHandle<Q>) + Send + 'static,
    {
        let handle = query.clone();
        self.submit(
            query.to_dyn(),
            options,
            priority,
            Some(Box::new(move || callback(handle))),
        )
    }

    /// Enqueue behind all interactive work.
    pub fn enqueue_background<Q: Query>(
        &self,
        query: &QueryHandle<Q>,
        options: QueryOptions,
    ) -> Result<QueryId, DispatchError> {
        self.submit(query.to_dyn(), options, Priority::Background, None)
    }

    /// Enqueue a type-erased query, e.g. one rebuilt by the query registry.
    pub fn enqueue_dyn(
        &self,
        query: Arc<dyn DynQuery>,
        options: QueryOptions,
        callback: Option<Callback>,
    ) -> Result<QueryId, DispatchError> {
        self.submit(query, options, Priority::Normal, callback)
    }

    /// Enqueue and block for at most `timeout`. Returns the status observed
    /// when the wait ended, which is non-terminal if the timeout elapsed.
    pub fn enqueue_and_wait<Q: Query>(
        &self,
        query: &QueryHandle<Q>,
        options: QueryOptions,
        timeout: Duration,
    ) -> Result<QueryStatus, DispatchError> {
        if self.is_worker_thread() {
            return Err(DispatchError::WouldDeadlock);
        }
        let completion = Completion::new();
        let options = options.difference(QueryOptions::SYNCHRONOUS);
        self.push(
            query.to_dyn(),
            options,
            Priority::Normal,
            None,
            Some(Arc::clone(&completion)),
        )?;
        Ok(completion
            .wait(Some(timeout))
            .unwrap_or_else(|| query.status()))
    }

    fn submit(
        &self,
        query: Arc<dyn DynQuery>,
        options: QueryOptions,
        priority: Priority,
        callback: Option<Callback>,
    ) -> Result<QueryId, DispatchError> {
        let synchronous = options.contains(QueryOptions::SYNCHRONOUS);
        if synchronous && self.is_worker_thread() {
            return Err(DispatchError::WouldDeadlock);
        }

        let (entry_callback, caller_callback) =
            if synchronous && !options.contains(QueryOptions::AUTO_CALLBACK) {
                (None, callback)
            } else {
                (callback, None)
            };
        let completion = synchronous.then(Completion::new);

        let id = self.push(query, options, priority, entry_callback, completion.clone())?;

        if let Some(completion) = completion {
            let status = completion.wait(None);
            debug!(query = %id, ?status, "Synchronous query returned to caller");
            if let Some(callback) = caller_callback {
                callback();
            }
        }
        Ok(id)
    }

    fn push(
        &self,
        query: Arc<dyn DynQuery>,
        options: QueryOptions,
        priority: Priority,
        callback: Option<Callback>,
        completion: Option<Arc<Completion>>,
    ) -> Result<QueryId, DispatchError> {
        let priority = if options.contains(QueryOptions::PRIORITIZE) {
            Priority::High
        } else {
            priority
        };
        let id = query.id();
        {
            let mut state = lock(&self.shared.state);
            if state.closing {
                return Err(DispatchError::Closed);
            }
            if !query.claim_submission(options) {
                return Err(DispatchError::AlreadySubmitted(id));
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            debug!(query = %id, name = query.name(), ?priority, seq, "Enqueued query");
            state.queue.push(Entry {
                priority,
                seq,
                query,
                callback,
                completion,
            });
        }
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Number of queries waiting to run.
    pub fn pending(&self) -> usize {
        lock(&self.shared.state).queue.len()
    }

    /// The query currently executing, if any.
    pub fn running(&self) -> Option<QueryId> {
        lock(&self.shared.state)
            .running
            .as_ref()
            .map(|query| query.id())
    }

    pub fn is_closing(&self) -> bool {
        lock(&self.shared.state).closing
    }

    /// Cancel the running query and interrupt its current statement.
    pub fn cancel_running(&self) -> Option<QueryId> {
        // Holding the state lock keeps the worker from moving on to the next
        // query before the interrupt lands.
        let state = lock(&self.shared.state);
        let running = state.running.as_ref()?;
        running.cancel();
        self.shared.db.interrupt();
        info!(query = %running.id(), name = running.name(), "Canceled running query");
        Some(running.id())
    }

    /// Stop accepting work, cancel everything still queued and join the worker.
    ///
    /// Every queued query ends as `Canceled` and its envelope, callback
    /// included, is posted before this returns. A query that is already
    /// running is allowed to finish. Returns the number of canceled queries.
    pub fn close(&self) -> usize {
        let canceled: Vec<Entry> = {
            let mut state = lock(&self.shared.state);
            if state.closing {
                Vec::new()
            } else {
                state.closing = true;
                let mut drained = Vec::with_capacity(state.queue.len());
                while let Some(entry) = state.queue.pop() {
                    drained.push(entry);
                }
                drained
            }
        };
        self.shared.wake.notify_all();

        let count = canceled.len();
        for entry in canceled {
            entry.query.cancel();
            // Canceled while Idle: finalized without touching the store.
            let status = entry.query.run(&self.shared.db);
            self.shared.finish(entry, status);
        }
        if count > 0 {
            info!(target_id = %self.shared.target, canceled = count, "Canceled queued queries");
        }

        if self.is_worker_thread() {
            warn!("Dispatcher closed from its own worker; not joining");
            return count;
        }
        let handle = lock(&self.shared.worker).take();
        match handle {
            Some(handle) => {
                if handle.join().is_err() {
                    error!(target_id = %self.shared.target, "Dispatcher worker panicked");
                }
            }
            // Another caller is joining; wait until the worker is gone.
            None => self.wait_stopped(),
        }
        count
    }

    fn wait_stopped(&self) {
        let mut state = lock(&self.shared.state);
        while !state.stopped {
            state = self
                .shared
                .stopped
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn is_worker_thread(&self) -> bool {
        self.shared.worker_thread.get() == Some(&thread::current().id())
    }
}

impl Shared {
    fn finish(&self, entry: Entry, status: QueryStatus) {
        let Entry {
            query,
            callback,
            completion,
            ..
        } = entry;

        let completed = QueryCompletion {
            id: query.id(),
            name: query.name(),
            status,
            error: query.error(),
        };
        let mut envelope = Envelope::new(self.target, Message::QueryCompleted(completed));
        if let Some(callback) = callback {
            envelope = envelope.with_callback(callback);
        }
        self.router.post(envelope);

        if let Some(completion) = completion {
            completion.complete(status);
        }
    }
}

/// Marks the worker stopped when it exits, including by unwinding.
struct StopSignal<'a>(&'a Shared);

impl Drop for StopSignal<'_> {
    fn drop(&mut self) {
        lock(&self.0.state).stopped = true;
        self.0.stopped.notify_all();
    }
}

fn run_loop(shared: Arc<Shared>) {
    info!(target_id = %shared.target, "Dispatcher worker started");
    let _stop = StopSignal(&shared);

    loop {
        let entry = {
            let mut state = lock(&shared.state);
            loop {
                if let Some(entry) = state.queue.pop() {
                    state.running = Some(Arc::clone(&entry.query));
                    break Some(entry);
                }
                if state.closing {
                    break None;
                }
                state = shared
                    .wake
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        let Some(entry) = entry else {
            break;
        };

        let started = Instant::now();
        let status = entry.query.run(&shared.db);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match status {
            QueryStatus::Failed => warn!(
                query = %entry.query.id(),
                name = entry.query.name(),
                error = entry.query.error().as_deref().unwrap_or("unknown"),
                elapsed_ms,
                "Query failed"
            ),
            _ => debug!(
                query = %entry.query.id(),
                name = entry.query.name(),
                %status,
                elapsed_ms,
                "Query complete"
            ),
        }

        lock(&shared.state).running = None;
        shared.finish(entry, status);
    }

    info!(target_id = %shared.target, "Dispatcher worker stopped");
}
