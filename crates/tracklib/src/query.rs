//! Queries: units of work executed once against the store.
//!
//! A query moves through a small state machine:
//!
//! ```text
//! Idle --(dequeued, not canceled)--> Running
//! Idle --(canceled before dequeue)--> Canceled
//! Running --(on_run returns Ok(true))--> Finished
//! Running --(on_run returns Ok(false), Err, or panics)--> Failed
//! Running --(cancellation observed at a checkpoint)--> Canceled
//! ```
//!
//! Only the dispatcher's worker drives transitions. Any thread may set the
//! cancellation flag, which running code observes only at its own
//! checkpoints. Terminal states are sticky.

use crate::cancel::CancellationToken;
use crate::error::QueryError;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracklib_db::DbConnection;

static NEXT_QUERY_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique, monotonically increasing query identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(u64);

impl QueryId {
    fn next() -> Self {
        Self(NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// Query lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum QueryStatus {
    Idle = 0,
    Running = 1,
    Finished = 2,
    Failed = 3,
    Canceled = 4,
}

impl QueryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryStatus::Idle => "idle",
            QueryStatus::Running => "running",
            QueryStatus::Finished => "finished",
            QueryStatus::Failed => "failed",
            QueryStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QueryStatus::Finished | QueryStatus::Failed | QueryStatus::Canceled
        )
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => QueryStatus::Idle,
            1 => QueryStatus::Running,
            2 => QueryStatus::Finished,
            3 => QueryStatus::Failed,
            _ => QueryStatus::Canceled,
        }
    }
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Options given to `Dispatcher::enqueue`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct QueryOptions: u32 {
        /// Jump ahead of normal and background work.
        const PRIORITIZE = 1;
        /// Block the enqueuing thread until the query is terminal.
        const SYNCHRONOUS = 1 << 1;
        /// Deliver the callback of a synchronous query through the router
        /// instead of on the blocked caller's thread.
        const AUTO_CALLBACK = 1 << 2;
    }
}

/// Passed to [`Query::on_run`] for cooperative cancellation.
pub struct RunContext<'a> {
    id: QueryId,
    cancel: &'a CancellationToken,
}

impl RunContext<'_> {
    pub fn query_id(&self) -> QueryId {
        self.id
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(QueryError::Canceled)` once cancellation was requested. Use with `?`
    /// between rows or other natural break points.
    pub fn checkpoint(&self) -> Result<(), QueryError> {
        if self.is_canceled() {
            Err(QueryError::Canceled)
        } else {
            Ok(())
        }
    }
}

/// The body of a unit of work.
pub trait Query: Send + Sync + 'static {
    /// Stable name, used in logs and completion messages.
    fn name(&self) -> &'static str;

    /// Execute against the store. `Ok(true)` finishes the query, `Ok(false)`
    /// or an error fails it. Return `Err(QueryError::Canceled)` (usually via
    /// [`RunContext::checkpoint`]) to end as canceled.
    fn on_run(&self, db: &DbConnection, ctx: &RunContext<'_>) -> Result<bool, QueryError>;
}

/// A query body together with its lifecycle state.
pub(crate) struct Tracked<Q> {
    id: QueryId,
    status: AtomicU8,
    options: AtomicU32,
    submitted: AtomicBool,
    cancel: CancellationToken,
    error: Mutex<Option<String>>,
    body: Q,
}

impl<Q: Query> Tracked<Q> {
    pub(crate) fn body(&self) -> &Q {
        &self.body
    }

    fn transition(&self, from: QueryStatus, to: QueryStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn record_error(&self, message: String) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
    }

    fn execute(&self, db: &DbConnection) -> QueryStatus {
        if self.cancel.is_cancelled() {
            // Canceled before it ever ran: the store is not touched.
            self.transition(QueryStatus::Idle, QueryStatus::Canceled);
            return self.current_status();
        }
        if !self.transition(QueryStatus::Idle, QueryStatus::Running) {
            return self.current_status();
        }

        let ctx = RunContext {
            id: self.id,
            cancel: &self.cancel,
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.body.on_run(db, &ctx)));
        let status = match outcome {
            Ok(Ok(true)) => QueryStatus::Finished,
            Ok(Ok(false)) => {
                self.record_error(format!("{} returned false", self.body.name()));
                QueryStatus::Failed
            }
            Ok(Err(err)) if err.is_cancellation() => QueryStatus::Canceled,
            Ok(Err(err)) => {
                self.record_error(err.to_string());
                QueryStatus::Failed
            }
            Err(payload) => {
                self.record_error(format!("panicked: {}", panic_message(&*payload)));
                QueryStatus::Failed
            }
        };
        self.transition(QueryStatus::Running, status);
        status
    }

    fn current_status(&self) -> QueryStatus {
        QueryStatus::from_u8(self.status.load(Ordering::SeqCst))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Type-erased view of a query, as held by the dispatcher.
pub trait DynQuery: Send + Sync {
    fn id(&self) -> QueryId;
    fn name(&self) -> &'static str;
    fn status(&self) -> QueryStatus;
    fn options(&self) -> QueryOptions;
    fn cancel(&self);
    fn is_canceled(&self) -> bool;
    /// Failure message of a `Failed` query.
    fn error(&self) -> Option<String>;
    /// Drive the state machine once. Later calls return the current status.
    fn run(&self, db: &DbConnection) -> QueryStatus;
    /// Claim the query for a single submission. False if it was already claimed.
    #[doc(hidden)]
    fn claim_submission(&self, options: QueryOptions) -> bool;
}

impl<Q: Query> DynQuery for Tracked<Q> {
    fn id(&self) -> QueryId {
        self.id
    }

    fn name(&self) -> &'static str {
        self.body.name()
    }

    fn status(&self) -> QueryStatus {
        self.current_status()
    }

    fn options(&self) -> QueryOptions {
        QueryOptions::from_bits_truncate(self.options.load(Ordering::SeqCst))
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn error(&self) -> Option<String> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn run(&self, db: &DbConnection) -> QueryStatus {
        self.execute(db)
    }

    fn claim_submission(&self, options: QueryOptions) -> bool {
        if self.submitted.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.options.store(options.bits(), Ordering::SeqCst);
        true
    }
}

/// Shared handle to a typed query. Clones refer to the same query.
pub struct QueryHandle<Q> {
    inner: Arc<Tracked<Q>>,
}

impl<Q> Clone for QueryHandle<Q> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Q: Query> std::fmt::Debug for QueryHandle<Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}

impl<Q: Query> QueryHandle<Q> {
    pub fn new(body: Q) -> Self {
        Self {
            inner: Arc::new(Tracked {
                id: QueryId::next(),
                status: AtomicU8::new(QueryStatus::Idle as u8),
                options: AtomicU32::new(0),
                submitted: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                error: Mutex::new(None),
                body,
            }),
        }
    }

    pub fn id(&self) -> QueryId {
        self.inner.id
    }

    pub fn name(&self) -> &'static str {
        self.inner.body.name()
    }

    pub fn status(&self) -> QueryStatus {
        self.inner.current_status()
    }

    /// Options recorded when the query was enqueued. Empty before that.
    pub fn options(&self) -> QueryOptions {
        DynQuery::options(&*self.inner)
    }

    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn error(&self) -> Option<String> {
        DynQuery::error(&*self.inner)
    }

    /// The query body, for reading its results after completion.
    pub fn body(&self) -> &Q {
        &self.inner.body
    }

    /// Execute directly on the calling thread. True if the query finished.
    ///
    /// Each query runs at most once: a query that is no longer `Idle` is left
    /// untouched and this returns false.
    pub fn run(&self, db: &DbConnection) -> bool {
        if self.status() != QueryStatus::Idle {
            return false;
        }
        self.inner.execute(db) == QueryStatus::Finished
    }

    pub fn to_dyn(&self) -> Arc<dyn DynQuery> {
        self.inner.clone()
    }

    pub(crate) fn tracked(&self) -> &Arc<Tracked<Q>> {
        &self.inner
    }
}
