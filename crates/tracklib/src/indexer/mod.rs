//! Library indexer: reconciles the configured root directories with the
//! track table.
//!
//! The indexer owns a thread (`tracklib-indexer`) fed by a command channel.
//! Every store access goes through the library's dispatcher as a synchronous
//! background query, so interactive queries keep their priority. Progress is
//! reported as router messages addressed to [`TargetId::Indexer`]:
//!
//! - `SynchronizeStart` and `SynchronizeEnd(summary)` bracket every run,
//!   including runs that fail or are canceled.
//! - `PathsUpdated` after queued path changes were applied.
//! - `TrackRefreshed` after each batch that changed tracks.

mod scan;

use crate::cancel::CancellationToken;
use crate::config::IndexerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::IndexerError;
use crate::library::LibraryId;
use crate::queries::{ListPathsQuery, PathChange};
use crate::query::{QueryHandle, QueryOptions, QueryStatus};
use crate::router::{Envelope, Message, MessageRouter, TargetId};
use serde::Serialize;
use std::path::{Path, MAIN_SEPARATOR};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, info, warn};

/// Outcome of one synchronization run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub paths_scanned: u64,
    pub files_scanned: u64,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub unchanged: u64,
    /// Files or directories that could not be read.
    pub errors: u64,
    pub canceled: bool,
    /// Set when a store query ended the run early.
    pub failure: Option<String>,
    pub duration_ms: u64,
}

impl SyncSummary {
    pub fn changed(&self) -> bool {
        self.inserted + self.updated + self.deleted > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexerState {
    Idle,
    Synchronizing,
}

/// Snapshot of the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexerProgress {
    pub state: IndexerState,
    pub paths_total: u64,
    pub paths_done: u64,
    pub files_scanned: u64,
}

enum Command {
    Synchronize,
    Shutdown,
}

struct Control {
    state: IndexerState,
    pending_changes: Vec<PathChange>,
    /// A `Synchronize` command is queued and not yet picked up.
    sync_queued: bool,
    restart_requested: bool,
    token: CancellationToken,
}

#[derive(Default)]
struct Progress {
    paths_total: AtomicU64,
    paths_done: AtomicU64,
    files_scanned: AtomicU64,
}

impl Progress {
    fn reset(&self) {
        self.paths_total.store(0, Ordering::SeqCst);
        self.paths_done.store(0, Ordering::SeqCst);
        self.files_scanned.store(0, Ordering::SeqCst);
    }
}

struct Shared {
    library: LibraryId,
    dispatcher: Dispatcher,
    router: MessageRouter,
    config: IndexerConfig,
    control: Mutex<Control>,
    progress: Progress,
}

impl Shared {
    fn target(&self) -> TargetId {
        TargetId::Indexer(self.library)
    }

    fn signal(&self, message: Message) {
        self.router.post(Envelope::new(self.target(), message));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Normalize a root path: canonical when it exists, always with a trailing separator.
pub fn normalize_path(path: &Path) -> String {
    let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let mut text = resolved.to_string_lossy().into_owned();
    if !text.ends_with(MAIN_SEPARATOR) {
        text.push(MAIN_SEPARATOR);
    }
    text
}

pub struct Indexer {
    shared: Arc<Shared>,
    commands: Mutex<Option<Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_thread: ThreadId,
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("library", &self.shared.library)
            .field("state", &self.state())
            .finish()
    }
}

impl Indexer {
    pub fn start(
        library: LibraryId,
        dispatcher: Dispatcher,
        router: MessageRouter,
        config: IndexerConfig,
    ) -> Result<Self, IndexerError> {
        let sync_on_startup = config.sync_on_startup;
        let shared = Arc::new(Shared {
            library,
            dispatcher,
            router,
            config,
            control: Mutex::new(Control {
                state: IndexerState::Idle,
                pending_changes: Vec::new(),
                sync_queued: sync_on_startup,
                restart_requested: false,
                token: CancellationToken::new(),
            }),
            progress: Progress::default(),
        });

        let (tx, rx) = mpsc::channel();
        if sync_on_startup {
            // The receiver is alive, so this cannot fail.
            let _ = tx.send(Command::Synchronize);
        }

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("tracklib-indexer".to_string())
            .spawn(move || run_loop(worker_shared, rx))
            .map_err(IndexerError::Spawn)?;

        Ok(Self {
            shared,
            commands: Mutex::new(Some(tx)),
            worker_thread: handle.thread().id(),
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn library(&self) -> LibraryId {
        self.shared.library
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.shared.config
    }

    /// Queue a root directory. Returns the normalized path.
    pub fn add_path(&self, path: impl AsRef<Path>) -> String {
        let normalized = normalize_path(path.as_ref());
        self.queue_change(PathChange::Add(normalized.clone()));
        normalized
    }

    /// Queue removal of a root directory. Its tracks are deleted by the next run.
    pub fn remove_path(&self, path: impl AsRef<Path>) -> String {
        let normalized = normalize_path(path.as_ref());
        self.queue_change(PathChange::Remove(normalized.clone()));
        normalized
    }

    fn queue_change(&self, change: PathChange) {
        debug!(library = %self.shared.library, ?change, "Queued path change");
        lock(&self.shared.control).pending_changes.push(change);
        if self.shared.config.sync_on_path_change {
            self.synchronize(true);
        }
    }

    /// Stored roots, ordered by id, with queued changes applied on top.
    pub fn get_paths(&self) -> Result<Vec<String>, IndexerError> {
        let query = QueryHandle::new(ListPathsQuery::new());
        self.shared
            .dispatcher
            .enqueue_background(&query, QueryOptions::SYNCHRONOUS)?;
        if query.status() != QueryStatus::Finished {
            return Err(IndexerError::Query {
                name: query.name(),
                status: query.status(),
                message: query.error().unwrap_or_default(),
            });
        }

        let mut paths: Vec<String> = query.body().paths().into_iter().map(|p| p.path).collect();
        for change in &lock(&self.shared.control).pending_changes {
            match change {
                PathChange::Add(path) => {
                    if !paths.contains(path) {
                        paths.push(path.clone());
                    }
                }
                PathChange::Remove(path) => paths.retain(|existing| existing != path),
            }
        }
        Ok(paths)
    }

    /// Request a run. While a run is in progress, `restart` cancels it and
    /// starts over; otherwise the request is dropped.
    pub fn synchronize(&self, restart: bool) {
        let mut control = lock(&self.shared.control);
        if control.state == IndexerState::Synchronizing {
            if restart {
                info!(library = %self.shared.library, "Restarting synchronization");
                control.restart_requested = true;
                control.token.cancel();
            }
            return;
        }
        if control.sync_queued {
            return;
        }
        if let Some(commands) = lock(&self.commands).as_ref() {
            if commands.send(Command::Synchronize).is_ok() {
                control.sync_queued = true;
            }
        }
    }

    /// Cancel the current run, if any. Queued path changes are kept.
    pub fn stop(&self) {
        let mut control = lock(&self.shared.control);
        control.restart_requested = false;
        if control.state == IndexerState::Synchronizing {
            info!(library = %self.shared.library, "Stopping synchronization");
            control.token.cancel();
        }
    }

    pub fn state(&self) -> IndexerState {
        lock(&self.shared.control).state
    }

    pub fn progress(&self) -> IndexerProgress {
        let progress = &self.shared.progress;
        IndexerProgress {
            state: self.state(),
            paths_total: progress.paths_total.load(Ordering::SeqCst),
            paths_done: progress.paths_done.load(Ordering::SeqCst),
            files_scanned: progress.files_scanned.load(Ordering::SeqCst),
        }
    }

    /// Stop any run and join the indexer thread. Idempotent.
    pub fn shutdown(&self) {
        self.stop();
        if let Some(commands) = lock(&self.commands).take() {
            let _ = commands.send(Command::Shutdown);
        }
        if thread::current().id() == self.worker_thread {
            return;
        }
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(library = %self.shared.library, "Indexer thread panicked");
            }
        }
    }
}

impl Drop for Indexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(shared: Arc<Shared>, commands: Receiver<Command>) {
    info!(library = %shared.library, "Indexer started");
    let interval = shared.config.auto_sync_interval();

    loop {
        let command = match interval {
            Some(interval) => match commands.recv_timeout(interval) {
                Ok(command) => command,
                Err(RecvTimeoutError::Timeout) => Command::Synchronize,
                Err(RecvTimeoutError::Disconnected) => Command::Shutdown,
            },
            None => commands.recv().unwrap_or(Command::Shutdown),
        };

        match command {
            Command::Shutdown => break,
            Command::Synchronize => loop {
                scan::run_once(&shared);
                let mut control = lock(&shared.control);
                if !std::mem::take(&mut control.restart_requested) {
                    break;
                }
            },
        }
    }

    info!(library = %shared.library, "Indexer stopped");
}
