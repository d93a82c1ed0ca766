//! A library: one store, its dispatcher and its indexer.

use crate::config::{IndexerConfig, TracklibConfig};
use crate::dispatcher::{Dispatcher, Priority};
use crate::error::{DispatchError, LibraryError};
use crate::indexer::Indexer;
use crate::query::{Query, QueryHandle, QueryId, QueryOptions};
use crate::router::{MessageRouter, TargetId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracklib_db::{schema, DbConnection, StoreOptions};

/// File name of a library store inside its directory.
pub const DATABASE_FILENAME: &str = "library.db";

/// Identity of a library within a [`LibraryRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LibraryId(pub u32);

impl LibraryId {
    pub const DEFAULT: LibraryId = LibraryId(1);
}

impl std::fmt::Display for LibraryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct Library {
    id: LibraryId,
    name: String,
    db: DbConnection,
    router: MessageRouter,
    dispatcher: Dispatcher,
    indexer: Indexer,
    closed: AtomicBool,
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("location", &self.db.location())
            .finish()
    }
}

impl Library {
    /// Open (creating if needed) the store under `config.data_dir`.
    pub fn open(
        id: LibraryId,
        name: impl Into<String>,
        config: &TracklibConfig,
        router: MessageRouter,
    ) -> Result<Self, LibraryError> {
        let db = DbConnection::open(config.library_db_path(id), &StoreOptions::default())?;
        Self::open_with_store(id, name, db, &config.indexer, router)
    }

    /// Wrap an already opened store, e.g. an in-memory one.
    pub fn open_with_store(
        id: LibraryId,
        name: impl Into<String>,
        db: DbConnection,
        indexer_config: &IndexerConfig,
        router: MessageRouter,
    ) -> Result<Self, LibraryError> {
        let name = name.into();
        let version = schema::migrate(&db)?;
        let dispatcher = Dispatcher::start(TargetId::Library(id), db.clone(), router.clone())?;
        let indexer = match Indexer::start(
            id,
            dispatcher.clone(),
            router.clone(),
            indexer_config.clone(),
        ) {
            Ok(indexer) => indexer,
            Err(err) => {
                dispatcher.close();
                return Err(err.into());
            }
        };

        info!(library = %id, name = %name, schema_version = version, "Opened library");
        Ok(Self {
            id,
            name,
            db,
            router,
            dispatcher,
            indexer,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> LibraryId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db(&self) -> &DbConnection {
        &self.db
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    pub fn enqueue<Q: Query>(
        &self,
        query: &QueryHandle<Q>,
        options: QueryOptions,
    ) -> Result<QueryId, DispatchError> {
        self.dispatcher.enqueue(query, options)
    }

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
        self.dispatcher.enqueue_with(query, options, priority, callback)
    }

    /// Abort whatever statement is running right now.
    pub fn interrupt(&self) {
        self.dispatcher.cancel_running();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Shut the library down. Idempotent.
    ///
    /// Stops the indexer, cancels every queued query, closes the store and,
    /// on the router's owning thread, drains the router so the cancellation
    /// callbacks have run before this returns.
    pub fn close(&self) -> Result<(), LibraryError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.indexer.shutdown();
        let canceled = self.dispatcher.close();
        let closed = self.db.close();
        if self.router.is_owner_thread() {
            self.router.drain();
        }

        info!(library = %self.id, canceled, "Closed library");
        closed.map_err(LibraryError::from)
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(library = %self.id, error = %err, "Failed to close library");
        }
    }
}

/// Explicit registry of open libraries sharing one router and config.
pub struct LibraryRegistry {
    config: TracklibConfig,
    router: MessageRouter,
    libraries: BTreeMap<LibraryId, Arc<Library>>,
}

impl LibraryRegistry {
    pub fn new(config: TracklibConfig, router: MessageRouter) -> Self {
        Self {
            config,
            router,
            libraries: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &TracklibConfig {
        &self.config
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Open a new library under the next free id. The default id is
    /// reserved for [`default_library`](Self::default_library).
    pub fn create(&mut self, name: impl Into<String>) -> Result<Arc<Library>, LibraryError> {
        let next = self
            .libraries
            .keys()
            .next_back()
            .map_or(LibraryId::DEFAULT.0, |last| last.0)
            .max(LibraryId::DEFAULT.0)
            + 1;
        let next = LibraryId(next);
        self.open(next, name)
    }

    fn open(&mut self, id: LibraryId, name: impl Into<String>) -> Result<Arc<Library>, LibraryError> {
        let library = Arc::new(Library::open(id, name, &self.config, self.router.clone())?);
        self.libraries.insert(id, Arc::clone(&library));
        Ok(library)
    }

    pub fn get(&self, id: LibraryId) -> Option<Arc<Library>> {
        self.libraries.get(&id).cloned()
    }

    /// Library 1, opened under the configured default name on first use.
    pub fn default_library(&mut self) -> Result<Arc<Library>, LibraryError> {
        if let Some(library) = self.get(LibraryId::DEFAULT) {
            return Ok(library);
        }
        let name = self.config.default_library.clone();
        self.open(LibraryId::DEFAULT, name)
    }

    pub fn ids(&self) -> Vec<LibraryId> {
        self.libraries.keys().copied().collect()
    }

    /// Close and forget a library. Its store file is kept.
    pub fn destroy(&mut self, id: LibraryId) -> Result<bool, LibraryError> {
        match self.libraries.remove(&id) {
            Some(library) => {
                library.close()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close every library, returning the first error.
    pub fn close_all(&mut self) -> Result<(), LibraryError> {
        let mut first_error = None;
        for (id, library) in std::mem::take(&mut self.libraries) {
            if let Err(err) = library.close() {
                warn!(library = %id, error = %err, "Failed to close library");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for LibraryRegistry {
    fn drop(&mut self) {
        let _ = self.close_all();
    }
}
