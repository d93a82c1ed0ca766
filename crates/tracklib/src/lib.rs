//! tracklib: prioritized query dispatch and filesystem indexing for a local
//! media library.
//!
//! Producers on any thread build [`Query`] values and hand them to a
//! library's [`Dispatcher`], which executes them one at a time on its worker
//! thread against the library store. Completions are posted to a
//! [`MessageRouter`] and delivered when the owning thread drains it. The
//! [`Indexer`] reconciles the library's root directories with the track
//! table through the same dispatcher.

pub mod cancel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod indexer;
pub mod library;
pub mod queries;
pub mod query;
pub mod registry;
pub mod router;

pub use cancel::CancellationToken;
pub use config::{IndexerConfig, TracklibConfig};
pub use dispatcher::{Callback, Dispatcher, Priority};
pub use error::{ConfigError, DispatchError, IndexerError, LibraryError, QueryError, RegistryError};
pub use indexer::{Indexer, IndexerProgress, IndexerState, SyncSummary};
pub use library::{Library, LibraryId, LibraryRegistry};
pub use query::{DynQuery, Query, QueryHandle, QueryId, QueryOptions, QueryStatus, RunContext};
pub use registry::{QueryRegistry, QueryRequest, ReplayableQuery, SerializableQuery};
pub use router::{Envelope, Message, MessageRouter, QueryCompletion, Subscription, TargetId};

pub use tracklib_db::DbConnection;
