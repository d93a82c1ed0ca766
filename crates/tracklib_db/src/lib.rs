//! Store handle for the tracklib library database.
//!
//! A [`DbConnection`] owns exactly one SQLite connection and serializes every
//! statement through a single guard. Query execution, scheduling and result
//! delivery live in the `tracklib` crate; this crate only knows about
//! statements, transactions and the schema.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tracklib_db::{DbConnection, StoreOptions};
//!
//! let db = DbConnection::open("library.db", &StoreOptions::default())?;
//! tracklib_db::schema::migrate(&db)?;
//! let tracks: i64 = db.query_scalar("SELECT COUNT(*) FROM tracks", &[])?;
//! ```

mod connection;
mod error;
pub mod schema;
mod value;

pub use connection::{
    CheckpointMode, CheckpointStats, DbConnection, DbRows, DbSession, ScopedTransaction,
    Statement, StoreOptions,
};
pub use error::{BackendError, Result};
pub use value::{DbRow, DbValue, FromDbValue};
