//! Concrete queries over the library store.
//!
//! The indexer drives the path and track maintenance queries. Callers use
//! the read queries (`TrackListQuery`, `TrackByExternalIdQuery`,
//! `TrackCountQuery`, `ListPathsQuery`), directly or replayed through the
//! query registry.

mod maintenance;
mod paths;
mod tracks;

pub use maintenance::OptimizeQuery;
pub use paths::{LibraryPath, ListPathsQuery, PathChange, UpdatePathsQuery};
pub use tracks::{
    DeleteTracksQuery, Fingerprint, InsertTracksQuery, OrphanedTracksQuery, ScannedFile,
    TrackByExternalIdQuery, TrackCountQuery, TrackFingerprintsQuery, TrackListQuery,
    UpdateTracksQuery,
};

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracklib_db::{BackendError, DbRow};

/// Prefix of identifiers derived from a local file path.
pub const LOCAL_ID_PREFIX: &str = "local:";

/// Columns selected for a [`TrackRecord`], in `from_row` order.
pub(crate) const TRACK_COLUMNS: &str = "id, external_id, path_id, filename, directory, title, \
     extension, filesize, filetime, date_added, date_updated";

/// Stable identifier for the file at `filename`, independent of its row id.
pub fn external_id(filename: &str) -> String {
    format!(
        "{}{}",
        LOCAL_ID_PREFIX,
        blake3::hash(filename.as_bytes()).to_hex()
    )
}

/// A track row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub id: i64,
    pub external_id: String,
    pub path_id: i64,
    /// Absolute path of the file.
    pub filename: String,
    /// Directory containing the file, with a trailing separator.
    pub directory: String,
    pub title: String,
    /// Lowercase extension without the dot.
    pub extension: String,
    pub filesize: u64,
    /// Modification time, seconds since the Unix epoch.
    pub filetime: i64,
    pub date_added: i64,
    pub date_updated: i64,
}

impl TrackRecord {
    pub fn from_row(row: &DbRow) -> Result<Self, BackendError> {
        Ok(Self {
            id: row.get_by_name("id")?,
            external_id: row.get_by_name("external_id")?,
            path_id: row.get_by_name("path_id")?,
            filename: row.get_by_name("filename")?,
            directory: row.get_by_name("directory")?,
            title: row.get_by_name("title")?,
            extension: row.get_by_name("extension")?,
            filesize: row.get_by_name("filesize")?,
            filetime: row.get_by_name("filetime")?,
            date_added: row.get_by_name("date_added")?,
            date_updated: row.get_by_name("date_updated")?,
        })
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Seconds since the Unix epoch, for `date_added`/`date_updated`.
pub(crate) fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}
