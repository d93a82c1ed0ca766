use super::lock;
use crate::error::QueryError;
use crate::query::{Query, RunContext};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;
use tracklib_db::{DbConnection, DbValue};

/// A root directory scanned by the indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryPath {
    pub id: i64,
    /// Normalized, with a trailing separator.
    pub path: String,
}

/// A pending edit of the path set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "path", rename_all = "snake_case")]
pub enum PathChange {
    Add(String),
    Remove(String),
}

impl PathChange {
    pub fn path(&self) -> &str {
        match self {
            PathChange::Add(path) | PathChange::Remove(path) => path,
        }
    }
}

/// Apply path changes in order, in one transaction.
///
/// Adding an existing path or removing an unknown one is not an error.
/// Tracks under a removed path are left for [`super::OrphanedTracksQuery`].
#[derive(Debug)]
pub struct UpdatePathsQuery {
    changes: Vec<PathChange>,
    changed: AtomicU64,
}

impl UpdatePathsQuery {
    pub fn new(changes: Vec<PathChange>) -> Self {
        Self {
            changes,
            changed: AtomicU64::new(0),
        }
    }

    pub fn changes(&self) -> &[PathChange] {
        &self.changes
    }

    /// Rows inserted or deleted.
    pub fn changed(&self) -> u64 {
        self.changed.load(Ordering::SeqCst)
    }
}

impl Query for UpdatePathsQuery {
    fn name(&self) -> &'static str {
        "update_paths"
    }

    fn on_run(&self, db: &DbConnection, ctx: &RunContext<'_>) -> Result<bool, QueryError> {
        let changed = db.transaction(|db| {
            let mut changed = 0;
            for change in &self.changes {
                ctx.checkpoint()?;
                changed += match change {
                    PathChange::Add(path) => db.execute_with(
                        "INSERT OR IGNORE INTO paths (path) VALUES (?1)",
                        &[DbValue::from(path)],
                    )?,
                    PathChange::Remove(path) => db.execute_with(
                        "DELETE FROM paths WHERE path = ?1",
                        &[DbValue::from(path)],
                    )?,
                };
            }
            Ok::<_, QueryError>(changed)
        })?;
        debug!(changes = self.changes.len(), changed, "Applied path changes");
        self.changed.store(changed, Ordering::SeqCst);
        Ok(true)
    }
}

/// Read the path set, ordered by id.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ListPathsQuery {
    #[serde(skip)]
    paths: Mutex<Vec<LibraryPath>>,
}

impl ListPathsQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paths(&self) -> Vec<LibraryPath> {
        lock(&self.paths).clone()
    }
}

impl Query for ListPathsQuery {
    fn name(&self) -> &'static str {
        "list_paths"
    }

    fn on_run(&self, db: &DbConnection, _ctx: &RunContext<'_>) -> Result<bool, QueryError> {
        let rows = db.query_all("SELECT id, path FROM paths ORDER BY id", &[])?;
        let paths = rows
            .iter()
            .map(|row| {
                Ok(LibraryPath {
                    id: row.get(0)?,
                    path: row.get(1)?,
                })
            })
            .collect::<Result<Vec<_>, tracklib_db::BackendError>>()?;
        *lock(&self.paths) = paths;
        Ok(true)
    }
}
