use crate::error::QueryError;
use crate::query::{Query, RunContext};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::info;
use tracklib_db::{CheckpointMode, DbConnection};

/// Refresh planner statistics and fold the write-ahead log back into the
/// main file. Run by the indexer after a synchronization changed anything.
#[derive(Debug, Default)]
pub struct OptimizeQuery {
    checkpointed_frames: AtomicI64,
}

impl OptimizeQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames moved by the checkpoint, -1 for a store without a WAL.
    pub fn checkpointed_frames(&self) -> i64 {
        self.checkpointed_frames.load(Ordering::SeqCst)
    }
}

impl Query for OptimizeQuery {
    fn name(&self) -> &'static str {
        "optimize"
    }

    fn on_run(&self, db: &DbConnection, ctx: &RunContext<'_>) -> Result<bool, QueryError> {
        db.execute("ANALYZE")?;
        ctx.checkpoint()?;
        let stats = db.checkpoint(CheckpointMode::Passive)?;
        info!(
            busy = stats.busy,
            log_frames = stats.log_frames,
            checkpointed_frames = stats.checkpointed_frames,
            "Optimized library store"
        );
        self.checkpointed_frames
            .store(stats.checkpointed_frames, Ordering::SeqCst);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryHandle;
    use tracklib_db::{schema, StoreOptions};

    #[test]
    fn test_optimize_on_wal_store() {
        let temp = tempfile::TempDir::new().unwrap();
        let db = DbConnection::open(temp.path().join("library.db"), &StoreOptions::default())
            .unwrap();
        schema::migrate(&db).unwrap();

        let query = QueryHandle::new(OptimizeQuery::new());
        assert!(query.run(&db));
        assert!(query.body().checkpointed_frames() >= 0);
        db.close().unwrap();
    }
}
