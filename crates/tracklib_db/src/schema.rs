//! Library schema and migrations.

use crate::connection::DbConnection;
use crate::error::{BackendError, Result};
use crate::value::DbValue;
use tracing::info;

/// Schema version written by the newest migration.
pub const SCHEMA_VERSION: i64 = 2;

const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        r#"
CREATE TABLE IF NOT EXISTS paths (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS tracks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id TEXT NOT NULL UNIQUE,
    path_id INTEGER NOT NULL,
    filename TEXT NOT NULL UNIQUE,
    directory TEXT NOT NULL,
    title TEXT NOT NULL,
    extension TEXT NOT NULL DEFAULT '',
    filesize INTEGER NOT NULL DEFAULT 0,
    filetime INTEGER NOT NULL DEFAULT 0,
    date_added INTEGER NOT NULL,
    date_updated INTEGER NOT NULL
);
"#,
    ),
    (
        2,
        r#"
CREATE INDEX IF NOT EXISTS idx_tracks_path_id ON tracks(path_id);
CREATE INDEX IF NOT EXISTS idx_tracks_directory ON tracks(directory);
CREATE INDEX IF NOT EXISTS idx_tracks_title ON tracks(title);
"#,
    ),
];

/// Read the stored schema version, 0 for a fresh store.
pub fn current_version(db: &DbConnection) -> Result<i64> {
    db.execute("CREATE TABLE IF NOT EXISTS version (version INTEGER NOT NULL)")?;
    let version: Option<i64> = db.query_scalar("SELECT MAX(version) FROM version", &[])?;
    Ok(version.unwrap_or(0))
}

/// Apply every pending migration in one transaction. Returns the resulting version.
pub fn migrate(db: &DbConnection) -> Result<i64> {
    let from = current_version(db)?;
    if from >= SCHEMA_VERSION {
        return Ok(from);
    }

    db.transaction(|db| {
        for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > from) {
            db.execute(sql)?;
            db.execute_with(
                "INSERT INTO version (version) VALUES (?1)",
                &[DbValue::from(*version)],
            )?;
        }
        Ok::<_, BackendError>(())
    })?;

    info!(from, to = SCHEMA_VERSION, "Migrated library schema");
    Ok(SCHEMA_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_fresh_store() {
        let db = DbConnection::open_in_memory().unwrap();
        assert_eq!(current_version(&db).unwrap(), 0);
        assert_eq!(migrate(&db).unwrap(), SCHEMA_VERSION);

        let tables: i64 = db
            .query_scalar(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('paths', 'tracks')",
                &[],
            )
            .unwrap();
        assert_eq!(tables, 2);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let db = DbConnection::open_in_memory().unwrap();
        migrate(&db).unwrap();
        migrate(&db).unwrap();
        let rows: i64 = db.query_scalar("SELECT COUNT(*) FROM version", &[]).unwrap();
        assert_eq!(rows, SCHEMA_VERSION);
    }
}
