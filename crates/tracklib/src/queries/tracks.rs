use super::{external_id, lock, now_timestamp, TrackRecord, TRACK_COLUMNS};
use crate::error::QueryError;
use crate::query::{Query, RunContext};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;
use tracklib_db::{DbConnection, DbValue};

/// A file found on disk by the indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedFile {
    pub filename: String,
    pub directory: String,
    pub title: String,
    pub extension: String,
    pub filesize: u64,
    pub filetime: i64,
}

/// Stored change-detection data for one track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub id: i64,
    pub filesize: u64,
    pub filetime: i64,
}

impl Fingerprint {
    pub fn matches(&self, file: &ScannedFile) -> bool {
        self.filesize == file.filesize && self.filetime == file.filetime
    }
}

/// Run one prepared write per item inside a single transaction.
fn write_batch<T>(
    db: &DbConnection,
    ctx: &RunContext<'_>,
    sql: &str,
    items: &[T],
    params: impl Fn(&T) -> Vec<DbValue>,
) -> Result<u64, QueryError> {
    let tx = db.begin()?;
    let mut changed = 0;
    {
        let session = db.lock()?;
        let mut stmt = session.prepare(sql)?;
        for item in items {
            ctx.checkpoint()?;
            stmt.bind_all(&params(item))?;
            changed += stmt.execute()?;
        }
    }
    tx.commit()?;
    Ok(changed)
}

/// Load the fingerprints of every track under one root, keyed by filename.
#[derive(Debug)]
pub struct TrackFingerprintsQuery {
    path_id: i64,
    fingerprints: Mutex<HashMap<String, Fingerprint>>,
}

impl TrackFingerprintsQuery {
    pub fn new(path_id: i64) -> Self {
        Self {
            path_id,
            fingerprints: Mutex::new(HashMap::new()),
        }
    }

    pub fn take_fingerprints(&self) -> HashMap<String, Fingerprint> {
        std::mem::take(&mut *lock(&self.fingerprints))
    }
}

impl Query for TrackFingerprintsQuery {
    fn name(&self) -> &'static str {
        "track_fingerprints"
    }

    fn on_run(&self, db: &DbConnection, ctx: &RunContext<'_>) -> Result<bool, QueryError> {
        let mut fingerprints = HashMap::new();
        {
            let session = db.lock()?;
            let mut stmt = session.prepare(
                "SELECT id, filename, filesize, filetime FROM tracks WHERE path_id = ?1",
            )?;
            stmt.bind(0, self.path_id)?;
            let mut rows = stmt.query();
            while let Some(row) = rows.step()? {
                ctx.checkpoint()?;
                fingerprints.insert(
                    row.get::<String>(1)?,
                    Fingerprint {
                        id: row.get(0)?,
                        filesize: row.get(2)?,
                        filetime: row.get(3)?,
                    },
                );
            }
        }
        *lock(&self.fingerprints) = fingerprints;
        Ok(true)
    }
}

/// Insert new tracks. A filename that already exists is updated in place.
#[derive(Debug)]
pub struct InsertTracksQuery {
    path_id: i64,
    files: Vec<ScannedFile>,
    inserted: AtomicU64,
}

impl InsertTracksQuery {
    pub fn new(path_id: i64, files: Vec<ScannedFile>) -> Self {
        Self {
            path_id,
            files,
            inserted: AtomicU64::new(0),
        }
    }

    pub fn inserted(&self) -> u64 {
        self.inserted.load(Ordering::SeqCst)
    }
}

impl Query for InsertTracksQuery {
    fn name(&self) -> &'static str {
        "insert_tracks"
    }

    fn on_run(&self, db: &DbConnection, ctx: &RunContext<'_>) -> Result<bool, QueryError> {
        let now = now_timestamp();
        let inserted = write_batch(
            db,
            ctx,
            "INSERT INTO tracks (external_id, path_id, filename, directory, title, extension, \
                                 filesize, filetime, date_added, date_updated) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9) \
             ON CONFLICT(filename) DO UPDATE SET \
                 path_id = excluded.path_id, \
                 directory = excluded.directory, \
                 title = excluded.title, \
                 extension = excluded.extension, \
                 filesize = excluded.filesize, \
                 filetime = excluded.filetime, \
                 date_updated = excluded.date_updated",
            &self.files,
            |file| {
                vec![
                    external_id(&file.filename).into(),
                    self.path_id.into(),
                    (&file.filename).into(),
                    (&file.directory).into(),
                    (&file.title).into(),
                    (&file.extension).into(),
                    (file.filesize as i64).into(),
                    file.filetime.into(),
                    now.into(),
                ]
            },
        )?;
        debug!(path_id = self.path_id, inserted, "Inserted tracks");
        self.inserted.store(inserted, Ordering::SeqCst);
        Ok(true)
    }
}

/// Refresh the fingerprint and derived fields of existing tracks.
#[derive(Debug)]
pub struct UpdateTracksQuery {
    updates: Vec<(i64, ScannedFile)>,
    updated: AtomicU64,
}

impl UpdateTracksQuery {
    pub fn new(updates: Vec<(i64, ScannedFile)>) -> Self {
        Self {
            updates,
            updated: AtomicU64::new(0),
        }
    }

    pub fn updated(&self) -> u64 {
        self.updated.load(Ordering::SeqCst)
    }
}

impl Query for UpdateTracksQuery {
    fn name(&self) -> &'static str {
        "update_tracks"
    }

    fn on_run(&self, db: &DbConnection, ctx: &RunContext<'_>) -> Result<bool, QueryError> {
        let now = now_timestamp();
        let updated = write_batch(
            db,
            ctx,
            "UPDATE tracks SET title = ?1, extension = ?2, filesize = ?3, filetime = ?4, \
                               date_updated = ?5 \
             WHERE id = ?6",
            &self.updates,
            |(id, file)| {
                vec![
                    (&file.title).into(),
                    (&file.extension).into(),
                    (file.filesize as i64).into(),
                    file.filetime.into(),
                    now.into(),
                    (*id).into(),
                ]
            },
        )?;
        self.updated.store(updated, Ordering::SeqCst);
        Ok(true)
    }
}

/// Delete tracks by id.
#[derive(Debug, Default)]
pub struct DeleteTracksQuery {
    ids: Vec<i64>,
    deleted: AtomicU64,
}

impl DeleteTracksQuery {
    pub fn new(ids: Vec<i64>) -> Self {
        Self {
            ids,
            deleted: AtomicU64::new(0),
        }
    }

    pub fn deleted(&self) -> u64 {
        self.deleted.load(Ordering::SeqCst)
    }
}

impl Query for DeleteTracksQuery {
    fn name(&self) -> &'static str {
        "delete_tracks"
    }

    fn on_run(&self, db: &DbConnection, ctx: &RunContext<'_>) -> Result<bool, QueryError> {
        let deleted = write_batch(db, ctx, "DELETE FROM tracks WHERE id = ?1", &self.ids, |id| {
            vec![(*id).into()]
        })?;
        self.deleted.store(deleted, Ordering::SeqCst);
        Ok(true)
    }
}

/// Find tracks whose root path no longer exists.
#[derive(Debug, Default)]
pub struct OrphanedTracksQuery {
    ids: Mutex<Vec<i64>>,
}

impl OrphanedTracksQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_ids(&self) -> Vec<i64> {
        std::mem::take(&mut *lock(&self.ids))
    }
}

impl Query for OrphanedTracksQuery {
    fn name(&self) -> &'static str {
        "orphaned_tracks"
    }

    fn on_run(&self, db: &DbConnection, _ctx: &RunContext<'_>) -> Result<bool, QueryError> {
        let rows = db.query_all(
            "SELECT id FROM tracks WHERE path_id NOT IN (SELECT id FROM paths) ORDER BY id",
            &[],
        )?;
        let ids = rows
            .iter()
            .map(|row| row.get::<i64>(0))
            .collect::<Result<Vec<_>, _>>()?;
        *lock(&self.ids) = ids;
        Ok(true)
    }
}

/// List tracks ordered by directory and filename, optionally filtered by a
/// substring of the title or filename.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TrackListQuery {
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: u32,
    #[serde(skip)]
    tracks: Mutex<Vec<TrackRecord>>,
}

impl TrackListQuery {
    pub fn new(filter: Option<String>, limit: Option<u32>, offset: u32) -> Self {
        Self {
            filter,
            limit,
            offset,
            tracks: Mutex::new(Vec::new()),
        }
    }

    pub fn tracks(&self) -> Vec<TrackRecord> {
        lock(&self.tracks).clone()
    }
}

impl Query for TrackListQuery {
    fn name(&self) -> &'static str {
        "track_list"
    }

    fn on_run(&self, db: &DbConnection, ctx: &RunContext<'_>) -> Result<bool, QueryError> {
        let sql = format!(
            "SELECT {} FROM tracks \
             WHERE ?1 IS NULL OR title LIKE ?1 OR filename LIKE ?1 \
             ORDER BY directory, filename \
             LIMIT ?2 OFFSET ?3",
            TRACK_COLUMNS
        );
        let pattern = self
            .filter
            .as_deref()
            .filter(|filter| !filter.is_empty())
            .map(|filter| format!("%{}%", filter));
        let limit = self.limit.map_or(-1, i64::from);

        let mut tracks = Vec::new();
        {
            let session = db.lock()?;
            let mut stmt = session.prepare(&sql)?;
            stmt.bind(0, pattern)?;
            stmt.bind(1, limit)?;
            stmt.bind(2, self.offset)?;
            let mut rows = stmt.query();
            while let Some(row) = rows.step()? {
                ctx.checkpoint()?;
                tracks.push(TrackRecord::from_row(&row)?);
            }
        }
        *lock(&self.tracks) = tracks;
        Ok(true)
    }
}

/// Look up one track by its external id.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TrackByExternalIdQuery {
    pub external_id: String,
    #[serde(skip)]
    track: Mutex<Option<TrackRecord>>,
}

impl TrackByExternalIdQuery {
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            track: Mutex::new(None),
        }
    }

    pub fn track(&self) -> Option<TrackRecord> {
        lock(&self.track).clone()
    }
}

impl Query for TrackByExternalIdQuery {
    fn name(&self) -> &'static str {
        "track_by_external_id"
    }

    fn on_run(&self, db: &DbConnection, _ctx: &RunContext<'_>) -> Result<bool, QueryError> {
        let row = db.query_optional(
            &format!("SELECT {} FROM tracks WHERE external_id = ?1", TRACK_COLUMNS),
            &[DbValue::from(&self.external_id)],
        )?;
        let track = row.as_ref().map(TrackRecord::from_row).transpose()?;
        *lock(&self.track) = track;
        Ok(true)
    }
}

/// Count tracks, in total or under one root.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TrackCountQuery {
    #[serde(default)]
    pub path_id: Option<i64>,
    #[serde(skip)]
    count: AtomicU64,
}

impl TrackCountQuery {
    pub fn new(path_id: Option<i64>) -> Self {
        Self {
            path_id,
            count: AtomicU64::new(0),
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }
}

impl Query for TrackCountQuery {
    fn name(&self) -> &'static str {
        "track_count"
    }

    fn on_run(&self, db: &DbConnection, _ctx: &RunContext<'_>) -> Result<bool, QueryError> {
        let count: u64 = db.query_scalar(
            "SELECT COUNT(*) FROM tracks WHERE ?1 IS NULL OR path_id = ?1",
            &[DbValue::from(self.path_id)],
        )?;
        self.count.store(count, Ordering::SeqCst);
        Ok(true)
    }
}
