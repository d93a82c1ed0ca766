//! One synchronization run.

use super::{lock, IndexerState, Shared, SyncSummary};
use crate::cancel::CancellationToken;
use crate::error::IndexerError;
use crate::queries::{
    DeleteTracksQuery, Fingerprint, InsertTracksQuery, LibraryPath, ListPathsQuery,
    OptimizeQuery, OrphanedTracksQuery, ScannedFile, TrackFingerprintsQuery, UpdatePathsQuery,
    UpdateTracksQuery,
};
use crate::query::{Query, QueryHandle, QueryOptions, QueryStatus};
use crate::router::Message;
use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path, MAIN_SEPARATOR};
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{error, info, info_span, warn};
use walkdir::WalkDir;

pub(super) fn run_once(shared: &Shared) {
    let token = {
        let mut control = lock(&shared.control);
        control.state = IndexerState::Synchronizing;
        control.sync_queued = false;
        control.restart_requested = false;
        control.token = CancellationToken::new();
        control.token.clone()
    };
    shared.progress.reset();
    shared.signal(Message::SynchronizeStart);

    let span = info_span!("indexer.sync", library = %shared.library);
    let _guard = span.enter();
    let started = Instant::now();

    let mut run = SyncRun {
        shared,
        token,
        summary: SyncSummary::default(),
    };
    let outcome = run.run();
    let mut summary = run.summary;
    summary.duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(()) => info!(
            paths = summary.paths_scanned,
            files = summary.files_scanned,
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            errors = summary.errors,
            duration_ms = summary.duration_ms,
            "Synchronization complete"
        ),
        Err(IndexerError::Canceled) => {
            info!(duration_ms = summary.duration_ms, "Synchronization canceled");
            summary.canceled = true;
        }
        Err(err) => {
            error!(error = %err, "Synchronization failed");
            summary.failure = Some(err.to_string());
        }
    }

    lock(&shared.control).state = IndexerState::Idle;
    shared.signal(Message::SynchronizeEnd(summary));
}

struct SyncRun<'a> {
    shared: &'a Shared,
    token: CancellationToken,
    summary: SyncSummary,
}

impl SyncRun<'_> {
    fn checkpoint(&self) -> Result<(), IndexerError> {
        if self.token.is_cancelled() {
            Err(IndexerError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Run `body` as a synchronous background query and wait for it.
    fn submit<Q: Query>(&self, body: Q) -> Result<QueryHandle<Q>, IndexerError> {
        self.checkpoint()?;
        let query = QueryHandle::new(body);
        self.shared
            .dispatcher
            .enqueue_background(&query, QueryOptions::SYNCHRONOUS)?;
        match query.status() {
            QueryStatus::Finished => Ok(query),
            QueryStatus::Canceled => Err(IndexerError::Canceled),
            status => Err(IndexerError::Query {
                name: query.name(),
                status,
                message: query.error().unwrap_or_default(),
            }),
        }
    }

    fn run(&mut self) -> Result<(), IndexerError> {
        self.apply_path_changes()?;

        let roots = self.submit(ListPathsQuery::new())?.body().paths();
        self.shared
            .progress
            .paths_total
            .store(roots.len() as u64, Ordering::SeqCst);

        for root in &roots {
            self.checkpoint()?;
            if Path::new(&root.path).is_dir() {
                self.scan_root(root, &roots)?;
                self.summary.paths_scanned += 1;
            } else {
                warn!(path = %root.path, "Library path is not a readable directory; skipping");
            }
            self.shared.progress.paths_done.fetch_add(1, Ordering::SeqCst);
        }

        let orphans = self.submit(OrphanedTracksQuery::new())?.body().take_ids();
        if !orphans.is_empty() {
            info!(count = orphans.len(), "Removing tracks of removed paths");
            self.delete(orphans)?;
        }

        if self.summary.changed() {
            self.submit(OptimizeQuery::new())?;
        }
        Ok(())
    }

    fn apply_path_changes(&mut self) -> Result<(), IndexerError> {
        let changes = std::mem::take(&mut lock(&self.shared.control).pending_changes);
        if changes.is_empty() {
            return Ok(());
        }

        match self.submit(UpdatePathsQuery::new(changes.clone())) {
            Ok(query) => {
                if query.body().changed() > 0 {
                    self.shared.signal(Message::PathsUpdated);
                }
                Ok(())
            }
            Err(err) => {
                // Keep the changes for the next run, ahead of any queued since.
                let mut control = lock(&self.shared.control);
                let newer = std::mem::replace(&mut control.pending_changes, changes);
                control.pending_changes.extend(newer);
                Err(err)
            }
        }
    }

    fn scan_root(&mut self, root: &LibraryPath, roots: &[LibraryPath]) -> Result<(), IndexerError> {
        let shared = self.shared;
        let config = &shared.config;
        let batch_size = config.effective_batch_size();
        let mut fingerprints = self
            .submit(TrackFingerprintsQuery::new(root.id))?
            .body()
            .take_fingerprints();

        // Roots nested inside this one are scanned on their own.
        let nested: Vec<&str> = roots
            .iter()
            .filter(|other| other.id != root.id && other.path.starts_with(&root.path))
            .map(|other| other.path.as_str())
            .collect();

        let walker = WalkDir::new(&root.path)
            .follow_links(config.follow_symlinks)
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 || !entry.file_type().is_dir() {
                    return true;
                }
                let excluded = entry
                    .file_name()
                    .to_str()
                    .map_or(false, |name| config.is_excluded_dir(name));
                !excluded && !nested.contains(&with_separator(entry.path()).as_str())
            });

        let mut inserts = Vec::new();
        let mut updates = Vec::new();

        for entry in walker {
            self.checkpoint()?;
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().unwrap_or(Path::new(&root.path)).to_path_buf();
                    self.skip(IndexerError::Enumeration {
                        path,
                        message: err.to_string(),
                    });
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let accepted = entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map_or(false, |ext| config.accepts_extension(ext));
            if !accepted {
                continue;
            }

            let file = match entry.metadata() {
                Ok(metadata) => scanned_file(entry.path(), &metadata),
                Err(err) => {
                    self.skip(IndexerError::Enumeration {
                        path: entry.path().to_path_buf(),
                        message: err.to_string(),
                    });
                    continue;
                }
            };
            let Some(file) = file else {
                self.skip(IndexerError::Enumeration {
                    path: entry.path().to_path_buf(),
                    message: "path is not valid UTF-8".to_string(),
                });
                continue;
            };

            self.summary.files_scanned += 1;
            self.shared.progress.files_scanned.fetch_add(1, Ordering::SeqCst);

            // Whatever stays in `fingerprints` was not seen on disk.
            match fingerprints.remove(&file.filename) {
                None => inserts.push(file),
                Some(fingerprint) if !fingerprint.matches(&file) => {
                    updates.push((fingerprint.id, file))
                }
                Some(_) => self.summary.unchanged += 1,
            }

            if inserts.len() >= batch_size {
                self.insert(root.id, std::mem::take(&mut inserts))?;
            }
            if updates.len() >= batch_size {
                self.update(std::mem::take(&mut updates))?;
            }
        }

        if !inserts.is_empty() {
            self.insert(root.id, inserts)?;
        }
        if !updates.is_empty() {
            self.update(updates)?;
        }

        if config.remove_missing_files {
            let missing = missing_tracks(fingerprints);
            if !missing.is_empty() {
                info!(path = %root.path, count = missing.len(), "Removing missing files");
                self.delete(missing)?;
            }
        }
        Ok(())
    }

    fn skip(&mut self, err: IndexerError) {
        warn!(error = %err, "Skipping unreadable entry");
        self.summary.errors += 1;
    }

    fn insert(&mut self, path_id: i64, files: Vec<ScannedFile>) -> Result<(), IndexerError> {
        let inserted = self
            .submit(InsertTracksQuery::new(path_id, files))?
            .body()
            .inserted();
        self.refreshed(inserted);
        self.summary.inserted += inserted;
        Ok(())
    }

    fn update(&mut self, updates: Vec<(i64, ScannedFile)>) -> Result<(), IndexerError> {
        let updated = self.submit(UpdateTracksQuery::new(updates))?.body().updated();
        self.refreshed(updated);
        self.summary.updated += updated;
        Ok(())
    }

    fn delete(&mut self, ids: Vec<i64>) -> Result<(), IndexerError> {
        for chunk in ids.chunks(self.shared.config.effective_batch_size()) {
            let deleted = self
                .submit(DeleteTracksQuery::new(chunk.to_vec()))?
                .body()
                .deleted();
            self.refreshed(deleted);
            self.summary.deleted += deleted;
        }
        Ok(())
    }

    fn refreshed(&self, changed: u64) {
        if changed > 0 {
            self.shared.signal(Message::TrackRefreshed);
        }
    }
}

/// Stored tracks the walk did not see and whose file is gone.
///
/// A file that still exists but was not walked (excluded directory, changed
/// extension list, unreadable directory) keeps its track.
fn missing_tracks(unseen: HashMap<String, Fingerprint>) -> Vec<i64> {
    let mut ids: Vec<i64> = unseen
        .into_iter()
        .filter(|(filename, _)| !Path::new(filename).exists())
        .map(|(_, fingerprint)| fingerprint.id)
        .collect();
    ids.sort_unstable();
    ids
}

fn with_separator(path: &Path) -> String {
    let mut text = path.to_string_lossy().into_owned();
    if !text.ends_with(MAIN_SEPARATOR) {
        text.push(MAIN_SEPARATOR);
    }
    text
}

/// Describe a file for the track table. `None` for non UTF-8 paths.
fn scanned_file(path: &Path, metadata: &Metadata) -> Option<ScannedFile> {
    let filename = path.to_str()?.to_string();
    let directory = with_separator(path.parent()?);
    let title = path.file_stem()?.to_str()?.to_string();
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let filetime = metadata
        .modified()
        .map(|modified| chrono::DateTime::<chrono::Utc>::from(modified).timestamp())
        .unwrap_or(0);

    Some(ScannedFile {
        filename,
        directory,
        title,
        extension,
        filesize: metadata.len(),
        filetime,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use tempfile::TempDir;

    #[test]
    fn test_scanned_file_fields() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("Song Title.FLAC");
        std::fs::write(&path, b"abcd").unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(1_600_000_000, 0)).unwrap();

        let metadata = std::fs::metadata(&path).unwrap();
        let file = scanned_file(&path, &metadata).unwrap();
        assert_eq!(file.title, "Song Title");
        assert_eq!(file.extension, "flac");
        assert_eq!(file.filesize, 4);
        assert_eq!(file.filetime, 1_600_000_000);
        assert!(file.directory.ends_with(MAIN_SEPARATOR));
        assert!(file.filename.ends_with("Song Title.FLAC"));
    }

    #[test]
    fn test_missing_tracks_keeps_existing_files() {
        let temp = TempDir::new().unwrap();
        let present = temp.path().join("present.mp3");
        std::fs::write(&present, b"x").unwrap();

        let mut unseen = HashMap::new();
        let fingerprint = |id| Fingerprint {
            id,
            filesize: 1,
            filetime: 0,
        };
        unseen.insert(present.to_string_lossy().into_owned(), fingerprint(1));
        unseen.insert(
            temp.path().join("gone.mp3").to_string_lossy().into_owned(),
            fingerprint(2),
        );
        assert_eq!(missing_tracks(unseen), vec![2]);
    }
}
