//! Indexer synchronization against a real directory tree.

use filetime::FileTime;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracklib::queries::{external_id, TrackByExternalIdQuery, TrackCountQuery, TrackListQuery};
use tracklib::{
    IndexerConfig, IndexerState, Library, LibraryId, Message, MessageRouter, Query, QueryError,
    QueryHandle, QueryOptions, RunContext, Subscription, SyncSummary, TargetId,
};
use tracklib_db::DbConnection;

const LIBRARY: LibraryId = LibraryId(1);

/// Occupies the dispatcher until released, stalling the indexer's next query.
struct Hold {
    release: Arc<AtomicBool>,
}

impl Query for Hold {
    fn name(&self) -> &'static str {
        "hold"
    }

    fn on_run(&self, _db: &DbConnection, _ctx: &RunContext<'_>) -> Result<bool, QueryError> {
        while !self.release.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(2));
        }
        Ok(true)
    }
}

fn wait_for(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out");
        thread::sleep(Duration::from_millis(1));
    }
}

struct Harness {
    _temp: TempDir,
    music: PathBuf,
    router: MessageRouter,
    library: Library,
    events: Arc<Mutex<Vec<(TargetId, Message)>>>,
    _subscription: Subscription,
}

impl Harness {
    fn new(config: IndexerConfig) -> Self {
        let temp = TempDir::new().unwrap();
        let music = temp.path().join("music");
        fs::create_dir_all(&music).unwrap();

        let router = MessageRouter::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let subscription = router.subscribe(None, move |target, message| {
            sink.lock().unwrap().push((target, message.clone()));
        });

        let db = DbConnection::open_in_memory().unwrap();
        let library =
            Library::open_with_store(LIBRARY, "Test", db, &config, router.clone()).unwrap();
        Self {
            _temp: temp,
            music,
            router,
            library,
            events,
            _subscription: subscription,
        }
    }

    fn manual() -> Self {
        Self::new(IndexerConfig {
            sync_on_path_change: false,
            ..IndexerConfig::default()
        })
    }

    fn write(&self, relative: &str, contents: &[u8], mtime: i64) -> PathBuf {
        let path = self.music.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(mtime, 0)).unwrap();
        path
    }

    fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    /// Drain until `count` runs have ended and return their summaries.
    fn wait_for_sync_ends(&self, count: usize) -> Vec<SyncSummary> {
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            self.router.wait_and_drain(Duration::from_millis(20));
            let ends: Vec<SyncSummary> = self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(_, message)| match message {
                    Message::SynchronizeEnd(summary) => Some(summary.clone()),
                    _ => None,
                })
                .collect();
            if ends.len() >= count {
                return ends;
            }
            assert!(Instant::now() < deadline, "synchronization did not finish");
        }
    }

    /// Drain until the next `SynchronizeEnd` and return its summary.
    fn wait_for_sync_end(&self) -> SyncSummary {
        self.wait_for_sync_ends(1).remove(0)
    }

    /// Park the dispatcher on a query that runs until the returned flag is set.
    fn hold_dispatcher(&self) -> Arc<AtomicBool> {
        let release = Arc::new(AtomicBool::new(false));
        let hold = QueryHandle::new(Hold {
            release: Arc::clone(&release),
        });
        self.library.enqueue(&hold, QueryOptions::empty()).unwrap();
        wait_for(|| self.library.dispatcher().running().is_some());
        release
    }

    fn sync(&self) -> SyncSummary {
        self.clear_events();
        self.library.indexer().synchronize(false);
        self.wait_for_sync_end()
    }

    fn completions_named(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(target, message)| {
                *target == TargetId::Library(LIBRARY)
                    && matches!(message, Message::QueryCompleted(done) if done.name == name)
            })
            .count()
    }

    fn signals(&self, kind: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(target, message)| {
                *target == TargetId::Indexer(LIBRARY) && message.kind() == kind
            })
            .count()
    }

    fn track_count(&self) -> u64 {
        let query = QueryHandle::new(TrackCountQuery::new(None));
        self.library
            .enqueue(&query, QueryOptions::SYNCHRONOUS)
            .unwrap();
        query.body().count()
    }

    fn has_track(&self, path: &Path) -> bool {
        let canonical = path.canonicalize().unwrap();
        let query = QueryHandle::new(TrackByExternalIdQuery::new(external_id(
            canonical.to_str().unwrap(),
        )));
        self.library
            .enqueue(&query, QueryOptions::SYNCHRONOUS)
            .unwrap();
        query.body().track().is_some()
    }

    fn titles(&self) -> Vec<String> {
        let query = QueryHandle::new(TrackListQuery::new(None, None, 0));
        self.library
            .enqueue(&query, QueryOptions::SYNCHRONOUS)
            .unwrap();
        query.body().tracks().into_iter().map(|t| t.title).collect()
    }
}

fn normalized(path: &Path) -> String {
    tracklib::indexer::normalize_path(path)
}

#[test]
fn test_add_path_with_one_file_inserts_once() {
    let harness = Harness::manual();
    harness.write("Artist/Song.mp3", b"id3", 1_700_000_000);
    harness.library.indexer().add_path(&harness.music);

    let summary = harness.sync();
    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.files_scanned, 1);
    assert!(summary.failure.is_none());
    assert!(!summary.canceled);

    assert_eq!(harness.completions_named("insert_tracks"), 1);
    assert_eq!(harness.signals("track_refreshed"), 1);
    assert_eq!(harness.signals("paths_updated"), 1);
    assert_eq!(harness.signals("synchronize_start"), 1);
    assert_eq!(harness.titles(), vec!["Song"]);
    assert_eq!(harness.library.indexer().state(), IndexerState::Idle);
}

#[test]
fn test_resync_unchanged_tree_is_idempotent() {
    let harness = Harness::manual();
    harness.write("a.flac", b"aaaa", 1_700_000_000);
    harness.write("b.flac", b"bbbb", 1_700_000_000);
    harness.library.indexer().add_path(&harness.music);
    assert_eq!(harness.sync().inserted, 2);

    let summary = harness.sync();
    assert_eq!(summary.unchanged, 2);
    assert!(!summary.changed());
    for name in ["insert_tracks", "update_tracks", "delete_tracks", "optimize"] {
        assert_eq!(harness.completions_named(name), 0, "{name} ran");
    }
    assert_eq!(harness.signals("track_refreshed"), 0);
}

#[test]
fn test_modified_file_is_updated() {
    let harness = Harness::manual();
    let path = harness.write("a.ogg", b"short", 1_700_000_000);
    harness.library.indexer().add_path(&harness.music);
    harness.sync();

    fs::write(&path, b"much longer contents").unwrap();
    filetime::set_file_mtime(&path, FileTime::from_unix_time(1_700_000_500, 0)).unwrap();
    let summary = harness.sync();
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.inserted, 0);
    assert_eq!(harness.completions_named("update_tracks"), 1);
}

#[test]
fn test_missing_file_is_deleted() {
    let harness = Harness::manual();
    let gone = harness.write("gone.mp3", b"x", 1_700_000_000);
    harness.write("kept.mp3", b"y", 1_700_000_000);
    harness.library.indexer().add_path(&harness.music);
    harness.sync();
    assert_eq!(harness.track_count(), 2);

    fs::remove_file(&gone).unwrap();
    let summary = harness.sync();
    assert_eq!(summary.deleted, 1);
    assert_eq!(harness.titles(), vec!["kept"]);
}

#[test]
fn test_missing_files_kept_when_removal_disabled() {
    let harness = Harness::new(IndexerConfig {
        sync_on_path_change: false,
        remove_missing_files: false,
        ..IndexerConfig::default()
    });
    let gone = harness.write("gone.mp3", b"x", 1_700_000_000);
    harness.library.indexer().add_path(&harness.music);
    harness.sync();

    fs::remove_file(&gone).unwrap();
    assert_eq!(harness.sync().deleted, 0);
    assert_eq!(harness.track_count(), 1);
}

#[test]
fn test_filters_extensions_and_excluded_dirs() {
    let harness = Harness::manual();
    harness.write("keep.wav", b"x", 1_700_000_000);
    harness.write("notes.txt", b"x", 1_700_000_000);
    harness.write(".git/hidden.mp3", b"x", 1_700_000_000);
    harness.library.indexer().add_path(&harness.music);

    let summary = harness.sync();
    assert_eq!(summary.inserted, 1);
    assert_eq!(harness.titles(), vec!["keep"]);
}

#[test]
fn test_removed_root_prunes_tracks() {
    let harness = Harness::manual();
    harness.write("a.mp3", b"x", 1_700_000_000);
    let indexer = harness.library.indexer();
    indexer.add_path(&harness.music);
    harness.sync();
    assert_eq!(harness.track_count(), 1);

    indexer.remove_path(&harness.music);
    let summary = harness.sync();
    assert_eq!(summary.deleted, 1);
    assert_eq!(harness.track_count(), 0);
    assert!(indexer.get_paths().unwrap().is_empty());
}

#[test]
fn test_get_paths_includes_queued_changes() {
    let harness = Harness::manual();
    let indexer = harness.library.indexer();
    let added = indexer.add_path(&harness.music);
    assert_eq!(added, normalized(&harness.music));
    assert!(added.ends_with(std::path::MAIN_SEPARATOR));

    // Not yet persisted, but visible.
    assert_eq!(indexer.get_paths().unwrap(), vec![added.clone()]);
    harness.sync();
    assert_eq!(indexer.get_paths().unwrap(), vec![added]);
}

#[test]
fn test_path_change_triggers_sync_when_configured() {
    let harness = Harness::new(IndexerConfig::default());
    harness.write("a.mp3", b"x", 1_700_000_000);
    harness.library.indexer().add_path(&harness.music);

    let summary = harness.wait_for_sync_end();
    assert_eq!(summary.inserted, 1);
    assert!(harness.has_track(&harness.music.join("a.mp3")));
}

#[test]
fn test_stop_cancels_run() {
    let harness = Harness::manual();
    harness.write("a.mp3", b"x", 1_700_000_000);
    harness.write("b.mp3", b"y", 1_700_000_000);
    let indexer = harness.library.indexer();
    indexer.add_path(&harness.music);

    let release = harness.hold_dispatcher();
    indexer.synchronize(false);
    wait_for(|| indexer.state() == IndexerState::Synchronizing);
    indexer.stop();
    release.store(true, Ordering::SeqCst);

    let summary = harness.wait_for_sync_end();
    assert!(summary.canceled);
    assert!(summary.failure.is_none());
    assert_eq!(summary.inserted, 0);
    assert_eq!(harness.track_count(), 0);
    assert_eq!(indexer.state(), IndexerState::Idle);

    // A stopped run leaves nothing behind; the next one indexes everything.
    let summary = harness.sync();
    assert!(!summary.canceled);
    assert_eq!(summary.inserted, 2);
}

#[test]
fn test_restart_reruns() {
    let harness = Harness::manual();
    for index in 0..5 {
        harness.write(&format!("track-{index}.flac"), b"x", 1_700_000_000);
    }
    let indexer = harness.library.indexer();
    indexer.add_path(&harness.music);

    let release = harness.hold_dispatcher();
    indexer.synchronize(false);
    wait_for(|| indexer.state() == IndexerState::Synchronizing);
    indexer.synchronize(true);
    release.store(true, Ordering::SeqCst);

    let ends = harness.wait_for_sync_ends(2);
    assert!(ends[0].canceled);
    assert_eq!(ends[0].inserted, 0);
    assert!(!ends[1].canceled);
    assert!(ends[1].failure.is_none());
    assert_eq!(ends[1].inserted, 5);
    assert_eq!(harness.signals("synchronize_start"), 2);
    assert_eq!(harness.track_count(), 5);
}

#[test]
fn test_store_failure_still_ends() {
    let harness = Harness::manual();
    harness.write("a.mp3", b"x", 1_700_000_000);
    let indexer = harness.library.indexer();
    indexer.add_path(&harness.music);
    assert_eq!(harness.sync().inserted, 1);

    harness.library.db().execute("DROP TABLE tracks").unwrap();
    let summary = harness.sync();
    let failure = summary.failure.expect("run should report the failure");
    assert!(failure.contains("track_fingerprints"), "{failure}");
    assert!(!summary.canceled);
    assert_eq!(indexer.state(), IndexerState::Idle);
}

#[cfg(unix)]
#[test]
fn test_non_utf8_file_name_is_counted_and_skipped() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let harness = Harness::manual();
    harness.write("good.mp3", b"x", 1_700_000_000);
    let bad = harness.music.join(OsStr::from_bytes(b"bad-\xff.mp3"));
    fs::write(&bad, b"x").unwrap();
    harness.library.indexer().add_path(&harness.music);

    let summary = harness.sync();
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.inserted, 1);
    assert!(summary.failure.is_none());
    assert_eq!(harness.titles(), vec!["good"]);
}

#[cfg(unix)]
#[test]
fn test_unreadable_dir_is_skipped() {
    use std::os::unix::fs::PermissionsExt;

    let harness = Harness::manual();
    harness.write("open.mp3", b"x", 1_700_000_000);
    harness.write("locked/hidden.mp3", b"x", 1_700_000_000);
    let locked = harness.music.join("locked");
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
    // Privileged users read through mode 000.
    let enforced = fs::read_dir(&locked).is_err();
    harness.library.indexer().add_path(&harness.music);

    let summary = harness.sync();
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

    assert!(summary.failure.is_none());
    assert!(harness.titles().contains(&"open".to_string()));
    if enforced {
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.inserted, 1);
    } else {
        assert_eq!(summary.errors, 0);
        assert_eq!(summary.inserted, 2);
    }
}
