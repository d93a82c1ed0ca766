//! Library lifecycle and query replay.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracklib::queries::{
    external_id, InsertTracksQuery, ListPathsQuery, PathChange, ScannedFile,
    TrackByExternalIdQuery, TrackCountQuery, TrackListQuery, UpdatePathsQuery,
};
use tracklib::{
    DbConnection, IndexerConfig, Library, LibraryId, LibraryRegistry, MessageRouter, Priority,
    Query, QueryError, QueryHandle, QueryOptions, QueryRegistry, QueryStatus, RunContext,
    SerializableQuery, TracklibConfig,
};

struct Hold {
    started: Arc<AtomicBool>,
    release: Arc<AtomicBool>,
}

impl Query for Hold {
    fn name(&self) -> &'static str {
        "hold"
    }

    fn on_run(&self, _db: &DbConnection, _ctx: &RunContext<'_>) -> Result<bool, QueryError> {
        self.started.store(true, Ordering::SeqCst);
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

fn memory_library(router: MessageRouter) -> Library {
    let db = DbConnection::open_in_memory().unwrap();
    Library::open_with_store(LibraryId(1), "Test", db, &IndexerConfig::default(), router).unwrap()
}

#[test]
fn test_close_delivers_n_canceled_callbacks() {
    const QUEUED: usize = 5;
    let router = MessageRouter::new();
    let library = memory_library(router.clone());

    let started = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let hold = QueryHandle::new(Hold {
        started: Arc::clone(&started),
        release: Arc::clone(&release),
    });
    library.enqueue(&hold, QueryOptions::empty()).unwrap();
    wait_for(|| started.load(Ordering::SeqCst));

    let canceled = Arc::new(AtomicUsize::new(0));
    let queued: Vec<_> = (0..QUEUED)
        .map(|_| {
            let query = QueryHandle::new(TrackCountQuery::new(None));
            let canceled = Arc::clone(&canceled);
            library
                .enqueue_with(&query, QueryOptions::empty(), Priority::Normal, move |q| {
                    if q.status() == QueryStatus::Canceled {
                        canceled.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .unwrap();
            query
        })
        .collect();

    let dispatcher = library.dispatcher().clone();
    let releaser = thread::spawn(move || {
        wait_for(|| dispatcher.is_closing());
        release.store(true, Ordering::SeqCst);
    });

    library.close().unwrap();
    releaser.join().unwrap();

    assert_eq!(canceled.load(Ordering::SeqCst), QUEUED);
    assert!(queued.iter().all(|q| q.status() == QueryStatus::Canceled));
    assert_eq!(hold.status(), QueryStatus::Finished);
    assert!(!library.db().is_open());
    assert_eq!(router.pending(), 0);
}

#[test]
fn test_enqueue_after_close_fails() {
    let library = memory_library(MessageRouter::new());
    library.close().unwrap();
    let query = QueryHandle::new(TrackCountQuery::new(None));
    assert!(library.enqueue(&query, QueryOptions::empty()).is_err());
}

fn seed(library: &Library) {
    let paths = QueryHandle::new(UpdatePathsQuery::new(vec![PathChange::Add(
        "/music/".to_string(),
    )]));
    library.enqueue(&paths, QueryOptions::SYNCHRONOUS).unwrap();
    let files = ["intro", "live at home", "outro"]
        .iter()
        .enumerate()
        .map(|(index, title)| ScannedFile {
            filename: format!("/music/{}.mp3", title),
            directory: "/music/".to_string(),
            title: title.to_string(),
            extension: "mp3".to_string(),
            filesize: 1000 + index as u64,
            filetime: 1_700_000_000,
        })
        .collect();
    let insert = QueryHandle::new(InsertTracksQuery::new(1, files));
    library.enqueue(&insert, QueryOptions::SYNCHRONOUS).unwrap();
    assert_eq!(insert.status(), QueryStatus::Finished);
}

/// Run `original` directly and its replayed copy through the registry;
/// both must produce the same result.
fn assert_replay_matches<Q: SerializableQuery>(library: &Library, original: Q) {
    let registry = QueryRegistry::with_builtin_queries();
    let original = QueryHandle::new(original);
    let text = registry
        .serialize(&original, QueryOptions::PRIORITIZE)
        .unwrap();

    library.enqueue(&original, QueryOptions::SYNCHRONOUS).unwrap();
    assert_eq!(original.status(), QueryStatus::Finished);

    let (replayed, options) = registry.deserialize(&text).unwrap();
    assert_eq!(options, QueryOptions::PRIORITIZE);
    library
        .dispatcher()
        .enqueue_dyn(
            Arc::clone(&replayed).into_dyn(),
            options | QueryOptions::SYNCHRONOUS,
            None,
        )
        .unwrap();
    assert_eq!(replayed.status(), QueryStatus::Finished);
    assert_eq!(replayed.result_json(), original.body().result_json());
}

#[test]
fn test_every_registered_kind_replays_to_the_same_result() {
    let library = memory_library(MessageRouter::new());
    seed(&library);

    for kind in QueryRegistry::with_builtin_queries().kinds() {
        match kind {
            "list_paths" => assert_replay_matches(&library, ListPathsQuery::new()),
            "track_count" => {
                assert_replay_matches(&library, TrackCountQuery::new(None));
                assert_replay_matches(&library, TrackCountQuery::new(Some(1)));
            }
            "track_list" => {
                assert_replay_matches(
                    &library,
                    TrackListQuery::new(Some("live".into()), Some(10), 0),
                );
                assert_replay_matches(&library, TrackListQuery::new(None, Some(2), 1));
            }
            "track_by_external_id" => assert_replay_matches(
                &library,
                TrackByExternalIdQuery::new(external_id("/music/intro.mp3")),
            ),
            other => panic!("no replay case for registered kind {other}"),
        }
    }

    let count = QueryHandle::new(TrackCountQuery::new(None));
    library.enqueue(&count, QueryOptions::SYNCHRONOUS).unwrap();
    assert_eq!(count.body().count(), 3);
    library.close().unwrap();
}

#[test]
fn test_registry_reopens_persisted_library() {
    let temp = TempDir::new().unwrap();
    let config = TracklibConfig {
        data_dir: temp.path().to_path_buf(),
        ..TracklibConfig::default()
    };

    {
        let mut registry = LibraryRegistry::new(config.clone(), MessageRouter::new());
        let library = registry.default_library().unwrap();
        seed(&library);
        registry.close_all().unwrap();
    }

    let mut registry = LibraryRegistry::new(config, MessageRouter::new());
    let library = registry.default_library().unwrap();
    let count = QueryHandle::new(TrackCountQuery::new(None));
    library.enqueue(&count, QueryOptions::SYNCHRONOUS).unwrap();
    assert_eq!(count.body().count(), 3);
    registry.close_all().unwrap();
}
