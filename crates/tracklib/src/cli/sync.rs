use super::print_summary;
use anyhow::{bail, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracklib::indexer::SyncSummary;
use tracklib::library::Library;
use tracklib::router::{Message, TargetId};

const DRAIN_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub struct SyncArgs {
    pub restart: bool,
    pub json: bool,
}

pub fn run(library: &Library, args: SyncArgs) -> Result<()> {
    let summary = synchronize_and_wait(library, args.restart)?;
    print_summary(&summary, args.json)?;
    if let Some(failure) = summary.failure {
        bail!("Synchronization failed: {}", failure);
    }
    Ok(())
}

/// Request a run and drain the router until its `SynchronizeEnd` arrives.
pub fn synchronize_and_wait(library: &Library, restart: bool) -> Result<SyncSummary> {
    let finished: Arc<Mutex<Option<SyncSummary>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&finished);
    let subscription = library.router().subscribe(
        Some(TargetId::Indexer(library.id())),
        move |_, message| match message {
            Message::SynchronizeEnd(summary) => {
                if let Ok(mut slot) = slot.lock() {
                    *slot = Some(summary.clone());
                }
            }
            Message::PathsUpdated => tracing::info!("Library paths updated"),
            _ => {}
        },
    );

    library.indexer().synchronize(restart);

    let summary = loop {
        library.router().wait_and_drain(DRAIN_INTERVAL);
        let done = finished
            .lock()
            .map(|mut slot| slot.take())
            .unwrap_or(None);
        if let Some(summary) = done {
            break summary;
        }
    };
    subscription.cancel();
    Ok(summary)
}
