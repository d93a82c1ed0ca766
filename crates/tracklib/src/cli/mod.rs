//! Command implementations for the `tracklib` binary.
//!
//! Every command opens the default library, runs against it and closes it.
//! The binary's main thread owns the router, so it drains completions and
//! indexer signals while it waits.

pub mod output;
pub mod paths;
pub mod query;
pub mod sync;
pub mod tracks;

use anyhow::{bail, Context, Result};
use tracklib::indexer::SyncSummary;
use tracklib::library::Library;
use tracklib::query::{Query, QueryHandle, QueryOptions, QueryStatus};

/// Run a query synchronously at high priority and fail unless it finished.
pub fn run_query<Q: Query>(library: &Library, body: Q) -> Result<QueryHandle<Q>> {
    let query = QueryHandle::new(body);
    library
        .enqueue(&query, QueryOptions::SYNCHRONOUS | QueryOptions::PRIORITIZE)
        .with_context(|| format!("Failed to enqueue {}", query.name()))?;
    library.router().drain();
    match query.status() {
        QueryStatus::Finished => Ok(query),
        status => bail!(
            "Query {} ended as {}: {}",
            query.name(),
            status,
            query.error().unwrap_or_default()
        ),
    }
}

pub fn print_summary(summary: &SyncSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    let outcome = if summary.canceled {
        "canceled"
    } else if summary.failure.is_some() {
        "failed"
    } else {
        "complete"
    };
    println!("Synchronization {} in {} ms", outcome, summary.duration_ms);
    output::print_table(
        &["Paths", "Files", "Inserted", "Updated", "Deleted", "Unchanged", "Errors"],
        vec![vec![
            summary.paths_scanned.to_string(),
            summary.files_scanned.to_string(),
            summary.inserted.to_string(),
            summary.updated.to_string(),
            summary.deleted.to_string(),
            summary.unchanged.to_string(),
            summary.errors.to_string(),
        ]],
    );
    if let Some(failure) = &summary.failure {
        eprintln!("Error: {}", failure);
    }
    Ok(())
}
