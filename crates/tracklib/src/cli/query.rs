use anyhow::{bail, Context, Result};
use serde_json::json;
use std::sync::Arc;
use tracklib::library::Library;
use tracklib::query::{QueryOptions, QueryStatus};
use tracklib::registry::QueryRegistry;

/// Replay a serialized query request and print its result as JSON.
pub fn run(library: &Library, request: &str) -> Result<()> {
    let registry = QueryRegistry::with_builtin_queries();
    let (query, options) = registry.deserialize(request).with_context(|| {
        format!(
            "Invalid query request (known kinds: {})",
            registry.kinds().join(", ")
        )
    })?;

    library
        .dispatcher()
        .enqueue_dyn(
            Arc::clone(&query).into_dyn(),
            options | QueryOptions::SYNCHRONOUS,
            None,
        )
        .context("Failed to enqueue query")?;
    library.router().drain();

    let status = query.status();
    let output = json!({
        "kind": query.kind(),
        "status": status,
        "error": query.error(),
        "result": if status == QueryStatus::Finished { query.result_json() } else { json!(null) },
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    if status != QueryStatus::Finished {
        bail!("Query {} ended as {}", query.kind(), status);
    }
    Ok(())
}
