use super::{print_summary, sync::synchronize_and_wait};
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tracklib::library::Library;

pub fn list(library: &Library, json: bool) -> Result<()> {
    let paths = library
        .indexer()
        .get_paths()
        .context("Failed to read library paths")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&paths)?);
    } else if paths.is_empty() {
        println!("No library paths. Add one with: tracklib add-path <dir>");
    } else {
        for path in paths {
            println!("{}", path);
        }
    }
    Ok(())
}

#[derive(Debug)]
pub struct PathArgs {
    pub path: PathBuf,
    pub json: bool,
}

/// Add a root and synchronize, which also persists the change.
pub fn add(library: &Library, args: PathArgs) -> Result<()> {
    if !args.path.is_dir() {
        bail!("Not a directory: {}", args.path.display());
    }
    let normalized = library.indexer().add_path(&args.path);
    println!("Added {}", normalized);
    let summary = synchronize_and_wait(library, false)?;
    print_summary(&summary, args.json)
}

pub fn remove(library: &Library, args: PathArgs) -> Result<()> {
    let normalized = library.indexer().remove_path(&args.path);
    println!("Removed {}", normalized);
    let summary = synchronize_and_wait(library, false)?;
    print_summary(&summary, args.json)
}
