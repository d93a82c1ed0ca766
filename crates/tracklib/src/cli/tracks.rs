use super::output::{format_size, format_timestamp, print_table};
use super::run_query;
use anyhow::Result;
use tracklib::library::Library;
use tracklib::queries::TrackListQuery;

#[derive(Debug)]
pub struct TracksArgs {
    pub filter: Option<String>,
    pub limit: u32,
    pub offset: u32,
    pub json: bool,
}

pub fn run(library: &Library, args: TracksArgs) -> Result<()> {
    let query = run_query(
        library,
        TrackListQuery::new(args.filter, Some(args.limit), args.offset),
    )?;
    let tracks = query.body().tracks();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&tracks)?);
        return Ok(());
    }
    if tracks.is_empty() {
        println!("No tracks found.");
        return Ok(());
    }

    let count = tracks.len();
    let rows = tracks
        .into_iter()
        .map(|track| {
            vec![
                track.title,
                track.extension,
                format_size(track.filesize),
                format_timestamp(track.filetime),
                track.directory,
            ]
        })
        .collect();
    print_table(&["Title", "Type", "Size", "Modified", "Directory"], rows);
    println!("{} track(s)", count);
    Ok(())
}
