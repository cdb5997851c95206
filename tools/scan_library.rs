use std::env;
use std::path::PathBuf;

use library::{Library, ScanMode};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut mode = ScanMode::Incremental;
    let mut positional = Vec::new();
    for arg in env::args().skip(1) {
        if arg == "--full" {
            mode = ScanMode::Full;
        } else {
            positional.push(arg);
        }
    }
    let mut positional = positional.into_iter();
    let music_root = positional
        .next()
        .or_else(|| env::var("MUSIC_ROOT").ok())
        .ok_or("MUSIC_ROOT not set and no path argument")?;
    let index_path = positional
        .next()
        .or_else(|| env::var("INDEX_PATH").ok())
        .unwrap_or_else(|| "data/library.redb".to_string());

    let library = Library::open(PathBuf::from(&music_root), PathBuf::from(&index_path))?;
    let result = library.scan(mode)?;
    let stats = library.stats()?;

    for failure in &result.failures {
        println!("{:?}\t{}\t{}", failure.reason, failure.path, failure.detail);
    }
    println!(
        "Albums: {} added, {} updated, {} removed, {} unchanged",
        result.albums_added, result.albums_updated, result.albums_removed, result.albums_unchanged
    );
    println!(
        "Indexed: {} albums, {} tracks ({} failures)",
        stats.albums,
        stats.tracks,
        result.failures.len()
    );

    Ok(())
}
