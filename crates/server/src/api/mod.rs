pub mod library;
pub mod scan;
pub mod stream;

use axum::{routing::get, Router};

use crate::state::AppState;

pub fn api_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/scan", get(scan::trigger_scan))
        .route("/scan/status", get(scan::scan_status))
        .route("/health", get(scan::health))
        .route("/profiles", get(stream::list_profiles))
        .route("/streams", get(stream::list_streams))
        .route("/albums", get(library::list_albums))
        .route("/albums/:album_id", get(library::get_album))
        .route("/tracks", get(library::list_tracks))
        .route("/tracks/:track_id", get(library::get_track));

    Router::new()
        .nest("/api", api)
        .route("/stream/:track_id", get(stream::stream_track))
        .route("/art/:album_id", get(library::get_album_art))
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::fs::{self, File};
    use std::io::Write;
    use std::path::Path;
    use std::sync::Arc;

    use ::library::{Library, ScanMode};
    use parking_lot::RwLock;

    use crate::config::ServerConfig;
    use crate::scan::ScanController;
    use crate::state::AppState;
    use crate::streaming::StreamEngine;

    pub fn write_wav(path: &Path, secs: u32) {
        let data_len = 8000 * secs;
        let mut header = Vec::new();
        header.extend_from_slice(b"RIFF");
        header.extend_from_slice(&(36 + data_len).to_le_bytes());
        header.extend_from_slice(b"WAVEfmt ");
        header.extend_from_slice(&16u32.to_le_bytes());
        header.extend_from_slice(&1u16.to_le_bytes());
        header.extend_from_slice(&1u16.to_le_bytes());
        header.extend_from_slice(&8000u32.to_le_bytes());
        header.extend_from_slice(&8000u32.to_le_bytes());
        header.extend_from_slice(&1u16.to_le_bytes());
        header.extend_from_slice(&8u16.to_le_bytes());
        header.extend_from_slice(b"data");
        header.extend_from_slice(&data_len.to_le_bytes());
        let mut file = File::create(path).unwrap();
        file.write_all(&header).unwrap();
        file.set_len(44 + u64::from(data_len)).unwrap();
    }

    /// One scanned album ("Band/Record": two wav tracks and a cover) served
    /// by a `/bin/sh` converter running `script`.
    pub fn scanned_state(dir: &Path, script: &str) -> AppState {
        let album = dir.join("music").join("Band").join("Record");
        fs::create_dir_all(&album).unwrap();
        write_wav(&album.join("01 - Intro.wav"), 2);
        write_wav(&album.join("02 - Outro.wav"), 3);
        fs::write(album.join("cover.png"), b"\x89PNG fake").unwrap();

        let config = ServerConfig {
            music_root: dir.join("music").to_string_lossy().to_string(),
            ffmpeg_path: "/bin/sh".to_string(),
            ffmpeg_global_args: vec![
                "-c".to_string(),
                script.to_string(),
                "converter".to_string(),
            ],
            ..ServerConfig::default()
        };
        let library = Library::open(dir.join("music"), dir.join("index.redb")).unwrap();
        library.scan(ScanMode::Full).unwrap();
        AppState {
            engine: StreamEngine::from_config(&config),
            config: Arc::new(RwLock::new(config)),
            scans: ScanController::new(library.clone()),
            library,
            watcher: Arc::new(RwLock::new(None)),
        }
    }
}
