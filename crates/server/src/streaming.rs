use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use common::{join_relpath, Track};
use futures_util::stream::{self, BoxStream, StreamExt};
use library::{Library, LibraryError};
use tokio::process::ChildStdout;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::stream_sessions::{SessionInfo, StreamSessions, StreamState};
use crate::transcode::{build_args, find_preset, ConversionProcess, ConversionRequest, Preset};
use crate::utils::json_error_code;

const CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug)]
pub enum StreamError {
    TrackNotFound(String),
    SourceMissing(String),
    UnknownPreset(String),
    InvalidSeek(String),
    ConverterUnavailable(String),
    ConversionFailed(String),
    Library(LibraryError),
}

impl StreamError {
    pub fn status(&self) -> StatusCode {
        match self {
            StreamError::TrackNotFound(_) => StatusCode::NOT_FOUND,
            StreamError::SourceMissing(_) => StatusCode::GONE,
            StreamError::UnknownPreset(_) | StreamError::InvalidSeek(_) => StatusCode::BAD_REQUEST,
            StreamError::ConverterUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            StreamError::ConversionFailed(_) => StatusCode::BAD_GATEWAY,
            StreamError::Library(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            StreamError::TrackNotFound(_) => "track_not_found",
            StreamError::SourceMissing(_) => "source_missing",
            StreamError::UnknownPreset(_) => "unknown_preset",
            StreamError::InvalidSeek(_) => "invalid_seek",
            StreamError::ConverterUnavailable(_) => "converter_unavailable",
            StreamError::ConversionFailed(_) => "conversion_failed",
            StreamError::Library(_) => "library_error",
        }
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::TrackNotFound(id) => write!(f, "track not found: {}", id),
            StreamError::SourceMissing(path) => write!(f, "source file missing: {}", path),
            StreamError::UnknownPreset(name) => write!(f, "unknown quality preset: {}", name),
            StreamError::InvalidSeek(detail) => write!(f, "invalid seek: {}", detail),
            StreamError::ConverterUnavailable(detail) => {
                write!(f, "converter unavailable: {}", detail)
            }
            StreamError::ConversionFailed(detail) => write!(f, "conversion failed: {}", detail),
            StreamError::Library(err) => write!(f, "library error: {}", err),
        }
    }
}

impl std::error::Error for StreamError {}

impl From<LibraryError> for StreamError {
    fn from(err: LibraryError) -> Self {
        StreamError::Library(err)
    }
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        json_error_code(self.status(), self.code(), self.to_string())
    }
}

/// The part of a source file one stream plays.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceWindow {
    pub path: PathBuf,
    pub start_secs: f64,
    /// `None` plays to the end of the file.
    pub length_secs: Option<f64>,
}

/// Maps a seek into the logical track onto the underlying file.
pub fn resolve_window(
    track: &Track,
    root: &Path,
    seek_secs: f64,
) -> Result<SourceWindow, StreamError> {
    if !seek_secs.is_finite() || seek_secs < 0.0 {
        return Err(StreamError::InvalidSeek(format!(
            "{} is not a non-negative number of seconds",
            seek_secs
        )));
    }
    if let Some(duration) = track.duration_secs {
        if seek_secs >= duration {
            return Err(StreamError::InvalidSeek(format!(
                "{:.3}s is past the end of a {:.3}s track",
                seek_secs, duration
            )));
        }
    }

    let path = join_relpath(root, &track.file_relpath);
    if !path.is_file() {
        return Err(StreamError::SourceMissing(track.file_relpath.clone()));
    }

    let window = match &track.segment {
        Some(segment) => {
            let start_secs = segment.start_secs + seek_secs;
            SourceWindow {
                path,
                start_secs,
                length_secs: segment.end_secs.map(|end| end - start_secs),
            }
        }
        None => SourceWindow {
            path,
            start_secs: seek_secs,
            length_secs: None,
        },
    };
    Ok(window)
}

pub struct OpenedStream {
    pub session_id: String,
    pub preset: &'static Preset,
    pub window: SourceWindow,
    pub body: BoxStream<'static, Result<Bytes, io::Error>>,
}

#[derive(Clone)]
pub struct StreamEngine {
    program: Arc<str>,
    global_args: Arc<[String]>,
    buffer_chunks: usize,
    sessions: StreamSessions,
}

impl StreamEngine {
    pub fn new(program: &str, global_args: &[String], buffer_chunks: usize) -> Self {
        Self {
            program: Arc::from(program),
            global_args: Arc::from(global_args.to_vec()),
            buffer_chunks: buffer_chunks.max(1),
            sessions: StreamSessions::new(),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            &config.ffmpeg_path,
            &config.ffmpeg_global_args,
            config.stream_buffer_chunks,
        )
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.list()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Starts one converter for `track_id` at `seek_secs` and waits for its
    /// first output. A request naming a live `session` replaces it: the old
    /// process is terminated before the new one is spawned.
    pub async fn open_stream(
        &self,
        library: &Library,
        track_id: &str,
        quality: &str,
        seek_secs: f64,
        session: Option<String>,
    ) -> Result<OpenedStream, StreamError> {
        let preset =
            find_preset(quality).ok_or_else(|| StreamError::UnknownPreset(quality.to_string()))?;
        let track = library
            .get_track(track_id)?
            .ok_or_else(|| StreamError::TrackNotFound(track_id.to_string()))?;
        let window = resolve_window(&track, library.root(), seek_secs)?;
        let passthrough = preset.allows_passthrough(&track);
        let args = build_args(
            &self.global_args,
            &ConversionRequest {
                source: &window.path,
                start_secs: window.start_secs,
                length_secs: window.length_secs,
                preset,
                passthrough,
            },
        );

        let claim = self.sessions.claim(session, track_id, preset.name).await;
        let session_id = claim.id.clone();
        let generation = claim.generation;

        let mut process = match ConversionProcess::spawn(&self.program, &args) {
            Ok(process) => process,
            Err(err) => {
                self.sessions
                    .finish(&session_id, generation, StreamState::Failed);
                warn!("Failed to start converter {}: {}", self.program, err);
                return Err(StreamError::ConverterUnavailable(format!(
                    "{}: {}",
                    self.program, err
                )));
            }
        };
        let stdout = match process.take_stdout() {
            Some(stdout) => stdout,
            None => {
                process.terminate().await;
                self.sessions
                    .finish(&session_id, generation, StreamState::Failed);
                return Err(StreamError::ConversionFailed(
                    "converter stdout unavailable".to_string(),
                ));
            }
        };
        info!(
            "Stream {} started: track {} preset {} from {:.3}s{}",
            session_id,
            track_id,
            preset.name,
            window.start_secs,
            if passthrough { " (copy)" } else { "" }
        );

        let (tx, mut rx) = mpsc::channel::<Result<Bytes, io::Error>>(self.buffer_chunks);
        tokio::spawn(pump_output(Pump {
            process,
            stdout,
            tx,
            cancel: claim.cancel,
            release: claim.release,
            sessions: self.sessions.clone(),
            session_id: session_id.clone(),
            generation,
        }));

        let body = match rx.recv().await {
            Some(Ok(first)) => stream::once(async move { Ok::<Bytes, io::Error>(first) })
                .chain(ReceiverStream::new(rx))
                .boxed(),
            Some(Err(err)) => return Err(StreamError::ConversionFailed(err.to_string())),
            None => stream::empty().boxed(),
        };

        Ok(OpenedStream {
            session_id,
            preset,
            window,
            body,
        })
    }
}

struct Pump {
    process: ConversionProcess,
    stdout: ChildStdout,
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    cancel: CancellationToken,
    release: DropGuard,
    sessions: StreamSessions,
    session_id: String,
    generation: u64,
}

enum PumpEnd {
    Eof,
    Superseded,
    Disconnected,
    ReadError(io::Error),
}

/// Moves converter output into the bounded channel. A slow client fills the
/// channel, which stops reads, which fills the pipe and stalls the converter.
async fn pump_output(pump: Pump) {
    let Pump {
        mut process,
        stdout,
        tx,
        cancel,
        release,
        sessions,
        session_id,
        generation,
    } = pump;
    let mut reader = ReaderStream::with_capacity(stdout, CHUNK_SIZE);
    let mut streaming = false;

    let end = loop {
        tokio::select! {
            _ = cancel.cancelled() => break PumpEnd::Superseded,
            _ = tx.closed() => break PumpEnd::Disconnected,
            chunk = reader.next() => match chunk {
                Some(Ok(bytes)) => {
                    if !streaming {
                        streaming = true;
                        sessions.transition(&session_id, generation, StreamState::Streaming);
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break PumpEnd::Superseded,
                        sent = tx.send(Ok(bytes)) => {
                            if sent.is_err() {
                                break PumpEnd::Disconnected;
                            }
                        }
                    }
                }
                Some(Err(err)) => break PumpEnd::ReadError(err),
                None => break PumpEnd::Eof,
            },
        }
    };

    let state = match end {
        PumpEnd::Superseded => {
            process.terminate().await;
            StreamState::Superseded
        }
        PumpEnd::Disconnected => {
            process.terminate().await;
            info!("Stream {} client disconnected", session_id);
            StreamState::Disconnected
        }
        PumpEnd::ReadError(err) => {
            process.terminate().await;
            warn!("Stream {} read error: {}", session_id, err);
            let _ = tx.send(Err(err)).await;
            StreamState::Failed
        }
        PumpEnd::Eof => match process.wait().await {
            Ok(status) if status.success() => StreamState::Ended,
            Ok(status) => {
                let tail = process.stderr_tail().await;
                warn!("Stream {} converter exited with {}: {}", session_id, status, tail);
                let message = if tail.is_empty() {
                    format!("converter exited with {}", status)
                } else {
                    format!("converter exited with {}: {}", status, tail)
                };
                let _ = tx.send(Err(io::Error::new(io::ErrorKind::Other, message))).await;
                StreamState::Failed
            }
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                StreamState::Failed
            }
        },
    };

    debug!("Stream {} finished as {:?}", session_id, state);
    sessions.finish(&session_id, generation, state);
    drop(release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{stable_id, AudioFormat, SegmentRef};
    use futures_util::StreamExt;
    use library::ScanMode;
    use std::fs::{self, File};
    use std::io::Write;
    use std::time::Duration;

    const SHEET: &str = "TITLE \"Disc\"\nFILE \"disc.wav\" WAVE\nTRACK 01 AUDIO\nINDEX 01 00:00:00\nTRACK 02 AUDIO\nINDEX 01 05:00:00\nTRACK 03 AUDIO\nINDEX 01 10:20:00\n";

    fn write_wav(path: &Path, secs: u32) {
        let data_len = 8000 * secs;
        let mut file = File::create(path).unwrap();
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
        file.write_all(&header).unwrap();
        file.set_len(44 + u64::from(data_len)).unwrap();
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        library: Library,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let album = dir.path().join("music").join("Disc");
        fs::create_dir_all(&album).unwrap();
        write_wav(&album.join("disc.wav"), 900);
        fs::write(album.join("disc.cue"), SHEET).unwrap();
        write_wav(&album.join("bonus.wav"), 5);
        let library =
            Library::open(dir.path().join("music"), dir.path().join("index.redb")).unwrap();
        library.scan(ScanMode::Full).unwrap();
        Fixture { _dir: dir, library }
    }

    fn shell(script: &str) -> StreamEngine {
        StreamEngine::new(
            "/bin/sh",
            &["-c".to_string(), script.to_string(), "converter".to_string()],
            4,
        )
    }

    fn segment_id(no: u16) -> String {
        stable_id(&common::Track::segment_key("Disc/disc.wav", no))
    }

    async fn collect(mut body: BoxStream<'static, Result<Bytes, io::Error>>) -> (Vec<u8>, bool) {
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => out.extend_from_slice(&bytes),
                Err(_) => return (out, true),
            }
        }
        (out, false)
    }

    async fn wait_for_no_sessions(engine: &StreamEngine) {
        for _ in 0..500 {
            if engine.active_sessions() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sessions still active: {:?}", engine.sessions());
    }

    fn plain_track(duration: Option<f64>) -> Track {
        Track {
            id: "p".to_string(),
            album_id: "a".to_string(),
            source_key: "Disc/bonus.wav".to_string(),
            file_relpath: "Disc/bonus.wav".to_string(),
            title: "Bonus".to_string(),
            artist: None,
            duration_secs: duration,
            track_no: 1,
            disc_no: None,
            format: AudioFormat::Wav,
            bitrate_kbps: Some(64),
            segment: None,
        }
    }

    #[test]
    fn windows_offset_segments_and_plain_files() {
        let fx = fixture();
        let root = fx.library.root();

        let plain = resolve_window(&plain_track(Some(5.0)), root, 2.5).unwrap();
        assert_eq!(plain.start_secs, 2.5);
        assert_eq!(plain.length_secs, None);

        let mut segment = plain_track(Some(320.0));
        segment.file_relpath = "Disc/disc.wav".to_string();
        segment.segment = Some(SegmentRef {
            start_secs: 300.0,
            end_secs: Some(620.0),
        });
        let window = resolve_window(&segment, root, 10.0).unwrap();
        assert_eq!(window.start_secs, 310.0);
        assert_eq!(window.length_secs, Some(310.0));

        segment.segment = Some(SegmentRef {
            start_secs: 620.0,
            end_secs: None,
        });
        segment.duration_secs = None;
        let open = resolve_window(&segment, root, 0.0).unwrap();
        assert_eq!(open.length_secs, None);
    }

    #[test]
    fn bad_seeks_and_missing_sources_are_distinct() {
        let fx = fixture();
        let root = fx.library.root();
        let track = plain_track(Some(5.0));
        assert!(matches!(
            resolve_window(&track, root, -1.0),
            Err(StreamError::InvalidSeek(_))
        ));
        assert!(matches!(
            resolve_window(&track, root, f64::NAN),
            Err(StreamError::InvalidSeek(_))
        ));
        assert!(matches!(
            resolve_window(&track, root, 5.0),
            Err(StreamError::InvalidSeek(_))
        ));

        let mut gone = plain_track(None);
        gone.file_relpath = "Disc/deleted.wav".to_string();
        assert!(matches!(
            resolve_window(&gone, root, 0.0),
            Err(StreamError::SourceMissing(_))
        ));
    }

    #[tokio::test]
    async fn seek_into_second_cue_track_cuts_exact_window() {
        let fx = fixture();
        let engine = shell("echo \"$@\"");
        let opened = engine
            .open_stream(&fx.library, &segment_id(2), "mp3_192", 10.0, None)
            .await
            .unwrap();
        assert_eq!(opened.window.start_secs, 310.0);
        assert_eq!(opened.window.length_secs, Some(310.0));

        let (bytes, failed) = collect(opened.body).await;
        assert!(!failed);
        let echoed = String::from_utf8(bytes).unwrap();
        assert!(echoed.contains("-ss 310.000 -i"), "{}", echoed);
        assert!(echoed.contains("disc.wav -t 310.000"), "{}", echoed);
        assert!(echoed.contains("-c:a libmp3lame -b:a 192k -f mp3 pipe:1"));
        wait_for_no_sessions(&engine).await;
    }

    #[tokio::test]
    async fn plain_track_seek_starts_at_offset() {
        let fx = fixture();
        let engine = shell("echo \"$@\"");
        let opened = engine
            .open_stream(&fx.library, &stable_id("Disc/bonus.wav"), "lossless", 1.5, None)
            .await
            .unwrap();
        let (bytes, _) = collect(opened.body).await;
        let echoed = String::from_utf8(bytes).unwrap();
        assert!(echoed.contains("-ss 1.500 -i"));
        assert!(!echoed.contains(" -t "));
    }

    #[tokio::test]
    async fn request_errors_map_to_categories() {
        let fx = fixture();
        let engine = shell("echo ok");
        let missing = engine
            .open_stream(&fx.library, "nope", "lossless", 0.0, None)
            .await;
        assert!(matches!(missing, Err(StreamError::TrackNotFound(_))));

        let preset = engine
            .open_stream(&fx.library, &segment_id(1), "wma_64", 0.0, None)
            .await;
        assert!(matches!(preset, Err(StreamError::UnknownPreset(_))));

        let seek = engine
            .open_stream(&fx.library, &segment_id(1), "lossless", 300.0, None)
            .await;
        assert!(matches!(seek, Err(StreamError::InvalidSeek(_))));
        assert_eq!(StreamError::SourceMissing(String::new()).status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn missing_converter_is_unavailable() {
        let fx = fixture();
        let engine = StreamEngine::new("/nonexistent/ffmpeg", &[], 4);
        let result = engine
            .open_stream(&fx.library, &segment_id(1), "lossless", 0.0, None)
            .await;
        match result {
            Err(err @ StreamError::ConverterUnavailable(_)) => {
                assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE)
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("stream opened without a converter"),
        }
        assert_eq!(engine.active_sessions(), 0);
    }

    #[tokio::test]
    async fn early_converter_failure_reports_stderr() {
        let fx = fixture();
        let engine = shell("echo boom >&2; exit 1");
        let result = engine
            .open_stream(&fx.library, &segment_id(1), "ogg_128", 0.0, None)
            .await;
        match result {
            Err(StreamError::ConversionFailed(detail)) => assert!(detail.contains("boom")),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("failed converter produced a stream"),
        }
        wait_for_no_sessions(&engine).await;
    }

    #[tokio::test]
    async fn mid_stream_failure_aborts_body() {
        let fx = fixture();
        let engine = shell("printf partial; exit 3");
        let opened = engine
            .open_stream(&fx.library, &segment_id(3), "lossless", 0.0, None)
            .await
            .unwrap();
        let (bytes, failed) = collect(opened.body).await;
        assert_eq!(bytes, b"partial");
        assert!(failed);
        wait_for_no_sessions(&engine).await;
    }

    #[tokio::test]
    async fn same_session_supersedes_previous_stream() {
        let fx = fixture();
        let engine = shell("printf x; exec sleep 30");
        let session = Some("player-1".to_string());

        let first = engine
            .open_stream(&fx.library, &segment_id(1), "lossless", 0.0, session.clone())
            .await
            .unwrap();
        assert_eq!(first.session_id, "player-1");
        assert_eq!(engine.sessions()[0].state, StreamState::Streaming);

        let second = engine
            .open_stream(&fx.library, &segment_id(1), "lossless", 42.0, session)
            .await
            .unwrap();
        assert_eq!(second.window.start_secs, 42.0);
        assert_eq!(engine.active_sessions(), 1);

        let (bytes, _) = tokio::time::timeout(Duration::from_secs(5), collect(first.body))
            .await
            .unwrap();
        assert_eq!(bytes, b"x");

        drop(second.body);
        wait_for_no_sessions(&engine).await;
    }

    #[tokio::test]
    async fn client_disconnect_kills_converter() {
        let fx = fixture();
        let engine = shell("printf x; exec sleep 30");
        let opened = engine
            .open_stream(&fx.library, &stable_id("Disc/bonus.wav"), "mp3_128", 0.0, None)
            .await
            .unwrap();
        assert_eq!(engine.active_sessions(), 1);
        drop(opened.body);
        wait_for_no_sessions(&engine).await;
    }
}
