use std::sync::Arc;

use axum::http::StatusCode;
use axum::Json;
use common::{Album, Track};
use library::{Library, LibraryStats, PlayStats, ScanResult};
use notify::RecommendedWatcher;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;
use crate::scan::ScanController;
use crate::streaming::StreamEngine;
use crate::transcode::Preset;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<ServerConfig>>,
    pub library: Library,
    pub scans: ScanController,
    pub engine: StreamEngine,
    pub watcher: Arc<RwLock<Option<RecommendedWatcher>>>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub scanning: bool,
    pub active_streams: usize,
    pub library: Option<LibraryStats>,
}

#[derive(Serialize)]
pub struct ProfilesResponse {
    pub default: String,
    pub items: Vec<Preset>,
}

#[derive(Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct ScanTriggerResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ScanStatusResponse {
    pub scanning: bool,
    pub state: &'static str,
    pub message: Option<String>,
    pub last_result: Option<ScanResult>,
}

#[derive(Serialize)]
pub struct AlbumDetailResponse {
    pub album: Album,
    pub tracks: Vec<Track>,
}

#[derive(Serialize)]
pub struct TrackDetailResponse {
    #[serde(flatten)]
    pub track: Track,
    #[serde(flatten)]
    pub plays: PlayStats,
}

/// Paging and substring filter shared by the album and track listings.
#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub search: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ScanQuery {
    pub full: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub quality: Option<String>,
    pub seek: Option<f64>,
    pub session: Option<String>,
}

pub type JsonResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;
