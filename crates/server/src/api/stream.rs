use axum::{
    body::Body,
    extract::{Path as AxumPath, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::Response,
    Json,
};

use tracing::{debug, warn};

use crate::state::{AppState, ListResponse, ProfilesResponse, StreamQuery};
use crate::stream_sessions::SessionInfo;
use crate::streaming::StreamError;
use crate::transcode::PRESETS;

/// Live converter output for one track. There is no `Content-Length` and no
/// range support; clients seek by reissuing the request with `seek`.
pub async fn stream_track(
    State(state): State<AppState>,
    AxumPath(track_id): AxumPath<String>,
    Query(params): Query<StreamQuery>,
) -> Result<Response, StreamError> {
    let quality = match params.quality {
        Some(quality) if !quality.trim().is_empty() => quality,
        _ => state.config.read().default_quality.clone(),
    };
    let opened = state
        .engine
        .open_stream(
            &state.library,
            &track_id,
            &quality,
            params.seek.unwrap_or(0.0),
            params.session,
        )
        .await?;
    record_play(&state, track_id).await;
    debug!(
        "Serving stream {} from {} at {:.3}s",
        opened.session_id,
        opened.window.path.display(),
        opened.window.start_secs
    );

    let mut response = Response::new(Body::from_stream(opened.body));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(opened.preset.mime),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("none"));
    if let Ok(value) = HeaderValue::from_str(&opened.session_id) {
        headers.insert("x-stream-session", value);
    }
    Ok(response)
}

async fn record_play(state: &AppState, track_id: String) {
    let library = state.library.clone();
    match tokio::task::spawn_blocking(move || library.increment_play_count(&track_id)).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => warn!("Failed to record play: {}", err),
        Err(err) => warn!("Play count task failed: {}", err),
    }
}

pub async fn list_profiles(State(state): State<AppState>) -> Json<ProfilesResponse> {
    Json(ProfilesResponse {
        default: state.config.read().default_quality.clone(),
        items: PRESETS.to_vec(),
    })
}

pub async fn list_streams(State(state): State<AppState>) -> Json<ListResponse<SessionInfo>> {
    let items = state.engine.sessions();
    let total = items.len();
    Json(ListResponse { items, total })
}
