use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use common::{join_relpath, Album, Track};
use library::LibraryError;

use crate::state::{
    AlbumDetailResponse, AppState, JsonResult, ListResponse, SearchQuery, TrackDetailResponse,
};
use crate::utils::{clamp_limit, json_error, json_error_response};

const DEFAULT_PAGE: usize = 100;
const MAX_PAGE: usize = 1000;

pub async fn list_albums(
    State(state): State<AppState>,
    Query(params): Query<SearchQuery>,
) -> JsonResult<ListResponse<Album>> {
    let limit = clamp_limit(params.limit, DEFAULT_PAGE, MAX_PAGE);
    let offset = params.offset.unwrap_or(0);
    let search = params
        .search
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());

    match state.library.list_albums(search, limit, offset) {
        Ok((items, total)) => Ok(Json(ListResponse { items, total })),
        Err(err) => Err(json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("library error: {}", err),
        )),
    }
}

pub async fn get_album(
    State(state): State<AppState>,
    AxumPath(album_id): AxumPath<String>,
) -> JsonResult<AlbumDetailResponse> {
    let album = match state.library.get_album(&album_id) {
        Ok(Some(album)) => album,
        Ok(None) => return Err(json_error(StatusCode::NOT_FOUND, "album not found")),
        Err(err) => {
            return Err(json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("library error: {}", err),
            ))
        }
    };
    let tracks = state.library.get_album_tracks(&album_id).map_err(|err| {
        json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("library error: {}", err),
        )
    })?;
    Ok(Json(AlbumDetailResponse { album, tracks }))
}

pub async fn list_tracks(
    State(state): State<AppState>,
    Query(params): Query<SearchQuery>,
) -> JsonResult<ListResponse<Track>> {
    let limit = clamp_limit(params.limit, DEFAULT_PAGE, MAX_PAGE);
    let offset = params.offset.unwrap_or(0);

    match state
        .library
        .search_tracks(params.search.as_deref(), limit, offset)
    {
        Ok((items, total)) => Ok(Json(ListResponse { items, total })),
        Err(err) => Err(json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("library error: {}", err),
        )),
    }
}

pub async fn get_track(
    State(state): State<AppState>,
    AxumPath(track_id): AxumPath<String>,
) -> JsonResult<TrackDetailResponse> {
    let library_error = |err: LibraryError| {
        json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("library error: {}", err),
        )
    };
    let track = match state.library.get_track(&track_id).map_err(library_error)? {
        Some(track) => track,
        None => return Err(json_error(StatusCode::NOT_FOUND, "track not found")),
    };
    let plays = state.library.play_stats(&track_id).map_err(library_error)?;
    Ok(Json(TrackDetailResponse { track, plays }))
}

pub async fn get_album_art(
    State(state): State<AppState>,
    AxumPath(album_id): AxumPath<String>,
) -> Response {
    let album = match state.library.get_album(&album_id) {
        Ok(Some(album)) => album,
        Ok(None) => return json_error_response(StatusCode::NOT_FOUND, "album not found"),
        Err(err) => {
            return json_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("library error: {}", err),
            )
        }
    };
    let cover_relpath = match album.cover_relpath {
        Some(cover) => cover,
        None => return json_error_response(StatusCode::NOT_FOUND, "cover not found"),
    };

    let path = join_relpath(state.library.root(), &cover_relpath);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return json_error_response(
                StatusCode::NOT_FOUND,
                format!("cover unreadable: {}", err),
            )
        }
    };
    let mime = mime_guess::from_path(&path).first_or_octet_stream();

    let mut response = bytes.into_response();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=86400"),
    );
    response
}
