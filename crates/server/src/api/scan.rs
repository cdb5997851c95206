use axum::{
    extract::{Query, State},
    Json,
};
use library::ScanMode;
use tracing::warn;

use crate::state::{
    AppState, HealthResponse, ScanQuery, ScanStatusResponse, ScanTriggerResponse,
};

/// Kicks off a scan and returns immediately; a second trigger while one is
/// running reports `already_scanning` instead of queueing.
pub async fn trigger_scan(
    State(state): State<AppState>,
    Query(params): Query<ScanQuery>,
) -> Json<ScanTriggerResponse> {
    let mode = if params.full.unwrap_or(false) {
        ScanMode::Full
    } else {
        ScanMode::Incremental
    };
    let outcome = state.scans.trigger(mode);
    Json(ScanTriggerResponse {
        status: outcome.as_str(),
    })
}

pub async fn scan_status(State(state): State<AppState>) -> Json<ScanStatusResponse> {
    Json(state.scans.status_response())
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let library = match state.library.stats() {
        Ok(stats) => Some(stats),
        Err(err) => {
            warn!("Health check could not read index: {}", err);
            None
        }
    };
    Json(HealthResponse {
        status: "ok",
        scanning: state.scans.is_running(),
        active_streams: state.engine.active_sessions(),
        library,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::scanned_state;
    use std::time::Duration;

    #[tokio::test]
    async fn scan_trigger_reports_gate_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = scanned_state(dir.path(), "true");

        let Json(first) = trigger_scan(State(state.clone()), Query(ScanQuery { full: Some(true) })).await;
        assert_eq!(first.status, "scan_started");
        let Json(second) = trigger_scan(State(state.clone()), Query(ScanQuery { full: None })).await;
        assert_eq!(second.status, "already_scanning");

        for _ in 0..500 {
            if !state.scans.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let Json(status) = scan_status(State(state.clone())).await;
        assert!(!status.scanning);
        assert_eq!(status.state, "finished");
        assert_eq!(status.last_result.unwrap().albums_unchanged, 1);
    }

    #[tokio::test]
    async fn health_reports_index_counts() {
        let dir = tempfile::tempdir().unwrap();
        let state = scanned_state(dir.path(), "true");
        let Json(health) = health(State(state)).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.active_streams, 0);
        let stats = health.library.unwrap();
        assert_eq!((stats.albums, stats.tracks), (1, 2));
    }
}
