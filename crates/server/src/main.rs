mod api;
mod config;
mod scan;
mod state;
mod stream_sessions;
mod streaming;
mod transcode;
mod utils;
mod watch;

use std::sync::Arc;
use std::time::Duration;

use api::api_router;
use config::{config_path_from_env, load_or_create_config, resolve_music_root, resolve_path};
use library::{Library, ScanMode};
use parking_lot::RwLock;
use scan::{start_periodic_scans, ScanController};
use state::AppState;
use streaming::StreamEngine;
use tower_http::request_id::{MakeRequestUuid, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = config_path_from_env();
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Created default config at {:?}", config_path);
    } else {
        info!("Loaded config from {:?}", config_path);
    }

    let music_root = match resolve_music_root(&config_path, &config.music_root) {
        Some(root) => root,
        None => {
            return Err(format!(
                "music_root is not set; edit {} and restart",
                config_path.display()
            )
            .into())
        }
    };
    if !music_root.is_dir() {
        warn!(
            "Music root {} is not a readable directory; scans will fail until it appears",
            music_root.display()
        );
    }

    let index_path = resolve_path(&config_path, &config.index_path);
    if let Some(parent) = index_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let library = Library::open(music_root.clone(), index_path)?;
    match library.stats() {
        Ok(stats) => info!(
            "Index holds {} albums, {} tracks",
            stats.albums, stats.tracks
        ),
        Err(err) => warn!("Failed to read index stats: {}", err),
    }

    let scans = ScanController::new(library.clone());
    let engine = StreamEngine::from_config(&config);
    info!(
        "Converter {} (default quality {}, buffer {} chunks)",
        config.ffmpeg_path, config.default_quality, config.stream_buffer_chunks
    );

    let bind_addr = format!("{}:{}", config.bind_host, config.port);
    let scan_on_start = config.scan_on_start;
    let scan_interval = Duration::from_secs(config.scan_interval_secs);
    let state = AppState {
        config: Arc::new(RwLock::new(config)),
        library,
        scans: scans.clone(),
        engine,
        watcher: Arc::new(RwLock::new(None)),
    };

    if scan_on_start {
        scans.trigger(ScanMode::Incremental);
    }
    start_periodic_scans(scans, scan_interval);
    watch::configure_watcher(&state, music_root);

    let app = api_router(state)
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on {}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to install terminate signal handler: {}", err);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", err);
        }
    }

    info!("Shutdown signal received.");
}
