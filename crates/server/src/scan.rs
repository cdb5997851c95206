use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use library::{Library, ScanMode, ScanResult};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::state::ScanStatusResponse;

/// Process-wide "a scan is running" flag. Only a [`ScanGuard`] clears it.
#[derive(Clone, Default)]
pub struct ScanGate {
    running: Arc<AtomicBool>,
}

pub struct ScanGuard {
    running: Arc<AtomicBool>,
}

impl ScanGate {
    pub fn try_acquire(&self) -> Option<ScanGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ScanGuard {
                running: Arc::clone(&self.running),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanTrigger {
    Started,
    AlreadyRunning,
}

impl ScanTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanTrigger::Started => "scan_started",
            ScanTrigger::AlreadyRunning => "already_scanning",
        }
    }
}

#[derive(Clone, Debug)]
pub enum ScanStatus {
    Idle,
    Scanning { started: SystemTime, mode: ScanMode },
    Finished { finished: SystemTime, result: ScanResult },
    Failed(String),
}

/// Owns the gate and the last outcome; every trigger (HTTP, timer, watcher)
/// goes through [`ScanController::trigger`].
#[derive(Clone)]
pub struct ScanController {
    library: Library,
    gate: ScanGate,
    status: Arc<RwLock<ScanStatus>>,
    last_result: Arc<RwLock<Option<ScanResult>>>,
}

impl ScanController {
    pub fn new(library: Library) -> Self {
        Self {
            library,
            gate: ScanGate::default(),
            status: Arc::new(RwLock::new(ScanStatus::Idle)),
            last_result: Arc::new(RwLock::new(None)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.gate.is_running()
    }

    pub fn status(&self) -> ScanStatus {
        self.status.read().clone()
    }

    /// Starts a background scan unless one is already in flight. Never
    /// waits for the scan itself.
    pub fn trigger(&self, mode: ScanMode) -> ScanTrigger {
        let guard = match self.gate.try_acquire() {
            Some(guard) => guard,
            None => {
                debug!("Scan trigger ignored; scan already running");
                return ScanTrigger::AlreadyRunning;
            }
        };
        *self.status.write() = ScanStatus::Scanning {
            started: SystemTime::now(),
            mode,
        };
        info!("Library scan started ({:?})", mode);

        let controller = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let library = controller.library.clone();
            let result = tokio::task::spawn_blocking(move || library.scan(mode)).await;
            let status = match result {
                Ok(Ok(result)) => {
                    *controller.last_result.write() = Some(result.clone());
                    ScanStatus::Finished {
                        finished: SystemTime::now(),
                        result,
                    }
                }
                Ok(Err(err)) => {
                    warn!("Library scan failed: {}", err);
                    ScanStatus::Failed(err.to_string())
                }
                Err(err) => {
                    warn!("Library scan join error: {}", err);
                    ScanStatus::Failed(err.to_string())
                }
            };
            *controller.status.write() = status;
        });
        ScanTrigger::Started
    }

    pub fn status_response(&self) -> ScanStatusResponse {
        let status = self.status();
        let (state, message) = match &status {
            ScanStatus::Idle => ("idle", None),
            ScanStatus::Scanning { started, mode } => (
                "scanning",
                Some(format!(
                    "{:?} scan running since {}",
                    mode,
                    unix_secs(*started)
                )),
            ),
            ScanStatus::Finished { finished, result } => (
                "finished",
                Some(format!(
                    "finished at {}: {} added, {} updated, {} removed, {} failures",
                    unix_secs(*finished),
                    result.albums_added,
                    result.albums_updated,
                    result.albums_removed,
                    result.failures.len()
                )),
            ),
            ScanStatus::Failed(message) => ("failed", Some(message.clone())),
        };
        ScanStatusResponse {
            scanning: self.is_running(),
            state,
            message,
            last_result: self.last_result.read().clone(),
        }
    }
}

pub fn start_periodic_scans(controller: ScanController, interval: Duration) {
    if interval.is_zero() {
        info!("Periodic scan disabled");
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if controller.trigger(ScanMode::Incremental) == ScanTrigger::AlreadyRunning {
                debug!("Periodic scan skipped; previous scan still running");
            }
        }
    });
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|value| value.as_secs())
        .unwrap_or(0)
}
