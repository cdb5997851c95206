use std::path::PathBuf;
use std::time::Duration;

use library::ScanMode;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::scan::{ScanController, ScanTrigger};
use crate::state::AppState;

pub fn configure_watcher(state: &AppState, root: PathBuf) {
    let config = state.config.read().clone();
    if !config.watch_music {
        info!("Watcher disabled (watch_music=false)");
        *state.watcher.write() = None;
        return;
    }

    let watch_debounce_secs = if config.watch_debounce_secs == 0 {
        2
    } else {
        config.watch_debounce_secs
    };
    let watch_debounce = Duration::from_secs(watch_debounce_secs);

    match setup_watcher(state.scans.clone(), root.clone(), watch_debounce) {
        Ok(watcher) => {
            info!(
                "Watching {} for changes (debounce {}s)",
                root.display(),
                watch_debounce.as_secs()
            );
            *state.watcher.write() = Some(watcher);
        }
        Err(err) => {
            warn!("Failed to start watcher: {}", err);
            *state.watcher.write() = None;
        }
    }
}

fn setup_watcher(
    scans: ScanController,
    root: PathBuf,
    debounce: Duration,
) -> Result<RecommendedWatcher, notify::Error> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        NotifyConfig::default(),
    )?;

    watcher.watch(&root, RecursiveMode::Recursive)?;

    tokio::spawn(async move {
        watch_loop(rx, debounce, move || scans.trigger(ScanMode::Incremental)).await;
    });

    Ok(watcher)
}

/// Collapses bursts of filesystem events into one `trigger` call once the
/// tree has been quiet for `debounce`.
async fn watch_loop<F>(mut rx: UnboundedReceiver<Event>, debounce: Duration, mut trigger: F)
where
    F: FnMut() -> ScanTrigger,
{
    loop {
        let event = match rx.recv().await {
            Some(event) => event,
            None => break,
        };
        if !is_relevant_event(&event) {
            continue;
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(debounce) => {
                    match trigger() {
                        ScanTrigger::Started => info!("Auto-scan started after file changes"),
                        ScanTrigger::AlreadyRunning => {
                            debug!("Auto-scan skipped; scan already running")
                        }
                    }
                    break;
                }
                maybe_event = rx.recv() => {
                    if maybe_event.is_none() {
                        return;
                    }
                }
            }
        }
    }
}

fn is_relevant_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind, RemoveKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn only_content_changes_trigger_scans() {
        assert!(is_relevant_event(&Event::new(EventKind::Create(
            CreateKind::File
        ))));
        assert!(!is_relevant_event(&Event::new(EventKind::Access(
            AccessKind::Any
        ))));
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn event_bursts_collapse_into_one_scan() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let handle = tokio::spawn(watch_loop(rx, Duration::from_secs(2), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            ScanTrigger::Started
        }));

        tx.send(Event::new(EventKind::Access(AccessKind::Any))).unwrap();
        settle().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        for kind in [
            EventKind::Create(CreateKind::File),
            EventKind::Modify(ModifyKind::Any),
            EventKind::Remove(RemoveKind::File),
        ] {
            tx.send(Event::new(kind)).unwrap();
            settle().await;
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tx.send(Event::new(EventKind::Create(CreateKind::File))).unwrap();
        settle().await;
        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        drop(tx);
        handle.await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
