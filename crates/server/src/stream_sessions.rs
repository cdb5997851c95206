use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Starting,
    Streaming,
    Ended,
    Failed,
    Superseded,
    Disconnected,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamState::Ended | StreamState::Failed | StreamState::Disconnected
        )
    }

    /// `Superseded` is not terminal: the session id lives on in its
    /// replacement, which starts over from `Starting`.
    pub fn can_transition(self, next: StreamState) -> bool {
        use StreamState::*;
        match (self, next) {
            (Idle, Starting) => true,
            (Starting, Streaming) | (Starting, Failed) | (Starting, Ended) => true,
            (Starting, Superseded) | (Starting, Disconnected) => true,
            (Streaming, Ended) | (Streaming, Failed) => true,
            (Streaming, Superseded) | (Streaming, Disconnected) => true,
            (Superseded, Starting) => true,
            _ => false,
        }
    }
}

/// Registry of live stream sessions keyed by client-visible id. Each slot is
/// stamped with a generation so a superseded pump cannot touch the slot of
/// its replacement.
#[derive(Clone, Default)]
pub struct StreamSessions {
    inner: Arc<Mutex<HashMap<String, SessionSlot>>>,
    generations: Arc<AtomicU64>,
}

struct SessionSlot {
    generation: u64,
    state: StreamState,
    track_id: String,
    preset: &'static str,
    started: Instant,
    cancel: CancellationToken,
    released: CancellationToken,
}

/// Ownership of one session generation. Dropping `release` tells a
/// superseding request that this generation's process is gone.
pub struct SessionClaim {
    pub id: String,
    pub generation: u64,
    pub cancel: CancellationToken,
    pub release: DropGuard,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub track_id: String,
    pub preset: &'static str,
    pub state: StreamState,
    pub age_secs: u64,
}

impl StreamSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new generation for `requested` (or a fresh id). A live
    /// previous generation is cancelled and awaited until its process has
    /// been terminated.
    pub async fn claim(
        &self,
        requested: Option<String>,
        track_id: &str,
        preset: &'static str,
    ) -> SessionClaim {
        let id = requested
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let released = CancellationToken::new();
        // Armed before any await so a dropped claim still releases.
        let release = released.clone().drop_guard();

        let previous = self.inner.lock().insert(
            id.clone(),
            SessionSlot {
                generation,
                state: StreamState::Starting,
                track_id: track_id.to_string(),
                preset,
                started: Instant::now(),
                cancel: cancel.clone(),
                released,
            },
        );

        let mut pending = PendingSlot {
            sessions: self,
            id: id.clone(),
            generation,
            armed: true,
        };
        if let Some(old) = previous {
            info!(
                "Stream session {} {:?} -> {:?} (generation {} -> {})",
                id,
                old.state,
                StreamState::Superseded,
                old.generation,
                generation
            );
            old.cancel.cancel();
            old.released.cancelled().await;
        }
        pending.armed = false;

        SessionClaim {
            id,
            generation,
            cancel,
            release,
        }
    }

    pub fn transition(&self, id: &str, generation: u64, next: StreamState) {
        let mut guard = self.inner.lock();
        if let Some(slot) = guard.get_mut(id) {
            if slot.generation == generation && slot.state.can_transition(next) {
                slot.state = next;
            }
        }
    }

    /// Records the terminal state of a generation and drops its slot.
    pub fn finish(&self, id: &str, generation: u64, state: StreamState) {
        let mut guard = self.inner.lock();
        let current = match guard.get(id) {
            Some(slot) if slot.generation == generation => slot.state,
            _ => {
                debug!("Stream session {} generation {} already replaced", id, generation);
                return;
            }
        };
        debug!("Stream session {} {:?} -> {:?}", id, current, state);
        if state.is_terminal() || state == StreamState::Superseded {
            guard.remove(id);
        } else if let Some(slot) = guard.get_mut(id) {
            slot.state = state;
        }
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let guard = self.inner.lock();
        let mut items: Vec<SessionInfo> = guard
            .iter()
            .map(|(id, slot)| SessionInfo {
                id: id.clone(),
                track_id: slot.track_id.clone(),
                preset: slot.preset,
                state: slot.state,
                age_secs: slot.started.elapsed().as_secs(),
            })
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    fn discard(&self, id: &str, generation: u64) {
        let mut guard = self.inner.lock();
        if guard.get(id).map(|slot| slot.generation) == Some(generation) {
            guard.remove(id);
            debug!("Stream session {} generation {} abandoned", id, generation);
        }
    }
}

/// Drops a freshly inserted slot when its claim is abandoned while waiting on
/// the previous generation.
struct PendingSlot<'a> {
    sessions: &'a StreamSessions,
    id: String,
    generation: u64,
    armed: bool,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.sessions.discard(&self.id, self.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn transitions_follow_the_lifecycle() {
        use StreamState::*;
        assert!(Idle.can_transition(Starting));
        assert!(Starting.can_transition(Streaming));
        assert!(Streaming.can_transition(Ended));
        assert!(Streaming.can_transition(Superseded));
        assert!(Superseded.can_transition(Starting));
        assert!(!Ended.can_transition(Starting));
        assert!(!Failed.can_transition(Streaming));
        assert!(!Idle.can_transition(Streaming));
        assert!(Disconnected.is_terminal());
        assert!(!Superseded.is_terminal());
    }

    #[tokio::test]
    async fn anonymous_claims_get_distinct_ids() {
        let sessions = StreamSessions::new();
        let a = sessions.claim(None, "t1", "mp3_192").await;
        let b = sessions.claim(Some("  ".to_string()), "t1", "mp3_192").await;
        assert_ne!(a.id, b.id);
        assert_eq!(sessions.len(), 2);
        assert!(sessions
            .list()
            .iter()
            .all(|info| info.state == StreamState::Starting));
    }

    #[tokio::test]
    async fn reclaim_waits_for_previous_release() {
        let sessions = StreamSessions::new();
        let first = sessions
            .claim(Some("player".to_string()), "t1", "lossless")
            .await;
        let cancel = first.cancel.clone();
        let release = first.release;
        let releaser = tokio::spawn(async move {
            cancel.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(release);
        });

        let second = sessions
            .claim(Some("player".to_string()), "t2", "lossless")
            .await;
        assert!(first.cancel.is_cancelled());
        releaser.await.unwrap();
        assert_eq!(second.id, "player");

        sessions.finish("player", first.generation, StreamState::Superseded);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions.list()[0].track_id, "t2");

        sessions.transition("player", second.generation, StreamState::Streaming);
        assert_eq!(sessions.list()[0].state, StreamState::Streaming);
        sessions.finish("player", second.generation, StreamState::Ended);
        assert_eq!(sessions.len(), 0);
    }

    #[tokio::test]
    async fn abandoned_reclaim_leaves_no_slot() {
        let sessions = StreamSessions::new();
        let first = sessions
            .claim(Some("player".to_string()), "t1", "lossless")
            .await;

        let waiting = tokio::spawn({
            let sessions = sessions.clone();
            async move {
                sessions
                    .claim(Some("player".to_string()), "t2", "lossless")
                    .await;
            }
        });
        while !first.cancel.is_cancelled() {
            tokio::task::yield_now().await;
        }
        assert_eq!(sessions.list()[0].track_id, "t2");

        waiting.abort();
        assert!(waiting.await.unwrap_err().is_cancelled());
        assert_eq!(sessions.len(), 0);

        sessions.finish("player", first.generation, StreamState::Superseded);
        drop(first.release);
        assert_eq!(sessions.len(), 0);
    }
}
