//! Recording persistence boundary
//!
//! The orchestrator never writes marks itself. A sync task subscribes to
//! [`MediaEvent`]s and mirrors them into a [`RecordingStore`].

use crate::events::MediaEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use stagecast_sfu::RoomId;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    Recording,
    Recorded,
    Failed,
}

/// What the outside world knows about a room's recording
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingMark {
    pub room_id: RoomId,
    pub state: RecordingState,
    pub final_path: PathBuf,
    pub public_path: String,
    pub updated_at: DateTime<Utc>,
    /// Last finalized file, carried while a newer recording runs or after it fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_recorded: Option<RecordedFile>,
}

/// A finalized recording on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedFile {
    pub final_path: PathBuf,
    pub public_path: String,
}

impl RecordingMark {
    /// The finalized file this mark vouches for, if any.
    /// A running or failed recording falls back to the one before it.
    #[must_use]
    pub fn recorded_file(&self) -> Option<RecordedFile> {
        match self.state {
            RecordingState::Recorded => Some(RecordedFile {
                final_path: self.final_path.clone(),
                public_path: self.public_path.clone(),
            }),
            RecordingState::Recording | RecordingState::Failed => self.last_recorded.clone(),
        }
    }
}

#[async_trait]
pub trait RecordingStore: Send + Sync + 'static {
    async fn get(&self, room_id: &RoomId) -> Option<RecordingMark>;

    async fn put(&self, mark: RecordingMark);

    /// Change the state of an existing mark; missing marks are ignored
    async fn set_state(&self, room_id: &RoomId, state: RecordingState);
}

/// In-memory store
#[derive(Default)]
pub struct MemoryRecordingStore {
    marks: DashMap<RoomId, RecordingMark>,
}

impl MemoryRecordingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordingStore for MemoryRecordingStore {
    async fn get(&self, room_id: &RoomId) -> Option<RecordingMark> {
        self.marks.get(room_id).map(|m| m.value().clone())
    }

    async fn put(&self, mark: RecordingMark) {
        self.marks.insert(mark.room_id.clone(), mark);
    }

    async fn set_state(&self, room_id: &RoomId, state: RecordingState) {
        if let Some(mut mark) = self.marks.get_mut(room_id) {
            mark.state = state;
            mark.updated_at = Utc::now();
        }
    }
}

/// Mirror recording events into `store` until `shutdown` fires or the
/// event channel closes
pub fn spawn_persistence_sync(
    store: Arc<dyn RecordingStore>,
    mut events: broadcast::Receiver<MediaEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            // Queued events are applied before a pending shutdown is seen
            let event = tokio::select! {
                biased;
                received = events.recv() => match received {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Persistence sync lagged behind media events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                () = shutdown.cancelled() => break,
            };
            apply(store.as_ref(), event).await;
        }
        debug!("Persistence sync stopped");
    })
}

async fn apply(store: &dyn RecordingStore, event: MediaEvent) {
    match event {
        MediaEvent::RecordingStarted {
            room_id,
            final_path,
            public_path,
        } => {
            let last_recorded = store
                .get(&room_id)
                .await
                .and_then(|mark| mark.recorded_file());
            store
                .put(RecordingMark {
                    room_id,
                    state: RecordingState::Recording,
                    final_path,
                    public_path,
                    updated_at: Utc::now(),
                    last_recorded,
                })
                .await;
        }
        MediaEvent::RecordingStopped {
            room_id,
            final_path,
            public_path,
            ..
        } => {
            store
                .put(RecordingMark {
                    room_id,
                    state: RecordingState::Recorded,
                    final_path,
                    public_path,
                    updated_at: Utc::now(),
                    last_recorded: None,
                })
                .await;
        }
        MediaEvent::RecordingFailed { room_id, .. } => {
            store.set_state(&room_id, RecordingState::Failed).await;
        }
        MediaEvent::RelayStarted { .. } | MediaEvent::RelayStopped { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sync_follows_recording_lifecycle() {
        let store = Arc::new(MemoryRecordingStore::new());
        let (tx, rx) = broadcast::channel(16);
        let shutdown = CancellationToken::new();
        let handle = spawn_persistence_sync(store.clone(), rx, shutdown.clone());
        let room = RoomId::from("r1");

        tx.send(MediaEvent::RecordingStarted {
            room_id: room.clone(),
            final_path: PathBuf::from("/tmp/r1.mp4"),
            public_path: "/uploads/r1.mp4".to_string(),
        })
        .unwrap();
        tx.send(MediaEvent::RecordingFailed {
            room_id: room.clone(),
            reason: "no output".to_string(),
        })
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        let mark = store.get(&room).await.unwrap();
        assert_eq!(mark.state, RecordingState::Failed);
        assert_eq!(mark.public_path, "/uploads/r1.mp4");
        assert_eq!(mark.recorded_file(), None);
    }

    #[tokio::test]
    async fn test_failure_keeps_last_recorded_file() {
        let store = Arc::new(MemoryRecordingStore::new());
        let (tx, rx) = broadcast::channel(16);
        let shutdown = CancellationToken::new();
        let handle = spawn_persistence_sync(store.clone(), rx, shutdown.clone());
        let room = RoomId::from("r1");

        tx.send(MediaEvent::RecordingStarted {
            room_id: room.clone(),
            final_path: PathBuf::from("/tmp/r1_a.mp4"),
            public_path: "/uploads/r1_a.mp4".to_string(),
        })
        .unwrap();
        tx.send(MediaEvent::RecordingStopped {
            room_id: room.clone(),
            final_path: PathBuf::from("/tmp/r1_a.mp4"),
            public_path: "/uploads/r1_a.mp4".to_string(),
            duration_ms: 1000,
        })
        .unwrap();
        tx.send(MediaEvent::RecordingStarted {
            room_id: room.clone(),
            final_path: PathBuf::from("/tmp/r1_b.mp4"),
            public_path: "/uploads/r1_b.mp4".to_string(),
        })
        .unwrap();
        tx.send(MediaEvent::RecordingFailed {
            room_id: room.clone(),
            reason: "no output".to_string(),
        })
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        let mark = store.get(&room).await.unwrap();
        assert_eq!(mark.state, RecordingState::Failed);
        assert_eq!(
            mark.recorded_file(),
            Some(RecordedFile {
                final_path: PathBuf::from("/tmp/r1_a.mp4"),
                public_path: "/uploads/r1_a.mp4".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_failed_without_mark_is_ignored() {
        let store = MemoryRecordingStore::new();
        store
            .set_state(&RoomId::from("ghost"), RecordingState::Failed)
            .await;
        assert!(store.get(&RoomId::from("ghost")).await.is_none());
    }

    #[tokio::test]
    async fn test_sync_stops_on_shutdown() {
        let store = Arc::new(MemoryRecordingStore::new());
        let (_tx, rx) = broadcast::channel(16);
        let shutdown = CancellationToken::new();
        let handle = spawn_persistence_sync(store, rx, shutdown.clone());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
