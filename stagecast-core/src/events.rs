//! Lifecycle events of recording and relay jobs

use serde::Serialize;
use stagecast_sfu::RoomId;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum MediaEvent {
    #[serde(rename_all = "camelCase")]
    RecordingStarted {
        room_id: RoomId,
        final_path: PathBuf,
        public_path: String,
    },
    #[serde(rename_all = "camelCase")]
    RecordingStopped {
        room_id: RoomId,
        final_path: PathBuf,
        public_path: String,
        /// Measured from start to finalize
        duration_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    RecordingFailed { room_id: RoomId, reason: String },
    #[serde(rename_all = "camelCase")]
    RelayStarted {
        room_id: RoomId,
        /// Masked destination URL
        destination: String,
    },
    #[serde(rename_all = "camelCase")]
    RelayStopped { room_id: RoomId, crashed: bool },
}

impl MediaEvent {
    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        match self {
            Self::RecordingStarted { room_id, .. }
            | Self::RecordingStopped { room_id, .. }
            | Self::RecordingFailed { room_id, .. }
            | Self::RelayStarted { room_id, .. }
            | Self::RelayStopped { room_id, .. } => room_id,
        }
    }
}
