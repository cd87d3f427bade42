//! Notifications fanned out to every connection

use crate::track::TrackKind;
use crate::types::{ConnectionId, RoomId, TrackId};
use serde::Serialize;

/// Room-level change other connections may react to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SfuEvent {
    /// A track went on air; `origin` published it and is not notified
    #[serde(rename_all = "camelCase")]
    NewProducer {
        room_id: RoomId,
        kind: TrackKind,
        track_id: TrackId,
        #[serde(skip)]
        origin: ConnectionId,
    },
    /// A track left the producer table; its consumers are already closed
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        room_id: RoomId,
        kind: TrackKind,
        track_id: TrackId,
    },
}

impl SfuEvent {
    /// Whether `connection_id` should receive this event
    #[must_use]
    pub fn is_for(&self, connection_id: &ConnectionId) -> bool {
        match self {
            Self::NewProducer { origin, .. } => origin != connection_id,
            Self::ProducerClosed { .. } => true,
        }
    }
}
