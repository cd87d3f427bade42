//! Room producer table
//!
//! Each room holds at most one active track per kind. Rooms are never created
//! explicitly: an entry appears with the first publish and disappears when its
//! last track is removed.

use crate::track::{Track, TrackKind};
use crate::types::{ConnectionId, RoomId, TrackId};
use dashmap::DashMap;
use serde::Serialize;

/// The tracks currently on air in one room
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoomProducers {
    pub video: Option<Track>,
    pub audio: Option<Track>,
}

impl RoomProducers {
    #[must_use]
    pub const fn get(&self, kind: TrackKind) -> Option<&Track> {
        match kind {
            TrackKind::Video => self.video.as_ref(),
            TrackKind::Audio => self.audio.as_ref(),
        }
    }

    fn slot_mut(&mut self, kind: TrackKind) -> &mut Option<Track> {
        match kind {
            TrackKind::Video => &mut self.video,
            TrackKind::Audio => &mut self.audio,
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }

    /// Active tracks, video first
    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.video.iter().chain(self.audio.iter())
    }
}

/// Outcome of installing a track in its room
#[derive(Debug, Clone)]
pub enum PublishTransition {
    /// The slot for this kind was empty
    Published,
    /// Another track held the slot and was displaced (it is not closed here)
    Replaced { previous: Track },
}

/// Per-room mapping of media kind to the active track
#[derive(Default)]
pub struct ProducerTable {
    rooms: DashMap<RoomId, RoomProducers>,
}

impl ProducerTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `track` as its room's current track for its kind. Last writer wins.
    pub fn install(&self, track: Track) -> PublishTransition {
        let mut room = self.rooms.entry(track.room_id.clone()).or_default();
        match room.slot_mut(track.kind).replace(track) {
            Some(previous) => PublishTransition::Replaced { previous },
            None => PublishTransition::Published,
        }
    }

    /// Current tracks of the room (empty when the room has none)
    #[must_use]
    pub fn candidates(&self, room_id: &RoomId) -> RoomProducers {
        self.rooms
            .get(room_id)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    /// Remove the room's track for `kind` only if it is still `track_id`.
    /// Empty rooms are dropped.
    pub fn remove_if_current(
        &self,
        room_id: &RoomId,
        kind: TrackKind,
        track_id: &TrackId,
    ) -> Option<Track> {
        let removed = {
            let mut room = self.rooms.get_mut(room_id)?;
            let slot = room.slot_mut(kind);
            if slot.as_ref().is_some_and(|t| &t.id == track_id) {
                slot.take()
            } else {
                None
            }
        };
        if removed.is_some() {
            self.rooms.remove_if(room_id, |_, room| room.is_empty());
        }
        removed
    }

    /// Every listed track published by `connection_id`
    #[must_use]
    pub fn tracks_owned_by(&self, connection_id: &ConnectionId) -> Vec<Track> {
        self.rooms
            .iter()
            .flat_map(|room| {
                room.iter()
                    .filter(|t| &t.connection_id == connection_id)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Find a listed track by id
    #[must_use]
    pub fn find(&self, track_id: &TrackId) -> Option<Track> {
        self.rooms
            .iter()
            .find_map(|room| room.iter().find(|t| &t.id == track_id).cloned())
    }

    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        let mut ids: Vec<RoomId> = self.rooms.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Number of listed tracks of each kind: (video, audio)
    #[must_use]
    pub fn track_counts(&self) -> (usize, usize) {
        self.rooms.iter().fold((0, 0), |(video, audio), room| {
            (
                video + usize::from(room.video.is_some()),
                audio + usize::from(room.audio.is_some()),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::RtpParameters;
    use crate::types::TransportId;
    use chrono::Utc;

    fn track(room: &str, conn: &str, kind: TrackKind) -> Track {
        Track {
            id: TrackId::generate(),
            kind,
            room_id: RoomId::from(room),
            connection_id: ConnectionId::from(conn),
            transport_id: TransportId::generate(),
            rtp_parameters: RtpParameters::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_install_and_replace() {
        let table = ProducerTable::new();
        let first = track("r1", "c1", TrackKind::Video);
        let second = track("r1", "c2", TrackKind::Video);

        assert!(matches!(table.install(first.clone()), PublishTransition::Published));
        match table.install(second.clone()) {
            PublishTransition::Replaced { previous } => assert_eq!(previous.id, first.id),
            PublishTransition::Published => panic!("expected replacement"),
        }

        let current = table.candidates(&RoomId::from("r1"));
        assert_eq!(current.video.unwrap().id, second.id);
        assert!(current.audio.is_none());
    }

    #[test]
    fn test_kinds_are_independent() {
        let table = ProducerTable::new();
        table.install(track("r1", "c1", TrackKind::Video));
        table.install(track("r1", "c1", TrackKind::Audio));
        assert_eq!(table.track_counts(), (1, 1));
        assert_eq!(table.candidates(&RoomId::from("r1")).iter().count(), 2);
    }

    #[test]
    fn test_remove_if_current_ignores_stale_ids() {
        let table = ProducerTable::new();
        let old = track("r1", "c1", TrackKind::Video);
        let new = track("r1", "c2", TrackKind::Video);
        table.install(old.clone());
        table.install(new.clone());

        assert!(table
            .remove_if_current(&RoomId::from("r1"), TrackKind::Video, &old.id)
            .is_none());
        assert!(table
            .remove_if_current(&RoomId::from("r1"), TrackKind::Video, &new.id)
            .is_some());
    }

    #[test]
    fn test_empty_room_is_collected() {
        let table = ProducerTable::new();
        let t = track("r1", "c1", TrackKind::Audio);
        table.install(t.clone());
        assert_eq!(table.room_ids(), vec![RoomId::from("r1")]);

        table.remove_if_current(&t.room_id, t.kind, &t.id);
        assert_eq!(table.room_count(), 0);
        assert!(table.candidates(&t.room_id).is_empty());
    }

    #[test]
    fn test_tracks_owned_by_connection() {
        let table = ProducerTable::new();
        table.install(track("r1", "c1", TrackKind::Video));
        table.install(track("r2", "c1", TrackKind::Audio));
        table.install(track("r3", "c2", TrackKind::Video));
        assert_eq!(table.tracks_owned_by(&ConnectionId::from("c1")).len(), 2);
    }

    #[test]
    fn test_concurrent_installs_keep_one_track_per_kind() {
        let table = std::sync::Arc::new(ProducerTable::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let table = table.clone();
                std::thread::spawn(move || {
                    table.install(track("r1", &format!("c{i}"), TrackKind::Video));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.track_counts(), (1, 0));
    }
}
