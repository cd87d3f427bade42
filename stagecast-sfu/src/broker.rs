//! Publishing and consumption
//!
//! A publish installs a track as its room's current producer for that kind;
//! a subscribe hands a viewer one consumer per kind it can decode.

use crate::capabilities::{RtpCapabilities, RtpParameters};
use crate::engine::ConsumerDescriptor;
use crate::error::{Result, SfuError};
use crate::events::SfuEvent;
use crate::manager::SessionManager;
use crate::room::{PublishTransition, RoomProducers};
use crate::track::{Track, TrackKind};
use crate::transport::{ConsumerEntry, TransportRole, TransportState};
use crate::types::{ConnectionId, RoomId, TrackId, TransportId};
use chrono::Utc;
use tracing::{debug, info, warn};

/// Result of a publish
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub track_id: TrackId,
    pub transition: PublishTransition,
}

impl SessionManager {
    /// Publish a track of `kind` into `room_id` on the connection's send transport
    pub async fn publish(
        &self,
        room_id: RoomId,
        connection_id: &ConnectionId,
        kind: TrackKind,
        rtp_parameters: RtpParameters,
    ) -> Result<PublishOutcome> {
        let send = self
            .registry
            .send_transport(connection_id)?
            .filter(|t| t.state == TransportState::Connected)
            .ok_or_else(|| SfuError::SendTransportUnavailable(connection_id.clone()))?;

        let track_id = self.engine.produce(&send.id, kind, &rtp_parameters).await?;

        let hosted_before =
            match self
                .registry
                .host_track(connection_id, &send.id, kind, track_id.clone())
            {
                Ok(previous) => previous,
                Err(e) => {
                    // Transport closed while the engine was producing
                    self.engine.close_producer(&track_id).await;
                    return Err(e);
                }
            };
        if let Some(older) = hosted_before {
            self.close_hosted_track(&older, kind).await;
        }

        let track = Track {
            id: track_id.clone(),
            kind,
            room_id: room_id.clone(),
            connection_id: connection_id.clone(),
            transport_id: send.id.clone(),
            rtp_parameters,
            created_at: Utc::now(),
        };

        let transition = self.producers.install(track);
        match &transition {
            PublishTransition::Published => {
                info!(
                    room_id = %room_id,
                    connection_id = %connection_id,
                    track_id = %track_id,
                    kind = %kind,
                    "Track published"
                );
            }
            PublishTransition::Replaced { previous } => {
                info!(
                    room_id = %room_id,
                    connection_id = %connection_id,
                    track_id = %track_id,
                    previous_track = %previous.id,
                    kind = %kind,
                    "Track replaced the room's current producer"
                );
                if self.config.close_replaced_producers {
                    self.close_transport(&previous.connection_id, Some(&previous.transport_id))
                        .await;
                    self.retire_track(previous.clone()).await;
                }
            }
        }

        let _ = self.events.send(SfuEvent::NewProducer {
            room_id,
            kind,
            track_id: track_id.clone(),
            origin: connection_id.clone(),
        });

        Ok(PublishOutcome {
            track_id,
            transition,
        })
    }

    /// A send transport hosts one track per kind; the older one goes away
    async fn close_hosted_track(&self, track_id: &TrackId, kind: TrackKind) {
        debug!(track_id = %track_id, kind = %kind, "Closing track superseded on its transport");
        match self.producers.find(track_id) {
            Some(track) => {
                if let Some(removed) = self.producers.remove_if_current(&track.room_id, kind, track_id)
                {
                    self.retire_track(removed).await;
                }
            }
            None => self.engine.close_producer(track_id).await,
        }
    }

    /// Current tracks of a room
    pub fn list_candidates(&self, room_id: &RoomId) -> RoomProducers {
        self.producers.candidates(room_id)
    }

    /// Create one consumer per room track the viewer can decode.
    ///
    /// Fails with [`SfuError::NothingToConsume`] when the room has no tracks;
    /// an empty list means tracks exist but none match `capabilities`.
    pub async fn subscribe(
        &self,
        connection_id: &ConnectionId,
        transport_id: &TransportId,
        room_id: &RoomId,
        capabilities: &RtpCapabilities,
    ) -> Result<Vec<ConsumerDescriptor>> {
        let transport = self.registry.find(connection_id, transport_id)?;
        if transport.role != TransportRole::Receive {
            return Err(SfuError::TransportNotFound(transport_id.clone()));
        }

        let candidates = self.producers.candidates(room_id);
        if candidates.is_empty() {
            return Err(SfuError::NothingToConsume(room_id.clone()));
        }

        let mut created: Vec<ConsumerDescriptor> = Vec::new();
        for track in candidates.iter() {
            if !self.engine.can_consume(&track.id, capabilities) {
                debug!(
                    connection_id = %connection_id,
                    track_id = %track.id,
                    kind = %track.kind,
                    "Receiver cannot consume track"
                );
                continue;
            }

            let consumer = match self.engine.consume(transport_id, &track.id, capabilities).await {
                Ok(consumer) => consumer,
                Err(e) => {
                    self.abort_consumers(connection_id, &created).await;
                    return Err(e);
                }
            };

            let entry = ConsumerEntry {
                id: consumer.id.clone(),
                track_id: track.id.clone(),
                room_id: room_id.clone(),
                kind: track.kind,
                transport_id: transport_id.clone(),
            };
            if let Err(e) = self.registry.add_consumer(connection_id, entry) {
                self.engine.close_consumer(&consumer.id).await;
                self.abort_consumers(connection_id, &created).await;
                return Err(e);
            }

            // The track may have been retired while the consumer was created
            if self.producers.find(&track.id).is_none() {
                warn!(track_id = %track.id, "Track left the room during subscribe");
                self.registry.remove_consumer(connection_id, &consumer.id);
                self.engine.close_consumer(&consumer.id).await;
                continue;
            }

            created.push(consumer);
        }

        info!(
            connection_id = %connection_id,
            room_id = %room_id,
            consumers = created.len(),
            "Viewer subscribed"
        );
        Ok(created)
    }

    async fn abort_consumers(&self, connection_id: &ConnectionId, created: &[ConsumerDescriptor]) {
        for consumer in created {
            self.registry.remove_consumer(connection_id, &consumer.id);
            self.engine.close_consumer(&consumer.id).await;
        }
        debug!(connection_id = %connection_id, aborted = created.len(), "Subscribe rolled back");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{default_capabilities, RtpCodecParameters};
    use crate::config::SfuConfig;
    use crate::engine::InProcessEngine;
    use serde_json::{json, Map};
    use std::sync::Arc;

    fn vp8() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 96,
                clock_rate: 90000,
                channels: None,
                parameters: Map::new(),
            }],
            ..Default::default()
        }
    }

    async fn publisher(manager: &SessionManager, name: &str) -> ConnectionId {
        let conn = ConnectionId::from(name);
        manager.open_connection(conn.clone()).await.unwrap();
        let send = manager
            .open_transport(&conn, TransportRole::Send)
            .await
            .unwrap();
        manager
            .connect_transport(&conn, &send.id, &json!({}))
            .await
            .unwrap();
        conn
    }

    #[tokio::test]
    async fn test_publish_without_send_transport() {
        let manager = SessionManager::new(SfuConfig::default(), Arc::new(InProcessEngine::default()));
        let conn = ConnectionId::from("c1");
        manager.open_connection(conn.clone()).await.unwrap();

        let result = manager
            .publish(RoomId::from("r1"), &conn, TrackKind::Video, vp8())
            .await;
        assert_eq!(
            result.unwrap_err(),
            SfuError::SendTransportUnavailable(conn.clone())
        );

        // Created but not connected is not enough either
        manager.open_transport(&conn, TransportRole::Send).await.unwrap();
        let result = manager
            .publish(RoomId::from("r1"), &conn, TrackKind::Video, vp8())
            .await;
        assert!(matches!(result, Err(SfuError::SendTransportUnavailable(_))));
    }

    #[tokio::test]
    async fn test_republish_same_kind_closes_older_track() {
        let manager = SessionManager::new(SfuConfig::default(), Arc::new(InProcessEngine::default()));
        let conn = publisher(&manager, "c1").await;
        let room = RoomId::from("r1");

        let first = manager
            .publish(room.clone(), &conn, TrackKind::Video, vp8())
            .await
            .unwrap();
        let second = manager
            .publish(room.clone(), &conn, TrackKind::Video, vp8())
            .await
            .unwrap();

        assert!(matches!(second.transition, PublishTransition::Published));
        let current = manager.list_candidates(&room);
        assert_eq!(current.video.unwrap().id, second.track_id);
        assert_ne!(first.track_id, second.track_id);
    }

    #[tokio::test]
    async fn test_subscribe_on_send_transport_is_rejected() {
        let manager = SessionManager::new(SfuConfig::default(), Arc::new(InProcessEngine::default()));
        let conn = publisher(&manager, "c1").await;
        let send = manager.transports().send_transport(&conn).unwrap().unwrap();

        let result = manager
            .subscribe(&conn, &send.id, &RoomId::from("r1"), &default_capabilities())
            .await;
        assert!(matches!(result, Err(SfuError::TransportNotFound(_))));
    }

    #[tokio::test]
    async fn test_subscribe_empty_room() {
        let manager = SessionManager::new(SfuConfig::default(), Arc::new(InProcessEngine::default()));
        let viewer = ConnectionId::from("v1");
        manager.open_connection(viewer.clone()).await.unwrap();
        let recv = manager
            .open_transport(&viewer, TransportRole::Receive)
            .await
            .unwrap();

        let result = manager
            .subscribe(&viewer, &recv.id, &RoomId::from("empty"), &default_capabilities())
            .await;
        assert_eq!(
            result.unwrap_err(),
            SfuError::NothingToConsume(RoomId::from("empty"))
        );
    }

    #[tokio::test]
    async fn test_publish_notifies_others() {
        let manager = SessionManager::new(SfuConfig::default(), Arc::new(InProcessEngine::default()));
        let mut events = manager.subscribe_events();
        let conn = publisher(&manager, "c1").await;

        let outcome = manager
            .publish(RoomId::from("r1"), &conn, TrackKind::Video, vp8())
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert!(!event.is_for(&conn));
        assert!(event.is_for(&ConnectionId::from("someone-else")));
        assert_eq!(
            event,
            SfuEvent::NewProducer {
                room_id: RoomId::from("r1"),
                kind: TrackKind::Video,
                track_id: outcome.track_id,
                origin: conn,
            }
        );
    }
}
