//! Session manager - top-level owner of the relay's session state
//!
//! This module provides:
//! - Connection registration and transport lifecycle (open, connect, close)
//! - Room-independent capability negotiation
//! - Track retirement (producer close plus consumer teardown)
//! - Aggregate statistics
//!
//! Publishing and subscribing live in `broker`, connection loss in
//! `reconciler`; both extend [`SessionManager`].

use crate::capabilities::RtpCapabilities;
use crate::config::SfuConfig;
use crate::engine::{MediaEngine, TransportParams};
use crate::error::{Result, SfuError};
use crate::events::SfuEvent;
use crate::room::ProducerTable;
use crate::track::Track;
use crate::transport::{
    ReleasedResources, TransportEntry, TransportRegistry, TransportRole, TransportState,
};
use crate::types::{ConnectionId, RoomId, TransportId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the room event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Global session statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStats {
    pub connections: usize,
    pub active_rooms: usize,
    pub video_tracks: usize,
    pub audio_tracks: usize,
    pub receive_transports: usize,
    /// Departed publishers whose tracks are waiting out the grace period
    pub pending_sweeps: usize,
}

/// Whether a room is on air, plus every room that is
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProducerStatus {
    pub has_video: bool,
    pub has_audio: bool,
    pub all_room_ids: Vec<RoomId>,
}

/// Session manager - owns the transport registry and the producer table
pub struct SessionManager {
    pub(crate) config: Arc<SfuConfig>,
    pub(crate) engine: Arc<dyn MediaEngine>,
    pub(crate) registry: TransportRegistry,
    pub(crate) producers: ProducerTable,
    pub(crate) events: broadcast::Sender<SfuEvent>,
    pub(crate) pending_sweeps: AtomicUsize,
    pub(crate) shutdown: CancellationToken,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new(config: SfuConfig, engine: Arc<dyn MediaEngine>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            grace_period_secs = config.producer_grace_period_secs,
            viewer_scope = ?config.viewer_scope,
            close_replaced_producers = config.close_replaced_producers,
            "Session manager initialized"
        );

        Arc::new(Self {
            config: Arc::new(config),
            engine,
            registry: TransportRegistry::new(),
            producers: ProducerTable::new(),
            events,
            pending_sweeps: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    /// Get configuration
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    /// Receive room events (new producers, closed producers)
    pub fn subscribe_events(&self) -> broadcast::Receiver<SfuEvent> {
        self.events.subscribe()
    }

    /// Room-independent receive capabilities
    pub fn capabilities(&self) -> RtpCapabilities {
        self.engine.capabilities()
    }

    /// Register a new connection. Fails when the engine cannot serve it.
    pub async fn open_connection(&self, connection_id: ConnectionId) -> Result<()> {
        self.engine.health_check().await?;
        self.registry.register(connection_id.clone());
        info!(
            connection_id = %connection_id,
            connections = self.registry.connection_count(),
            "Connection opened"
        );
        Ok(())
    }

    #[must_use]
    pub fn is_open(&self, connection_id: &ConnectionId) -> bool {
        self.registry.contains(connection_id)
    }

    /// Allocate a transport owned by `connection_id`
    pub async fn open_transport(
        &self,
        connection_id: &ConnectionId,
        role: TransportRole,
    ) -> Result<TransportParams> {
        if !self.registry.contains(connection_id) {
            return Err(SfuError::ConnectionUnknown(connection_id.clone()));
        }
        let limit = self.config.max_receive_transports;
        if role == TransportRole::Receive
            && limit > 0
            && self.registry.receive_count(connection_id)? >= limit
        {
            return Err(SfuError::TransportLimit(limit));
        }

        let params = self.engine.create_transport(role).await?;
        match self
            .registry
            .insert(connection_id, TransportEntry::new(params.id.clone(), role))
        {
            Ok(Some(previous)) => {
                warn!(
                    connection_id = %connection_id,
                    previous_transport = %previous,
                    transport_id = %params.id,
                    "Send transport replaced; previous one stays open until the connection closes"
                );
            }
            Ok(None) => {}
            Err(e) => {
                // The connection went away while the engine was allocating
                self.engine.close_transport(&params.id).await;
                return Err(e);
            }
        }

        debug!(
            connection_id = %connection_id,
            transport_id = %params.id,
            role = ?role,
            "Transport opened"
        );
        Ok(params)
    }

    /// Run the transport handshake and mark it connected
    pub async fn connect_transport(
        &self,
        connection_id: &ConnectionId,
        transport_id: &TransportId,
        handshake: &serde_json::Value,
    ) -> Result<()> {
        self.registry.find(connection_id, transport_id)?;
        self.registry
            .set_state(connection_id, transport_id, TransportState::Connecting)?;

        if let Err(e) = self.engine.connect_transport(transport_id, handshake).await {
            let _ = self
                .registry
                .set_state(connection_id, transport_id, TransportState::Created);
            return Err(e);
        }

        self.registry
            .set_state(connection_id, transport_id, TransportState::Connected)?;
        debug!(connection_id = %connection_id, transport_id = %transport_id, "Transport connected");
        Ok(())
    }

    /// Close one transport, or every transport of the connection when
    /// `transport_id` is `None`. Idempotent; returns how many were closed.
    ///
    /// Tracks hosted on a closed send transport leave their room immediately.
    pub async fn close_transport(
        &self,
        connection_id: &ConnectionId,
        transport_id: Option<&TransportId>,
    ) -> usize {
        let released = match transport_id {
            Some(id) => self
                .registry
                .remove(connection_id, id)
                .map(|(transport, consumers)| ReleasedResources {
                    transports: vec![transport],
                    consumers,
                })
                .unwrap_or_default(),
            None => self.registry.remove_all(connection_id),
        };
        let closed = released.transports.len();
        self.release(released, true).await;
        if closed > 0 {
            debug!(connection_id = %connection_id, closed, "Transports closed");
        }
        closed
    }

    /// Close released transports and consumers in the engine. With
    /// `unlist_hosted`, tracks hosted on the transports are retired too.
    pub(crate) async fn release(&self, released: ReleasedResources, unlist_hosted: bool) {
        for consumer in &released.consumers {
            self.engine.close_consumer(&consumer.id).await;
        }
        for transport in &released.transports {
            self.engine.close_transport(&transport.id).await;
            if !unlist_hosted {
                continue;
            }
            for (kind, track_id) in &transport.hosted {
                let Some(track) = self.producers.find(track_id) else {
                    continue;
                };
                if let Some(removed) = self
                    .producers
                    .remove_if_current(&track.room_id, *kind, track_id)
                {
                    self.retire_track(removed).await;
                }
            }
        }
    }

    /// Close a track that left the producer table along with its consumers
    pub(crate) async fn retire_track(&self, track: Track) {
        self.engine.close_producer(&track.id).await;

        let consumers = self.registry.remove_consumers_of_track(&track.id);
        for (_, consumer) in &consumers {
            self.engine.close_consumer(&consumer.id).await;
        }

        info!(
            room_id = %track.room_id,
            track_id = %track.id,
            kind = %track.kind,
            closed_consumers = consumers.len(),
            "Track retired"
        );

        let _ = self.events.send(SfuEvent::ProducerClosed {
            room_id: track.room_id,
            kind: track.kind,
            track_id: track.id,
        });
    }

    /// Which kinds the room is producing, plus every room on air
    pub fn check_producer(&self, room_id: &RoomId) -> ProducerStatus {
        let current = self.producers.candidates(room_id);
        ProducerStatus {
            has_video: current.video.is_some(),
            has_audio: current.audio.is_some(),
            all_room_ids: self.producers.room_ids(),
        }
    }

    /// Ids of every transport the connection owns
    pub fn owned_transports(&self, connection_id: &ConnectionId) -> Vec<TransportId> {
        self.registry.owned_transports(connection_id)
    }

    pub fn producer_table(&self) -> &ProducerTable {
        &self.producers
    }

    pub fn transports(&self) -> &TransportRegistry {
        &self.registry
    }

    /// Get global statistics
    pub fn stats(&self) -> ManagerStats {
        let (video_tracks, audio_tracks) = self.producers.track_counts();
        ManagerStats {
            connections: self.registry.connection_count(),
            active_rooms: self.producers.room_count(),
            video_tracks,
            audio_tracks,
            receive_transports: self.registry.receive_transport_total(),
            pending_sweeps: self.pending_sweeps.load(Ordering::Relaxed),
        }
    }

    /// Cancel pending grace-period sweeps
    pub fn shutdown(&self) {
        let pending = self.pending_sweeps.load(Ordering::Relaxed);
        info!(pending_sweeps = pending, "Shutting down session manager");
        self.shutdown.cancel();
    }
}
