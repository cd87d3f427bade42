//! Media engine seam
//!
//! The relay does not negotiate ICE/DTLS or forward RTP itself. Everything
//! below the session tables goes through [`MediaEngine`], which only has to
//! create and connect transports, produce a track and consume a track given
//! compatible receive capabilities.
//!
//! [`InProcessEngine`] keeps engine-side bookkeeping in memory and answers
//! compatibility by codec intersection. It backs the default server build and
//! the test suites.

use crate::capabilities::{default_capabilities, RtpCapabilities, RtpParameters};
use crate::error::{Result, SfuError};
use crate::track::TrackKind;
use crate::transport::TransportRole;
use crate::types::{ConsumerId, TrackId, TransportId};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::debug;

/// Parameters a client needs to set up its side of a transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: TransportId,
    pub ice_parameters: Value,
    pub ice_candidates: Vec<Value>,
    pub dtls_parameters: Value,
}

/// What a viewer needs to receive one track
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDescriptor {
    pub id: ConsumerId,
    /// Source track (the producer id, in client terms)
    pub producer_id: TrackId,
    pub kind: TrackKind,
    pub rtp_parameters: RtpParameters,
}

/// Black-box transport and codec engine
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Receive capabilities of the relay
    fn capabilities(&self) -> RtpCapabilities;

    /// Fails when the engine cannot take new connections
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn create_transport(&self, role: TransportRole) -> Result<TransportParams>;

    /// Complete the DTLS/ICE handshake with the client's parameters
    async fn connect_transport(&self, transport_id: &TransportId, handshake: &Value) -> Result<()>;

    /// Close a transport together with every producer and consumer on it
    async fn close_transport(&self, transport_id: &TransportId);

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: TrackKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<TrackId>;

    /// Capability intersection: can a receiver with `capabilities` consume the track
    fn can_consume(&self, track_id: &TrackId, capabilities: &RtpCapabilities) -> bool;

    async fn consume(
        &self,
        transport_id: &TransportId,
        track_id: &TrackId,
        capabilities: &RtpCapabilities,
    ) -> Result<ConsumerDescriptor>;

    async fn close_producer(&self, track_id: &TrackId);

    async fn close_consumer(&self, consumer_id: &ConsumerId);
}

struct EngineTransport {
    role: TransportRole,
    connected: bool,
}

struct EngineProducer {
    transport_id: TransportId,
    kind: TrackKind,
    rtp_parameters: RtpParameters,
}

struct EngineConsumer {
    transport_id: TransportId,
    track_id: TrackId,
}

/// In-memory engine
pub struct InProcessEngine {
    capabilities: RtpCapabilities,
    announced_ip: String,
    min_port: u16,
    max_port: u16,
    next_port: AtomicU32,
    next_ssrc: AtomicU32,
    available: AtomicBool,
    transports: DashMap<TransportId, EngineTransport>,
    producers: DashMap<TrackId, EngineProducer>,
    consumers: DashMap<ConsumerId, EngineConsumer>,
}

impl InProcessEngine {
    #[must_use]
    pub fn new(announced_ip: impl Into<String>, min_port: u16, max_port: u16) -> Self {
        Self {
            capabilities: default_capabilities(),
            announced_ip: announced_ip.into(),
            min_port,
            max_port: max_port.max(min_port),
            next_port: AtomicU32::new(0),
            next_ssrc: AtomicU32::new(0x1000_0000),
            available: AtomicBool::new(true),
            transports: DashMap::new(),
            producers: DashMap::new(),
            consumers: DashMap::new(),
        }
    }

    /// Mark the engine (un)available for new connections
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    fn allocate_port(&self) -> u16 {
        let span = u32::from(self.max_port - self.min_port) + 1;
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % span;
        // offset < span <= u16::MAX + 1, so the sum stays within max_port
        self.min_port + u16::try_from(offset).unwrap_or(0)
    }

    fn drop_consumers_where(&self, predicate: impl Fn(&EngineConsumer) -> bool) {
        self.consumers.retain(|_, consumer| !predicate(consumer));
    }
}

impl Default for InProcessEngine {
    fn default() -> Self {
        Self::new("127.0.0.1", 40000, 49999)
    }
}

#[async_trait]
impl MediaEngine for InProcessEngine {
    fn capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    async fn health_check(&self) -> Result<()> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(SfuError::Engine("media engine unavailable".to_string()))
        }
    }

    async fn create_transport(&self, role: TransportRole) -> Result<TransportParams> {
        self.health_check().await?;

        let id = TransportId::generate();
        let port = self.allocate_port();
        self.transports.insert(
            id.clone(),
            EngineTransport {
                role,
                connected: false,
            },
        );
        debug!(transport_id = %id, role = ?role, port, "Engine transport created");

        Ok(TransportParams {
            ice_parameters: json!({
                "usernameFragment": nanoid::nanoid!(16),
                "password": nanoid::nanoid!(24),
                "iceLite": true,
            }),
            ice_candidates: vec![json!({
                "foundation": "udpcandidate",
                "ip": self.announced_ip,
                "port": port,
                "priority": 1_076_302_079u32,
                "protocol": "udp",
                "type": "host",
            })],
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{
                    "algorithm": "sha-256",
                    "value": uuid::Uuid::new_v4().simple().to_string(),
                }],
            }),
            id,
        })
    }

    async fn connect_transport(&self, transport_id: &TransportId, handshake: &Value) -> Result<()> {
        if !handshake.is_object() {
            return Err(SfuError::InvalidParameters(
                "handshake parameters must be an object".to_string(),
            ));
        }
        let mut transport = self
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;
        transport.connected = true;
        Ok(())
    }

    async fn close_transport(&self, transport_id: &TransportId) {
        if self.transports.remove(transport_id).is_none() {
            return;
        }
        let closed_tracks: Vec<TrackId> = self
            .producers
            .iter()
            .filter(|p| &p.transport_id == transport_id)
            .map(|p| p.key().clone())
            .collect();
        for track_id in &closed_tracks {
            self.producers.remove(track_id);
        }
        self.drop_consumers_where(|c| {
            &c.transport_id == transport_id || closed_tracks.contains(&c.track_id)
        });
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: TrackKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<TrackId> {
        {
            let transport = self
                .transports
                .get(transport_id)
                .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;
            if transport.role != TransportRole::Send || !transport.connected {
                return Err(SfuError::Engine(format!(
                    "transport {transport_id} cannot produce"
                )));
            }
        }

        let codec = rtp_parameters
            .codecs
            .first()
            .ok_or_else(|| SfuError::InvalidParameters("no codecs declared".to_string()))?;
        if TrackKind::from_mime_type(&codec.mime_type) != Some(kind) {
            return Err(SfuError::InvalidParameters(format!(
                "codec {} does not carry {kind}",
                codec.mime_type
            )));
        }
        if !self.capabilities.supports(codec) {
            return Err(SfuError::InvalidParameters(format!(
                "codec {} is not supported",
                codec.mime_type
            )));
        }

        let track_id = TrackId::generate();
        self.producers.insert(
            track_id.clone(),
            EngineProducer {
                transport_id: transport_id.clone(),
                kind,
                rtp_parameters: rtp_parameters.clone(),
            },
        );
        Ok(track_id)
    }

    fn can_consume(&self, track_id: &TrackId, capabilities: &RtpCapabilities) -> bool {
        self.producers
            .get(track_id)
            .and_then(|p| p.rtp_parameters.codecs.first().cloned())
            .is_some_and(|codec| capabilities.supports(&codec))
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        track_id: &TrackId,
        capabilities: &RtpCapabilities,
    ) -> Result<ConsumerDescriptor> {
        {
            let transport = self
                .transports
                .get(transport_id)
                .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;
            if transport.role != TransportRole::Receive {
                return Err(SfuError::Engine(format!(
                    "transport {transport_id} cannot consume"
                )));
            }
        }

        let (kind, mut codec) = {
            let producer = self
                .producers
                .get(track_id)
                .ok_or_else(|| SfuError::Engine(format!("producer {track_id} is closed")))?;
            let codec = producer
                .rtp_parameters
                .codecs
                .first()
                .cloned()
                .ok_or_else(|| SfuError::Engine(format!("producer {track_id} has no codec")))?;
            (producer.kind, codec)
        };

        let capability = capabilities
            .find(&codec)
            .ok_or_else(|| SfuError::Engine(format!("receiver cannot decode {}", codec.mime_type)))?;
        if let Some(payload_type) = capability.preferred_payload_type {
            codec.payload_type = payload_type;
        }

        let consumer_id = ConsumerId::generate();
        let ssrc = self.next_ssrc.fetch_add(1, Ordering::Relaxed);
        self.consumers.insert(
            consumer_id.clone(),
            EngineConsumer {
                transport_id: transport_id.clone(),
                track_id: track_id.clone(),
            },
        );

        Ok(ConsumerDescriptor {
            id: consumer_id,
            producer_id: track_id.clone(),
            kind,
            rtp_parameters: RtpParameters {
                mid: None,
                codecs: vec![codec],
                encodings: vec![json!({ "ssrc": ssrc })],
                header_extensions: Vec::new(),
            },
        })
    }

    async fn close_producer(&self, track_id: &TrackId) {
        if self.producers.remove(track_id).is_some() {
            self.drop_consumers_where(|c| &c.track_id == track_id);
        }
    }

    async fn close_consumer(&self, consumer_id: &ConsumerId) {
        self.consumers.remove(consumer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::RtpCodecParameters;
    use serde_json::Map;

    fn opus_parameters() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 111,
                clock_rate: 48000,
                channels: Some(2),
                parameters: Map::new(),
            }],
            ..Default::default()
        }
    }

    async fn connected_send(engine: &InProcessEngine) -> TransportId {
        let params = engine.create_transport(TransportRole::Send).await.unwrap();
        engine
            .connect_transport(&params.id, &json!({"fingerprints": []}))
            .await
            .unwrap();
        params.id
    }

    #[tokio::test]
    async fn test_produce_requires_connected_send_transport() {
        let engine = InProcessEngine::default();
        let params = engine.create_transport(TransportRole::Send).await.unwrap();
        let result = engine
            .produce(&params.id, TrackKind::Audio, &opus_parameters())
            .await;
        assert!(result.is_err());

        let send = connected_send(&engine).await;
        assert!(engine
            .produce(&send, TrackKind::Audio, &opus_parameters())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_produce_rejects_kind_mismatch() {
        let engine = InProcessEngine::default();
        let send = connected_send(&engine).await;
        let result = engine
            .produce(&send, TrackKind::Video, &opus_parameters())
            .await;
        assert!(matches!(result, Err(SfuError::InvalidParameters(_))));
    }

    #[tokio::test]
    async fn test_consume_uses_receiver_payload_type() {
        let engine = InProcessEngine::default();
        let send = connected_send(&engine).await;
        let track = engine
            .produce(&send, TrackKind::Audio, &opus_parameters())
            .await
            .unwrap();
        let recv = engine.create_transport(TransportRole::Receive).await.unwrap();

        let caps = default_capabilities();
        assert!(engine.can_consume(&track, &caps));
        let consumer = engine.consume(&recv.id, &track, &caps).await.unwrap();
        assert_eq!(consumer.rtp_parameters.codecs[0].payload_type, 100);
        assert_eq!(consumer.producer_id, track);
        assert_eq!(engine.consumer_count(), 1);
    }

    #[tokio::test]
    async fn test_incompatible_receiver() {
        let engine = InProcessEngine::default();
        let send = connected_send(&engine).await;
        let track = engine
            .produce(&send, TrackKind::Audio, &opus_parameters())
            .await
            .unwrap();
        assert!(!engine.can_consume(&track, &RtpCapabilities::default()));
    }

    #[tokio::test]
    async fn test_closing_transport_closes_its_producers_and_consumers() {
        let engine = InProcessEngine::default();
        let send = connected_send(&engine).await;
        let track = engine
            .produce(&send, TrackKind::Audio, &opus_parameters())
            .await
            .unwrap();
        let recv = engine.create_transport(TransportRole::Receive).await.unwrap();
        engine
            .consume(&recv.id, &track, &default_capabilities())
            .await
            .unwrap();

        engine.close_transport(&send).await;
        assert_eq!(engine.producer_count(), 0);
        assert_eq!(engine.consumer_count(), 0);
        assert_eq!(engine.transport_count(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_engine_refuses_transports() {
        let engine = InProcessEngine::default();
        engine.set_available(false);
        assert!(engine.health_check().await.is_err());
        assert!(engine.create_transport(TransportRole::Receive).await.is_err());
    }
}
