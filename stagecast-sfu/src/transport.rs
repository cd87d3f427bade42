//! Transport registry
//!
//! Per-connection ownership of one send transport and any number of receive
//! transports, plus the consumers bound to those receive transports. The
//! registry is pure bookkeeping; engine calls happen in the session manager.

use crate::error::{Result, SfuError};
use crate::track::TrackKind;
use crate::types::{ConnectionId, ConsumerId, RoomId, TrackId, TransportId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Direction of a transport, seen from the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportRole {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Created,
    Connecting,
    Connected,
    Closed,
}

/// A transport owned by one connection
#[derive(Debug, Clone)]
pub struct TransportEntry {
    pub id: TransportId,
    pub role: TransportRole,
    pub state: TransportState,
    /// Tracks produced on this transport, at most one per kind
    pub hosted: HashMap<TrackKind, TrackId>,
    pub created_at: DateTime<Utc>,
}

impl TransportEntry {
    #[must_use]
    pub fn new(id: TransportId, role: TransportRole) -> Self {
        Self {
            id,
            role,
            state: TransportState::Created,
            hosted: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}

/// A consumer bound to one of the connection's receive transports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerEntry {
    pub id: ConsumerId,
    pub track_id: TrackId,
    pub room_id: RoomId,
    pub kind: TrackKind,
    pub transport_id: TransportId,
}

/// Everything a connection owned, handed back when it is torn down
#[derive(Debug, Default)]
pub struct ReleasedResources {
    pub transports: Vec<TransportEntry>,
    pub consumers: Vec<ConsumerEntry>,
}

struct ConnectionSession {
    send: Option<TransportEntry>,
    /// Send transports whose reference was replaced by a newer one; still
    /// open, closed with the connection
    retired: Vec<TransportEntry>,
    receive: Vec<TransportEntry>,
    consumers: Vec<ConsumerEntry>,
}

impl ConnectionSession {
    const fn new() -> Self {
        Self {
            send: None,
            retired: Vec::new(),
            receive: Vec::new(),
            consumers: Vec::new(),
        }
    }

    fn transport_mut(&mut self, transport_id: &TransportId) -> Option<&mut TransportEntry> {
        self.send
            .iter_mut()
            .chain(self.retired.iter_mut())
            .chain(self.receive.iter_mut())
            .find(|t| &t.id == transport_id)
    }

    fn take_transport(&mut self, transport_id: &TransportId) -> Option<TransportEntry> {
        if self.send.as_ref().is_some_and(|t| &t.id == transport_id) {
            return self.send.take();
        }
        if let Some(pos) = self.retired.iter().position(|t| &t.id == transport_id) {
            return Some(self.retired.remove(pos));
        }
        if let Some(pos) = self.receive.iter().position(|t| &t.id == transport_id) {
            return Some(self.receive.remove(pos));
        }
        None
    }

    fn drain(&mut self) -> ReleasedResources {
        let mut transports: Vec<TransportEntry> = self.send.take().into_iter().collect();
        transports.append(&mut self.retired);
        transports.append(&mut self.receive);
        ReleasedResources {
            transports,
            consumers: std::mem::take(&mut self.consumers),
        }
    }
}

/// Registry of connections and the transports they own
#[derive(Default)]
pub struct TransportRegistry {
    connections: DashMap<ConnectionId, ConnectionSession>,
}

impl TransportRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a connection
    pub fn register(&self, connection_id: ConnectionId) {
        self.connections
            .entry(connection_id)
            .or_insert_with(ConnectionSession::new);
    }

    #[must_use]
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.connections.contains_key(connection_id)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Record a newly created transport under the connection.
    ///
    /// A send transport replaces the connection's send reference and the
    /// previous one is returned; it stays open and is closed with the
    /// connection.
    pub fn insert(
        &self,
        connection_id: &ConnectionId,
        entry: TransportEntry,
    ) -> Result<Option<TransportId>> {
        let mut session = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| SfuError::ConnectionUnknown(connection_id.clone()))?;

        match entry.role {
            TransportRole::Send => {
                let previous = session.send.replace(entry);
                Ok(previous.map(|prev| {
                    let id = prev.id.clone();
                    session.retired.push(prev);
                    id
                }))
            }
            TransportRole::Receive => {
                session.receive.push(entry);
                Ok(None)
            }
        }
    }

    /// Number of receive transports the connection currently holds
    pub fn receive_count(&self, connection_id: &ConnectionId) -> Result<usize> {
        self.connections
            .get(connection_id)
            .map(|s| s.receive.len())
            .ok_or_else(|| SfuError::ConnectionUnknown(connection_id.clone()))
    }

    pub fn find(
        &self,
        connection_id: &ConnectionId,
        transport_id: &TransportId,
    ) -> Result<TransportEntry> {
        let mut session = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| SfuError::ConnectionUnknown(connection_id.clone()))?;
        session
            .transport_mut(transport_id)
            .map(|t| t.clone())
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))
    }

    /// The connection's current send transport
    pub fn send_transport(&self, connection_id: &ConnectionId) -> Result<Option<TransportEntry>> {
        self.connections
            .get(connection_id)
            .map(|s| s.send.clone())
            .ok_or_else(|| SfuError::ConnectionUnknown(connection_id.clone()))
    }

    pub fn set_state(
        &self,
        connection_id: &ConnectionId,
        transport_id: &TransportId,
        state: TransportState,
    ) -> Result<()> {
        let mut session = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| SfuError::ConnectionUnknown(connection_id.clone()))?;
        let transport = session
            .transport_mut(transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;
        transport.state = state;
        Ok(())
    }

    /// Record that a send transport now hosts `track_id` for `kind`.
    /// Returns the track it hosted for that kind before, if any.
    pub fn host_track(
        &self,
        connection_id: &ConnectionId,
        transport_id: &TransportId,
        kind: TrackKind,
        track_id: TrackId,
    ) -> Result<Option<TrackId>> {
        let mut session = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| SfuError::ConnectionUnknown(connection_id.clone()))?;
        let transport = session
            .transport_mut(transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;
        Ok(transport.hosted.insert(kind, track_id))
    }

    /// Remove one transport and the consumers bound to it.
    ///
    /// Closing something already gone is not an error.
    pub fn remove(
        &self,
        connection_id: &ConnectionId,
        transport_id: &TransportId,
    ) -> Option<(TransportEntry, Vec<ConsumerEntry>)> {
        let mut session = self.connections.get_mut(connection_id)?;
        let mut transport = session.take_transport(transport_id)?;
        transport.state = TransportState::Closed;

        let (dropped, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut session.consumers)
            .into_iter()
            .partition(|c| &c.transport_id == transport_id);
        session.consumers = kept;
        Some((transport, dropped))
    }

    /// Remove every transport of the connection but keep the connection
    pub fn remove_all(&self, connection_id: &ConnectionId) -> ReleasedResources {
        self.connections
            .get_mut(connection_id)
            .map(|mut s| s.drain())
            .unwrap_or_default()
    }

    /// Forget the connection entirely, returning what it owned
    pub fn remove_connection(&self, connection_id: &ConnectionId) -> Option<ReleasedResources> {
        self.connections
            .remove(connection_id)
            .map(|(_, mut session)| session.drain())
    }

    pub fn add_consumer(&self, connection_id: &ConnectionId, consumer: ConsumerEntry) -> Result<()> {
        let mut session = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| SfuError::ConnectionUnknown(connection_id.clone()))?;
        if !session.receive.iter().any(|t| t.id == consumer.transport_id) {
            return Err(SfuError::TransportNotFound(consumer.transport_id));
        }
        session.consumers.push(consumer);
        Ok(())
    }

    pub fn remove_consumer(
        &self,
        connection_id: &ConnectionId,
        consumer_id: &ConsumerId,
    ) -> Option<ConsumerEntry> {
        let mut session = self.connections.get_mut(connection_id)?;
        let pos = session.consumers.iter().position(|c| &c.id == consumer_id)?;
        Some(session.consumers.remove(pos))
    }

    /// Detach every consumer of `track_id`, across all connections
    pub fn remove_consumers_of_track(&self, track_id: &TrackId) -> Vec<(ConnectionId, ConsumerEntry)> {
        let mut removed = Vec::new();
        for mut session in self.connections.iter_mut() {
            let connection_id = session.key().clone();
            let (dropped, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut session.consumers)
                .into_iter()
                .partition(|c| &c.track_id == track_id);
            session.consumers = kept;
            removed.extend(dropped.into_iter().map(|c| (connection_id.clone(), c)));
        }
        removed
    }

    /// Whether any connection holds a receive transport
    #[must_use]
    pub fn any_receive_transport(&self) -> bool {
        self.connections.iter().any(|s| !s.receive.is_empty())
    }

    /// Whether any connection consumes from `room_id`
    #[must_use]
    pub fn room_has_consumers(&self, room_id: &RoomId) -> bool {
        self.connections
            .iter()
            .any(|s| s.consumers.iter().any(|c| &c.room_id == room_id))
    }

    /// Ids of all transports the connection owns
    #[must_use]
    pub fn owned_transports(&self, connection_id: &ConnectionId) -> Vec<TransportId> {
        self.connections
            .get(connection_id)
            .map(|s| {
                s.send
                    .iter()
                    .chain(s.retired.iter())
                    .chain(s.receive.iter())
                    .map(|t| t.id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn consumers(&self, connection_id: &ConnectionId) -> Vec<ConsumerEntry> {
        self.connections
            .get(connection_id)
            .map(|s| s.consumers.clone())
            .unwrap_or_default()
    }

    /// Total number of receive transports across all connections
    #[must_use]
    pub fn receive_transport_total(&self) -> usize {
        self.connections.iter().map(|s| s.receive.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(conn: &str) -> (TransportRegistry, ConnectionId) {
        let registry = TransportRegistry::new();
        let id = ConnectionId::from(conn);
        registry.register(id.clone());
        (registry, id)
    }

    #[test]
    fn test_insert_requires_known_connection() {
        let registry = TransportRegistry::new();
        let entry = TransportEntry::new(TransportId::generate(), TransportRole::Send);
        let result = registry.insert(&ConnectionId::from("ghost"), entry);
        assert!(matches!(result, Err(SfuError::ConnectionUnknown(_))));
    }

    #[test]
    fn test_send_replacement_keeps_previous_open() {
        let (registry, conn) = registry_with("c1");
        let first = TransportId::generate();
        let second = TransportId::generate();

        registry
            .insert(&conn, TransportEntry::new(first.clone(), TransportRole::Send))
            .unwrap();
        let replaced = registry
            .insert(&conn, TransportEntry::new(second.clone(), TransportRole::Send))
            .unwrap();

        assert_eq!(replaced, Some(first.clone()));
        assert_eq!(registry.send_transport(&conn).unwrap().unwrap().id, second);
        assert_eq!(registry.owned_transports(&conn).len(), 2);
    }

    #[test]
    fn test_receive_transports_append() {
        let (registry, conn) = registry_with("c1");
        for _ in 0..3 {
            registry
                .insert(&conn, TransportEntry::new(TransportId::generate(), TransportRole::Receive))
                .unwrap();
        }
        assert_eq!(registry.receive_count(&conn).unwrap(), 3);
        assert!(registry.any_receive_transport());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (registry, conn) = registry_with("c1");
        let id = TransportId::generate();
        registry
            .insert(&conn, TransportEntry::new(id.clone(), TransportRole::Receive))
            .unwrap();

        let (closed, _) = registry.remove(&conn, &id).unwrap();
        assert_eq!(closed.state, TransportState::Closed);
        assert!(registry.remove(&conn, &id).is_none());
        assert!(registry.remove(&ConnectionId::from("ghost"), &id).is_none());
    }

    #[test]
    fn test_removing_receive_transport_drops_its_consumers() {
        let (registry, conn) = registry_with("c1");
        let recv = TransportId::generate();
        registry
            .insert(&conn, TransportEntry::new(recv.clone(), TransportRole::Receive))
            .unwrap();
        registry
            .add_consumer(
                &conn,
                ConsumerEntry {
                    id: ConsumerId::generate(),
                    track_id: TrackId::from("t1"),
                    room_id: RoomId::from("r1"),
                    kind: TrackKind::Video,
                    transport_id: recv.clone(),
                },
            )
            .unwrap();
        assert!(registry.room_has_consumers(&RoomId::from("r1")));

        let (_, consumers) = registry.remove(&conn, &recv).unwrap();
        assert_eq!(consumers.len(), 1);
        assert!(!registry.room_has_consumers(&RoomId::from("r1")));
    }

    #[test]
    fn test_remove_connection_releases_everything() {
        let (registry, conn) = registry_with("c1");
        registry
            .insert(&conn, TransportEntry::new(TransportId::generate(), TransportRole::Send))
            .unwrap();
        registry
            .insert(&conn, TransportEntry::new(TransportId::generate(), TransportRole::Receive))
            .unwrap();

        let released = registry.remove_connection(&conn).unwrap();
        assert_eq!(released.transports.len(), 2);
        assert!(registry.owned_transports(&conn).is_empty());
        assert!(!registry.contains(&conn));
        assert!(!registry.any_receive_transport());
    }

    #[test]
    fn test_host_track_reports_previous() {
        let (registry, conn) = registry_with("c1");
        let send = TransportId::generate();
        registry
            .insert(&conn, TransportEntry::new(send.clone(), TransportRole::Send))
            .unwrap();

        let first = registry
            .host_track(&conn, &send, TrackKind::Video, TrackId::from("t1"))
            .unwrap();
        let second = registry
            .host_track(&conn, &send, TrackKind::Video, TrackId::from("t2"))
            .unwrap();
        assert_eq!(first, None);
        assert_eq!(second, Some(TrackId::from("t1")));
    }
}
