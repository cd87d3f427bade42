//! Connection loss handling
//!
//! Transports of a departed connection are closed right away. Its tracks stay
//! listed for the grace period so viewers mid-negotiation do not race the
//! removal, then a sweep drops them if nobody is watching.

use crate::config::ViewerScope;
use crate::manager::SessionManager;
use crate::track::Track;
use crate::types::{ConnectionId, RoomId, TrackId};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

/// What a disconnect released
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectReport {
    pub closed_transports: usize,
    pub closed_consumers: usize,
    /// Tracks left listed until their grace sweep runs
    pub pending_tracks: Vec<TrackId>,
}

impl SessionManager {
    /// Release everything `connection_id` owned and schedule grace sweeps
    /// for the tracks it was publishing. Calling it again is a no-op.
    pub async fn disconnect(self: &Arc<Self>, connection_id: &ConnectionId) -> DisconnectReport {
        let Some(released) = self.registry.remove_connection(connection_id) else {
            return DisconnectReport::default();
        };

        let mut report = DisconnectReport {
            closed_transports: released.transports.len(),
            closed_consumers: released.consumers.len(),
            pending_tracks: Vec::new(),
        };
        self.release(released, false).await;

        for track in self.producers.tracks_owned_by(connection_id) {
            report.pending_tracks.push(track.id.clone());
            self.schedule_sweep(track);
        }

        info!(
            connection_id = %connection_id,
            closed_transports = report.closed_transports,
            closed_consumers = report.closed_consumers,
            pending_tracks = report.pending_tracks.len(),
            "Connection closed"
        );
        report
    }

    fn schedule_sweep(self: &Arc<Self>, track: Track) {
        let manager = Arc::clone(self);
        let grace = self.config.grace_period();
        self.pending_sweeps.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            tokio::select! {
                () = manager.shutdown.cancelled() => {
                    debug!(track_id = %track.id, "Grace sweep cancelled");
                }
                () = tokio::time::sleep(grace) => {
                    manager.sweep(track).await;
                }
            }
            manager.pending_sweeps.fetch_sub(1, Ordering::Relaxed);
        });
    }

    async fn sweep(&self, track: Track) {
        if self.has_viewers(&track.room_id) {
            info!(
                room_id = %track.room_id,
                track_id = %track.id,
                scope = ?self.config.viewer_scope,
                "Viewers present, keeping departed publisher's track listed"
            );
            return;
        }

        match self
            .producers
            .remove_if_current(&track.room_id, track.kind, &track.id)
        {
            Some(removed) => self.retire_track(removed).await,
            None => debug!(track_id = %track.id, "Track already replaced or removed"),
        }
    }

    /// Viewer presence as seen by the grace sweep
    fn has_viewers(&self, room_id: &RoomId) -> bool {
        match self.config.viewer_scope {
            ViewerScope::Global => self.registry.any_receive_transport(),
            ViewerScope::Room => self.registry.room_has_consumers(room_id),
        }
    }
}
