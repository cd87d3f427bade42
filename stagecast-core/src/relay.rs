//! External RTMP relay orchestrator
//!
//! Pushes a room to a third-party ingest endpoint through an encoder. When
//! the room has no live video to pull, a placeholder feed is pushed so the
//! destination always receives a valid stream. Health is best effort: it is
//! read from the encoder's output and exit, never from the destination.

use crate::config::RelayConfig;
use crate::encoder::{
    EncodePlan, EncoderInput, EncoderLauncher, EncoderOutput, EncoderProcess, ExitReport,
};
use crate::error::{Error, Result};
use crate::events::MediaEvent;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;
use stagecast_sfu::{RoomId, SessionManager};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Pre-compiled destination key pattern
static DESTINATION_KEY: LazyLock<Regex> = LazyLock::new(|| {
    // SAFETY: compile-time constant pattern, always valid
    Regex::new(r"^[A-Za-z0-9-]{1,64}$").expect("destination key regex is a valid constant")
});

/// Reject keys that could alter the destination URL
pub fn validate_destination_key(key: &str) -> Result<()> {
    if DESTINATION_KEY.is_match(key) {
        Ok(())
    } else {
        Err(Error::InvalidDestinationKey)
    }
}

/// Answers whether a room currently has live video to pull
pub trait LiveSourceProbe: Send + Sync + 'static {
    fn has_live_video(&self, room_id: &RoomId) -> bool;
}

impl LiveSourceProbe for SessionManager {
    fn has_live_video(&self, room_id: &RoomId) -> bool {
        self.check_producer(room_id).has_video
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelaySource {
    Live,
    Placeholder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    Idle,
    /// Spawned, no encoder output yet
    Starting,
    Relaying,
    Stopped,
    /// The encoder exited without being asked to
    Crashed,
}

impl RelayState {
    const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Relaying)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStarted {
    pub room_id: RoomId,
    pub source: RelaySource,
    /// Masked destination URL
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub state: RelayState,
    pub source: Option<RelaySource>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_output_at: Option<DateTime<Utc>>,
    pub destination: Option<String>,
    /// How the encoder ended, once it has
    pub exit: Option<String>,
}

impl RelayStatus {
    const fn idle() -> Self {
        Self {
            running: false,
            pid: None,
            state: RelayState::Idle,
            source: None,
            started_at: None,
            last_output_at: None,
            destination: None,
            exit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayStopOutcome {
    Stopped { exit: ExitReport },
    NotRunning,
}

struct RelayJob {
    room_id: RoomId,
    source: RelaySource,
    destination: String,
    process: EncoderProcess,
    stop_requested: AtomicBool,
}

impl RelayJob {
    fn status(&self) -> RelayStatus {
        let exit = self.process.exit_report();
        let state = match exit {
            None if self.process.last_output_at().is_some() => RelayState::Relaying,
            None => RelayState::Starting,
            Some(_) if self.stop_requested.load(Ordering::Acquire) => RelayState::Stopped,
            Some(_) => RelayState::Crashed,
        };
        self.snapshot(state, exit)
    }

    fn snapshot(&self, state: RelayState, exit: Option<ExitReport>) -> RelayStatus {
        RelayStatus {
            running: state.is_active(),
            pid: self.process.pid(),
            state,
            source: Some(self.source),
            started_at: Some(self.process.started_at()),
            last_output_at: self.process.last_output_at(),
            destination: Some(self.destination.clone()),
            exit: exit.map(|e| e.to_string()),
        }
    }
}

pub struct RelayOrchestrator {
    config: RelayConfig,
    launcher: Arc<dyn EncoderLauncher>,
    probe: Arc<dyn LiveSourceProbe>,
    events: broadcast::Sender<MediaEvent>,
    jobs: DashMap<RoomId, Arc<RelayJob>>,
    /// Last terminal status per room, readable after its job is gone
    finished: DashMap<RoomId, RelayStatus>,
}

impl RelayOrchestrator {
    pub fn new(
        config: RelayConfig,
        launcher: Arc<dyn EncoderLauncher>,
        probe: Arc<dyn LiveSourceProbe>,
        events: broadcast::Sender<MediaEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            launcher,
            probe,
            events,
            jobs: DashMap::new(),
            finished: DashMap::new(),
        })
    }

    /// Start pushing `room_id` to the ingest endpoint under `key`
    pub fn start(self: &Arc<Self>, room_id: RoomId, key: &str, title: &str) -> Result<RelayStarted> {
        validate_destination_key(key)?;

        let destination = mask_destination(&self.config.ingest_url, key);
        let job = match self.jobs.entry(room_id.clone()) {
            Entry::Occupied(_) => return Err(Error::AlreadyRelaying(room_id)),
            Entry::Vacant(slot) => {
                let (input, source) = self.select_input(&room_id, title);
                let plan = EncodePlan {
                    label: format!("relay:{room_id}"),
                    input,
                    output: EncoderOutput::Rtmp {
                        url: format!("{}/{key}", self.config.ingest_url.trim_end_matches('/')),
                        video_bitrate_kbps: self.config.video_bitrate_kbps,
                    },
                };
                let process = EncoderProcess::spawn(self.launcher.as_ref(), &plan)?;

                let job = Arc::new(RelayJob {
                    room_id: room_id.clone(),
                    source,
                    destination: destination.clone(),
                    process,
                    stop_requested: AtomicBool::new(false),
                });
                slot.insert(Arc::clone(&job));
                job
            }
        };
        self.finished.remove(&room_id);

        info!(
            room_id = %room_id,
            destination = %destination,
            source = ?job.source,
            "Relay started"
        );
        let _ = self.events.send(MediaEvent::RelayStarted {
            room_id: room_id.clone(),
            destination: destination.clone(),
        });
        let source = job.source;
        tokio::spawn(Arc::clone(self).watch_job(job));

        Ok(RelayStarted {
            room_id,
            source,
            destination,
        })
    }

    fn select_input(&self, room_id: &RoomId, title: &str) -> (EncoderInput, RelaySource) {
        if let Some(template) = &self.config.live_source_template {
            if self.probe.has_live_video(room_id) {
                let url = template.replace("{room}", room_id.as_str());
                return (EncoderInput::Url(url), RelaySource::Live);
            }
        }
        let title = if title.trim().is_empty() {
            room_id.to_string()
        } else {
            title.to_string()
        };
        (
            EncoderInput::Placeholder {
                title,
                width: self.config.placeholder_width,
                height: self.config.placeholder_height,
                fps: self.config.placeholder_fps,
            },
            RelaySource::Placeholder,
        )
    }

    /// Stop the relay; the job is gone afterwards whatever the exit looked like
    pub async fn stop(&self, room_id: &RoomId) -> RelayStopOutcome {
        let Some((_, job)) = self.jobs.remove(room_id) else {
            return RelayStopOutcome::NotRunning;
        };
        job.stop_requested.store(true, Ordering::Release);
        self.finished
            .insert(room_id.clone(), job.snapshot(RelayState::Stopped, None));

        info!(room_id = %room_id, "Stopping relay");
        let exit = job.process.shutdown(self.config.stop_timeout()).await;
        self.finished
            .insert(room_id.clone(), job.snapshot(RelayState::Stopped, Some(exit)));
        RelayStopOutcome::Stopped { exit }
    }

    pub async fn stop_all(&self) {
        let rooms: Vec<RoomId> = self.jobs.iter().map(|j| j.key().clone()).collect();
        if rooms.is_empty() {
            return;
        }
        info!(count = rooms.len(), "Stopping all relays");
        futures::future::join_all(rooms.iter().map(|room| self.stop(room))).await;
    }

    /// Observability read, no side effects. A room whose relay ended keeps
    /// reporting how it ended until the next start.
    pub fn status(&self, room_id: &RoomId) -> RelayStatus {
        if let Some(job) = self.jobs.get(room_id).map(|j| Arc::clone(j.value())) {
            return job.status();
        }
        self.finished
            .get(room_id)
            .map_or_else(RelayStatus::idle, |s| s.value().clone())
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.jobs.len()
    }

    async fn watch_job(self: Arc<Self>, job: Arc<RelayJob>) {
        let exit = job.process.wait().await;
        let crashed = !job.stop_requested.load(Ordering::Acquire);

        // Recorded before the job disappears so status never falls back to idle
        if crashed {
            self.finished.insert(
                job.room_id.clone(),
                job.snapshot(RelayState::Crashed, Some(exit)),
            );
        }
        self.jobs
            .remove_if(&job.room_id, |_, current| Arc::ptr_eq(current, &job));

        if crashed {
            warn!(room_id = %job.room_id, exit = %exit, "Relay encoder exited unexpectedly");
        } else {
            info!(room_id = %job.room_id, "Relay stopped");
        }
        let _ = self.events.send(MediaEvent::RelayStopped {
            room_id: job.room_id.clone(),
            crashed,
        });
    }
}

/// Destination URL with the key hidden
fn mask_destination(ingest_url: &str, key: &str) -> String {
    let visible: String = if key.len() > 8 {
        key.chars().take(4).collect()
    } else {
        String::new()
    };
    format!("{}/{visible}****", ingest_url.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_key_pattern() {
        assert!(validate_destination_key("abcd-1234-efgh").is_ok());
        assert!(validate_destination_key(&"a".repeat(64)).is_ok());
        assert!(validate_destination_key(&"a".repeat(65)).is_err());
        assert!(validate_destination_key("").is_err());
        assert!(validate_destination_key("bad key!").is_err());
        assert!(validate_destination_key("../other").is_err());
        assert!(validate_destination_key("key?token=1").is_err());
    }

    #[test]
    fn test_mask_destination_hides_key() {
        let masked = mask_destination("rtmp://ingest/live2/", "abcd-1234-efgh");
        assert_eq!(masked, "rtmp://ingest/live2/abcd****");
        assert_eq!(mask_destination("rtmp://ingest", "short"), "rtmp://ingest/****");
    }
}
