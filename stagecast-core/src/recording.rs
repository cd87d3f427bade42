//! Recording orchestrator
//!
//! One encoder per room writes to a `.part` staging file next to its final
//! name. Whatever ends the encoder (stop request, kill after the stop timeout,
//! crash), the job's watcher task runs the same finalize step exactly once:
//! staged bytes are renamed onto the final path, an empty or missing staging
//! file marks the recording failed.

use crate::config::RecordingConfig;
use crate::encoder::{
    EncodePlan, EncoderInput, EncoderLauncher, EncoderOutput, EncoderProcess, ExitReport,
};
use crate::error::{Error, Result};
use crate::events::MediaEvent;
use crate::store::RecordingStore;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stagecast_sfu::RoomId;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Payload types announced in the RTP session description
const VP8_PAYLOAD_TYPE: u8 = 101;
const OPUS_PAYLOAD_TYPE: u8 = 100;

/// What a recording reads from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordingSource {
    /// Pull an existing stream
    HttpUrl(String),
    /// Plain RTP sent by the relay to local ports
    RtpPorts(RtpPorts),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpPorts {
    pub video: Option<u16>,
    pub audio: Option<u16>,
}

impl RtpPorts {
    fn session_description(&self, room_id: &RoomId) -> String {
        let mut sdp = format!(
            "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=stagecast {room_id}\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\n"
        );
        if let Some(port) = self.video {
            sdp.push_str(&format!(
                "m=video {port} RTP/AVP {VP8_PAYLOAD_TYPE}\r\na=rtpmap:{VP8_PAYLOAD_TYPE} VP8/90000\r\n"
            ));
        }
        if let Some(port) = self.audio {
            sdp.push_str(&format!(
                "m=audio {port} RTP/AVP {OPUS_PAYLOAD_TYPE}\r\na=rtpmap:{OPUS_PAYLOAD_TYPE} opus/48000/2\r\n"
            ));
        }
        sdp
    }
}

impl RecordingSource {
    fn validate(&self) -> Result<()> {
        match self {
            Self::HttpUrl(url) => {
                let scheme_ok = ["http://", "https://", "rtmp://", "rtsp://"]
                    .iter()
                    .any(|scheme| url.starts_with(scheme));
                if !scheme_ok || url.chars().any(char::is_whitespace) {
                    return Err(Error::InvalidSource(format!("unsupported pull URL: {url}")));
                }
            }
            Self::RtpPorts(ports) => {
                if ports.video.is_none() && ports.audio.is_none() {
                    return Err(Error::InvalidSource("no RTP port given".to_string()));
                }
                if ports.video == Some(0) || ports.audio == Some(0) {
                    return Err(Error::InvalidSource("RTP port 0".to_string()));
                }
                if ports.video.is_some() && ports.video == ports.audio {
                    return Err(Error::InvalidSource(
                        "video and audio share an RTP port".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// How a recording ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum FinalizeOutcome {
    #[serde(rename_all = "camelCase")]
    Recorded {
        final_path: PathBuf,
        public_path: String,
        duration_ms: u64,
        bytes: u64,
    },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped(FinalizeOutcome),
    /// No job for the room; stopping twice lands here
    NotRunning,
}

/// Returned by a successful start
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStarted {
    pub room_id: RoomId,
    pub public_path: String,
    #[serde(skip)]
    pub final_path: PathBuf,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStatus {
    pub is_recording: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobPhase {
    Recording,
    Finalizing,
}

struct RecordingJob {
    room_id: RoomId,
    started_at: DateTime<Utc>,
    clock: Instant,
    staging_path: PathBuf,
    final_path: PathBuf,
    public_path: String,
    sdp_path: Option<PathBuf>,
    /// Final file of the room's previous recording, replaced on success
    previous: Option<PathBuf>,
    process: EncoderProcess,
    phase: Mutex<JobPhase>,
    done: watch::Receiver<Option<FinalizeOutcome>>,
}

/// Per-room recording jobs
pub struct RecordingOrchestrator {
    config: RecordingConfig,
    launcher: Arc<dyn EncoderLauncher>,
    store: Arc<dyn RecordingStore>,
    events: broadcast::Sender<MediaEvent>,
    jobs: DashMap<RoomId, Arc<RecordingJob>>,
}

impl RecordingOrchestrator {
    pub fn new(
        config: RecordingConfig,
        launcher: Arc<dyn EncoderLauncher>,
        store: Arc<dyn RecordingStore>,
        events: broadcast::Sender<MediaEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            launcher,
            store,
            events,
            jobs: DashMap::new(),
        })
    }

    /// Start recording `room_id`. The encoder writes to a staging file; the
    /// returned public path becomes valid once the recording finalizes.
    pub async fn start(
        self: &Arc<Self>,
        room_id: RoomId,
        source: RecordingSource,
    ) -> Result<RecordingStarted> {
        source.validate()?;
        if self.jobs.contains_key(&room_id) {
            return Err(Error::AlreadyRecording(room_id));
        }

        let uploads = self.config.uploads_dir.clone();
        tokio::fs::create_dir_all(&uploads).await?;

        let previous = if self.config.keep_previous {
            None
        } else {
            self.store
                .get(&room_id)
                .await
                .and_then(|mark| mark.recorded_file())
                .map(|file| file.final_path)
        };

        let started_at = Utc::now();
        let stem = format!(
            "{}_{}",
            file_stem(&room_id),
            started_at.format("%Y%m%dT%H%M%S%3f")
        );
        let final_name = format!("{stem}.{}", self.config.container);
        let final_path = uploads.join(&final_name);
        let staging_path = uploads.join(format!("{final_name}.part"));
        let public_path = format!(
            "{}/{final_name}",
            self.config.public_prefix.trim_end_matches('/')
        );

        let (input, sdp_path) = match &source {
            RecordingSource::HttpUrl(url) => (EncoderInput::Url(url.clone()), None),
            RecordingSource::RtpPorts(ports) => {
                // Unique per attempt, so a losing concurrent start only removes its own
                let path = uploads.join(format!("{stem}_{}.sdp", nanoid::nanoid!(6)));
                tokio::fs::write(&path, ports.session_description(&room_id)).await?;
                (EncoderInput::Sdp(path.clone()), Some(path))
            }
        };
        let plan = EncodePlan {
            label: format!("recording:{room_id}"),
            input,
            output: EncoderOutput::File {
                path: staging_path.clone(),
                container: self.config.container.clone(),
            },
        };

        let (done_tx, done_rx) = watch::channel(None);
        let claimed = match self.jobs.entry(room_id.clone()) {
            Entry::Occupied(_) => Err(Error::AlreadyRecording(room_id.clone())),
            Entry::Vacant(slot) => {
                EncoderProcess::spawn(self.launcher.as_ref(), &plan).map(|process| {
                    let job = Arc::new(RecordingJob {
                        room_id: room_id.clone(),
                        started_at,
                        clock: Instant::now(),
                        staging_path,
                        final_path: final_path.clone(),
                        public_path: public_path.clone(),
                        sdp_path: sdp_path.clone(),
                        previous,
                        process,
                        phase: Mutex::new(JobPhase::Recording),
                        done: done_rx,
                    });
                    slot.insert(Arc::clone(&job));
                    job
                })
            }
        };
        // The shard lock is released here; cleanup may await
        let job = match claimed {
            Ok(job) => job,
            Err(e) => {
                if let Some(path) = &sdp_path {
                    remove_if_exists(path).await;
                }
                return Err(e);
            }
        };

        // Announced before the watcher can report an early exit
        info!(room_id = %room_id, public_path = %public_path, "Recording started");
        let _ = self.events.send(MediaEvent::RecordingStarted {
            room_id: room_id.clone(),
            final_path: final_path.clone(),
            public_path: public_path.clone(),
        });
        tokio::spawn(Arc::clone(self).watch_job(job, done_tx));

        Ok(RecordingStarted {
            room_id,
            public_path,
            final_path,
            started_at,
        })
    }

    /// Stop the room's recording and wait for it to finalize
    pub async fn stop(&self, room_id: &RoomId) -> StopOutcome {
        let Some(job) = self.jobs.get(room_id).map(|j| Arc::clone(j.value())) else {
            return StopOutcome::NotRunning;
        };

        info!(room_id = %room_id, "Stopping recording");
        let exit = job.process.shutdown(self.config.stop_timeout()).await;
        debug!(room_id = %room_id, exit = %exit, "Recording encoder ended");

        let mut done = job.done.clone();
        let outcome = match done.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        outcome.map_or(StopOutcome::NotRunning, StopOutcome::Stopped)
    }

    /// Stop every recording, finalizing each
    pub async fn stop_all(&self) {
        let rooms: Vec<RoomId> = self.jobs.iter().map(|j| j.key().clone()).collect();
        if rooms.is_empty() {
            return;
        }
        info!(count = rooms.len(), "Stopping all recordings");
        futures::future::join_all(rooms.iter().map(|room| self.stop(room))).await;
    }

    pub async fn status(&self, room_id: &RoomId) -> RecordingStatus {
        if let Some(job) = self.jobs.get(room_id).map(|j| Arc::clone(j.value())) {
            return RecordingStatus {
                is_recording: *job.phase.lock() == JobPhase::Recording,
                start_time: Some(job.started_at),
                file_path: Some(job.public_path.clone()),
            };
        }
        RecordingStatus {
            is_recording: false,
            start_time: None,
            file_path: self
                .store
                .get(room_id)
                .await
                .and_then(|mark| mark.recorded_file())
                .map(|file| file.public_path),
        }
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.jobs.len()
    }

    /// Sole finalizer of a job: runs once the encoder has exited, however
    /// it exited
    async fn watch_job(
        self: Arc<Self>,
        job: Arc<RecordingJob>,
        done: watch::Sender<Option<FinalizeOutcome>>,
    ) {
        let exit = job.process.wait().await;
        let outcome = self.finalize(&job, exit).await;

        self.jobs
            .remove_if(&job.room_id, |_, current| Arc::ptr_eq(current, &job));

        // Published before waiters on `done` resume
        let event = match outcome.clone() {
            FinalizeOutcome::Recorded {
                final_path,
                public_path,
                duration_ms,
                ..
            } => MediaEvent::RecordingStopped {
                room_id: job.room_id.clone(),
                final_path,
                public_path,
                duration_ms,
            },
            FinalizeOutcome::Failed { reason } => MediaEvent::RecordingFailed {
                room_id: job.room_id.clone(),
                reason,
            },
        };
        let _ = self.events.send(event);
        done.send_replace(Some(outcome));
    }

    async fn finalize(&self, job: &RecordingJob, exit: ExitReport) -> FinalizeOutcome {
        *job.phase.lock() = JobPhase::Finalizing;

        if let Some(sdp) = &job.sdp_path {
            remove_if_exists(sdp).await;
        }

        let staged = tokio::fs::metadata(&job.staging_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let duration_ms = u64::try_from(job.clock.elapsed().as_millis()).unwrap_or(u64::MAX);

        if staged == 0 {
            remove_if_exists(&job.staging_path).await;
            let reason = if exit.success {
                "encoder produced no output".to_string()
            } else {
                Error::EncoderCrashed(format!("{exit} before writing any output")).to_string()
            };
            warn!(room_id = %job.room_id, reason = %reason, "Recording failed");
            return FinalizeOutcome::Failed { reason };
        }

        if let Err(e) = tokio::fs::rename(&job.staging_path, &job.final_path).await {
            warn!(room_id = %job.room_id, error = %e, "Failed to finalize recording");
            return FinalizeOutcome::Failed {
                reason: format!("rename failed: {e}"),
            };
        }

        if !exit.success {
            warn!(
                room_id = %job.room_id,
                exit = %exit,
                bytes = staged,
                "Encoder ended abnormally, keeping partial recording"
            );
        }

        if let Some(previous) = job.previous.as_ref().filter(|p| **p != job.final_path) {
            remove_if_exists(previous).await;
            debug!(room_id = %job.room_id, previous = %previous.display(), "Previous recording replaced");
        }

        info!(
            room_id = %job.room_id,
            final_path = %job.final_path.display(),
            duration_ms,
            bytes = staged,
            "Recording finalized"
        );
        FinalizeOutcome::Recorded {
            final_path: job.final_path.clone(),
            public_path: job.public_path.clone(),
            duration_ms,
            bytes: staged,
        }
    }
}

/// Room ids are caller-supplied; keep them from escaping the uploads directory
fn file_stem(room_id: &RoomId) -> String {
    let stem: String = room_id
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        "room".to_string()
    } else {
        stem
    }
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_stem_strips_path_characters() {
        assert_eq!(file_stem(&RoomId::from("../etc/passwd")), "___etc_passwd");
        assert_eq!(file_stem(&RoomId::from("room-1_a")), "room-1_a");
        assert_eq!(file_stem(&RoomId::from("")), "room");
    }

    #[test]
    fn test_source_validation() {
        assert!(RecordingSource::HttpUrl("http://x".to_string()).validate().is_ok());
        assert!(RecordingSource::HttpUrl("file:///etc/passwd".to_string())
            .validate()
            .is_err());
        assert!(RecordingSource::RtpPorts(RtpPorts {
            video: None,
            audio: None
        })
        .validate()
        .is_err());
        assert!(RecordingSource::RtpPorts(RtpPorts {
            video: Some(5004),
            audio: Some(5004)
        })
        .validate()
        .is_err());
        assert!(RecordingSource::RtpPorts(RtpPorts {
            video: Some(5004),
            audio: Some(5006)
        })
        .validate()
        .is_ok());
    }

    #[test]
    fn test_source_wire_format() {
        let pull: RecordingSource =
            serde_json::from_value(serde_json::json!({"httpUrl": "http://x"})).unwrap();
        assert_eq!(pull, RecordingSource::HttpUrl("http://x".to_string()));

        let rtp: RecordingSource =
            serde_json::from_value(serde_json::json!({"rtpPorts": {"video": 5004}})).unwrap();
        assert_eq!(
            rtp,
            RecordingSource::RtpPorts(RtpPorts {
                video: Some(5004),
                audio: None
            })
        );
    }

    #[test]
    fn test_session_description_lists_requested_media() {
        let sdp = RtpPorts {
            video: Some(5004),
            audio: None,
        }
        .session_description(&RoomId::from("r1"));
        assert!(sdp.contains("m=video 5004 RTP/AVP 101"));
        assert!(sdp.contains("a=rtpmap:101 VP8/90000"));
        assert!(!sdp.contains("m=audio"));
    }
}
