//! External encoder subprocess
//!
//! Recording and relay jobs both drive an encoder (ffmpeg by default) through
//! an [`EncoderProcess`]: one supervisor task owns the child and publishes its
//! exit exactly once, stderr is drained into the log, and stopping is a
//! graceful request followed by a kill if the process outlives the timeout.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStderr, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, trace, warn};

/// Where the encoder reads media from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderInput {
    /// Pull from a URL (HTTP, RTMP, ...)
    Url(String),
    /// Receive RTP described by a local session description file
    Sdp(PathBuf),
    /// Synthetic test pattern with silent audio and a title overlay
    Placeholder {
        title: String,
        width: u32,
        height: u32,
        fps: u32,
    },
}

/// Where the encoder writes media to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderOutput {
    /// Progressive file in `container` format
    File { path: PathBuf, container: String },
    /// Live push to an RTMP endpoint
    Rtmp { url: String, video_bitrate_kbps: u32 },
}

/// Everything needed to launch one encoder
#[derive(Debug, Clone)]
pub struct EncodePlan {
    /// Used in logs, e.g. `recording:r1`
    pub label: String,
    pub input: EncoderInput,
    pub output: EncoderOutput,
}

/// Turns a plan into a command line
pub trait EncoderLauncher: Send + Sync + 'static {
    fn command(&self, plan: &EncodePlan) -> Command;
}

/// Launches ffmpeg
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    program: String,
}

impl FfmpegLauncher {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Argument list for `plan`, without the program name
    #[must_use]
    pub fn args(plan: &EncodePlan) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "warning", "-nostats", "-progress", "pipe:2", "-y"]
            .iter()
            .map(ToString::to_string)
            .collect();

        let mut video_filter = None;
        match &plan.input {
            EncoderInput::Url(url) => {
                args.extend(["-i".to_string(), url.clone()]);
            }
            EncoderInput::Sdp(path) => {
                args.extend([
                    "-protocol_whitelist".to_string(),
                    "file,udp,rtp".to_string(),
                    "-i".to_string(),
                    path.display().to_string(),
                ]);
            }
            EncoderInput::Placeholder {
                title,
                width,
                height,
                fps,
            } => {
                args.extend([
                    "-re".to_string(),
                    "-f".to_string(),
                    "lavfi".to_string(),
                    "-i".to_string(),
                    format!("testsrc2=size={width}x{height}:rate={fps}"),
                    "-f".to_string(),
                    "lavfi".to_string(),
                    "-i".to_string(),
                    "anullsrc=channel_layout=stereo:sample_rate=44100".to_string(),
                ]);
                video_filter = Some(format!(
                    "drawtext=text='{}':fontcolor=white:fontsize=48:box=1:boxcolor=black@0.5:x=(w-text_w)/2:y=(h-text_h)/2",
                    sanitize_title(title)
                ));
            }
        }

        if let Some(filter) = video_filter {
            args.extend(["-vf".to_string(), filter]);
        }

        match &plan.output {
            EncoderOutput::File { path, container } => {
                args.extend(
                    [
                        "-c:v", "libx264", "-preset", "veryfast", "-pix_fmt", "yuv420p", "-c:a",
                        "aac", "-b:a", "128k",
                    ]
                    .iter()
                    .map(ToString::to_string),
                );
                let format = muxer_for(container);
                if format == "mp4" {
                    // Playable while still being written
                    args.extend(["-movflags".to_string(), "frag_keyframe+empty_moov".to_string()]);
                }
                // The staging name hides the container from ffmpeg's guesser
                args.extend(["-f".to_string(), format.to_string(), path.display().to_string()]);
            }
            EncoderOutput::Rtmp {
                url,
                video_bitrate_kbps,
            } => {
                args.extend(
                    [
                        "-c:v", "libx264", "-preset", "veryfast", "-tune", "zerolatency", "-pix_fmt",
                        "yuv420p", "-g", "60",
                    ]
                    .iter()
                    .map(ToString::to_string),
                );
                args.extend([
                    "-b:v".to_string(),
                    format!("{video_bitrate_kbps}k"),
                    "-maxrate".to_string(),
                    format!("{video_bitrate_kbps}k"),
                    "-bufsize".to_string(),
                    format!("{}k", video_bitrate_kbps * 2),
                ]);
                args.extend(
                    ["-c:a", "aac", "-b:a", "128k", "-ar", "44100", "-f", "flv"]
                        .iter()
                        .map(ToString::to_string),
                );
                args.push(url.clone());
            }
        }

        args
    }
}

impl EncoderLauncher for FfmpegLauncher {
    fn command(&self, plan: &EncodePlan) -> Command {
        let mut command = Command::new(&self.program);
        command.args(Self::args(plan));
        command
    }
}

/// ffmpeg muxer name for a container extension
fn muxer_for(container: &str) -> &str {
    match container {
        "mkv" => "matroska",
        "ts" => "mpegts",
        other => other,
    }
}

/// Keep only characters that need no filtergraph escaping
fn sanitize_title(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | '!' | '?' | '#' | '(' | ')' | '&') {
                c
            } else {
                ' '
            }
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// How the encoder ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub success: bool,
    /// Terminated by a forced kill
    pub killed: bool,
}

impl std::fmt::Display for ExitReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.killed, self.code) {
            (true, _) => write!(f, "killed"),
            (false, Some(code)) => write!(f, "exit code {code}"),
            (false, None) => write!(f, "terminated by signal"),
        }
    }
}

/// A running encoder subprocess
pub struct EncoderProcess {
    label: String,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exit_rx: watch::Receiver<Option<ExitReport>>,
    last_output_at: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl EncoderProcess {
    /// Spawn the encoder for `plan`. Must be called within a tokio runtime.
    pub fn spawn(launcher: &dyn EncoderLauncher, plan: &EncodePlan) -> Result<Self> {
        let mut command = launcher.command(plan);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| Error::EncoderSpawnFailed(format!("{}: {e}", plan.label)))?;
        let pid = child.id();
        let stdin = child.stdin.take();

        let last_output_at = Arc::new(Mutex::new(None));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(
                stderr,
                plan.label.clone(),
                Arc::clone(&last_output_at),
            ));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(supervise(child, plan.label.clone(), kill_rx, exit_tx));

        info!(encoder = %plan.label, pid = ?pid, "Encoder started");

        Ok(Self {
            label: plan.label.clone(),
            pid,
            started_at: Utc::now(),
            stdin: tokio::sync::Mutex::new(stdin),
            kill_tx: Mutex::new(Some(kill_tx)),
            exit_rx,
            last_output_at,
        })
    }

    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// When the encoder last wrote to stderr
    #[must_use]
    pub fn last_output_at(&self) -> Option<DateTime<Utc>> {
        *self.last_output_at.lock()
    }

    #[must_use]
    pub fn exit_report(&self) -> Option<ExitReport> {
        *self.exit_rx.borrow()
    }

    /// Wait for the process to exit
    pub async fn wait(&self) -> ExitReport {
        let mut rx = self.exit_rx.clone();
        let result = rx.wait_for(Option::is_some).await.map(|report| *report);
        match result {
            Ok(Some(report)) => report,
            // Supervisor gone without a report
            _ => ExitReport {
                code: None,
                success: false,
                killed: false,
            },
        }
    }

    /// Ask the encoder to finish: `q` on stdin, then close it
    pub async fn request_stop(&self) {
        let Some(mut stdin) = self.stdin.lock().await.take() else {
            return;
        };
        if let Err(e) = stdin.write_all(b"q").await {
            debug!(encoder = %self.label, error = %e, "Encoder stdin already closed");
            return;
        }
        let _ = stdin.flush().await;
    }

    /// Force the process down
    pub fn kill(&self) {
        if let Some(tx) = self.kill_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Graceful stop, escalating to a kill after `timeout`
    pub async fn shutdown(&self, timeout: Duration) -> ExitReport {
        self.request_stop().await;
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(report) => report,
            Err(_) => {
                warn!(
                    encoder = %self.label,
                    timeout_secs = timeout.as_secs(),
                    "Encoder did not exit in time, killing"
                );
                self.kill();
                self.wait().await
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    label: String,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitReport>>,
) {
    let (status, killed) = tokio::select! {
        status = child.wait() => (status, false),
        // Also fires when the handle is dropped without a stop
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                warn!(encoder = %label, error = %e, "Failed to kill encoder");
            }
            (child.wait().await, true)
        }
    };

    let report = match status {
        Ok(status) => ExitReport {
            code: status.code(),
            success: status.success() && !killed,
            killed,
        },
        Err(e) => {
            warn!(encoder = %label, error = %e, "Failed to reap encoder");
            ExitReport {
                code: None,
                success: false,
                killed,
            }
        }
    };

    if report.success {
        info!(encoder = %label, "Encoder exited");
    } else {
        warn!(encoder = %label, exit = %report, "Encoder exited abnormally");
    }
    exit_tx.send_replace(Some(report));
}

async fn drain_stderr(
    stderr: ChildStderr,
    label: String,
    last_output_at: Arc<Mutex<Option<DateTime<Utc>>>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                *last_output_at.lock() = Some(Utc::now());
                // -progress emits key=value lines; everything else is a real message
                if is_progress_line(&line) {
                    trace!(encoder = %label, "{line}");
                } else {
                    debug!(encoder = %label, "{line}");
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(encoder = %label, error = %e, "Encoder stderr read failed");
                break;
            }
        }
    }
}

fn is_progress_line(line: &str) -> bool {
    line.split_once('=')
        .is_some_and(|(key, _)| !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}
