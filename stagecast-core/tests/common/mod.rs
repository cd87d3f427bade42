//! Shell scripts standing in for the encoder
//!
//! The script sees the output (file path or push URL) as `$1` and the input
//! (pull URL, SDP path or `placeholder`) as `$2`.

#![allow(dead_code)]

use parking_lot::Mutex;
use stagecast_core::encoder::{EncodePlan, EncoderInput, EncoderLauncher, EncoderOutput};
use stagecast_core::MediaEvent;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::broadcast;

/// Writes a few bytes, then exits cleanly once stdin delivers `q` or closes
pub const GRACEFUL: &str = r#"printf 'frame-data' > "$1"; echo "progress=continue" >&2; read -r _; exit 0"#;
/// Writes a few bytes and dies on its own
pub const CRASHING: &str = r#"printf 'partial' > "$1"; exit 3"#;
/// Writes a few bytes and ignores every polite request
pub const STUBBORN: &str = r#"printf 'x' > "$1"; trap '' TERM INT; exec sleep 30"#;
/// Never writes anything
pub const SILENT: &str = r#"read -r _; exit 0"#;
/// Creates the output but leaves it empty
pub const EMPTY: &str = r#": > "$1"; read -r _; exit 0"#;
/// Copies its input description into the output
pub const COPY_INPUT: &str = r#"cp "$2" "$1"; read -r _; exit 0"#;

pub struct ScriptLauncher {
    program: String,
    script: String,
    plans: Mutex<Vec<EncodePlan>>,
}

impl ScriptLauncher {
    pub fn new(script: &str) -> Self {
        Self::with_program("sh", script)
    }

    pub fn with_program(program: &str, script: &str) -> Self {
        Self {
            program: program.to_string(),
            script: script.to_string(),
            plans: Mutex::new(Vec::new()),
        }
    }

    /// Plans launched so far
    pub fn plans(&self) -> Vec<EncodePlan> {
        self.plans.lock().clone()
    }
}

impl EncoderLauncher for ScriptLauncher {
    fn command(&self, plan: &EncodePlan) -> Command {
        self.plans.lock().push(plan.clone());

        let output = match &plan.output {
            EncoderOutput::File { path, .. } => path.display().to_string(),
            EncoderOutput::Rtmp { url, .. } => url.clone(),
        };
        let input = match &plan.input {
            EncoderInput::Url(url) => url.clone(),
            EncoderInput::Sdp(path) => path.display().to_string(),
            EncoderInput::Placeholder { .. } => "placeholder".to_string(),
        };

        let mut command = Command::new(&self.program);
        command
            .arg("-c")
            .arg(&self.script)
            .arg("encoder")
            .arg(output)
            .arg(input);
        command
    }
}

/// Wait for the first event matching `pred`
pub async fn next_event(
    events: &mut broadcast::Receiver<MediaEvent>,
    pred: impl Fn(&MediaEvent) -> bool,
) -> MediaEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
