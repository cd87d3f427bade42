//! Relay orchestrator against real subprocesses
#![cfg(unix)]

mod common;

use common::{next_event, ScriptLauncher};
use stagecast_core::config::RelayConfig;
use stagecast_core::encoder::{EncoderInput, EncoderOutput};
use stagecast_core::relay::{
    LiveSourceProbe, RelayOrchestrator, RelaySource, RelayState, RelayStopOutcome,
};
use stagecast_core::{Error, MediaEvent};
use stagecast_sfu::RoomId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const KEY: &str = "abcd-1234-efgh-5678";

/// Reports progress, then runs until stdin delivers `q` or closes
const PUSHING: &str = r#"echo "progress=continue" >&2; read -r _; exit 0"#;

/// Stays quiet for a second before its first progress line
const SLOW_START: &str = r#"sleep 1; echo "progress=continue" >&2; read -r _; exit 0"#;

#[derive(Default)]
struct StaticProbe {
    live: AtomicBool,
}

impl LiveSourceProbe for StaticProbe {
    fn has_live_video(&self, _room_id: &RoomId) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

struct Harness {
    orchestrator: Arc<RelayOrchestrator>,
    launcher: Arc<ScriptLauncher>,
    probe: Arc<StaticProbe>,
    events: broadcast::Sender<MediaEvent>,
}

fn harness_with(script: &str, tweak: impl FnOnce(&mut RelayConfig)) -> Harness {
    let mut config = RelayConfig {
        ingest_url: "rtmp://ingest.local/live2".to_string(),
        stop_timeout_secs: 2,
        ..RelayConfig::default()
    };
    tweak(&mut config);

    let launcher = Arc::new(ScriptLauncher::new(script));
    let probe = Arc::new(StaticProbe::default());
    let (events, _) = broadcast::channel(64);
    let orchestrator =
        RelayOrchestrator::new(config, launcher.clone(), probe.clone(), events.clone());
    Harness {
        orchestrator,
        launcher,
        probe,
        events,
    }
}

fn harness(script: &str) -> Harness {
    harness_with(script, |_| {})
}

#[tokio::test]
async fn test_invalid_key_never_launches() {
    let h = harness(PUSHING);
    let room = RoomId::from("r1");

    for key in ["", "bad key", "key/../../x", "k?x=1"] {
        let err = h.orchestrator.start(room.clone(), key, "Show").unwrap_err();
        assert!(matches!(err, Error::InvalidDestinationKey));
        assert!(!err.to_string().contains(key) || key.is_empty());
    }
    assert!(h.launcher.plans().is_empty());
    assert_eq!(h.orchestrator.active_count(), 0);
}

#[tokio::test]
async fn test_placeholder_without_live_source() {
    let h = harness(PUSHING);
    let room = RoomId::from("r1");

    let started = h.orchestrator.start(room.clone(), KEY, "").unwrap();
    assert_eq!(started.source, RelaySource::Placeholder);
    assert!(!started.destination.contains(KEY));

    let plans = h.launcher.plans();
    assert_eq!(plans.len(), 1);
    match &plans[0].input {
        EncoderInput::Placeholder { title, width, .. } => {
            // Empty title falls back to the room id
            assert_eq!(title, "r1");
            assert_eq!(*width, 1280);
        }
        other => panic!("unexpected input: {other:?}"),
    }
    match &plans[0].output {
        EncoderOutput::Rtmp { url, .. } => {
            assert_eq!(url, &format!("rtmp://ingest.local/live2/{KEY}"));
        }
        other => panic!("unexpected output: {other:?}"),
    }

    h.orchestrator.stop(&room).await;
}

#[tokio::test]
async fn test_live_source_when_room_has_video() {
    let h = harness_with(PUSHING, |c| {
        c.live_source_template = Some("http://media.local/live/{room}.flv".to_string());
    });
    let room = RoomId::from("r1");

    // Template alone is not enough
    let started = h.orchestrator.start(room.clone(), KEY, "Show").unwrap();
    assert_eq!(started.source, RelaySource::Placeholder);
    h.orchestrator.stop(&room).await;

    h.probe.live.store(true, Ordering::SeqCst);
    let started = h.orchestrator.start(room.clone(), KEY, "Show").unwrap();
    assert_eq!(started.source, RelaySource::Live);

    let plans = h.launcher.plans();
    assert_eq!(
        plans[1].input,
        EncoderInput::Url("http://media.local/live/r1.flv".to_string())
    );

    h.orchestrator.stop(&room).await;
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let h = harness(PUSHING);
    let room = RoomId::from("r1");

    h.orchestrator.start(room.clone(), KEY, "Show").unwrap();
    let err = h.orchestrator.start(room.clone(), KEY, "Show").unwrap_err();
    assert!(matches!(err, Error::AlreadyRelaying(_)));
    assert_eq!(h.launcher.plans().len(), 1);

    h.orchestrator.stop(&room).await;
}

#[tokio::test]
async fn test_stop_is_not_a_crash() {
    let h = harness(PUSHING);
    let mut events = h.events.subscribe();
    let room = RoomId::from("r1");

    h.orchestrator.start(room.clone(), KEY, "Show").unwrap();
    let outcome = h.orchestrator.stop(&room).await;
    assert!(matches!(outcome, RelayStopOutcome::Stopped { .. }));
    assert_eq!(h.orchestrator.stop(&room).await, RelayStopOutcome::NotRunning);

    let status = h.orchestrator.status(&room);
    assert_eq!(status.state, RelayState::Stopped);
    assert!(!status.running);
    assert_eq!(status.exit.as_deref(), Some("exit code 0"));

    let stopped = next_event(&mut events, |e| {
        matches!(e, MediaEvent::RelayStopped { .. })
    })
    .await;
    assert_eq!(
        stopped,
        MediaEvent::RelayStopped {
            room_id: room,
            crashed: false
        }
    );
}

#[tokio::test]
async fn test_encoder_exit_is_reported_as_crash() {
    let h = harness("exit 1");
    let mut events = h.events.subscribe();
    let room = RoomId::from("r1");

    h.orchestrator.start(room.clone(), KEY, "Show").unwrap();
    let stopped = next_event(&mut events, |e| {
        matches!(e, MediaEvent::RelayStopped { .. })
    })
    .await;
    assert_eq!(
        stopped,
        MediaEvent::RelayStopped {
            room_id: room.clone(),
            crashed: true
        }
    );
    assert_eq!(h.orchestrator.active_count(), 0);

    let status = h.orchestrator.status(&room);
    assert!(!status.running);
    assert_eq!(status.state, RelayState::Crashed);
    assert_eq!(status.exit.as_deref(), Some("exit code 1"));
    assert!(status.destination.is_some());

    // The room can be relayed again
    h.orchestrator.start(room.clone(), KEY, "Show").unwrap();
}

#[tokio::test]
async fn test_status_reports_running_job() {
    let h = harness(PUSHING);
    let room = RoomId::from("r1");

    h.orchestrator.start(room.clone(), KEY, "Show").unwrap();

    let mut status = h.orchestrator.status(&room);
    for _ in 0..100 {
        if status.last_output_at.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        status = h.orchestrator.status(&room);
    }
    assert!(status.running);
    assert_eq!(status.state, RelayState::Relaying);
    assert_eq!(status.exit, None);
    assert!(status.pid.is_some());
    assert!(status.started_at.is_some());
    assert!(status.last_output_at.is_some());
    assert_eq!(
        status.destination.as_deref(),
        Some("rtmp://ingest.local/live2/abcd****")
    );

    h.orchestrator.stop_all().await;
    assert_eq!(h.orchestrator.active_count(), 0);
}

#[tokio::test]
async fn test_starting_until_first_output() {
    let h = harness(SLOW_START);
    let room = RoomId::from("r1");

    h.orchestrator.start(room.clone(), KEY, "Show").unwrap();
    let status = h.orchestrator.status(&room);
    assert_eq!(status.state, RelayState::Starting);
    assert!(status.running);
    assert_eq!(status.last_output_at, None);

    let mut status = h.orchestrator.status(&room);
    for _ in 0..150 {
        if status.state != RelayState::Starting {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        status = h.orchestrator.status(&room);
    }
    assert_eq!(status.state, RelayState::Relaying);
    assert!(status.last_output_at.is_some());

    h.orchestrator.stop(&room).await;
    assert_eq!(h.orchestrator.status(&room).state, RelayState::Stopped);
}
