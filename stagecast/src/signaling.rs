//! Control-channel protocol
//!
//! JSON text frames. A request `{"id", "method", "params"}` is answered by
//! exactly one response carrying the same id; notifications carry no id.
//! Requests of one connection are handled strictly in order by its
//! [`ControlSession`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use stagecast_core::recording::{FinalizeOutcome, RecordingSource, StopOutcome};
use stagecast_core::relay::RelayStopOutcome;
use stagecast_sfu::{
    ConnectionId, PublishTransition, RoomId, RtpCapabilities, RtpParameters, SfuError, TrackKind,
    TransportId, TransportRole,
};

use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub id: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl Response {
    const fn success(id: Value, data: Value) -> Self {
        Self {
            id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn failure(id: Value, error: &ControlError) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code: error.code(),
                message: error.to_string(),
            }),
        }
    }
}

/// Server-initiated message
#[derive(Debug, Serialize)]
pub struct Notification {
    pub notification: String,
    pub data: Value,
}

impl Notification {
    /// Lift an internally tagged event (`{"event": name, ...}`) into a
    /// notification named after its tag
    pub fn from_event(event: &impl Serialize) -> Option<Self> {
        let Ok(Value::Object(mut data)) = serde_json::to_value(event) else {
            return None;
        };
        let Some(Value::String(name)) = data.remove("event") else {
            return None;
        };
        Some(Self {
            notification: name,
            data: Value::Object(data),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Core(#[from] stagecast_core::Error),
}

impl From<SfuError> for ControlError {
    fn from(e: SfuError) -> Self {
        Self::Core(e.into())
    }
}

impl ControlError {
    const fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnknownMethod(_) => "unknown_method",
            Self::InvalidParams(_) => "invalid_params",
            Self::Core(e) => e.code(),
        }
    }
}

type ControlResult = Result<Value, ControlError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenTransportParams {
    role: TransportRole,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectTransportParams {
    transport_id: TransportId,
    #[serde(alias = "dtlsParameters")]
    handshake: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseTransportParams {
    /// Every transport of the connection when absent
    transport_id: Option<TransportId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishParams {
    room_id: RoomId,
    kind: TrackKind,
    rtp_parameters: RtpParameters,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeParams {
    room_id: RoomId,
    transport_id: TransportId,
    #[serde(alias = "capabilities")]
    rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomParams {
    room_id: RoomId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRecordingParams {
    room_id: RoomId,
    source: RecordingSource,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartSimulcastParams {
    room_id: RoomId,
    #[serde(alias = "streamKey")]
    key: String,
    #[serde(default)]
    title: String,
}

/// Per-connection request dispatcher
pub struct ControlSession {
    connection_id: ConnectionId,
    state: AppState,
}

impl ControlSession {
    pub const fn new(connection_id: ConnectionId, state: AppState) -> Self {
        Self {
            connection_id,
            state,
        }
    }

    /// Handle one text frame; always yields a response
    pub async fn handle_text(&self, text: &str) -> Response {
        let request: Request = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                return Response::failure(Value::Null, &ControlError::InvalidRequest(e.to_string()))
            }
        };

        debug!(
            connection_id = %self.connection_id,
            method = %request.method,
            "Control request"
        );
        match self.dispatch(&request.method, request.params).await {
            Ok(data) => Response::success(request.id, data),
            Err(e) => {
                debug!(
                    connection_id = %self.connection_id,
                    method = %request.method,
                    error = %e,
                    "Control request failed"
                );
                Response::failure(request.id, &e)
            }
        }
    }

    async fn dispatch(&self, method: &str, params: Value) -> ControlResult {
        match method {
            "getCapabilities" => to_data(self.state.sessions.capabilities()),
            "openTransport" => self.open_transport(parse(params)?).await,
            "connectTransport" => self.connect_transport(parse(params)?).await,
            "closeTransport" => self.close_transport(parse_optional(params)?).await,
            "publish" => self.publish(parse(params)?).await,
            "listCandidates" => {
                let RoomParams { room_id } = parse(params)?;
                to_data(self.state.sessions.list_candidates(&room_id))
            }
            "subscribe" => self.subscribe(parse(params)?).await,
            "checkProducer" => {
                let RoomParams { room_id } = parse(params)?;
                to_data(self.state.sessions.check_producer(&room_id))
            }
            "getStats" => self.stats(),
            "startRecording" => self.start_recording(parse(params)?).await,
            "stopRecording" => self.stop_recording(parse(params)?).await,
            "getRecordingStatus" => {
                let RoomParams { room_id } = parse(params)?;
                to_data(self.state.recordings.status(&room_id).await)
            }
            "startSimulcast" => self.start_simulcast(parse(params)?),
            "stopSimulcast" => self.stop_simulcast(parse(params)?).await,
            "getSimulcastStatus" => {
                let RoomParams { room_id } = parse(params)?;
                to_data(self.state.relays.status(&room_id))
            }
            other => Err(ControlError::UnknownMethod(other.to_string())),
        }
    }

    async fn open_transport(&self, params: OpenTransportParams) -> ControlResult {
        let transport = self
            .state
            .sessions
            .open_transport(&self.connection_id, params.role)
            .await?;
        to_data(transport)
    }

    async fn connect_transport(&self, params: ConnectTransportParams) -> ControlResult {
        self.state
            .sessions
            .connect_transport(&self.connection_id, &params.transport_id, &params.handshake)
            .await?;
        Ok(json!({ "connected": true }))
    }

    async fn close_transport(&self, params: CloseTransportParams) -> ControlResult {
        let closed = self
            .state
            .sessions
            .close_transport(&self.connection_id, params.transport_id.as_ref())
            .await;
        Ok(json!({ "closed": closed }))
    }

    async fn publish(&self, params: PublishParams) -> ControlResult {
        let outcome = self
            .state
            .sessions
            .publish(
                params.room_id,
                &self.connection_id,
                params.kind,
                params.rtp_parameters,
            )
            .await?;
        Ok(json!({
            "id": outcome.track_id,
            "replaced": matches!(outcome.transition, PublishTransition::Replaced { .. }),
        }))
    }

    async fn subscribe(&self, params: SubscribeParams) -> ControlResult {
        let consumers = match self
            .state
            .sessions
            .subscribe(
                &self.connection_id,
                &params.transport_id,
                &params.room_id,
                &params.rtp_capabilities,
            )
            .await
        {
            Ok(consumers) => consumers,
            // Not live yet; the client retries on newProducer
            Err(SfuError::NothingToConsume(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(json!({ "consumers": consumers }))
    }

    fn stats(&self) -> ControlResult {
        let mut data = to_data(self.state.sessions.stats())?;
        if let Value::Object(map) = &mut data {
            map.insert(
                "activeRecordings".to_string(),
                json!(self.state.recordings.active_count()),
            );
            map.insert(
                "activeRelays".to_string(),
                json!(self.state.relays.active_count()),
            );
        }
        Ok(data)
    }

    async fn start_recording(&self, params: StartRecordingParams) -> ControlResult {
        let started = self
            .state
            .recordings
            .start(params.room_id, params.source)
            .await?;
        to_data(started)
    }

    async fn stop_recording(&self, params: RoomParams) -> ControlResult {
        let data = match self.state.recordings.stop(&params.room_id).await {
            StopOutcome::Stopped(FinalizeOutcome::Recorded {
                public_path,
                duration_ms,
                bytes,
                ..
            }) => json!({
                "ok": true,
                "filePath": public_path,
                "durationMs": duration_ms,
                "bytes": bytes,
            }),
            StopOutcome::Stopped(FinalizeOutcome::Failed { reason }) => {
                json!({ "ok": false, "reason": reason })
            }
            StopOutcome::NotRunning => json!({ "ok": false, "reason": "not_running" }),
        };
        Ok(data)
    }

    fn start_simulcast(&self, params: StartSimulcastParams) -> ControlResult {
        let started = self
            .state
            .relays
            .start(params.room_id, &params.key, &params.title)?;
        to_data(started)
    }

    async fn stop_simulcast(&self, params: RoomParams) -> ControlResult {
        let data = match self.state.relays.stop(&params.room_id).await {
            RelayStopOutcome::Stopped { exit } => json!({ "ok": true, "exit": exit.to_string() }),
            RelayStopOutcome::NotRunning => json!({ "ok": false, "reason": "not_running" }),
        };
        Ok(data)
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, ControlError> {
    serde_json::from_value(params).map_err(|e| ControlError::InvalidParams(e.to_string()))
}

/// Like [`parse`], but a missing params object means all defaults
fn parse_optional<T: DeserializeOwned + Default>(params: Value) -> Result<T, ControlError> {
    if params.is_null() {
        Ok(T::default())
    } else {
        parse(params)
    }
}

fn to_data<T: Serialize>(value: T) -> ControlResult {
    serde_json::to_value(value)
        .map_err(|e| stagecast_core::Error::Internal(format!("response encoding: {e}")).into())
}
