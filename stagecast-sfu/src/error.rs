use crate::types::{ConnectionId, RoomId, TransportId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SfuError {
    #[error("Connection unknown: {0}")]
    ConnectionUnknown(ConnectionId),

    #[error("Transport not found: {0}")]
    TransportNotFound(TransportId),

    /// Publishing requires a connected send transport
    #[error("No connected send transport on connection {0}")]
    SendTransportUnavailable(ConnectionId),

    #[error("Receive transport limit reached ({0})")]
    TransportLimit(usize),

    #[error("Nothing to consume in room {0}")]
    NothingToConsume(RoomId),

    #[error("Invalid track parameters: {0}")]
    InvalidParameters(String),

    #[error("Media engine error: {0}")]
    Engine(String),
}

impl SfuError {
    /// Stable machine-readable code, sent to clients on the control channel
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ConnectionUnknown(_) => "connection_unknown",
            Self::TransportNotFound(_) => "transport_not_found",
            Self::SendTransportUnavailable(_) => "send_transport_unavailable",
            Self::TransportLimit(_) => "transport_limit",
            Self::NothingToConsume(_) => "nothing_to_consume",
            Self::InvalidParameters(_) => "invalid_parameters",
            Self::Engine(_) => "engine_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;
