use stagecast_sfu::{RoomId, SfuError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Room {0} is already being recorded")]
    AlreadyRecording(RoomId),

    #[error("Room {0} is already being relayed")]
    AlreadyRelaying(RoomId),

    /// The key never appears in the message
    #[error("Invalid destination key")]
    InvalidDestinationKey,

    #[error("Invalid recording source: {0}")]
    InvalidSource(String),

    #[error("Failed to spawn encoder: {0}")]
    EncoderSpawnFailed(String),

    /// Recovered into the finalize path, never returned from a call
    #[error("Encoder crashed: {0}")]
    EncoderCrashed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Sfu(#[from] SfuError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code for the control channel
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::AlreadyRecording(_) => "already_recording",
            Self::AlreadyRelaying(_) => "already_relaying",
            Self::InvalidDestinationKey => "invalid_destination_key",
            Self::InvalidSource(_) => "invalid_source",
            Self::EncoderSpawnFailed(_) => "encoder_spawn_failed",
            Self::EncoderCrashed(_) => "encoder_crashed",
            Self::Io(_) => "io_error",
            Self::Config(_) => "config_error",
            Self::Sfu(e) => e.code(),
            Self::Internal(_) => "internal_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
