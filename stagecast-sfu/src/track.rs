//! Published tracks
//!
//! A [`Track`] is the relay-side record of one producing media stream. The
//! media itself lives in the engine; this is the bookkeeping the room tables
//! and the disconnect sweep work from.

use crate::capabilities::RtpParameters;
use crate::types::{ConnectionId, RoomId, TrackId, TransportId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    /// Kind implied by a codec MIME type ("audio/opus", "video/VP8")
    #[must_use]
    pub fn from_mime_type(mime_type: &str) -> Option<Self> {
        let (prefix, _) = mime_type.split_once('/')?;
        match prefix.to_ascii_lowercase().as_str() {
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            _ => None,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published track
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: TrackId,
    pub kind: TrackKind,
    pub room_id: RoomId,
    /// Connection that published the track
    pub connection_id: ConnectionId,
    /// Send transport hosting the track
    pub transport_id: TransportId,
    pub rtp_parameters: RtpParameters,
    pub created_at: DateTime<Utc>,
}

impl Track {
    #[must_use]
    pub fn is_video(&self) -> bool {
        self.kind == TrackKind::Video
    }

    #[must_use]
    pub fn is_audio(&self) -> bool {
        self.kind == TrackKind::Audio
    }

    /// MIME type of the track's primary codec, if the publisher declared one
    #[must_use]
    pub fn codec(&self) -> Option<&str> {
        self.rtp_parameters.codecs.first().map(|c| c.mime_type.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_mime_type() {
        assert_eq!(TrackKind::from_mime_type("audio/opus"), Some(TrackKind::Audio));
        assert_eq!(TrackKind::from_mime_type("VIDEO/VP8"), Some(TrackKind::Video));
        assert_eq!(TrackKind::from_mime_type("application/json"), None);
        assert_eq!(TrackKind::from_mime_type("opus"), None);
    }

    #[test]
    fn test_kind_serde() {
        assert_eq!(serde_json::to_string(&TrackKind::Video).unwrap(), "\"video\"");
        let kind: TrackKind = serde_json::from_str("\"audio\"").unwrap();
        assert_eq!(kind, TrackKind::Audio);
    }
}
