//! RTP capability and parameter descriptors
//!
//! These mirror the shapes browsers exchange during negotiation. The relay
//! treats everything except codec identity as opaque and passes it through.

use crate::track::TrackKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8};

/// One codec a party can receive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: TrackKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

impl RtpCodecCapability {
    /// Whether this capability describes the same codec as `codec`
    #[must_use]
    pub fn matches(&self, codec: &RtpCodecParameters) -> bool {
        self.mime_type.eq_ignore_ascii_case(&codec.mime_type)
            && self.clock_rate == codec.clock_rate
            && (self.channels.is_none() || codec.channels.is_none() || self.channels == codec.channels)
    }
}

/// Receive capabilities (of the room, or of a viewer)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_extensions: Vec<Value>,
}

impl RtpCapabilities {
    /// First capability matching the given codec
    #[must_use]
    pub fn find(&self, codec: &RtpCodecParameters) -> Option<&RtpCodecCapability> {
        self.codecs.iter().find(|cap| cap.matches(codec))
    }

    #[must_use]
    pub fn supports(&self, codec: &RtpCodecParameters) -> bool {
        self.find(codec).is_some()
    }
}

/// Codec entry of a producer's RTP parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

/// RTP parameters describing what a producer sends (or a consumer receives)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub encodings: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_extensions: Vec<Value>,
}

/// The standard codec set advertised to every connection
#[must_use]
pub fn default_capabilities() -> RtpCapabilities {
    let mut h264_params = Map::new();
    h264_params.insert("packetization-mode".to_string(), Value::from(1));
    h264_params.insert("profile-level-id".to_string(), Value::from("42e01f"));
    h264_params.insert("level-asymmetry-allowed".to_string(), Value::from(1));

    RtpCapabilities {
        codecs: vec![
            RtpCodecCapability {
                kind: TrackKind::Audio,
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: Some(2),
                preferred_payload_type: Some(100),
                parameters: Map::new(),
            },
            RtpCodecCapability {
                kind: TrackKind::Video,
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                channels: None,
                preferred_payload_type: Some(101),
                parameters: Map::new(),
            },
            RtpCodecCapability {
                kind: TrackKind::Video,
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                channels: None,
                preferred_payload_type: Some(102),
                parameters: h264_params,
            },
        ],
        header_extensions: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vp8() -> RtpCodecParameters {
        RtpCodecParameters {
            mime_type: "video/vp8".to_string(),
            payload_type: 96,
            clock_rate: 90000,
            channels: None,
            parameters: Map::new(),
        }
    }

    #[test]
    fn test_default_capabilities_cover_both_kinds() {
        let caps = default_capabilities();
        assert!(caps.codecs.iter().any(|c| c.kind == TrackKind::Audio));
        assert!(caps.codecs.iter().any(|c| c.kind == TrackKind::Video));
    }

    #[test]
    fn test_codec_match_ignores_mime_case() {
        let caps = default_capabilities();
        let found = caps.find(&vp8()).expect("VP8 should be supported");
        assert_eq!(found.preferred_payload_type, Some(101));
    }

    #[test]
    fn test_codec_mismatch_on_clock_rate() {
        let mut codec = vp8();
        codec.clock_rate = 48000;
        assert!(!default_capabilities().supports(&codec));
    }

    #[test]
    fn test_capabilities_deserialize_camel_case() {
        let json = r#"{"codecs":[{"kind":"audio","mimeType":"audio/opus","clockRate":48000,"channels":2}]}"#;
        let caps: RtpCapabilities = serde_json::from_str(json).unwrap();
        assert_eq!(caps.codecs.len(), 1);
        assert_eq!(caps.codecs[0].channels, Some(2));
    }
}
