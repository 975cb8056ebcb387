use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Codecs a room router is allowed to negotiate.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum MediaCodec {
    #[serde(rename = "video/H264")]
    #[strum(serialize = "video/H264")]
    H264,
    #[serde(rename = "video/VP8")]
    #[strum(serialize = "video/VP8")]
    Vp8,
    #[serde(rename = "video/VP9")]
    #[strum(serialize = "video/VP9")]
    Vp9,
    #[serde(rename = "audio/opus")]
    #[strum(serialize = "audio/opus")]
    Opus,
}

/// The fixed allow-list used when a room obtains its routing context.
pub fn media_codecs() -> Vec<MediaCodec> {
    vec![
        MediaCodec::H264,
        MediaCodec::Vp8,
        MediaCodec::Vp9,
        MediaCodec::Opus,
    ]
}

/// Options applied to every WebRTC transport a room creates.
#[derive(Debug, Clone)]
pub struct WebRtcTransportConfig {
    pub max_incoming_bitrate: Option<u32>,
    pub initial_available_outgoing_bitrate: u32,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            max_incoming_bitrate: Some(1_500_000),
            initial_available_outgoing_bitrate: 1_000_000,
        }
    }
}

/// Tunables for rooms and peers. The defaults match production behaviour,
/// tests shrink the durations.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub webrtc_transport: WebRtcTransportConfig,
    /// Period of the per-peer disconnect check.
    pub liveness_interval: Duration,
    /// Number of failed checks a disconnected peer survives.
    pub liveness_limit: u8,
    /// How long an outbound request may stay unanswered.
    pub request_timeout: Duration,
    /// Period of the per-consumer score push.
    pub score_interval: Duration,
    /// A room with no request for this long is considered deserted.
    pub idle_timeout: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            webrtc_transport: WebRtcTransportConfig::default(),
            liveness_interval: Duration::from_secs(20),
            liveness_limit: 6,
            request_timeout: Duration::from_secs(10),
            score_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(2 * 60 * 60),
        }
    }
}
