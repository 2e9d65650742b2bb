//! Signaling JSON grammar, per §4.7 and §6.3.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// First frame a browser sends on the signaling connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub device_type: DeviceType,
    pub device_id: String,
    pub device_ip: String,
    pub device_port: u16,
    pub sdp: String,
    pub av_sync: bool,
    pub driver_config: DriverConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Android,
    Xvfb,
    Dummy,
    Sunshine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub video_codec: String,
    pub audio_codec: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl AgentConfig {
    /// Builds the on-device `scrcpy-server` argument list from the
    /// negotiated codecs plus any extra `server_args` passed through
    /// `driver_config`. Not part of the wire grammar in §6 — a judgment
    /// call recorded in DESIGN.md.
    pub fn server_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("video_codec={}", self.driver_config.video_codec),
            format!("audio_codec={}", self.driver_config.audio_codec),
        ];
        if let Some(Value::Array(extra)) = self.driver_config.extra.get("server_args") {
            args.extend(extra.iter().filter_map(|v| v.as_str()).map(str::to_owned));
        }
        args
    }
}

/// `Server -> Browser` frame sent after `Broker::admit`.
#[derive(Debug, Clone, Serialize)]
pub struct WebRtcInitFrame {
    pub status: &'static str,
    pub stage: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WebRtcInitFrame {
    pub fn ok(sdp: String) -> Self {
        Self {
            status: "ok",
            stage: "webrtc_init",
            sdp: Some(sdp),
            message: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            status: "error",
            stage: "webrtc_init",
            sdp: None,
            message: Some(message),
        }
    }
}

/// `Server -> Browser` frame sent after `Broker::start` once the negotiated
/// codec is known.
#[derive(Debug, Clone, Serialize)]
pub struct WebRtcMetaInfoFrame {
    pub status: &'static str,
    pub stage: &'static str,
    pub capabilities: Capabilities,
    pub media_meta: MediaMeta,
}

#[derive(Debug, Clone, Serialize)]
pub struct Capabilities {
    pub control_ordered: bool,
    pub control_unordered: bool,
    pub clipboard: bool,
    pub uhid: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaMeta {
    pub video_mime_type: String,
    pub video_payload_type: u8,
    pub audio_mime_type: String,
    pub width: u16,
    pub height: u16,
}

impl WebRtcMetaInfoFrame {
    pub fn new(capabilities: Capabilities, media_meta: MediaMeta) -> Self {
        Self {
            status: "ok",
            stage: "webrtc_metainfo",
            capabilities,
            media_meta,
        }
    }
}
