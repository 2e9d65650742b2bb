//! WebRTC plumbing: the codec registry, the H.265 RTP payloader (webrtc-rs
//! has no native HEVC packetizer), and the signaling JSON grammar.
//!
//! ```text
//! Conditioner -> shared TrackLocal(s) -> RTCPeerConnection -> Browser
//!                                            ^
//!                                            |
//!                                   control-ordered / control-unordered
//!                                            data channels
//! ```

pub mod codecs;
pub mod h265_payloader;
pub mod signaling;

pub use codecs::{build_setting_engine, register_codecs, MIME_TYPE_AV1, MIME_TYPE_H265};
pub use h265_payloader::H265Payloader;
pub use signaling::{AgentConfig, Capabilities, DeviceType, MediaMeta, WebRtcInitFrame, WebRtcMetaInfoFrame};
