//! The WebRTC codec registry (§6.2): payload types, fmtp lines, and RTCP
//! feedback wired into a `webrtc::api::media_engine::MediaEngine`.

use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCPFeedback, RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;

/// MIME type for H.265, not exposed as a `webrtc` crate constant.
pub const MIME_TYPE_H265: &str = "video/H265";
/// MIME type for AV1, not exposed as a `webrtc` crate constant.
pub const MIME_TYPE_AV1: &str = "video/AV1";

/// RTP header extension URI for transport-wide congestion control, paired
/// with the `transport-cc` RTCP feedback already declared on every video
/// codec above — the feedback is useless without the per-packet sequence
/// number this extension carries.
const TRANSPORT_CC_URI: &str = "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";

fn video_feedback() -> Vec<RTCPFeedback> {
    vec![
        RTCPFeedback {
            typ: "transport-cc".to_owned(),
            parameter: String::new(),
        },
        RTCPFeedback {
            typ: "ccm".to_owned(),
            parameter: "fir".to_owned(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: String::new(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "pli".to_owned(),
        },
    ]
}

/// Registers the codec set from §6.2 onto `engine`, in descending preference
/// order (AV1 first, then H.265, then H.264, plus Opus for audio).
pub fn register_codecs(engine: &mut MediaEngine) -> webrtc::error::Result<()> {
    let video_codecs = [
        (MIME_TYPE_AV1, 100u8, "profile=0;level-idx=13;tier=0"),
        (MIME_TYPE_H265, 102, "profile-id=1;tier-flag=0;level-id=153"),
        (MIME_TYPE_H265, 103, "profile-id=1;tier-flag=0;level-id=123"),
        (MIME_TYPE_H264, 104, "profile-level-id=640033;packetization-mode=1"),
        (MIME_TYPE_H264, 105, "profile-level-id=640c33;packetization-mode=1"),
    ];

    for (mime, payload_type, fmtp) in video_codecs {
        engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: mime.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: fmtp.to_owned(),
                    rtcp_feedback: video_feedback(),
                },
                payload_type,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;
    }

    engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;maxptime=20;useinbandfec=1;stereo=1;sprop-stereo=1"
                    .to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    engine.register_header_extension(
        RTCRtpHeaderExtensionCapability {
            uri: TRANSPORT_CC_URI.to_owned(),
        },
        RTPCodecType::Video,
        Some(RTCRtpTransceiverDirection::Sendonly),
    )?;

    Ok(())
}

/// A `SettingEngine` with the ephemeral UDP port range pinned, per §4.6.
pub fn build_setting_engine(port_min: u16, port_max: u16) -> webrtc::error::Result<SettingEngine> {
    let mut setting_engine = SettingEngine::default();
    setting_engine.set_ephemeral_udp_port_range(port_min, port_max)?;
    Ok(setting_engine)
}
