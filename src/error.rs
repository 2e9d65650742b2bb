use serde::Serialize;
use thiserror::Error;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("negotiation failed at stage {stage}: {message}")]
    Negotiation { stage: String, message: String },

    #[error("bitstream parse error: {0}")]
    Parser(#[from] crate::bitstream::ParseError),

    #[error("device connection lost [{device}]: {reason}")]
    DeviceLost { device: String, reason: String },

    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl AppError {
    /// Render this error as the signaling JSON error envelope described in §7.
    ///
    /// `{status:"error", stage, message}` - used only at admission time; fatal
    /// session errors surface natively through `connectionState -> Failed` instead.
    pub fn to_signaling_envelope(&self, stage: &str) -> SignalingErrorEnvelope {
        SignalingErrorEnvelope {
            status: "error",
            stage: stage.to_string(),
            message: self.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SignalingErrorEnvelope {
    pub status: &'static str,
    pub stage: String,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, AppError>;
