//! scrcpy device wire framing: the 12-byte media frame header and the 5-byte
//! device->host control message header, per spec §6.1.

use bytes::Bytes;

/// One length-prefixed frame read off the video or audio socket.
#[derive(Debug, Clone)]
pub struct DeviceFrame {
    pub pts_us: u64,
    pub is_config: bool,
    pub is_keyframe: bool,
    pub payload: Bytes,
}

const CONFIG_BIT: u64 = 1 << 63;
const KEYFRAME_BIT: u64 = 1 << 62;
const PTS_MASK: u64 = (1 << 62) - 1;

impl DeviceFrame {
    /// Decode the 12-byte header (`PTS64 | Size32`) and associated payload.
    /// `header` must be exactly 12 bytes; `payload` must be exactly `Size` bytes.
    pub fn from_header_and_payload(header: &[u8; 12], payload: Bytes) -> Self {
        let word = u64::from_be_bytes(header[0..8].try_into().expect("8 bytes"));
        Self {
            pts_us: word & PTS_MASK,
            is_config: word & CONFIG_BIT != 0,
            is_keyframe: word & KEYFRAME_BIT != 0,
            payload,
        }
    }

    pub fn declared_size(header: &[u8; 12]) -> u32 {
        u32::from_be_bytes(header[8..12].try_into().expect("4 bytes"))
    }
}

/// Device -> host control message (clipboard content today, others are
/// recognized only by draining their length).
#[derive(Debug, Clone)]
pub enum DeviceControlMessage {
    Clipboard(Bytes),
    Unknown { msg_type: u8, payload: Bytes },
}

impl DeviceControlMessage {
    pub fn from_type_and_payload(msg_type: u8, payload: Bytes) -> Self {
        match msg_type {
            0 => DeviceControlMessage::Clipboard(payload),
            other => DeviceControlMessage::Unknown {
                msg_type: other,
                payload,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_config_and_keyframe_bits() {
        let pts: u64 = 123_456;
        let word = pts | CONFIG_BIT | KEYFRAME_BIT;
        let mut header = [0u8; 12];
        header[0..8].copy_from_slice(&word.to_be_bytes());
        header[8..12].copy_from_slice(&42u32.to_be_bytes());

        let frame = DeviceFrame::from_header_and_payload(&header, Bytes::from_static(b"x"));
        assert_eq!(frame.pts_us, pts);
        assert!(frame.is_config);
        assert!(frame.is_keyframe);
        assert_eq!(DeviceFrame::declared_size(&header), 42);
    }

    #[test]
    fn decodes_plain_frame() {
        let mut header = [0u8; 12];
        header[0..8].copy_from_slice(&1000u64.to_be_bytes());
        header[8..12].copy_from_slice(&4u32.to_be_bytes());

        let frame = DeviceFrame::from_header_and_payload(&header, Bytes::from_static(b"abcd"));
        assert_eq!(frame.pts_us, 1000);
        assert!(!frame.is_config);
        assert!(!frame.is_keyframe);
    }
}
