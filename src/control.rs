//! `ControlEvent` (browser -> device) and `FeedbackEvent` (device -> browser)
//! wire codecs.
//!
//! The host->device byte layouts are bit-exact per spec §6.1. The two data
//! channels described in §4.4 carry the same tag-byte framing; the ordered
//! channel is expected to carry `SetClipboard`/`GetClipboard`/`UHIDCreate`/
//! `UHIDDestroy`/`Rotate`, the unordered channel `Touch`/`Key`/`Scroll`/
//! `UHIDInput`. `SetClipboard`'s wire layout is not specified by §6.1 (only
//! the device->host clipboard frame is); this implementation uses a length-
//! prefixed UTF-8 payload, noted as a judgment call in DESIGN.md.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::AppError;

/// Host -> device control message type bytes, per §6.1.
pub mod wire_type {
    pub const INJECT_KEY: u8 = 0;
    pub const INJECT_TOUCH: u8 = 2;
    pub const INJECT_SCROLL: u8 = 3;
    pub const SET_CLIPBOARD: u8 = 9;
    pub const ROTATE_DEVICE: u8 = 11;
    pub const UHID_CREATE: u8 = 12;
    pub const UHID_INPUT: u8 = 13;
    pub const UHID_DESTROY: u8 = 14;
    pub const REQUEST_IDR: u8 = 99;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TouchEvent {
    pub action: u8,
    pub pointer_id: u64,
    pub pos_x: i32,
    pub pos_y: i32,
    pub width: u16,
    pub height: u16,
    pub pressure: u16,
    pub buttons_a: u32,
    pub buttons_b: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub action: u8,
    pub keycode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrollEvent {
    pub pos_x: i32,
    pub pos_y: i32,
    pub width: u16,
    pub height: u16,
    pub h_scroll: i16,
    pub v_scroll: i16,
    pub buttons: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UhidCreate {
    pub id: u16,
    pub vendor: u16,
    pub product: u16,
    pub name: Bytes,
    pub report_desc: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UhidInput {
    pub id: u16,
    pub data: Bytes,
}

/// One control event originating from a browser subscriber, destined for the
/// device control socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    Touch(TouchEvent),
    Key(KeyEvent),
    Scroll(ScrollEvent),
    Rotate,
    SetClipboard(String),
    GetClipboard,
    UHIDCreate(UhidCreate),
    UHIDInput(UhidInput),
    UHIDDestroy { id: u16 },
    RequestIDR,
}

impl ControlEvent {
    /// Encode the exact bytes to write to the device control socket. Returns
    /// `None` for `GetClipboard`, which is answered from the cached
    /// `FeedbackEvent::ClipboardContent` without touching the device.
    pub fn encode(&self) -> Option<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            ControlEvent::Key(k) => {
                buf.put_u8(wire_type::INJECT_KEY);
                buf.put_u8(k.action);
                buf.put_u32(k.keycode);
                buf.put_u32(0); // repeat
                buf.put_u32(0); // meta
            }
            ControlEvent::Touch(t) => {
                buf.put_u8(wire_type::INJECT_TOUCH);
                buf.put_u8(t.action);
                buf.put_u64(t.pointer_id);
                buf.put_i32(t.pos_x);
                buf.put_i32(t.pos_y);
                buf.put_u16(t.width);
                buf.put_u16(t.height);
                buf.put_u16(t.pressure);
                buf.put_u32(t.buttons_a);
                buf.put_u32(t.buttons_b);
            }
            ControlEvent::Scroll(s) => {
                buf.put_u8(wire_type::INJECT_SCROLL);
                buf.put_i32(s.pos_x);
                buf.put_i32(s.pos_y);
                buf.put_u16(s.width);
                buf.put_u16(s.height);
                buf.put_i16(s.h_scroll);
                buf.put_i16(s.v_scroll);
                buf.put_u32(s.buttons);
            }
            ControlEvent::Rotate => {
                buf.put_u8(wire_type::ROTATE_DEVICE);
            }
            ControlEvent::SetClipboard(text) => {
                buf.put_u8(wire_type::SET_CLIPBOARD);
                buf.put_u32(text.len() as u32);
                buf.put_slice(text.as_bytes());
            }
            ControlEvent::GetClipboard => return None,
            ControlEvent::UHIDCreate(c) => {
                buf.put_u8(wire_type::UHID_CREATE);
                buf.put_u16(c.id);
                buf.put_u16(c.vendor);
                buf.put_u16(c.product);
                buf.put_u8(c.name.len() as u8);
                buf.put_slice(&c.name);
                buf.put_u16(c.report_desc.len() as u16);
                buf.put_slice(&c.report_desc);
            }
            ControlEvent::UHIDInput(i) => {
                buf.put_u8(wire_type::UHID_INPUT);
                buf.put_u16(i.id);
                buf.put_u16(i.data.len() as u16);
                buf.put_slice(&i.data);
            }
            ControlEvent::UHIDDestroy { id } => {
                buf.put_u8(wire_type::UHID_DESTROY);
                buf.put_u16(*id);
            }
            ControlEvent::RequestIDR => {
                buf.put_u8(wire_type::REQUEST_IDR);
            }
        }
        Some(buf.freeze())
    }
}

/// Decode a binary data-channel frame from a browser into a `ControlEvent`.
/// Uses the same tag byte as the host->device wire type, since the data
/// channel and the device control socket describe the same event space.
pub fn decode_control_event(mut data: Bytes) -> Result<ControlEvent, AppError> {
    if data.is_empty() {
        return Err(AppError::Protocol("empty control event frame".into()));
    }
    let tag = data.get_u8();
    match tag {
        wire_type::INJECT_KEY => {
            if data.remaining() < 13 {
                return Err(AppError::Protocol("short InjectKey frame".into()));
            }
            let action = data.get_u8();
            let keycode = data.get_u32();
            let _repeat = data.get_u32();
            let _meta = data.get_u32();
            Ok(ControlEvent::Key(KeyEvent { action, keycode }))
        }
        wire_type::INJECT_TOUCH => {
            if data.remaining() < 31 {
                return Err(AppError::Protocol("short InjectTouch frame".into()));
            }
            Ok(ControlEvent::Touch(TouchEvent {
                action: data.get_u8(),
                pointer_id: data.get_u64(),
                pos_x: data.get_i32(),
                pos_y: data.get_i32(),
                width: data.get_u16(),
                height: data.get_u16(),
                pressure: data.get_u16(),
                buttons_a: data.get_u32(),
                buttons_b: data.get_u32(),
            }))
        }
        wire_type::INJECT_SCROLL => {
            if data.remaining() < 20 {
                return Err(AppError::Protocol("short InjectScroll frame".into()));
            }
            Ok(ControlEvent::Scroll(ScrollEvent {
                pos_x: data.get_i32(),
                pos_y: data.get_i32(),
                width: data.get_u16(),
                height: data.get_u16(),
                h_scroll: data.get_i16(),
                v_scroll: data.get_i16(),
                buttons: data.get_u32(),
            }))
        }
        wire_type::ROTATE_DEVICE => Ok(ControlEvent::Rotate),
        wire_type::SET_CLIPBOARD => {
            if data.remaining() < 4 {
                return Err(AppError::Protocol("short SetClipboard frame".into()));
            }
            let len = data.get_u32() as usize;
            if data.remaining() < len {
                return Err(AppError::Protocol("truncated SetClipboard text".into()));
            }
            let text = String::from_utf8_lossy(&data[..len]).into_owned();
            Ok(ControlEvent::SetClipboard(text))
        }
        0xF0 => Ok(ControlEvent::GetClipboard),
        wire_type::UHID_CREATE => {
            if data.remaining() < 7 {
                return Err(AppError::Protocol("short UHIDCreate frame".into()));
            }
            let id = data.get_u16();
            let vendor = data.get_u16();
            let product = data.get_u16();
            let name_len = data.get_u8() as usize;
            if data.remaining() < name_len + 2 {
                return Err(AppError::Protocol("truncated UHIDCreate name".into()));
            }
            let name = data.copy_to_bytes(name_len);
            let desc_len = data.get_u16() as usize;
            if data.remaining() < desc_len {
                return Err(AppError::Protocol("truncated UHIDCreate descriptor".into()));
            }
            let report_desc = data.copy_to_bytes(desc_len);
            Ok(ControlEvent::UHIDCreate(UhidCreate {
                id,
                vendor,
                product,
                name,
                report_desc,
            }))
        }
        wire_type::UHID_INPUT => {
            if data.remaining() < 4 {
                return Err(AppError::Protocol("short UHIDInput frame".into()));
            }
            let id = data.get_u16();
            let size = data.get_u16() as usize;
            if data.remaining() < size {
                return Err(AppError::Protocol("truncated UHIDInput payload".into()));
            }
            let payload = data.copy_to_bytes(size);
            Ok(ControlEvent::UHIDInput(UhidInput { id, data: payload }))
        }
        wire_type::UHID_DESTROY => {
            if data.remaining() < 2 {
                return Err(AppError::Protocol("short UHIDDestroy frame".into()));
            }
            Ok(ControlEvent::UHIDDestroy { id: data.get_u16() })
        }
        wire_type::REQUEST_IDR => Ok(ControlEvent::RequestIDR),
        other => Err(AppError::Protocol(format!("unknown control tag {other}"))),
    }
}

/// Device -> browser out-of-band events, sent over the unordered data
/// channel (§4.5's event fan-out).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackEvent {
    ClipboardContent(String),
    TextStatusMessage(String),
}

impl FeedbackEvent {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            FeedbackEvent::ClipboardContent(text) => {
                buf.put_u8(0);
                buf.put_slice(text.as_bytes());
            }
            FeedbackEvent::TextStatusMessage(text) => {
                buf.put_u8(1);
                buf.put_slice(text.as_bytes());
            }
        }
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inject_touch_round_trips_31_bytes_after_type() {
        let event = ControlEvent::Touch(TouchEvent {
            action: 1,
            pointer_id: 7,
            pos_x: 100,
            pos_y: 200,
            width: 1080,
            height: 2400,
            pressure: 0xFFFF,
            buttons_a: 1,
            buttons_b: 0,
        });
        let encoded = event.encode().unwrap();
        assert_eq!(encoded.len(), 1 + 31);
        assert_eq!(encoded[0], wire_type::INJECT_TOUCH);

        let decoded = decode_control_event(encoded).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn inject_key_round_trips() {
        let event = ControlEvent::Key(KeyEvent {
            action: 0,
            keycode: 42,
        });
        let encoded = event.encode().unwrap();
        assert_eq!(encoded.len(), 1 + 13);
        assert_eq!(decode_control_event(encoded).unwrap(), event);
    }

    #[test]
    fn request_idr_is_a_single_byte() {
        let encoded = ControlEvent::RequestIDR.encode().unwrap();
        assert_eq!(encoded.as_ref(), &[wire_type::REQUEST_IDR]);
    }

    #[test]
    fn get_clipboard_produces_no_wire_bytes() {
        assert!(ControlEvent::GetClipboard.encode().is_none());
    }

    #[test]
    fn rejects_unknown_tag() {
        assert!(decode_control_event(Bytes::from_static(&[0xAA])).is_err());
    }
}
