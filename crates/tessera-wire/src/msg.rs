//! Backend protocol messages.
//!
//! Every frame on the pipe is `type:u16 | length:u32` (little endian)
//! followed by `length` payload bytes. The payload is the serialized body
//! of the message selected by `type`. Types 0..=7 travel backend→server,
//! 8..=20 server→backend.

use serde::{Deserialize, Serialize};

use crate::WireError;

/// Size of the `type | length` frame header.
pub const HEADER_LEN: usize = 6;

/// Maximum accepted payload; anything larger is treated as a framing
/// error and closes the link.
pub const MAX_PAYLOAD: usize = 4 * 1024 * 1024;

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub msg_type: u16,
    pub length: u32,
}

impl MessageHeader {
    #[must_use]
    pub fn encode(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&self.msg_type.to_le_bytes());
        buf[2..6].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    #[must_use]
    pub fn decode(buf: &[u8; HEADER_LEN]) -> MessageHeader {
        MessageHeader {
            msg_type: u16::from_le_bytes([buf[0], buf[1]]),
            length: u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]),
        }
    }
}

/* message type tags, backend → rdp-server */
pub const TAG_SET_POINTER: u16 = 0;
pub const TAG_FRAMEBUFFER_INFO: u16 = 1;
pub const TAG_BEEP: u16 = 2;
pub const TAG_SET_SYSTEM_POINTER: u16 = 3;
pub const TAG_SBP_REQUEST: u16 = 4;
pub const TAG_FRAMEBUFFER_SYNC_REPLY: u16 = 5;
pub const TAG_MESSAGE_REPLY: u16 = 6;
pub const TAG_VERSION_REPLY: u16 = 7;

/* message type tags, rdp-server → backend */
pub const TAG_CAPABILITIES: u16 = 8;
pub const TAG_SYNC_KEYBOARD: u16 = 9;
pub const TAG_SCANCODE_KEYBOARD: u16 = 10;
pub const TAG_UNICODE_KEYBOARD: u16 = 11;
pub const TAG_MOUSE: u16 = 12;
pub const TAG_EXTENDED_MOUSE: u16 = 13;
pub const TAG_FRAMEBUFFER_SYNC_REQUEST: u16 = 14;
pub const TAG_SBP_REPLY: u16 = 15;
pub const TAG_IMMEDIATE_SYNC_REQUEST: u16 = 16;
pub const TAG_SEAT_NEW: u16 = 17;
pub const TAG_SEAT_REMOVED: u16 = 18;
pub const TAG_MESSAGE: u16 = 19;
pub const TAG_VERSION: u16 = 20;

/// System pointer kinds (`SetSystemPointer.ptr_type`).
pub const SYSPTR_DEFAULT: u32 = 0x7F00;
pub const SYSPTR_NULL: u32 = 0;

/// Status of an SBP round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SbpStatus {
    Success,
    TransportError,
    Timeout,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetPointer {
    pub xor_bpp: u32,
    pub x_pos: u32,
    pub y_pos: u32,
    pub width: u32,
    pub height: u32,
    pub xor_mask: Vec<u8>,
    pub and_mask: Vec<u8>,
    /// 0 broadcasts to every front connection of the session.
    pub client_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramebufferInfo {
    pub version: u32,
    pub width: u32,
    pub height: u32,
    pub scanline: u32,
    pub bits_per_pixel: u32,
    pub bytes_per_pixel: u32,
    pub user_id: u32,
    pub multiseat_capable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beep {
    pub duration: u32,
    pub frequency: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetSystemPointer {
    pub ptr_type: u32,
    pub client_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbpRequest {
    pub sbp_type: u32,
    pub tag: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramebufferSyncReply {
    pub buffer_id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReply {
    pub message_id: u32,
    pub result: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub version_major: u32,
    pub version_minor: u32,
    pub cookie: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub desktop_width: u32,
    pub desktop_height: u32,
    pub color_depth: u32,
    pub keyboard_layout: u32,
    pub keyboard_type: u32,
    pub keyboard_subtype: u32,
    pub client_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncKeyboard {
    pub flags: u32,
    pub client_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScancodeKeyboard {
    pub flags: u32,
    pub code: u32,
    pub keyboard_type: u32,
    pub client_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnicodeKeyboard {
    pub flags: u32,
    pub code: u32,
    pub client_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mouse {
    pub flags: u32,
    pub x: u32,
    pub y: u32,
    pub client_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramebufferSyncRequest {
    pub buffer_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbpReply {
    pub sbp_type: u32,
    pub tag: u32,
    pub status: SbpStatus,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatNew {
    pub client_id: u32,
    pub keyboard_layout: u32,
    pub keyboard_type: u32,
    pub keyboard_subtype: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatRemoved {
    pub client_id: u32,
}

/// A user-visible message dialog bridged from the session manager through
/// the backend. `icp_tag` / `icp_type` route the eventual reply back to
/// the originating ICP call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub message_id: u32,
    pub message_type: u32,
    pub style: u32,
    pub timeout: u32,
    pub parameters: Vec<String>,
    pub icp_tag: u32,
    pub icp_type: u32,
}

/// Every message of the backend protocol, in both directions.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    SetPointer(SetPointer),
    FramebufferInfo(FramebufferInfo),
    Beep(Beep),
    SetSystemPointer(SetSystemPointer),
    SbpRequest(SbpRequest),
    FramebufferSyncReply(FramebufferSyncReply),
    MessageReply(MessageReply),
    VersionReply(Version),
    Capabilities(Capabilities),
    SyncKeyboard(SyncKeyboard),
    ScancodeKeyboard(ScancodeKeyboard),
    UnicodeKeyboard(UnicodeKeyboard),
    Mouse(Mouse),
    ExtendedMouse(Mouse),
    FramebufferSyncRequest(FramebufferSyncRequest),
    SbpReply(SbpReply),
    ImmediateSyncRequest(FramebufferSyncRequest),
    SeatNew(SeatNew),
    SeatRemoved(SeatRemoved),
    Message(UserMessage),
    Version(Version),
}

fn payload<T: Serialize>(kind: &'static str, body: &T) -> Result<Vec<u8>, WireError> {
    serde_json::to_vec(body).map_err(|source| WireError::Payload { kind, source })
}

fn parse<'a, T: Deserialize<'a>>(kind: &'static str, data: &'a [u8]) -> Result<T, WireError> {
    serde_json::from_slice(data).map_err(|source| WireError::Payload { kind, source })
}

impl WireMessage {
    /// The numeric wire tag of this message.
    #[must_use]
    pub fn tag(&self) -> u16 {
        match self {
            WireMessage::SetPointer(_) => TAG_SET_POINTER,
            WireMessage::FramebufferInfo(_) => TAG_FRAMEBUFFER_INFO,
            WireMessage::Beep(_) => TAG_BEEP,
            WireMessage::SetSystemPointer(_) => TAG_SET_SYSTEM_POINTER,
            WireMessage::SbpRequest(_) => TAG_SBP_REQUEST,
            WireMessage::FramebufferSyncReply(_) => TAG_FRAMEBUFFER_SYNC_REPLY,
            WireMessage::MessageReply(_) => TAG_MESSAGE_REPLY,
            WireMessage::VersionReply(_) => TAG_VERSION_REPLY,
            WireMessage::Capabilities(_) => TAG_CAPABILITIES,
            WireMessage::SyncKeyboard(_) => TAG_SYNC_KEYBOARD,
            WireMessage::ScancodeKeyboard(_) => TAG_SCANCODE_KEYBOARD,
            WireMessage::UnicodeKeyboard(_) => TAG_UNICODE_KEYBOARD,
            WireMessage::Mouse(_) => TAG_MOUSE,
            WireMessage::ExtendedMouse(_) => TAG_EXTENDED_MOUSE,
            WireMessage::FramebufferSyncRequest(_) => TAG_FRAMEBUFFER_SYNC_REQUEST,
            WireMessage::SbpReply(_) => TAG_SBP_REPLY,
            WireMessage::ImmediateSyncRequest(_) => TAG_IMMEDIATE_SYNC_REQUEST,
            WireMessage::SeatNew(_) => TAG_SEAT_NEW,
            WireMessage::SeatRemoved(_) => TAG_SEAT_REMOVED,
            WireMessage::Message(_) => TAG_MESSAGE,
            WireMessage::Version(_) => TAG_VERSION,
        }
    }

    /// Human readable name, for logs.
    #[must_use]
    pub fn name(tag: u16) -> &'static str {
        match tag {
            TAG_SET_POINTER => "SetPointer",
            TAG_FRAMEBUFFER_INFO => "FramebufferInfo",
            TAG_BEEP => "Beep",
            TAG_SET_SYSTEM_POINTER => "SetSystemPointer",
            TAG_SBP_REQUEST => "SbpRequest",
            TAG_FRAMEBUFFER_SYNC_REPLY => "FramebufferSyncReply",
            TAG_MESSAGE_REPLY => "MessageReply",
            TAG_VERSION_REPLY => "VersionReply",
            TAG_CAPABILITIES => "Capabilities",
            TAG_SYNC_KEYBOARD => "SyncKeyboard",
            TAG_SCANCODE_KEYBOARD => "ScancodeKeyboard",
            TAG_UNICODE_KEYBOARD => "UnicodeKeyboard",
            TAG_MOUSE => "Mouse",
            TAG_EXTENDED_MOUSE => "ExtendedMouse",
            TAG_FRAMEBUFFER_SYNC_REQUEST => "FramebufferSyncRequest",
            TAG_SBP_REPLY => "SbpReply",
            TAG_IMMEDIATE_SYNC_REQUEST => "ImmediateSyncRequest",
            TAG_SEAT_NEW => "SeatNew",
            TAG_SEAT_REMOVED => "SeatRemoved",
            TAG_MESSAGE => "Message",
            TAG_VERSION => "Version",
            _ => "Unknown",
        }
    }

    /// Serialize into a complete frame (header + payload).
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let body = match self {
            WireMessage::SetPointer(m) => payload("SetPointer", m)?,
            WireMessage::FramebufferInfo(m) => payload("FramebufferInfo", m)?,
            WireMessage::Beep(m) => payload("Beep", m)?,
            WireMessage::SetSystemPointer(m) => payload("SetSystemPointer", m)?,
            WireMessage::SbpRequest(m) => payload("SbpRequest", m)?,
            WireMessage::FramebufferSyncReply(m) => payload("FramebufferSyncReply", m)?,
            WireMessage::MessageReply(m) => payload("MessageReply", m)?,
            WireMessage::VersionReply(m) => payload("VersionReply", m)?,
            WireMessage::Capabilities(m) => payload("Capabilities", m)?,
            WireMessage::SyncKeyboard(m) => payload("SyncKeyboard", m)?,
            WireMessage::ScancodeKeyboard(m) => payload("ScancodeKeyboard", m)?,
            WireMessage::UnicodeKeyboard(m) => payload("UnicodeKeyboard", m)?,
            WireMessage::Mouse(m) => payload("Mouse", m)?,
            WireMessage::ExtendedMouse(m) => payload("ExtendedMouse", m)?,
            WireMessage::FramebufferSyncRequest(m) => payload("FramebufferSyncRequest", m)?,
            WireMessage::SbpReply(m) => payload("SbpReply", m)?,
            WireMessage::ImmediateSyncRequest(m) => payload("ImmediateSyncRequest", m)?,
            WireMessage::SeatNew(m) => payload("SeatNew", m)?,
            WireMessage::SeatRemoved(m) => payload("SeatRemoved", m)?,
            WireMessage::Message(m) => payload("Message", m)?,
            WireMessage::Version(m) => payload("Version", m)?,
        };
        if body.len() > MAX_PAYLOAD {
            return Err(WireError::Oversized(body.len()));
        }
        let header = MessageHeader {
            msg_type: self.tag(),
            length: body.len() as u32,
        };
        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode a payload according to its wire tag.
    pub fn decode(tag: u16, data: &[u8]) -> Result<WireMessage, WireError> {
        Ok(match tag {
            TAG_SET_POINTER => WireMessage::SetPointer(parse("SetPointer", data)?),
            TAG_FRAMEBUFFER_INFO => WireMessage::FramebufferInfo(parse("FramebufferInfo", data)?),
            TAG_BEEP => WireMessage::Beep(parse("Beep", data)?),
            TAG_SET_SYSTEM_POINTER => {
                WireMessage::SetSystemPointer(parse("SetSystemPointer", data)?)
            }
            TAG_SBP_REQUEST => WireMessage::SbpRequest(parse("SbpRequest", data)?),
            TAG_FRAMEBUFFER_SYNC_REPLY => {
                WireMessage::FramebufferSyncReply(parse("FramebufferSyncReply", data)?)
            }
            TAG_MESSAGE_REPLY => WireMessage::MessageReply(parse("MessageReply", data)?),
            TAG_VERSION_REPLY => WireMessage::VersionReply(parse("VersionReply", data)?),
            TAG_CAPABILITIES => WireMessage::Capabilities(parse("Capabilities", data)?),
            TAG_SYNC_KEYBOARD => WireMessage::SyncKeyboard(parse("SyncKeyboard", data)?),
            TAG_SCANCODE_KEYBOARD => {
                WireMessage::ScancodeKeyboard(parse("ScancodeKeyboard", data)?)
            }
            TAG_UNICODE_KEYBOARD => WireMessage::UnicodeKeyboard(parse("UnicodeKeyboard", data)?),
            TAG_MOUSE => WireMessage::Mouse(parse("Mouse", data)?),
            TAG_EXTENDED_MOUSE => WireMessage::ExtendedMouse(parse("ExtendedMouse", data)?),
            TAG_FRAMEBUFFER_SYNC_REQUEST => {
                WireMessage::FramebufferSyncRequest(parse("FramebufferSyncRequest", data)?)
            }
            TAG_SBP_REPLY => WireMessage::SbpReply(parse("SbpReply", data)?),
            TAG_IMMEDIATE_SYNC_REQUEST => {
                WireMessage::ImmediateSyncRequest(parse("ImmediateSyncRequest", data)?)
            }
            TAG_SEAT_NEW => WireMessage::SeatNew(parse("SeatNew", data)?),
            TAG_SEAT_REMOVED => WireMessage::SeatRemoved(parse("SeatRemoved", data)?),
            TAG_MESSAGE => WireMessage::Message(parse("Message", data)?),
            TAG_VERSION => WireMessage::Version(parse("Version", data)?),
            other => return Err(WireError::UnknownType(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip_is_bijective() {
        for (msg_type, length) in [(0u16, 0u32), (7, 1), (20, 0xdead_beef), (u16::MAX, u32::MAX)] {
            let header = MessageHeader { msg_type, length };
            let decoded = MessageHeader::decode(&header.encode());
            assert_eq!(decoded, header);
        }
    }

    #[test]
    fn header_layout_matches_wire() {
        let header = MessageHeader {
            msg_type: 0x0102,
            length: 0x0304_0506,
        };
        assert_eq!(header.encode(), [0x02, 0x01, 0x06, 0x05, 0x04, 0x03]);
    }

    #[test]
    fn version_roundtrip() {
        let msg = WireMessage::Version(Version {
            version_major: 1,
            version_minor: 0,
            cookie: "abc".into(),
        });
        let frame = msg.encode().unwrap();
        let header = MessageHeader::decode(frame[..HEADER_LEN].try_into().unwrap());
        assert_eq!(header.msg_type, TAG_VERSION);
        assert_eq!(header.length as usize, frame.len() - HEADER_LEN);
        let decoded = WireMessage::decode(header.msg_type, &frame[HEADER_LEN..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(matches!(
            WireMessage::decode(42, b"{}"),
            Err(WireError::UnknownType(42))
        ));
    }

    #[test]
    fn pointer_masks_survive() {
        let msg = WireMessage::SetPointer(SetPointer {
            xor_bpp: 32,
            x_pos: 3,
            y_pos: 4,
            width: 16,
            height: 16,
            xor_mask: vec![0xAA; 16 * 16 * 4],
            and_mask: vec![0x55; 16 * 16 / 8],
            client_id: 0,
        });
        let frame = msg.encode().unwrap();
        let decoded = WireMessage::decode(TAG_SET_POINTER, &frame[HEADER_LEN..]).unwrap();
        assert_eq!(decoded, msg);
    }
}
