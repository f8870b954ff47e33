//! Client input: fastpath input events and their slowpath equivalents.

use super::{ReadCursor, RdpError};

/* keyboardFlags as forwarded to the backend (slowpath values) */
pub const KBD_FLAGS_EXTENDED: u32 = 0x0100;
pub const KBD_FLAGS_DOWN: u32 = 0x4000;
pub const KBD_FLAGS_RELEASE: u32 = 0x8000;

/* sync toggle flags */
pub const KBD_SYNC_SCROLL_LOCK: u32 = 0x01;
pub const KBD_SYNC_NUM_LOCK: u32 = 0x02;
pub const KBD_SYNC_CAPS_LOCK: u32 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Sync { flags: u32 },
    Scancode { flags: u32, code: u32 },
    Unicode { flags: u32, code: u32 },
    Mouse { flags: u32, x: u32, y: u32 },
    ExtendedMouse { flags: u32, x: u32, y: u32 },
}

const FASTPATH_EVENT_SCANCODE: u8 = 0;
const FASTPATH_EVENT_MOUSE: u8 = 1;
const FASTPATH_EVENT_MOUSEX: u8 = 2;
const FASTPATH_EVENT_SYNC: u8 = 3;
const FASTPATH_EVENT_UNICODE: u8 = 4;

const FASTPATH_KBD_RELEASE: u8 = 0x01;
const FASTPATH_KBD_EXTENDED: u8 = 0x02;

/// Parse the events of a fastpath input PDU. `header` is the first byte
/// of the frame, `payload` everything after the length field.
pub fn parse_fastpath_input(header: u8, payload: &[u8]) -> Result<Vec<InputEvent>, RdpError> {
    let mut cur = ReadCursor::new(payload, "fastpath input");
    let mut num_events = usize::from((header >> 2) & 0x0f);
    if num_events == 0 {
        num_events = usize::from(cur.read_u8()?);
    }

    let mut events = Vec::with_capacity(num_events);
    for _ in 0..num_events {
        let event_header = cur.read_u8()?;
        let code = (event_header >> 5) & 0x07;
        let flags = event_header & 0x1f;
        match code {
            FASTPATH_EVENT_SCANCODE => {
                let scancode = cur.read_u8()?;
                let mut kbd_flags = if flags & FASTPATH_KBD_RELEASE != 0 {
                    KBD_FLAGS_RELEASE
                } else {
                    KBD_FLAGS_DOWN
                };
                if flags & FASTPATH_KBD_EXTENDED != 0 {
                    kbd_flags |= KBD_FLAGS_EXTENDED;
                }
                events.push(InputEvent::Scancode {
                    flags: kbd_flags,
                    code: u32::from(scancode),
                });
            }
            FASTPATH_EVENT_MOUSE | FASTPATH_EVENT_MOUSEX => {
                let pointer_flags = u32::from(cur.read_u16()?);
                let x = u32::from(cur.read_u16()?);
                let y = u32::from(cur.read_u16()?);
                if code == FASTPATH_EVENT_MOUSE {
                    events.push(InputEvent::Mouse {
                        flags: pointer_flags,
                        x,
                        y,
                    });
                } else {
                    events.push(InputEvent::ExtendedMouse {
                        flags: pointer_flags,
                        x,
                        y,
                    });
                }
            }
            FASTPATH_EVENT_SYNC => {
                events.push(InputEvent::Sync {
                    flags: u32::from(flags),
                });
            }
            FASTPATH_EVENT_UNICODE => {
                let code_point = cur.read_u16()?;
                let kbd_flags = if flags & FASTPATH_KBD_RELEASE != 0 {
                    KBD_FLAGS_RELEASE
                } else {
                    KBD_FLAGS_DOWN
                };
                events.push(InputEvent::Unicode {
                    flags: kbd_flags,
                    code: u32::from(code_point),
                });
            }
            other => {
                tracing::debug!(code = other, "ignoring unknown fastpath input event");
                return Ok(events);
            }
        }
    }
    Ok(events)
}

const INPUT_EVENT_SYNC: u16 = 0x0000;
const INPUT_EVENT_SCANCODE: u16 = 0x0004;
const INPUT_EVENT_UNICODE: u16 = 0x0005;
const INPUT_EVENT_MOUSE: u16 = 0x8001;
const INPUT_EVENT_MOUSEX: u16 = 0x8002;

/// Parse a slowpath TS_INPUT_PDU_DATA body.
pub fn parse_slowpath_input(payload: &[u8]) -> Result<Vec<InputEvent>, RdpError> {
    let mut cur = ReadCursor::new(payload, "input pdu");
    let num_events = cur.read_u16()?;
    cur.read_u16()?; // pad
    let mut events = Vec::with_capacity(usize::from(num_events));
    for _ in 0..num_events {
        cur.read_u32()?; // eventTime
        let message_type = cur.read_u16()?;
        let device_flags = u32::from(cur.read_u16()?);
        let param1 = u32::from(cur.read_u16()?);
        let param2 = u32::from(cur.read_u16()?);
        match message_type {
            INPUT_EVENT_SYNC => events.push(InputEvent::Sync { flags: param1 }),
            INPUT_EVENT_SCANCODE => events.push(InputEvent::Scancode {
                flags: device_flags,
                code: param1,
            }),
            INPUT_EVENT_UNICODE => events.push(InputEvent::Unicode {
                flags: device_flags,
                code: param1,
            }),
            INPUT_EVENT_MOUSE => events.push(InputEvent::Mouse {
                flags: device_flags,
                x: param1,
                y: param2,
            }),
            INPUT_EVENT_MOUSEX => events.push(InputEvent::ExtendedMouse {
                flags: device_flags,
                x: param1,
                y: param2,
            }),
            other => {
                tracing::debug!(message_type = other, "ignoring unknown input event");
            }
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fastpath_scancode_and_mouse() {
        // Two events encoded in the header, scancode down + mouse move.
        let header = 2 << 2;
        let mut payload = Vec::new();
        payload.push(FASTPATH_EVENT_SCANCODE << 5); // key down
        payload.push(0x1C);
        payload.push(FASTPATH_EVENT_MOUSE << 5);
        payload.extend_from_slice(&0x0800u16.to_le_bytes()); // PTR_FLAGS_MOVE
        payload.extend_from_slice(&100u16.to_le_bytes());
        payload.extend_from_slice(&200u16.to_le_bytes());

        let events = parse_fastpath_input(header, &payload).unwrap();
        assert_eq!(
            events,
            vec![
                InputEvent::Scancode {
                    flags: KBD_FLAGS_DOWN,
                    code: 0x1C
                },
                InputEvent::Mouse {
                    flags: 0x0800,
                    x: 100,
                    y: 200
                },
            ]
        );
    }

    #[test]
    fn fastpath_release_extended() {
        let header = 1 << 2;
        let payload = [
            (FASTPATH_EVENT_SCANCODE << 5) | FASTPATH_KBD_RELEASE | FASTPATH_KBD_EXTENDED,
            0x38,
        ];
        let events = parse_fastpath_input(header, &payload).unwrap();
        assert_eq!(
            events,
            vec![InputEvent::Scancode {
                flags: KBD_FLAGS_RELEASE | KBD_FLAGS_EXTENDED,
                code: 0x38
            }]
        );
    }

    #[test]
    fn fastpath_event_count_in_extra_byte() {
        let header = 0; // numEvents == 0 -> follows in the payload
        let payload = [1u8, (FASTPATH_EVENT_SYNC << 5) | 0x05];
        let events = parse_fastpath_input(header, &payload).unwrap();
        assert_eq!(events, vec![InputEvent::Sync { flags: 0x05 }]);
    }

    #[test]
    fn slowpath_events() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u16.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes()); // eventTime
        payload.extend_from_slice(&INPUT_EVENT_SCANCODE.to_le_bytes());
        payload.extend_from_slice(&(KBD_FLAGS_RELEASE as u16).to_le_bytes());
        payload.extend_from_slice(&0x1Cu16.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());

        let events = parse_slowpath_input(&payload).unwrap();
        assert_eq!(
            events,
            vec![InputEvent::Scancode {
                flags: KBD_FLAGS_RELEASE,
                code: 0x1C
            }]
        );
    }
}
