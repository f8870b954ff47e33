//! Capability exchange: the server demand active PDU and the client's
//! confirm active parsing.

use super::{ReadCursor, RdpError};

pub const CAPSET_GENERAL: u16 = 1;
pub const CAPSET_BITMAP: u16 = 2;
pub const CAPSET_ORDER: u16 = 3;
pub const CAPSET_POINTER: u16 = 8;
pub const CAPSET_SHARE: u16 = 9;
pub const CAPSET_INPUT: u16 = 13;
pub const CAPSET_VIRTUAL_CHANNEL: u16 = 20;
pub const CAPSET_MULTIFRAGMENT_UPDATE: u16 = 26;
pub const CAPSET_LARGE_POINTER: u16 = 27;
pub const CAPSET_SURFACE_COMMANDS: u16 = 28;
pub const CAPSET_BITMAP_CODECS: u16 = 29;
pub const CAPSET_FRAME_ACKNOWLEDGE: u16 = 30;

pub const SURFCMDS_SET_SURFACE_BITS: u32 = 0x02;
pub const SURFCMDS_FRAME_MARKER: u32 = 0x10;
pub const SURFCMDS_STREAM_SURFACE_BITS: u32 = 0x40;

pub const INPUT_FLAG_SCANCODES: u16 = 0x0001;
pub const INPUT_FLAG_MOUSEX: u16 = 0x0004;
pub const INPUT_FLAG_FASTPATH_INPUT: u16 = 0x0008;
pub const INPUT_FLAG_UNICODE: u16 = 0x0010;
pub const INPUT_FLAG_FASTPATH_INPUT2: u16 = 0x0020;

/// CODEC_GUID_REMOTEFX.
pub const GUID_REMOTEFX: [u8; 16] = [
    0x12, 0x2F, 0x77, 0x76, 0x72, 0xBD, 0x63, 0x44, 0xAF, 0xB3, 0xB7, 0x3C, 0x9C, 0x6F, 0x78, 0x86,
];

/// What the client granted in its confirm active.
#[derive(Debug, Clone)]
pub struct ClientCapabilities {
    pub color_depth: u32,
    pub desktop_width: u32,
    pub desktop_height: u32,
    pub desktop_resize: bool,
    pub pointer_cache_size: u32,
    pub color_pointer_cache_size: u32,
    pub multifrag_max_request_size: u32,
    pub surface_commands: u32,
    pub frame_ack_received: bool,
    pub frame_acknowledge: u32,
    /// Client-assigned codec id for RemoteFX, when advertised.
    pub remotefx_codec_id: Option<u8>,
    pub fastpath_output: bool,
    pub input_flags: u16,
    pub large_pointer: bool,
}

impl Default for ClientCapabilities {
    fn default() -> ClientCapabilities {
        ClientCapabilities {
            color_depth: 16,
            desktop_width: 0,
            desktop_height: 0,
            desktop_resize: false,
            pointer_cache_size: 0,
            color_pointer_cache_size: 0,
            // Without the capset the client is limited to what a single
            // unfragmented fastpath update can carry.
            multifrag_max_request_size: 16 * 1024,
            surface_commands: 0,
            frame_ack_received: false,
            frame_acknowledge: 0,
            remotefx_codec_id: None,
            fastpath_output: false,
            input_flags: 0,
            large_pointer: false,
        }
    }
}

impl ClientCapabilities {
    #[must_use]
    pub fn surface_bits_enabled(&self) -> bool {
        self.surface_commands & (SURFCMDS_SET_SURFACE_BITS | SURFCMDS_STREAM_SURFACE_BITS) != 0
    }

    #[must_use]
    pub fn frame_marker_enabled(&self) -> bool {
        self.surface_commands & SURFCMDS_FRAME_MARKER != 0
    }
}

fn capset(out: &mut Vec<u8>, set_type: u16, body: &[u8]) {
    out.extend_from_slice(&set_type.to_le_bytes());
    out.extend_from_slice(&((body.len() + 4) as u16).to_le_bytes());
    out.extend_from_slice(body);
}

/// The capability sets the server demands. `rfx` adds the bitmap codecs
/// capset so RemoteFX-capable clients negotiate a codec id.
#[must_use]
pub fn build_server_capsets(
    desktop_width: u32,
    desktop_height: u32,
    color_depth: u32,
    multifrag_max_request_size: u32,
    rfx: bool,
) -> Vec<Vec<u8>> {
    let mut sets: Vec<Vec<u8>> = Vec::new();

    let mut add = |set_type: u16, body: &[u8]| {
        let mut buf = Vec::with_capacity(body.len() + 4);
        capset(&mut buf, set_type, body);
        sets.push(buf);
    };

    // General: fastpath output, no bitmap compression headers, long
    // credentials, refresh-rect and suppress-output support.
    let mut general = Vec::new();
    general.extend_from_slice(&1u16.to_le_bytes()); // osMajorType: windows
    general.extend_from_slice(&3u16.to_le_bytes()); // osMinorType: nt
    general.extend_from_slice(&0x0200u16.to_le_bytes()); // protocolVersion
    general.extend_from_slice(&0u16.to_le_bytes()); // pad
    general.extend_from_slice(&0u16.to_le_bytes()); // compressionTypes
    general.extend_from_slice(&0x0405u16.to_le_bytes()); // extraFlags
    general.extend_from_slice(&0u16.to_le_bytes()); // updateCapabilityFlag
    general.extend_from_slice(&0u16.to_le_bytes()); // remoteUnshareFlag
    general.extend_from_slice(&0u16.to_le_bytes()); // compressionLevel
    general.push(1); // refreshRectSupport
    general.push(1); // suppressOutputSupport
    add(CAPSET_GENERAL, &general);

    let mut bitmap = Vec::new();
    bitmap.extend_from_slice(&(color_depth as u16).to_le_bytes());
    bitmap.extend_from_slice(&1u16.to_le_bytes()); // receive1BitPerPixel
    bitmap.extend_from_slice(&1u16.to_le_bytes()); // receive4BitsPerPixel
    bitmap.extend_from_slice(&1u16.to_le_bytes()); // receive8BitsPerPixel
    bitmap.extend_from_slice(&(desktop_width as u16).to_le_bytes());
    bitmap.extend_from_slice(&(desktop_height as u16).to_le_bytes());
    bitmap.extend_from_slice(&0u16.to_le_bytes()); // pad
    bitmap.extend_from_slice(&1u16.to_le_bytes()); // desktopResizeFlag
    bitmap.extend_from_slice(&1u16.to_le_bytes()); // bitmapCompressionFlag
    bitmap.extend_from_slice(&0u16.to_le_bytes()); // highColorFlags + drawingFlags
    bitmap.extend_from_slice(&1u16.to_le_bytes()); // multipleRectangleSupport
    bitmap.extend_from_slice(&0u16.to_le_bytes()); // pad
    add(CAPSET_BITMAP, &bitmap);

    // Order: no drawing orders, everything goes through bitmap or
    // surface updates.
    let mut order = vec![0u8; 16]; // terminalDescriptor + pad
    order.extend_from_slice(&1u16.to_le_bytes()); // desktopSaveXGranularity
    order.extend_from_slice(&20u16.to_le_bytes()); // desktopSaveYGranularity
    order.extend_from_slice(&0u16.to_le_bytes()); // pad
    order.extend_from_slice(&1u16.to_le_bytes()); // maximumOrderLevel
    order.extend_from_slice(&0u16.to_le_bytes()); // numberFonts
    order.extend_from_slice(&0x002Au16.to_le_bytes()); // orderFlags
    order.extend_from_slice(&[0u8; 32]); // orderSupport: none
    order.extend_from_slice(&0u16.to_le_bytes()); // textFlags
    order.extend_from_slice(&0u16.to_le_bytes()); // orderSupportExFlags
    order.extend_from_slice(&0u32.to_le_bytes()); // pad
    order.extend_from_slice(&0u32.to_le_bytes()); // desktopSaveSize
    order.extend_from_slice(&[0u8; 4]); // pad
    order.extend_from_slice(&0xE4u16.to_le_bytes()); // textANSICodePage
    order.extend_from_slice(&0u16.to_le_bytes()); // pad
    add(CAPSET_ORDER, &order);

    let mut pointer = Vec::new();
    pointer.extend_from_slice(&1u16.to_le_bytes()); // colorPointerFlag
    pointer.extend_from_slice(&25u16.to_le_bytes()); // colorPointerCacheSize
    pointer.extend_from_slice(&25u16.to_le_bytes()); // pointerCacheSize
    add(CAPSET_POINTER, &pointer);

    let mut input = Vec::new();
    input.extend_from_slice(
        &(INPUT_FLAG_SCANCODES
            | INPUT_FLAG_MOUSEX
            | INPUT_FLAG_FASTPATH_INPUT
            | INPUT_FLAG_UNICODE
            | INPUT_FLAG_FASTPATH_INPUT2)
            .to_le_bytes(),
    );
    input.extend_from_slice(&0u16.to_le_bytes()); // pad
    input.extend_from_slice(&[0u8; 4 + 4 + 4 + 4 + 64]); // kbd info + imeFileName
    add(CAPSET_INPUT, &input);

    let mut share = Vec::new();
    share.extend_from_slice(&super::mcs::SERVER_USER_ID.to_le_bytes());
    share.extend_from_slice(&0u16.to_le_bytes());
    add(CAPSET_SHARE, &share);

    let mut vc = Vec::new();
    vc.extend_from_slice(&0u32.to_le_bytes()); // no channel compression
    vc.extend_from_slice(&1600u32.to_le_bytes()); // VCChunkSize
    add(CAPSET_VIRTUAL_CHANNEL, &vc);

    let mut multifrag = Vec::new();
    multifrag.extend_from_slice(&multifrag_max_request_size.to_le_bytes());
    add(CAPSET_MULTIFRAGMENT_UPDATE, &multifrag);

    let mut large_pointer = Vec::new();
    large_pointer.extend_from_slice(&1u16.to_le_bytes()); // 96x96
    add(CAPSET_LARGE_POINTER, &large_pointer);

    let mut surface = Vec::new();
    surface.extend_from_slice(
        &(SURFCMDS_SET_SURFACE_BITS | SURFCMDS_FRAME_MARKER | SURFCMDS_STREAM_SURFACE_BITS)
            .to_le_bytes(),
    );
    surface.extend_from_slice(&0u32.to_le_bytes()); // reserved
    add(CAPSET_SURFACE_COMMANDS, &surface);

    if rfx {
        let mut codecs = Vec::new();
        codecs.push(1); // bitmapCodecCount
        codecs.extend_from_slice(&GUID_REMOTEFX);
        codecs.push(0); // codecID, assigned by the client
        // TS_RFX_SRVR_CAPS_CONTAINER: reserved
        codecs.extend_from_slice(&4u16.to_le_bytes());
        codecs.extend_from_slice(&0u32.to_le_bytes());
        add(CAPSET_BITMAP_CODECS, &codecs);
    }

    let mut frame_ack = Vec::new();
    frame_ack.extend_from_slice(&2u32.to_le_bytes());
    add(CAPSET_FRAME_ACKNOWLEDGE, &frame_ack);

    sets
}

fn parse_bitmap_codecs(data: &[u8], caps: &mut ClientCapabilities) -> Result<(), RdpError> {
    let mut cur = ReadCursor::new(data, "bitmap codecs capset");
    let count = cur.read_u8()?;
    for _ in 0..count {
        let guid = cur.read_bytes(16)?;
        let codec_id = cur.read_u8()?;
        let properties_len = usize::from(cur.read_u16()?);
        cur.skip(properties_len)?;
        if guid == GUID_REMOTEFX {
            caps.remotefx_codec_id = Some(codec_id);
        }
    }
    Ok(())
}

/// Parse the capability sets of a confirm active PDU body (after the
/// share control header).
pub fn parse_confirm_active(payload: &[u8]) -> Result<ClientCapabilities, RdpError> {
    let mut cur = ReadCursor::new(payload, "confirm active");
    let _share_id = cur.read_u32()?;
    let _originator_id = cur.read_u16()?;
    let source_len = usize::from(cur.read_u16()?);
    let _combined_len = usize::from(cur.read_u16()?);
    cur.skip(source_len)?;
    let number_capabilities = cur.read_u16()?;
    cur.read_u16()?; // pad

    let mut caps = ClientCapabilities::default();

    for _ in 0..number_capabilities {
        let set_type = cur.read_u16()?;
        let length = usize::from(cur.read_u16()?);
        if length < 4 {
            return Err(RdpError::Malformed("capability set length"));
        }
        let data = cur.read_bytes(length - 4)?;
        let mut set = ReadCursor::new(data, "capability set");
        match set_type {
            CAPSET_GENERAL => {
                set.skip(10)?;
                let extra_flags = set.read_u16()?;
                caps.fastpath_output = extra_flags & 0x0001 != 0;
            }
            CAPSET_BITMAP => {
                caps.color_depth = u32::from(set.read_u16()?);
                set.skip(6)?;
                caps.desktop_width = u32::from(set.read_u16()?);
                caps.desktop_height = u32::from(set.read_u16()?);
                set.skip(2)?;
                caps.desktop_resize = set.read_u16()? != 0;
            }
            CAPSET_POINTER => {
                set.skip(2)?;
                caps.color_pointer_cache_size = u32::from(set.read_u16()?);
                caps.pointer_cache_size = u32::from(set.read_u16().unwrap_or(0));
            }
            CAPSET_INPUT => {
                caps.input_flags = set.read_u16()?;
            }
            CAPSET_MULTIFRAGMENT_UPDATE => {
                caps.multifrag_max_request_size = set.read_u32()?;
            }
            CAPSET_LARGE_POINTER => {
                caps.large_pointer = set.read_u16()? != 0;
            }
            CAPSET_SURFACE_COMMANDS => {
                caps.surface_commands = set.read_u32()?;
            }
            CAPSET_FRAME_ACKNOWLEDGE => {
                caps.frame_ack_received = true;
                caps.frame_acknowledge = set.read_u32()?;
            }
            CAPSET_BITMAP_CODECS => parse_bitmap_codecs(data, &mut caps)?,
            _ => {}
        }
    }

    Ok(caps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirm_payload(sets: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut caps = Vec::new();
        for (set_type, body) in sets {
            capset(&mut caps, *set_type, body);
        }
        let mut out = Vec::new();
        out.extend_from_slice(&0x10001u32.to_le_bytes()); // shareId
        out.extend_from_slice(&0x03EAu16.to_le_bytes()); // originatorId
        out.extend_from_slice(&4u16.to_le_bytes()); // source len
        out.extend_from_slice(&((caps.len() + 4) as u16).to_le_bytes());
        out.extend_from_slice(b"MSTC");
        out.extend_from_slice(&(sets.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&caps);
        out
    }

    #[test]
    fn parses_client_capsets() {
        let mut bitmap = Vec::new();
        bitmap.extend_from_slice(&32u16.to_le_bytes());
        bitmap.extend_from_slice(&[0u8; 6]);
        bitmap.extend_from_slice(&1280u16.to_le_bytes());
        bitmap.extend_from_slice(&800u16.to_le_bytes());
        bitmap.extend_from_slice(&0u16.to_le_bytes());
        bitmap.extend_from_slice(&1u16.to_le_bytes());

        let mut multifrag = Vec::new();
        multifrag.extend_from_slice(&0x2_0000u32.to_le_bytes());

        let mut frame_ack = Vec::new();
        frame_ack.extend_from_slice(&2u32.to_le_bytes());

        let mut codecs = Vec::new();
        codecs.push(1);
        codecs.extend_from_slice(&GUID_REMOTEFX);
        codecs.push(3);
        codecs.extend_from_slice(&0u16.to_le_bytes());

        let mut surface = Vec::new();
        surface.extend_from_slice(
            &(SURFCMDS_SET_SURFACE_BITS | SURFCMDS_FRAME_MARKER).to_le_bytes(),
        );
        surface.extend_from_slice(&0u32.to_le_bytes());

        let payload = confirm_payload(&[
            (CAPSET_BITMAP, bitmap),
            (CAPSET_MULTIFRAGMENT_UPDATE, multifrag),
            (CAPSET_FRAME_ACKNOWLEDGE, frame_ack),
            (CAPSET_BITMAP_CODECS, codecs),
            (CAPSET_SURFACE_COMMANDS, surface),
        ]);

        let caps = parse_confirm_active(&payload).unwrap();
        assert_eq!(caps.color_depth, 32);
        assert_eq!(caps.desktop_width, 1280);
        assert!(caps.desktop_resize);
        assert_eq!(caps.multifrag_max_request_size, 0x2_0000);
        assert!(caps.frame_ack_received);
        assert_eq!(caps.frame_acknowledge, 2);
        assert_eq!(caps.remotefx_codec_id, Some(3));
        assert!(caps.surface_bits_enabled());
        assert!(caps.frame_marker_enabled());
    }

    #[test]
    fn absent_multifrag_keeps_conservative_default() {
        let payload = confirm_payload(&[]);
        let caps = parse_confirm_active(&payload).unwrap();
        assert_eq!(caps.multifrag_max_request_size, 16 * 1024);
        assert!(!caps.frame_ack_received);
    }

    #[test]
    fn server_capsets_contain_rfx_only_when_asked() {
        let with = build_server_capsets(1024, 768, 32, 65535, true);
        let without = build_server_capsets(1024, 768, 32, 65535, false);
        let has_codecs = |sets: &[Vec<u8>]| {
            sets.iter()
                .any(|s| u16::from_le_bytes([s[0], s[1]]) == CAPSET_BITMAP_CODECS)
        };
        assert!(has_codecs(&with));
        assert!(!has_codecs(&without));
    }
}
