//! RDPEGFX: the graphics pipeline served over an internal dynamic
//! channel. Handles the capability handshake, surface lifecycle and the
//! ZGFX segmentation that wraps every message on the wire.

use super::{ReadCursor, RdpError};
use tessera_encode::Rect;

pub const CHANNEL_NAME: &str = "Microsoft::Windows::RDS::Graphics";

/* command ids */
const CMD_WIRE_TO_SURFACE_1: u16 = 0x0001;
const CMD_WIRE_TO_SURFACE_2: u16 = 0x0002;
const CMD_CREATE_SURFACE: u16 = 0x0009;
const CMD_DELETE_SURFACE: u16 = 0x000A;
const CMD_START_FRAME: u16 = 0x000B;
const CMD_END_FRAME: u16 = 0x000C;
const CMD_FRAME_ACKNOWLEDGE: u16 = 0x000D;
const CMD_RESET_GRAPHICS: u16 = 0x000E;
const CMD_MAP_SURFACE_TO_OUTPUT: u16 = 0x000F;
const CMD_CAPS_ADVERTISE: u16 = 0x0012;
const CMD_CAPS_CONFIRM: u16 = 0x0013;
const CMD_QOE_FRAME_ACKNOWLEDGE: u16 = 0x0016;

/* capability versions */
pub const CAPVERSION_8: u32 = 0x0008_0004;
pub const CAPVERSION_81: u32 = 0x0008_0105;
pub const CAPVERSION_10: u32 = 0x000A_0002;
pub const CAPVERSION_101: u32 = 0x000A_0100;
pub const CAPVERSION_102: u32 = 0x000A_0200;
pub const CAPVERSION_103: u32 = 0x000A_0301;
pub const CAPVERSION_104: u32 = 0x000A_0400;

const CAPS_FLAG_AVC420_ENABLED: u32 = 0x10;
const CAPS_FLAG_AVC_DISABLED: u32 = 0x20;

/* codec ids for wire-to-surface */
pub const CODECID_CAVIDEO: u16 = 0x0003;
pub const CODECID_CAPROGRESSIVE: u16 = 0x0009;
pub const CODECID_AVC420: u16 = 0x000B;
pub const CODECID_AVC444: u16 = 0x000E;
pub const CODECID_AVC444V2: u16 = 0x000F;

pub const PIXEL_FORMAT_XRGB_8888: u8 = 0x20;

pub const QUEUE_DEPTH_SUSPENDED: u32 = 0xFFFF_FFFF;

/// ZGFX single-segment cap: FreeRDP decompresses each segment into a
/// 64 KiB buffer, minus the one-byte bulk header.
const ZGFX_MAX_SEGMENT_DATA: usize = 65534;

/// Wrap raw EGFX bytes in RDP_SEGMENTED_DATA (uncompressed RDP8 bulk).
#[must_use]
pub fn zgfx_wrap(payload: &[u8]) -> Vec<u8> {
    if payload.len() <= ZGFX_MAX_SEGMENT_DATA {
        let mut out = Vec::with_capacity(payload.len() + 2);
        out.push(0xE0); // ZGFX_SEGMENTED_SINGLE
        out.push(0x04); // RDP8 bulk, uncompressed
        out.extend_from_slice(payload);
        return out;
    }

    let chunks: Vec<&[u8]> = payload.chunks(ZGFX_MAX_SEGMENT_DATA).collect();
    let mut out = Vec::with_capacity(payload.len() + 7 + chunks.len() * 5);
    out.push(0xE1); // ZGFX_SEGMENTED_MULTIPART
    out.extend_from_slice(&(chunks.len() as u16).to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    for chunk in chunks {
        out.extend_from_slice(&((chunk.len() + 1) as u32).to_le_bytes());
        out.push(0x04);
        out.extend_from_slice(chunk);
    }
    out
}

/// Unwrap client RDP_SEGMENTED_DATA. Compressed segments are rejected
/// (we never advertise RDP8 bulk compression).
pub fn zgfx_unwrap(data: &[u8]) -> Result<Vec<u8>, RdpError> {
    let mut cur = ReadCursor::new(data, "zgfx");
    match cur.read_u8()? {
        0xE0 => {
            let bulk = cur.read_u8()?;
            if bulk & 0x20 != 0 {
                return Err(RdpError::Protocol("compressed zgfx segment"));
            }
            Ok(cur.rest().to_vec())
        }
        0xE1 => {
            let count = cur.read_u16()?;
            let uncompressed = cur.read_u32()? as usize;
            let mut out = Vec::with_capacity(uncompressed);
            for _ in 0..count {
                let seg_len = cur.read_u32()? as usize;
                if seg_len == 0 {
                    return Err(RdpError::Malformed("zgfx segment size"));
                }
                let bulk = cur.read_u8()?;
                if bulk & 0x20 != 0 {
                    return Err(RdpError::Protocol("compressed zgfx segment"));
                }
                out.extend_from_slice(cur.read_bytes(seg_len - 1)?);
            }
            if out.len() != uncompressed {
                return Err(RdpError::Malformed("zgfx uncompressed size"));
            }
            Ok(out)
        }
        _ => Err(RdpError::Malformed("zgfx descriptor")),
    }
}

fn pdu(cmd: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 8);
    out.extend_from_slice(&cmd.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // flags
    out.extend_from_slice(&((body.len() + 8) as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Events surfaced to the frame pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GfxEvent {
    /// Capability handshake finished.
    Ready { h264: bool, avc444: bool },
    FrameAck { frame_id: u32, queue_depth: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GfxState {
    WaitingCaps,
    Ready,
}

/// Server side of one connection's graphics pipeline.
#[derive(Debug)]
pub struct GfxServer {
    state: GfxState,
    pub negotiated_version: u32,
    pub h264_supported: bool,
    pub avc444_supported: bool,
    pub output_surface: Option<u16>,
    next_surface_id: u16,
}

impl Default for GfxServer {
    fn default() -> GfxServer {
        GfxServer::new()
    }
}

impl GfxServer {
    #[must_use]
    pub fn new() -> GfxServer {
        GfxServer {
            state: GfxState::WaitingCaps,
            negotiated_version: 0,
            h264_supported: false,
            avc444_supported: false,
            output_surface: None,
            next_surface_id: 1,
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == GfxState::Ready
    }

    /// Process one reassembled DVC payload from the client. Returns the
    /// events plus an optional ZGFX-wrapped response to send back.
    pub fn process(&mut self, data: &[u8]) -> Result<(Vec<GfxEvent>, Option<Vec<u8>>), RdpError> {
        let payload = zgfx_unwrap(data)?;
        let mut events = Vec::new();
        let mut response = None;

        let mut cur = ReadCursor::new(&payload, "gfx pdu");
        while cur.remaining() >= 8 {
            let cmd = cur.read_u16()?;
            let _flags = cur.read_u16()?;
            let length = cur.read_u32()? as usize;
            if length < 8 {
                return Err(RdpError::Malformed("gfx pdu length"));
            }
            let body = cur.read_bytes(length - 8)?;
            match cmd {
                CMD_CAPS_ADVERTISE => {
                    response = Some(self.handle_caps_advertise(body)?);
                    events.push(GfxEvent::Ready {
                        h264: self.h264_supported,
                        avc444: self.avc444_supported,
                    });
                }
                CMD_FRAME_ACKNOWLEDGE => {
                    let mut ack = ReadCursor::new(body, "gfx frame ack");
                    let queue_depth = ack.read_u32()?;
                    let frame_id = ack.read_u32()?;
                    events.push(GfxEvent::FrameAck {
                        frame_id,
                        queue_depth,
                    });
                }
                CMD_QOE_FRAME_ACKNOWLEDGE => {}
                other => {
                    tracing::debug!(cmd = other, "ignoring gfx pdu");
                }
            }
        }
        Ok((events, response))
    }

    fn handle_caps_advertise(&mut self, body: &[u8]) -> Result<Vec<u8>, RdpError> {
        let mut cur = ReadCursor::new(body, "gfx caps advertise");
        let count = cur.read_u16()?;

        let mut best: Option<(u32, u32)> = None;
        for _ in 0..count {
            let version = cur.read_u32()?;
            let data_len = cur.read_u32()? as usize;
            let data = cur.read_bytes(data_len)?;
            let flags = if data.len() >= 4 {
                u32::from_le_bytes(data[..4].try_into().expect("4 bytes checked"))
            } else {
                0
            };
            let known = matches!(
                version,
                CAPVERSION_8
                    | CAPVERSION_81
                    | CAPVERSION_10
                    | CAPVERSION_101
                    | CAPVERSION_102
                    | CAPVERSION_103
                    | CAPVERSION_104
            );
            if known && best.map_or(true, |(v, _)| version > v) {
                best = Some((version, flags));
            }
        }

        let (version, flags) = best.ok_or(RdpError::Protocol("no usable gfx capability set"))?;
        self.negotiated_version = version;
        self.h264_supported = match version {
            CAPVERSION_8 => false,
            CAPVERSION_81 => flags & CAPS_FLAG_AVC420_ENABLED != 0,
            _ => flags & CAPS_FLAG_AVC_DISABLED == 0,
        };
        self.avc444_supported = version >= CAPVERSION_10 && self.h264_supported;
        self.state = GfxState::Ready;

        tracing::debug!(
            version = format_args!("{version:#x}"),
            h264 = self.h264_supported,
            avc444 = self.avc444_supported,
            "gfx capabilities negotiated"
        );

        let mut confirm = Vec::with_capacity(12);
        confirm.extend_from_slice(&version.to_le_bytes());
        confirm.extend_from_slice(&4u32.to_le_bytes());
        confirm.extend_from_slice(&flags.to_le_bytes());
        Ok(zgfx_wrap(&pdu(CMD_CAPS_CONFIRM, &confirm)))
    }

    /// Reset + create + map the output surface; returns the wrapped
    /// batch to send.
    pub fn init_output(&mut self, width: u32, height: u32) -> Vec<u8> {
        let mut batch = Vec::new();

        // RESET_GRAPHICS is always padded to 340 bytes in total.
        let mut reset = Vec::with_capacity(332);
        reset.extend_from_slice(&width.to_le_bytes());
        reset.extend_from_slice(&height.to_le_bytes());
        reset.extend_from_slice(&1u32.to_le_bytes()); // monitorCount
        reset.extend_from_slice(&0u32.to_le_bytes()); // left
        reset.extend_from_slice(&0u32.to_le_bytes()); // top
        reset.extend_from_slice(&(width - 1).to_le_bytes());
        reset.extend_from_slice(&(height - 1).to_le_bytes());
        reset.extend_from_slice(&1u32.to_le_bytes()); // MONITOR_PRIMARY
        reset.resize(340 - 8, 0);
        batch.extend_from_slice(&pdu(CMD_RESET_GRAPHICS, &reset));

        let surface_id = self.next_surface_id;
        self.next_surface_id = self.next_surface_id.wrapping_add(1).max(1);
        self.output_surface = Some(surface_id);

        let mut create = Vec::with_capacity(8);
        create.extend_from_slice(&surface_id.to_le_bytes());
        create.extend_from_slice(&(width as u16).to_le_bytes());
        create.extend_from_slice(&(height as u16).to_le_bytes());
        create.push(PIXEL_FORMAT_XRGB_8888);
        batch.extend_from_slice(&pdu(CMD_CREATE_SURFACE, &create));

        let mut map = Vec::with_capacity(12);
        map.extend_from_slice(&surface_id.to_le_bytes());
        map.extend_from_slice(&0u16.to_le_bytes());
        map.extend_from_slice(&0u32.to_le_bytes());
        map.extend_from_slice(&0u32.to_le_bytes());
        batch.extend_from_slice(&pdu(CMD_MAP_SURFACE_TO_OUTPUT, &map));

        zgfx_wrap(&batch)
    }

    /// Delete the output surface ahead of a reactivation.
    pub fn shutdown_output(&mut self) -> Option<Vec<u8>> {
        let surface_id = self.output_surface.take()?;
        let body = surface_id.to_le_bytes();
        Some(zgfx_wrap(&pdu(CMD_DELETE_SURFACE, &body)))
    }

    #[must_use]
    pub fn start_frame(&self, frame_id: u32) -> Vec<u8> {
        let mut body = Vec::with_capacity(8);
        body.extend_from_slice(&0u32.to_le_bytes()); // timestamp
        body.extend_from_slice(&frame_id.to_le_bytes());
        zgfx_wrap(&pdu(CMD_START_FRAME, &body))
    }

    #[must_use]
    pub fn end_frame(&self, frame_id: u32) -> Vec<u8> {
        zgfx_wrap(&pdu(CMD_END_FRAME, &frame_id.to_le_bytes()))
    }

    /// One codec payload for one destination rect.
    #[must_use]
    pub fn wire_to_surface_1(&self, codec_id: u16, dest: &Rect, data: &[u8]) -> Vec<u8> {
        let surface_id = self.output_surface.unwrap_or(1);
        let mut body = Vec::with_capacity(data.len() + 17);
        body.extend_from_slice(&surface_id.to_le_bytes());
        body.extend_from_slice(&codec_id.to_le_bytes());
        body.push(PIXEL_FORMAT_XRGB_8888);
        body.extend_from_slice(&(dest.left as u16).to_le_bytes());
        body.extend_from_slice(&(dest.top as u16).to_le_bytes());
        body.extend_from_slice(&(dest.right as u16).to_le_bytes());
        body.extend_from_slice(&(dest.bottom as u16).to_le_bytes());
        body.extend_from_slice(&(data.len() as u32).to_le_bytes());
        body.extend_from_slice(data);
        zgfx_wrap(&pdu(CMD_WIRE_TO_SURFACE_1, &body))
    }

    /// Progressive payloads use the context-carrying variant.
    #[must_use]
    pub fn wire_to_surface_2(&self, data: &[u8]) -> Vec<u8> {
        let surface_id = self.output_surface.unwrap_or(1);
        let mut body = Vec::with_capacity(data.len() + 9);
        body.extend_from_slice(&surface_id.to_le_bytes());
        body.extend_from_slice(&CODECID_CAPROGRESSIVE.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes()); // codecContextId
        body.push(PIXEL_FORMAT_XRGB_8888);
        body.extend_from_slice(data);
        zgfx_wrap(&pdu(CMD_WIRE_TO_SURFACE_2, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps_advertise(sets: &[(u32, u32)]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(sets.len() as u16).to_le_bytes());
        for (version, flags) in sets {
            body.extend_from_slice(&version.to_le_bytes());
            body.extend_from_slice(&4u32.to_le_bytes());
            body.extend_from_slice(&flags.to_le_bytes());
        }
        zgfx_wrap(&pdu(CMD_CAPS_ADVERTISE, &body))
    }

    #[test]
    fn zgfx_roundtrip_single_and_multipart() {
        let small = vec![1u8; 100];
        assert_eq!(zgfx_unwrap(&zgfx_wrap(&small)).unwrap(), small);

        let big = vec![2u8; ZGFX_MAX_SEGMENT_DATA * 2 + 17];
        let wrapped = zgfx_wrap(&big);
        assert_eq!(wrapped[0], 0xE1);
        assert_eq!(zgfx_unwrap(&wrapped).unwrap(), big);
    }

    #[test]
    fn compressed_segments_are_rejected() {
        let mut wrapped = zgfx_wrap(&[1, 2, 3]);
        wrapped[1] |= 0x20;
        assert!(zgfx_unwrap(&wrapped).is_err());
    }

    #[test]
    fn negotiates_highest_version_with_avc() {
        let mut gfx = GfxServer::new();
        let (events, response) = gfx
            .process(&caps_advertise(&[
                (CAPVERSION_8, 0),
                (CAPVERSION_104, 0),
                (CAPVERSION_81, CAPS_FLAG_AVC420_ENABLED),
            ]))
            .unwrap();
        assert!(gfx.is_ready());
        assert_eq!(gfx.negotiated_version, CAPVERSION_104);
        assert!(gfx.h264_supported);
        assert!(gfx.avc444_supported);
        assert!(response.is_some());
        assert_eq!(
            events,
            vec![GfxEvent::Ready {
                h264: true,
                avc444: true
            }]
        );
    }

    #[test]
    fn avc_disabled_flag_wins_on_v10() {
        let mut gfx = GfxServer::new();
        let (_, _) = gfx
            .process(&caps_advertise(&[(CAPVERSION_103, CAPS_FLAG_AVC_DISABLED)]))
            .unwrap();
        assert!(gfx.is_ready());
        assert!(!gfx.h264_supported);
        assert!(!gfx.avc444_supported);
    }

    #[test]
    fn frame_ack_event() {
        let mut gfx = GfxServer::new();
        let _ = gfx.process(&caps_advertise(&[(CAPVERSION_8, 0)])).unwrap();

        let mut ack = Vec::new();
        ack.extend_from_slice(&3u32.to_le_bytes()); // queueDepth
        ack.extend_from_slice(&7u32.to_le_bytes()); // frameId
        ack.extend_from_slice(&7u32.to_le_bytes()); // totalFramesDecoded
        let (events, response) = gfx.process(&zgfx_wrap(&pdu(CMD_FRAME_ACKNOWLEDGE, &ack))).unwrap();
        assert!(response.is_none());
        assert_eq!(
            events,
            vec![GfxEvent::FrameAck {
                frame_id: 7,
                queue_depth: 3
            }]
        );
    }

    #[test]
    fn reset_graphics_is_padded() {
        let mut gfx = GfxServer::new();
        let batch = zgfx_unwrap(&gfx.init_output(1920, 1080)).unwrap();
        // First PDU is RESET_GRAPHICS with the mandated 340-byte size.
        let length = u32::from_le_bytes(batch[4..8].try_into().unwrap());
        assert_eq!(length, 340);
        assert_eq!(u16::from_le_bytes([batch[0], batch[1]]), CMD_RESET_GRAPHICS);
        assert!(gfx.output_surface.is_some());
    }
}
