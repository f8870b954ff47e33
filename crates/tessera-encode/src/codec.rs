//! Codec mode selection and the seams to the external transforms.
//!
//! The RemoteFX, RFX-Progressive and H.264 bitstream generators are
//! external libraries behind the traits below; everything around them
//! (mode choice, tile alignment, PDU envelopes, the AVC region
//! metablocks) is implemented here. Without a registered factory the
//! selection degrades to the bitmap path.

use crate::region::Rect;
use crate::EncodeError;

/// GCC connection types with at least LAN-grade bandwidth.
pub const CONNECTION_TYPE_LAN: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecMode {
    /// Legacy bitmap updates.
    Bmp,
    /// RemoteFX inside surface commands.
    Rfx1,
    /// RemoteFX over the graphics pipeline.
    Rfx2,
    /// RFX-Progressive over the graphics pipeline.
    Rfx3,
    /// H.264 over the graphics pipeline.
    H264,
}

/// Everything the selection needs to know about the activated client.
#[derive(Debug, Clone, Copy)]
pub struct ClientCaps {
    pub connection_type: u32,
    pub color_depth: u32,
    /// Client advertised the RemoteFX codec.
    pub remotefx_codec: bool,
    pub surface_commands_enabled: bool,
    pub frame_marker_enabled: bool,
    /// The frame-acknowledge capability set was present at all.
    pub frame_ack_capset_received: bool,
    /// Client's maxUnacknowledgedFrameCount.
    pub frame_acknowledge: u32,
    /// RNS_UD_CS_SUPPORT_DYNVC_GFX_PROTOCOL from the GCC core data.
    pub supports_gfx: bool,
    pub drdynvc_joined: bool,
    /// Server-side policy switch.
    pub gfx_forbidden: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecSelection {
    pub mode: CodecMode,
    /// The graphics pipeline must come up before output starts.
    pub gfx_required: bool,
    /// Effective ack window; 0 disables frame-ack pacing.
    pub frame_acknowledge: u32,
}

/// Choose the codec mode for an activation. `rfx_available` tells
/// whether a RemoteFX transform is registered server-side.
#[must_use]
pub fn select_codec(caps: &ClientCaps, rfx_available: bool) -> CodecSelection {
    let mut mode = CodecMode::Bmp;
    let mut gfx_required = false;

    // The richer codecs are only allowed on LAN-grade links at 32 bpp.
    if caps.connection_type >= CONNECTION_TYPE_LAN && caps.color_depth == 32 {
        let gfx = !caps.gfx_forbidden && caps.supports_gfx && caps.drdynvc_joined;
        let remotefx = caps.remotefx_codec && rfx_available;

        // A client that sets FrameAcknowledge to 0 but never sent the
        // capset does not acknowledge frames at all; RFX in surface
        // commands needs real acks.
        let rfx_surface = remotefx
            && caps.surface_commands_enabled
            && caps.frame_marker_enabled
            && caps.frame_ack_capset_received;

        if remotefx {
            if gfx {
                mode = CodecMode::Rfx2;
                gfx_required = true;
            } else if rfx_surface {
                mode = CodecMode::Rfx1;
            } else {
                tracing::error!("RemoteFX is enabled but no suitable transport was found");
            }
        } else if gfx && rfx_available {
            // Progressive support is mandatory under gfx.
            mode = CodecMode::Rfx3;
            gfx_required = true;
        }
    }

    let frame_acknowledge = if mode == CodecMode::Rfx1 || gfx_required {
        if caps.frame_acknowledge == 0 {
            5
        } else {
            caps.frame_acknowledge
        }
    } else {
        0
    };

    CodecSelection {
        mode,
        gfx_required,
        frame_acknowledge,
    }
}

/// Entropy algorithm for a RemoteFX encode pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfxEntropy {
    /// Required by the progressive container.
    Rlgr1,
    Rlgr3,
}

/// External RemoteFX transform. One instance per front
/// connection; recreated with the encoder.
pub trait RfxFrameEncoder: Send {
    /// Encode one damage rectangle of `data` (BGRX32, `scanline` bytes
    /// per row) into a TS_RFX bitstream, or an RFX_PROGRESSIVE container
    /// when `progressive` is set. `rect` is tile aligned by the caller.
    #[allow(clippy::too_many_arguments)]
    fn encode(
        &mut self,
        entropy: RfxEntropy,
        progressive: bool,
        rect: &Rect,
        data: &[u8],
        width: u32,
        height: u32,
        scanline: u32,
        frame_index: u32,
    ) -> Result<Vec<u8>, EncodeError>;
}

/// H.264 compression passes. AVC444 encodes one logical frame as two
/// AVC420 bitstreams: a luma pass then a chroma pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvcCompressMode {
    Avc420,
    Avc444V1Luma,
    Avc444V2Luma,
    Avc444Chroma,
}

pub struct AvcBitstream {
    pub data: Vec<u8>,
    /// The encoder left quality on the table; a progressive refresh pass
    /// is worthwhile.
    pub optimizable: bool,
}

/// External H.264 transform.
pub trait AvcFrameEncoder: Send {
    #[allow(clippy::too_many_arguments)]
    fn compress(
        &mut self,
        mode: AvcCompressMode,
        max_frame_rate: u32,
        target_frame_size_bits: u32,
        data: &[u8],
        width: u32,
        height: u32,
        scanline: u32,
    ) -> Result<AvcBitstream, EncodeError>;
}

type RfxFactory = Box<dyn Fn() -> Box<dyn RfxFrameEncoder> + Send + Sync>;
type AvcFactory = Box<dyn Fn() -> Box<dyn AvcFrameEncoder> + Send + Sync>;

/// Registered codec implementations. Empty by default, in which case
/// only the bitmap path is available.
#[derive(Default)]
pub struct CodecFactories {
    rfx: Option<RfxFactory>,
    avc: Option<AvcFactory>,
}

impl CodecFactories {
    pub fn register_rfx(
        &mut self,
        factory: impl Fn() -> Box<dyn RfxFrameEncoder> + Send + Sync + 'static,
    ) {
        self.rfx = Some(Box::new(factory));
    }

    pub fn register_avc(
        &mut self,
        factory: impl Fn() -> Box<dyn AvcFrameEncoder> + Send + Sync + 'static,
    ) {
        self.avc = Some(Box::new(factory));
    }

    #[must_use]
    pub fn has_rfx(&self) -> bool {
        self.rfx.is_some()
    }

    #[must_use]
    pub fn has_avc(&self) -> bool {
        self.avc.is_some()
    }

    #[must_use]
    pub fn new_rfx(&self) -> Option<Box<dyn RfxFrameEncoder>> {
        self.rfx.as_ref().map(|f| f())
    }

    #[must_use]
    pub fn new_avc(&self) -> Option<Box<dyn AvcFrameEncoder>> {
        self.avc.as_ref().map(|f| f())
    }
}

impl std::fmt::Debug for CodecFactories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecFactories")
            .field("rfx", &self.has_rfx())
            .field("avc", &self.has_avc())
            .finish()
    }
}

/// Default AVC region quantization, matching what real servers send.
pub const AVC_QP: u8 = 18;
pub const AVC_QUALITY: u8 = 100;

/// Serialize the RFX_AVC420_BITMAP_STREAM metablock followed by the
/// bitstream itself.
#[must_use]
pub fn write_avc420_stream(rects: &[Rect], bitstream: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + rects.len() * 10 + bitstream.len());
    out.extend_from_slice(&(rects.len() as u32).to_le_bytes());
    for r in rects {
        out.extend_from_slice(&(r.left as u16).to_le_bytes());
        out.extend_from_slice(&(r.top as u16).to_le_bytes());
        out.extend_from_slice(&(r.right as u16).to_le_bytes());
        out.extend_from_slice(&(r.bottom as u16).to_le_bytes());
    }
    for _ in rects {
        out.push(AVC_QP);
        out.push(AVC_QUALITY);
    }
    out.extend_from_slice(bitstream);
    out
}

/// The LC field of avc420EncodedBitstreamInfo: luma-only payload.
const AVC444_LC_LUMA_ONLY: u32 = 1 << 30;

/// Serialize the first stream of an RFX_AVC444_BITMAP_STREAM. With
/// `luma_only` the chroma stream is omitted for this frame.
#[must_use]
pub fn write_avc444_stream1(rects: &[Rect], bitstream: &[u8], luma_only: bool) -> Vec<u8> {
    let stream = write_avc420_stream(rects, bitstream);
    let mut info = stream.len() as u32;
    if luma_only {
        info |= AVC444_LC_LUMA_ONLY;
    }
    let mut out = Vec::with_capacity(4 + stream.len());
    out.extend_from_slice(&info.to_le_bytes());
    out.extend_from_slice(&stream);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lan_caps() -> ClientCaps {
        ClientCaps {
            connection_type: CONNECTION_TYPE_LAN,
            color_depth: 32,
            remotefx_codec: true,
            surface_commands_enabled: true,
            frame_marker_enabled: true,
            frame_ack_capset_received: true,
            frame_acknowledge: 2,
            supports_gfx: true,
            drdynvc_joined: true,
            gfx_forbidden: false,
        }
    }

    #[test]
    fn gfx_plus_rfx_selects_rfx2() {
        let sel = select_codec(&lan_caps(), true);
        assert_eq!(sel.mode, CodecMode::Rfx2);
        assert!(sel.gfx_required);
        assert_eq!(sel.frame_acknowledge, 2);
    }

    #[test]
    fn no_gfx_falls_back_to_surface_rfx() {
        let mut caps = lan_caps();
        caps.supports_gfx = false;
        let sel = select_codec(&caps, true);
        assert_eq!(sel.mode, CodecMode::Rfx1);
        assert!(!sel.gfx_required);
    }

    #[test]
    fn gfx_without_client_rfx_uses_progressive() {
        let mut caps = lan_caps();
        caps.remotefx_codec = false;
        let sel = select_codec(&caps, true);
        assert_eq!(sel.mode, CodecMode::Rfx3);
        assert!(sel.gfx_required);
        assert_eq!(sel.frame_acknowledge, 2);
    }

    #[test]
    fn missing_frame_ack_capset_blocks_rfx1() {
        let mut caps = lan_caps();
        caps.supports_gfx = false;
        caps.frame_ack_capset_received = false;
        let sel = select_codec(&caps, true);
        assert_eq!(sel.mode, CodecMode::Bmp);
        assert_eq!(sel.frame_acknowledge, 0);
    }

    #[test]
    fn low_bandwidth_or_depth_means_bmp() {
        let mut caps = lan_caps();
        caps.connection_type = 2;
        assert_eq!(select_codec(&caps, true).mode, CodecMode::Bmp);

        let mut caps = lan_caps();
        caps.color_depth = 16;
        assert_eq!(select_codec(&caps, true).mode, CodecMode::Bmp);
    }

    #[test]
    fn no_server_codec_degrades_to_bmp() {
        let sel = select_codec(&lan_caps(), false);
        assert_eq!(sel.mode, CodecMode::Bmp);
    }

    #[test]
    fn zero_frame_ack_gets_a_default() {
        let mut caps = lan_caps();
        caps.frame_acknowledge = 0;
        let sel = select_codec(&caps, true);
        assert_eq!(sel.frame_acknowledge, 5);
    }

    #[test]
    fn avc_metablock_layout() {
        let rects = [Rect::new(0, 0, 64, 64)];
        let stream = write_avc420_stream(&rects, &[0xAA, 0xBB]);
        assert_eq!(stream.len(), 4 + 10 + 2);
        assert_eq!(&stream[0..4], &1u32.to_le_bytes());
        assert_eq!(&stream[4..6], &0u16.to_le_bytes());
        assert_eq!(&stream[8..10], &64u16.to_le_bytes());
        assert_eq!(stream[12], AVC_QP);
        assert_eq!(stream[13], AVC_QUALITY);
        assert_eq!(&stream[14..], &[0xAA, 0xBB]);
    }

    #[test]
    fn avc444_luma_flag() {
        let rects = [Rect::new(0, 0, 64, 64)];
        let wrapped = write_avc444_stream1(&rects, &[1, 2, 3], true);
        let info = u32::from_le_bytes(wrapped[0..4].try_into().unwrap());
        assert_ne!(info & AVC444_LC_LUMA_ONLY, 0);
        assert_eq!((info & 0x3fff_ffff) as usize, wrapped.len() - 4);
    }
}
