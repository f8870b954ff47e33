//! Server output PDUs: fastpath update framing (with multi-fragment
//! packetization), surface commands, bitmap updates, pointer updates
//! and the few slowpath data PDUs that have no fastpath form.

use tessera_encode::bmp::BitmapUpdate;
use tessera_encode::pointer::PointerShape;
use tessera_encode::Rect;

/* fastpath update codes */
pub const FP_UPDATE_BITMAP: u8 = 0x1;
pub const FP_UPDATE_SURFCMDS: u8 = 0x4;
pub const FP_UPDATE_PTR_NULL: u8 = 0x5;
pub const FP_UPDATE_PTR_DEFAULT: u8 = 0x6;
pub const FP_UPDATE_PTR_POSITION: u8 = 0x8;
pub const FP_UPDATE_COLOR: u8 = 0x9;
pub const FP_UPDATE_CACHED: u8 = 0xA;
pub const FP_UPDATE_POINTER_NEW: u8 = 0xB;

const FRAGMENT_SINGLE: u8 = 0;
const FRAGMENT_LAST: u8 = 1;
const FRAGMENT_FIRST: u8 = 2;
const FRAGMENT_NEXT: u8 = 3;

/// Per-PDU payload bound: the fastpath length field is 15 bits; leave
/// room for the output header, length and update header.
const MAX_FASTPATH_FRAGMENT: usize = 16374;

/* surface command types */
const CMDTYPE_SET_SURFACE_BITS: u16 = 0x0001;
const CMDTYPE_FRAME_MARKER: u16 = 0x0004;
const CMDTYPE_STREAM_SURFACE_BITS: u16 = 0x0006;

pub const SURFACECMD_FRAMEACTION_BEGIN: u16 = 0x0000;
pub const SURFACECMD_FRAMEACTION_END: u16 = 0x0001;

fn write_fastpath_pdu(out: &mut Vec<u8>, update_header: u8, payload: &[u8]) {
    let size = payload.len() + 3; // update header + size field
    // Output header byte: action fastpath, no flags; then the 15-bit
    // length including itself.
    let total = size + 3;
    out.push(0x00);
    out.extend_from_slice(&(((total as u16) & 0x7fff) | 0x8000).to_be_bytes());
    out.push(update_header);
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
}

/// Emit one logical update, splitting it into fastpath fragments when it
/// exceeds a single PDU.
pub fn write_fastpath_update(out: &mut Vec<u8>, update_code: u8, payload: &[u8]) {
    if payload.len() <= MAX_FASTPATH_FRAGMENT {
        write_fastpath_pdu(out, update_code & 0x0f, payload);
        return;
    }

    let mut chunks = payload.chunks(MAX_FASTPATH_FRAGMENT).peekable();
    let mut first = true;
    while let Some(chunk) = chunks.next() {
        let fragmentation = if first {
            FRAGMENT_FIRST
        } else if chunks.peek().is_some() {
            FRAGMENT_NEXT
        } else {
            FRAGMENT_LAST
        };
        first = false;
        write_fastpath_pdu(out, (update_code & 0x0f) | (fragmentation << 4), chunk);
    }
}

/// TS_FP_UPDATE_BITMAP carrying one grouped bitmap update.
pub fn write_bitmap_update(out: &mut Vec<u8>, update: &BitmapUpdate) {
    let mut payload = Vec::new();
    payload.extend_from_slice(&0x0001u16.to_le_bytes()); // UPDATETYPE_BITMAP
    payload.extend_from_slice(&(update.fragments.len() as u16).to_le_bytes());
    for fragment in &update.fragments {
        payload.extend_from_slice(&fragment.dest_left.to_le_bytes());
        payload.extend_from_slice(&fragment.dest_top.to_le_bytes());
        payload.extend_from_slice(&fragment.dest_right.to_le_bytes());
        payload.extend_from_slice(&fragment.dest_bottom.to_le_bytes());
        payload.extend_from_slice(&fragment.width.to_le_bytes());
        payload.extend_from_slice(&fragment.height.to_le_bytes());
        payload.extend_from_slice(&fragment.bits_per_pixel.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes()); // flags: uncompressed
        payload.extend_from_slice(&(fragment.data.len() as u16).to_le_bytes());
        payload.extend_from_slice(&fragment.data);
    }
    write_fastpath_update(out, FP_UPDATE_BITMAP, &payload);
}

/// TS_SURFCMD_SET_SURFACE_BITS (or STREAM_) with an embedded
/// TS_BITMAP_DATA_EX.
pub fn write_surface_bits(
    out: &mut Vec<u8>,
    stream: bool,
    dest: &Rect,
    bpp: u8,
    codec_id: u8,
    width: u16,
    height: u16,
    data: &[u8],
) {
    let mut payload = Vec::with_capacity(data.len() + 32);
    let cmd = if stream {
        CMDTYPE_STREAM_SURFACE_BITS
    } else {
        CMDTYPE_SET_SURFACE_BITS
    };
    payload.extend_from_slice(&cmd.to_le_bytes());
    payload.extend_from_slice(&(dest.left as u16).to_le_bytes());
    payload.extend_from_slice(&(dest.top as u16).to_le_bytes());
    payload.extend_from_slice(&(dest.right as u16).to_le_bytes());
    payload.extend_from_slice(&(dest.bottom as u16).to_le_bytes());
    payload.push(bpp);
    payload.push(0); // flags
    payload.push(0); // reserved
    payload.push(codec_id);
    payload.extend_from_slice(&width.to_le_bytes());
    payload.extend_from_slice(&height.to_le_bytes());
    payload.extend_from_slice(&(data.len() as u32).to_le_bytes());
    payload.extend_from_slice(data);
    write_fastpath_update(out, FP_UPDATE_SURFCMDS, &payload);
}

/// Legacy TS_FRAME_MARKER surface command.
pub fn write_surface_frame_marker(out: &mut Vec<u8>, action: u16, frame_id: u32) {
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&CMDTYPE_FRAME_MARKER.to_le_bytes());
    payload.extend_from_slice(&action.to_le_bytes());
    payload.extend_from_slice(&frame_id.to_le_bytes());
    write_fastpath_update(out, FP_UPDATE_SURFCMDS, &payload);
}

fn write_color_pointer_body(payload: &mut Vec<u8>, cache_index: u16, shape: &PointerShape) {
    payload.extend_from_slice(&cache_index.to_le_bytes());
    payload.extend_from_slice(&(shape.hot_x as u16).to_le_bytes());
    payload.extend_from_slice(&(shape.hot_y as u16).to_le_bytes());
    payload.extend_from_slice(&(shape.width as u16).to_le_bytes());
    payload.extend_from_slice(&(shape.height as u16).to_le_bytes());
    payload.extend_from_slice(&(shape.and_mask.len() as u16).to_le_bytes());
    payload.extend_from_slice(&(shape.xor_mask.len() as u16).to_le_bytes());
    payload.extend_from_slice(&shape.xor_mask);
    payload.extend_from_slice(&shape.and_mask);
    payload.push(0); // pad
}

/// TS_FP_POINTERATTRIBUTE (New Pointer Update).
pub fn write_pointer_new(out: &mut Vec<u8>, cache_index: u16, shape: &PointerShape) {
    let mut payload = Vec::new();
    payload.extend_from_slice(&(shape.xor_bpp as u16).to_le_bytes());
    write_color_pointer_body(&mut payload, cache_index, shape);
    write_fastpath_update(out, FP_UPDATE_POINTER_NEW, &payload);
}

/// TS_FP_COLORPOINTERATTRIBUTE (24 bpp shapes only).
pub fn write_pointer_color(out: &mut Vec<u8>, cache_index: u16, shape: &PointerShape) {
    let mut payload = Vec::new();
    write_color_pointer_body(&mut payload, cache_index, shape);
    write_fastpath_update(out, FP_UPDATE_COLOR, &payload);
}

pub fn write_pointer_cached(out: &mut Vec<u8>, cache_index: u16) {
    write_fastpath_update(out, FP_UPDATE_CACHED, &cache_index.to_le_bytes());
}

/// System pointer: hidden or default arrow.
pub fn write_pointer_system(out: &mut Vec<u8>, hidden: bool) {
    let code = if hidden {
        FP_UPDATE_PTR_NULL
    } else {
        FP_UPDATE_PTR_DEFAULT
    };
    write_fastpath_update(out, code, &[]);
}

pub fn write_pointer_position(out: &mut Vec<u8>, x: u16, y: u16) {
    let mut payload = Vec::with_capacity(4);
    payload.extend_from_slice(&x.to_le_bytes());
    payload.extend_from_slice(&y.to_le_bytes());
    write_fastpath_update(out, FP_UPDATE_PTR_POSITION, &payload);
}

/* slowpath data PDU types used for output */
pub const PDUTYPE2_PLAY_SOUND: u8 = 34;
pub const PDUTYPE2_SET_KEYBOARD_INDICATORS: u8 = 41;
pub const PDUTYPE2_SET_ERROR_INFO_PDU: u8 = 47;

#[must_use]
pub fn build_play_sound(duration: u32, frequency: u32) -> Vec<u8> {
    let mut body = Vec::with_capacity(8);
    body.extend_from_slice(&duration.to_le_bytes());
    body.extend_from_slice(&frequency.to_le_bytes());
    body
}

#[must_use]
pub fn build_set_keyboard_indicators(led_flags: u16) -> Vec<u8> {
    let mut body = Vec::with_capacity(4);
    body.extend_from_slice(&0u16.to_le_bytes()); // unitId
    body.extend_from_slice(&led_flags.to_le_bytes());
    body
}

#[must_use]
pub fn build_set_error_info(error_info: u32) -> Vec<u8> {
    error_info.to_le_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_fastpath_pdus(mut data: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut pdus = Vec::new();
        while !data.is_empty() {
            assert_eq!(data[0], 0x00);
            let total = usize::from(u16::from_be_bytes([data[1] & 0x7f, data[2]]));
            let update_header = data[3];
            let size = usize::from(u16::from_le_bytes([data[4], data[5]]));
            pdus.push((update_header, data[6..6 + size].to_vec()));
            data = &data[total..];
        }
        pdus
    }

    #[test]
    fn small_update_is_single_fragment() {
        let mut out = Vec::new();
        write_fastpath_update(&mut out, FP_UPDATE_SURFCMDS, &[1, 2, 3]);
        let pdus = parse_fastpath_pdus(&out);
        assert_eq!(pdus.len(), 1);
        assert_eq!(pdus[0].0 & 0x0f, FP_UPDATE_SURFCMDS);
        assert_eq!((pdus[0].0 >> 4) & 0x3, FRAGMENT_SINGLE);
        assert_eq!(pdus[0].1, vec![1, 2, 3]);
    }

    #[test]
    fn large_update_fragments_first_next_last() {
        let payload = vec![7u8; MAX_FASTPATH_FRAGMENT * 2 + 100];
        let mut out = Vec::new();
        write_fastpath_update(&mut out, FP_UPDATE_SURFCMDS, &payload);
        let pdus = parse_fastpath_pdus(&out);
        assert_eq!(pdus.len(), 3);
        assert_eq!((pdus[0].0 >> 4) & 0x3, FRAGMENT_FIRST);
        assert_eq!((pdus[1].0 >> 4) & 0x3, FRAGMENT_NEXT);
        assert_eq!((pdus[2].0 >> 4) & 0x3, FRAGMENT_LAST);
        let total: usize = pdus.iter().map(|(_, d)| d.len()).sum();
        assert_eq!(total, payload.len());
    }

    #[test]
    fn frame_marker_layout() {
        let mut out = Vec::new();
        write_surface_frame_marker(&mut out, SURFACECMD_FRAMEACTION_END, 42);
        let pdus = parse_fastpath_pdus(&out);
        let body = &pdus[0].1;
        assert_eq!(u16::from_le_bytes([body[0], body[1]]), CMDTYPE_FRAME_MARKER);
        assert_eq!(
            u16::from_le_bytes([body[2], body[3]]),
            SURFACECMD_FRAMEACTION_END
        );
        assert_eq!(u32::from_le_bytes(body[4..8].try_into().unwrap()), 42);
    }

    #[test]
    fn surface_bits_wraps_bitmap_ex() {
        let mut out = Vec::new();
        let dest = Rect::new(64, 0, 128, 64);
        write_surface_bits(&mut out, false, &dest, 32, 3, 64, 64, &[0xAB; 10]);
        let pdus = parse_fastpath_pdus(&out);
        let body = &pdus[0].1;
        assert_eq!(
            u16::from_le_bytes([body[0], body[1]]),
            CMDTYPE_SET_SURFACE_BITS
        );
        assert_eq!(u16::from_le_bytes([body[2], body[3]]), 64); // left
        assert_eq!(body[10], 32); // bpp
        assert_eq!(body[13], 3); // codec id
        let len = u32::from_le_bytes(body[18..22].try_into().unwrap());
        assert_eq!(len, 10);
    }
}
