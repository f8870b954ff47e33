//! Legacy bitmap-update packing.
//!
//! Splits damage rectangles into client-acceptable fragments: 4-pixel
//! horizontal alignment, at most 64x64 per bitmap, every fragment and
//! every grouped update bounded by the client's MultifragMaxRequestSize.
//! Pixels are converted from BGRX32 to the destination depth and stored
//! bottom-up as the protocol requires.

use crate::region::Rect;
use crate::EncodeError;

/// Header sizes of the enclosing update, mirroring what the PDU writer
/// will prepend.
const BITMAP_UPDATE_HEADER: u32 = 2;
const BITMAP_DATA_HEADER: u32 = 26;

/// One TS_BITMAP_DATA worth of pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapFragment {
    pub dest_left: u16,
    pub dest_top: u16,
    /// Inclusive, as on the wire.
    pub dest_right: u16,
    pub dest_bottom: u16,
    pub width: u16,
    pub height: u16,
    pub bits_per_pixel: u16,
    pub data: Vec<u8>,
}

/// One bitmap-update PDU: fragments whose combined size respects the
/// max request size.
#[derive(Debug, Clone, Default)]
pub struct BitmapUpdate {
    pub fragments: Vec<BitmapFragment>,
}

fn convert_row(src: &[u8], dst: &mut Vec<u8>, width: usize, dst_bpp: u32) {
    match dst_bpp {
        32 => dst.extend_from_slice(&src[..width * 4]),
        24 => {
            for px in src[..width * 4].chunks_exact(4) {
                dst.extend_from_slice(&px[..3]);
            }
        }
        16 => {
            for px in src[..width * 4].chunks_exact(4) {
                let (b, g, r) = (u16::from(px[0]), u16::from(px[1]), u16::from(px[2]));
                let v = ((r >> 3) << 11) | ((g >> 2) << 5) | (b >> 3);
                dst.extend_from_slice(&v.to_le_bytes());
            }
        }
        _ => {
            // 15 bpp
            for px in src[..width * 4].chunks_exact(4) {
                let (b, g, r) = (u16::from(px[0]), u16::from(px[1]), u16::from(px[2]));
                let v = ((r >> 3) << 10) | ((g >> 3) << 5) | (b >> 3);
                dst.extend_from_slice(&v.to_le_bytes());
            }
        }
    }
}

fn extract_fragment(
    src: &[u8],
    scanline: usize,
    rect: &Rect,
    dst_bpp: u32,
    dst_bytes_pp: usize,
) -> BitmapFragment {
    let width = rect.width() as usize;
    let height = rect.height() as usize;
    let mut data = Vec::with_capacity(width * height * dst_bytes_pp);
    // Bottom-up rows.
    for y in (rect.top..rect.bottom).rev() {
        let off = (y as usize) * scanline + (rect.left as usize) * 4;
        convert_row(&src[off..], &mut data, width, dst_bpp);
    }
    BitmapFragment {
        dest_left: rect.left as u16,
        dest_top: rect.top as u16,
        dest_right: (rect.right - 1) as u16,
        dest_bottom: (rect.bottom - 1) as u16,
        width: width as u16,
        height: height as u16,
        bits_per_pixel: dst_bpp as u16,
        data,
    }
}

/// Fragment the damaged rects of `src` into grouped bitmap updates.
pub fn encode_bitmap_updates(
    src: &[u8],
    scanline: u32,
    desktop_width: u32,
    desktop_height: u32,
    dst_bits_per_pixel: u32,
    max_request_size: u32,
    rects: &[Rect],
) -> Result<Vec<BitmapUpdate>, EncodeError> {
    let dst_bytes_pp = match dst_bits_per_pixel {
        15 | 16 => 2usize,
        24 => 3,
        32 => 4,
        other => return Err(EncodeError::BadDepth(other)),
    };

    let max_pdu = max_request_size;
    // Room for the per-bitmap header plus a compression header the
    // client may expect to parse.
    let max_rect_size = max_pdu
        .checked_sub(BITMAP_UPDATE_HEADER + BITMAP_DATA_HEADER + 3)
        .ok_or(EncodeError::BadMaxRequestSize(max_request_size))? as usize;

    let mut fragments = Vec::new();

    for rect in rects {
        let mut rect = *rect;

        // Horizontal 4-pixel alignment.
        let lead = rect.left % 4;
        rect.left -= lead;
        let trail = rect.width() % 4;
        if trail != 0 {
            rect.right += 4 - trail;
        }
        let rect = rect.clamp(desktop_width.next_multiple_of(4), desktop_height);
        if rect.is_empty() {
            continue;
        }

        // Maximum 64x64 bitmaps, shrunk until a fragment fits the
        // client's request size while keeping fragments as wide as
        // possible.
        let mut w = rect.width().min(64) as usize;
        let mut h = rect.height().min(64) as usize;
        while w * dst_bytes_pp > max_rect_size {
            w /= 2;
        }
        while w * h * dst_bytes_pp > max_rect_size {
            h = if h == 3 { 2 } else { h / 2 };
        }
        if w < 4 || h == 0 {
            return Err(EncodeError::FragmentTooLarge(w * h * dst_bytes_pp));
        }
        let (w, h) = (w as u32, h as u32);

        let mut y = rect.top;
        while y < rect.bottom {
            let bottom = (y + h).min(rect.bottom);
            let mut x = rect.left;
            while x < rect.right {
                let right = (x + w).min(rect.right);
                let frag_rect = Rect::new(x, y, right.min(desktop_width), bottom)
                    .clamp(desktop_width, desktop_height);
                if !frag_rect.is_empty() {
                    fragments.push(extract_fragment(
                        src,
                        scanline as usize,
                        &frag_rect,
                        dst_bits_per_pixel,
                        dst_bytes_pp,
                    ));
                }
                x += w;
            }
            y += h;
        }
    }

    // Group fragments into updates that respect the request size.
    let max_data_size = (max_pdu - BITMAP_UPDATE_HEADER) as usize;
    let mut updates = Vec::new();
    let mut current = BitmapUpdate::default();
    let mut current_size = 0usize;

    for fragment in fragments {
        let fragment_size = fragment.data.len() + BITMAP_DATA_HEADER as usize;
        if fragment_size > max_data_size {
            return Err(EncodeError::FragmentTooLarge(fragment_size));
        }
        if current_size + fragment_size > max_data_size {
            updates.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += fragment_size;
        current.fragments.push(fragment);
    }
    if !current.fragments.is_empty() {
        updates.push(current);
    }

    Ok(updates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: u32, height: u32) -> (Vec<u8>, u32) {
        let scanline = width * 4;
        let mut data = vec![0u8; (scanline * height) as usize];
        // Distinct pixel values so conversions are observable.
        for (i, px) in data.chunks_exact_mut(4).enumerate() {
            px[0] = (i % 251) as u8;
            px[1] = (i % 83) as u8;
            px[2] = (i % 37) as u8;
        }
        (data, scanline)
    }

    #[test]
    fn whole_screen_fragments_to_64x64() {
        let (src, scanline) = frame(128, 128);
        let updates = encode_bitmap_updates(
            &src,
            scanline,
            128,
            128,
            32,
            65535,
            &[Rect::new(0, 0, 128, 128)],
        )
        .unwrap();
        let total: usize = updates.iter().map(|u| u.fragments.len()).sum();
        assert_eq!(total, 4);
        for update in &updates {
            let size: usize = update
                .fragments
                .iter()
                .map(|f| f.data.len() + 26)
                .sum::<usize>();
            assert!(size <= 65535 - 2);
        }
    }

    #[test]
    fn alignment_is_applied() {
        let (src, scanline) = frame(64, 64);
        let updates = encode_bitmap_updates(
            &src,
            scanline,
            64,
            64,
            32,
            65535,
            &[Rect::new(5, 3, 10, 9)],
        )
        .unwrap();
        let frag = &updates[0].fragments[0];
        assert_eq!(frag.dest_left % 4, 0);
        assert_eq!(frag.width % 4, 0);
        assert_eq!(frag.dest_top, 3);
    }

    #[test]
    fn small_request_size_shrinks_fragments() {
        let (src, scanline) = frame(128, 128);
        let updates = encode_bitmap_updates(
            &src,
            scanline,
            128,
            128,
            32,
            1024,
            &[Rect::new(0, 0, 128, 128)],
        )
        .unwrap();
        for update in &updates {
            let size: usize = update
                .fragments
                .iter()
                .map(|f| f.data.len() + 26)
                .sum::<usize>();
            assert!(size <= 1024 - 2, "update of {size} bytes exceeds the budget");
        }
    }

    #[test]
    fn sixteen_bpp_halves_the_payload() {
        let (src, scanline) = frame(64, 64);
        let updates32 =
            encode_bitmap_updates(&src, scanline, 64, 64, 32, 65535, &[Rect::new(0, 0, 64, 64)])
                .unwrap();
        let updates16 =
            encode_bitmap_updates(&src, scanline, 64, 64, 16, 65535, &[Rect::new(0, 0, 64, 64)])
                .unwrap();
        let len32: usize = updates32[0].fragments.iter().map(|f| f.data.len()).sum();
        let len16: usize = updates16[0].fragments.iter().map(|f| f.data.len()).sum();
        assert_eq!(len32, 64 * 64 * 4);
        assert_eq!(len16, 64 * 64 * 2);
    }

    #[test]
    fn rows_are_bottom_up() {
        let mut src = vec![0u8; 4 * 4 * 4];
        // Mark the top-left pixel.
        src[0] = 0xAB;
        let updates =
            encode_bitmap_updates(&src, 16, 4, 4, 32, 65535, &[Rect::new(0, 0, 4, 4)]).unwrap();
        let frag = &updates[0].fragments[0];
        // Bottom-up: the first stored row is the bottom one, the marked
        // pixel lands in the last row of the payload.
        assert_eq!(frag.data[(4 * 3) * 4], 0xAB);
        assert_eq!(frag.data[0], 0);
    }
}
