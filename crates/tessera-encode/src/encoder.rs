//! The per-client bitmap encoder: a `clientView` mirror of the last
//! pixels sent, damage accumulation and tile-based simplification.

use crate::region::{Rect, Region};
use crate::EncodeError;

const CLIENT_VIEW_ALIGN: usize = 256;

/// Sentinel the mirror is filled with at creation. Backend pixels are
/// BGRX with a zero X byte, so a 0x01 fill can never compare equal and
/// the first frame is always sent in full.
const CLIENT_VIEW_SENTINEL: u8 = 0x01;

/// A heap buffer whose payload starts on a 256-byte boundary.
struct AlignedBuf {
    raw: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedBuf {
    fn new_filled(len: usize, fill: u8) -> AlignedBuf {
        let raw = vec![fill; len + CLIENT_VIEW_ALIGN];
        let offset = raw.as_ptr().align_offset(CLIENT_VIEW_ALIGN);
        AlignedBuf { raw, offset, len }
    }

    fn as_slice(&self) -> &[u8] {
        &self.raw[self.offset..self.offset + self.len]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.raw[self.offset..self.offset + self.len]
    }
}

pub struct BitmapEncoder {
    pub desktop_width: u32,
    pub desktop_height: u32,
    /// Source scanline in bytes (BGRX32, multiple of 16).
    pub scanline: u32,
    pub bytes_per_pixel: u32,
    pub dst_bits_per_pixel: u32,
    pub dst_bytes_per_pixel: u32,
    pub multifrag_max_request_size: u32,
    client_view: AlignedBuf,
    pub accumulated_damage: Region,
}

impl BitmapEncoder {
    pub fn new(
        width: u32,
        height: u32,
        scanline: u32,
        dst_bits_per_pixel: u32,
        multifrag_max_request_size: u32,
    ) -> Result<BitmapEncoder, EncodeError> {
        if scanline % 16 != 0 || scanline < width * 4 {
            return Err(EncodeError::BadScanline(scanline));
        }
        let dst_bytes_per_pixel = match dst_bits_per_pixel {
            15 | 16 => 2,
            24 => 3,
            32 => 4,
            other => return Err(EncodeError::BadDepth(other)),
        };
        if multifrag_max_request_size < 1024 {
            return Err(EncodeError::BadMaxRequestSize(multifrag_max_request_size));
        }

        let view_len = (scanline as usize) * (height as usize);
        Ok(BitmapEncoder {
            desktop_width: width,
            desktop_height: height,
            scanline,
            bytes_per_pixel: 4,
            dst_bits_per_pixel,
            dst_bytes_per_pixel,
            multifrag_max_request_size,
            client_view: AlignedBuf::new_filled(view_len, CLIENT_VIEW_SENTINEL),
            accumulated_damage: Region::new(),
        })
    }

    /// Reactivation can lower or raise the client's max request size
    /// without recreating the encoder.
    pub fn update_max_request_size(&mut self, size: u32) -> Result<(), EncodeError> {
        if size < 1024 {
            return Err(EncodeError::BadMaxRequestSize(size));
        }
        self.multifrag_max_request_size = size;
        Ok(())
    }

    /// Add backend damage, dropping rects that fall outside the desktop.
    pub fn accumulate_damage(&mut self, x: i32, y: i32, width: i32, height: i32) {
        if x < 0 || y < 0 || width < 1 || height < 1 {
            tracing::warn!(x, y, width, height, "invalid rectangle in damage list");
            return;
        }
        let rect = Rect::new(x as u32, y as u32, (x + width) as u32, (y + height) as u32)
            .clamp(self.desktop_width, self.desktop_height);
        self.accumulated_damage.union_rect(&rect);
    }

    /// Reset the mirrored pixels of `rect` to the sentinel so the next
    /// simplification pass resends the area regardless of content.
    pub fn blank_client_view(&mut self, rect: &Rect) {
        let rect = rect.clamp(self.desktop_width, self.desktop_height);
        if rect.is_empty() {
            return;
        }
        let scanline = self.scanline as usize;
        let row_bytes = (rect.width() as usize) * 4;
        let view = self.client_view.as_mut_slice();
        for y in rect.top..rect.bottom {
            let off = (y as usize) * scanline + (rect.left as usize) * 4;
            view[off..off + row_bytes].fill(CLIENT_VIEW_SENTINEL);
        }
    }

    /// Compare `src` against the mirror for `rect`; returns true when
    /// identical. Differing rows are copied into the mirror.
    fn compare_and_update(&mut self, src: &[u8], rect: &Rect) -> bool {
        let scanline = self.scanline as usize;
        let width_bytes = (rect.width() as usize) * 4;
        let view = self.client_view.as_mut_slice();

        let mut clean = true;
        let mut y = rect.top as usize;
        let end = rect.bottom as usize;

        // Skip rows that are the same.
        while y < end {
            let off = y * scanline + (rect.left as usize) * 4;
            if view[off..off + width_bytes] != src[off..off + width_bytes] {
                clean = false;
                break;
            }
            y += 1;
        }

        // Then blindly copy the remaining ones.
        while y < end {
            let off = y * scanline + (rect.left as usize) * 4;
            view[off..off + width_bytes].copy_from_slice(&src[off..off + width_bytes]);
            y += 1;
        }

        clean
    }

    /// Simplify the accumulated damage against the mirror.
    ///
    /// Walks the tile grid covering the damage extents and keeps only
    /// what actually changed. With `full_tiles` (gfx codecs) the output
    /// is y-x-banded runs of whole tiles, horizontally merged; otherwise
    /// it is the exact dirty sub-rectangles. Returns the output region
    /// and the number of damaged pixels.
    pub fn simplify_damage(
        &mut self,
        src: &[u8],
        tile_size: u32,
        full_tiles: bool,
    ) -> Result<(Region, u64), EncodeError> {
        let needed = (self.desktop_height as usize) * (self.scanline as usize);
        if src.len() < needed {
            return Err(EncodeError::ShortSource);
        }

        let mut out = Region::new();
        let mut damaged_pixels: u64 = 0;

        let Some(extents) = self.accumulated_damage.extents() else {
            return Ok((out, 0));
        };

        let min_tile_x = extents.left / tile_size;
        let min_tile_y = extents.top / tile_size;
        let max_tile_x = (extents.right - 1) / tile_size;
        let max_tile_y = (extents.bottom - 1) / tile_size;

        let input = self.accumulated_damage.clone();

        for ty in min_tile_y..=max_tile_y {
            let tile_top = ty * tile_size;
            let tile_bottom = if ty == max_tile_y {
                extents.bottom
            } else {
                tile_top + tile_size
            };

            // Horizontal run of dirty tiles for banded output.
            let mut run: Option<Rect> = None;

            for tx in min_tile_x..=max_tile_x {
                let tile_left = tx * tile_size;
                let tile_right = if tx == max_tile_x {
                    extents.right
                } else {
                    tile_left + tile_size
                };
                let tile = Rect::new(tile_left, tile_top, tile_right, tile_bottom);

                let mut tile_dirty = false;
                for sub in input.intersected(&tile) {
                    if self.compare_and_update(src, &sub) {
                        continue;
                    }
                    tile_dirty = true;
                    damaged_pixels += sub.area();
                    if !full_tiles {
                        out.union_rect(&sub);
                    }
                }

                if full_tiles {
                    if tile_dirty {
                        run = Some(match run {
                            Some(r) if r.right == tile.left => r.union_bounds(&tile),
                            Some(r) => {
                                out.union_rect(&r);
                                tile
                            }
                            None => tile,
                        });
                    } else if let Some(r) = run.take() {
                        out.union_rect(&r);
                    }
                }
            }

            if let Some(r) = run.take() {
                out.union_rect(&r);
            }
        }

        Ok((out, damaged_pixels))
    }

    #[cfg(test)]
    pub(crate) fn client_view_at(&self, x: u32, y: u32) -> &[u8] {
        let off = (y as usize) * (self.scanline as usize) + (x as usize) * 4;
        &self.client_view.as_slice()[off..off + 4]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder_64x128() -> BitmapEncoder {
        // 128x128 desktop, scanline = width * 4 = 512 (multiple of 16).
        BitmapEncoder::new(128, 128, 512, 32, 65535).unwrap()
    }

    fn zero_frame(encoder: &BitmapEncoder) -> Vec<u8> {
        vec![0u8; (encoder.desktop_height * encoder.scanline) as usize]
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(matches!(
            BitmapEncoder::new(128, 128, 510, 32, 65535),
            Err(EncodeError::BadScanline(_))
        ));
        assert!(matches!(
            BitmapEncoder::new(128, 128, 512, 17, 65535),
            Err(EncodeError::BadDepth(17))
        ));
        assert!(matches!(
            BitmapEncoder::new(128, 128, 512, 32, 1023),
            Err(EncodeError::BadMaxRequestSize(1023))
        ));
    }

    #[test]
    fn first_frame_is_fully_damaged() {
        // The sentinel fill differs from any real pixel, so even an
        // all-zero framebuffer counts as damage on the first pass.
        let mut encoder = encoder_64x128();
        let frame = zero_frame(&encoder);
        encoder.accumulate_damage(0, 0, 128, 128);
        let (region, pixels) = encoder.simplify_damage(&frame, 64, true).unwrap();
        assert!(!region.is_empty());
        assert_eq!(pixels, 128 * 128);
    }

    #[test]
    fn identical_tiles_are_dropped_on_second_pass() {
        let mut encoder = encoder_64x128();
        let frame = zero_frame(&encoder);
        encoder.accumulate_damage(0, 0, 128, 128);
        let _ = encoder.simplify_damage(&frame, 64, true).unwrap();

        encoder.accumulate_damage(0, 0, 128, 128);
        let (region, pixels) = encoder.simplify_damage(&frame, 64, true).unwrap();
        assert!(region.is_empty());
        assert_eq!(pixels, 0);
    }

    #[test]
    fn single_changed_byte_damages_exactly_one_tile() {
        let mut encoder = encoder_64x128();
        let mut frame = zero_frame(&encoder);
        encoder.accumulate_damage(0, 0, 128, 128);
        let _ = encoder.simplify_damage(&frame, 64, true).unwrap();

        // Flip one byte inside the bottom-right 64x64 tile.
        let off = 100 * 512 + 100 * 4;
        frame[off] = 0xFF;
        encoder.accumulate_damage(0, 0, 128, 128);
        let (region, _) = encoder.simplify_damage(&frame, 64, true).unwrap();
        assert_eq!(region.rects().len(), 1);
        assert_eq!(region.rects()[0], Rect::new(64, 64, 128, 128));

        // Mirror updated: nothing left on the next pass.
        encoder.accumulate_damage(0, 0, 128, 128);
        let (region, _) = encoder.simplify_damage(&frame, 64, true).unwrap();
        assert!(region.is_empty());
    }

    #[test]
    fn adjacent_dirty_tiles_merge_into_a_run() {
        let mut encoder = encoder_64x128();
        let mut frame = zero_frame(&encoder);
        encoder.accumulate_damage(0, 0, 128, 128);
        let _ = encoder.simplify_damage(&frame, 64, true).unwrap();

        // One byte in each of the two top tiles.
        frame[10 * 512 + 10 * 4] = 1;
        frame[10 * 512 + 100 * 4] = 1;
        encoder.accumulate_damage(0, 0, 128, 128);
        let (region, _) = encoder.simplify_damage(&frame, 64, true).unwrap();
        assert_eq!(region.rects().len(), 1);
        assert_eq!(region.rects()[0], Rect::new(0, 0, 128, 64));
    }

    #[test]
    fn exact_mode_reports_subrects() {
        let mut encoder = encoder_64x128();
        let mut frame = zero_frame(&encoder);
        encoder.accumulate_damage(0, 0, 128, 128);
        let _ = encoder.simplify_damage(&frame, 32, false).unwrap();

        frame[512 + 4] = 1; // pixel (1, 1)
        encoder.accumulate_damage(0, 0, 16, 16);
        let (region, pixels) = encoder.simplify_damage(&frame, 32, false).unwrap();
        assert_eq!(region.rects().len(), 1);
        assert_eq!(region.rects()[0], Rect::new(0, 0, 16, 16));
        assert_eq!(pixels, 16 * 16);
    }

    #[test]
    fn blank_client_view_forces_resend() {
        let mut encoder = encoder_64x128();
        let frame = zero_frame(&encoder);
        encoder.accumulate_damage(0, 0, 128, 128);
        let _ = encoder.simplify_damage(&frame, 64, true).unwrap();

        encoder.blank_client_view(&Rect::new(0, 0, 8, 8));
        assert_eq!(encoder.client_view_at(0, 0), &[1, 1, 1, 1]);
        encoder.accumulate_damage(0, 0, 8, 8);
        let (region, _) = encoder.simplify_damage(&frame, 64, true).unwrap();
        assert!(!region.is_empty());
    }

    #[test]
    fn damage_is_clamped_to_desktop() {
        let mut encoder = encoder_64x128();
        encoder.accumulate_damage(120, 120, 100, 100);
        let extents = encoder.accumulated_damage.extents().unwrap();
        assert_eq!(extents, Rect::new(120, 120, 128, 128));
        encoder.accumulate_damage(-1, 0, 10, 10);
        assert_eq!(encoder.accumulated_damage.extents().unwrap(), extents);
    }
}
