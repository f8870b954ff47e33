//! Pointer shape validation, hashing and the per-connection cache.

use std::io::Cursor;

/// Hard protocol bounds for pointer shapes (MS-RDPBCGR 2.2.9.1.1.4.4).
pub const MAX_POINTER_DIM: u32 = 96;
pub const MAX_XOR_MASK: u32 = 96 * 96 * 4;
pub const MAX_AND_MASK: u32 = 96 * 96 / 8;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PointerError {
    #[error("invalid pointer size {width}x{height}")]
    BadSize { width: u32, height: u32 },
    #[error("invalid pointer hotspot {x}x{y}")]
    BadHotspot { x: u32, y: u32 },
    #[error("unsupported pointer color depth {0}")]
    BadDepth(u32),
    #[error("invalid XOR mask length {0}")]
    BadXorMask(u32),
    #[error("invalid AND mask length {0}")]
    BadAndMask(u32),
}

/// A validated pointer shape as received from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerShape {
    pub xor_bpp: u32,
    pub hot_x: u32,
    pub hot_y: u32,
    pub width: u32,
    pub height: u32,
    pub xor_mask: Vec<u8>,
    pub and_mask: Vec<u8>,
}

impl PointerShape {
    /// Boundary checks from the protocol: dimensions in (0, 96], hotspot
    /// within the shape, 24/32 bpp xor data, bounded mask lengths.
    pub fn validate(&self) -> Result<(), PointerError> {
        if self.width == 0
            || self.width > MAX_POINTER_DIM
            || self.height == 0
            || self.height > MAX_POINTER_DIM
        {
            return Err(PointerError::BadSize {
                width: self.width,
                height: self.height,
            });
        }
        if self.hot_x > self.width || self.hot_y > self.height {
            return Err(PointerError::BadHotspot {
                x: self.hot_x,
                y: self.hot_y,
            });
        }
        if self.xor_bpp != 24 && self.xor_bpp != 32 {
            return Err(PointerError::BadDepth(self.xor_bpp));
        }
        let xor_len = self.xor_mask.len() as u32;
        if xor_len == 0 || xor_len > MAX_XOR_MASK {
            return Err(PointerError::BadXorMask(xor_len));
        }
        let and_len = self.and_mask.len() as u32;
        if and_len == 0 || and_len > MAX_AND_MASK {
            return Err(PointerError::BadAndMask(and_len));
        }
        Ok(())
    }

    /// MurmurHash3 over the geometry and both masks; the cache key.
    #[must_use]
    pub fn shape_hash(&self) -> u32 {
        let mut buf = Vec::with_capacity(24 + self.and_mask.len() + self.xor_mask.len());
        buf.extend_from_slice(&self.hot_x.to_le_bytes());
        buf.extend_from_slice(&self.hot_y.to_le_bytes());
        buf.extend_from_slice(&self.width.to_le_bytes());
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&(self.and_mask.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.xor_mask.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.and_mask);
        buf.extend_from_slice(&self.xor_mask);
        murmur3::murmur3_32(&mut Cursor::new(&buf), 0).unwrap_or(0)
    }

    /// Convert a 32 bpp shape to a monochrome 24 bpp one for clients
    /// without New Pointer Update support. rdesktop additionally uses the
    /// legacy `(w+7)/8` AND-mask stride instead of the 2-byte padded one.
    #[must_use]
    pub fn to_monochrome(&self, is_rdesktop: bool) -> Option<PointerShape> {
        if self.xor_bpp != 32 {
            return None;
        }

        let width = self.width as usize;
        let height = self.height as usize;
        let and_stride = if is_rdesktop {
            (width + 7) / 8
        } else {
            ((width + 15) / 16) * 2
        };

        let mut xor = vec![0u8; width * height * 3];
        let mut and = vec![0u8; height * and_stride];

        for y in 0..height {
            for x in 0..width {
                let src = &self.xor_mask[(y * width + x) * 4..(y * width + x) * 4 + 4];
                let dst = &mut xor[(y * width + x) * 3..(y * width + x) * 3 + 3];

                let mut set_and_bit = true;
                let mut color = 0x00u8;
                // At least semi-opaque pixels become black or white by
                // ITU-R BT.601 luma; transparent ones set the AND bit.
                if src[3] > 127 {
                    let b = u32::from(src[0]);
                    let g = u32::from(src[1]);
                    let r = u32::from(src[2]);
                    let luma = (5_016_388 * r + 9_848_226 * g + 1_912_603 * b) >> 24;
                    color = if luma >> 7 != 0 { 0xFF } else { 0x00 };
                    set_and_bit = false;
                }

                let and_off = and_stride * y + (x >> 3);
                let and_bit = 0x80 >> (x & 7);
                if set_and_bit {
                    and[and_off] |= and_bit;
                } else {
                    and[and_off] &= !and_bit;
                }
                dst.fill(color);
            }
        }

        Some(PointerShape {
            xor_bpp: 24,
            hot_x: self.hot_x,
            hot_y: self.hot_y,
            width: self.width,
            height: self.height,
            xor_mask: xor,
            and_mask: and,
        })
    }
}

/// Result of a cache probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheProbe {
    /// Shape already known to the client at this slot.
    Hit(u32),
    /// New shape, stored (and to be announced) at this slot.
    Stored(u32),
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    hash: u32,
    hits: u32,
}

/// LRU-by-hits pointer cache sized by the client's PointerCacheSize.
#[derive(Debug)]
pub struct PointerCache {
    entries: Vec<CacheEntry>,
}

impl PointerCache {
    #[must_use]
    pub fn new(size: u32) -> PointerCache {
        PointerCache {
            entries: vec![
                CacheEntry {
                    hash: 0xffff_ffff,
                    hits: 0,
                };
                size as usize
            ],
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget everything (reactivation invalidates the client cache).
    pub fn clear(&mut self) {
        for entry in &mut self.entries {
            entry.hash = 0xffff_ffff;
            entry.hits = 0;
        }
    }

    /// Probe the cache: on a hit the slot's hit count grows, otherwise
    /// the least-hit slot is evicted and reused.
    pub fn probe(&mut self, hash: u32) -> Option<CacheProbe> {
        if self.entries.is_empty() {
            return None;
        }

        for (i, entry) in self.entries.iter_mut().enumerate() {
            if entry.hash == hash {
                entry.hits += 1;
                return Some(CacheProbe::Hit(i as u32));
            }
        }

        let mut victim = 0usize;
        for i in 0..self.entries.len() {
            if self.entries[i].hits < self.entries[victim].hits {
                victim = i;
            }
            if self.entries[victim].hits == 0 {
                break;
            }
        }

        self.entries[victim] = CacheEntry { hash, hits: 1 };
        Some(CacheProbe::Stored(victim as u32))
    }

    #[cfg(test)]
    fn hits(&self) -> Vec<u32> {
        self.entries.iter().map(|e| e.hits).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(width: u32, height: u32) -> PointerShape {
        PointerShape {
            xor_bpp: 32,
            hot_x: 0,
            hot_y: 0,
            width,
            height,
            xor_mask: vec![0; (width * height * 4) as usize],
            and_mask: vec![0; ((width * height) as usize).div_ceil(8)],
        }
    }

    #[test]
    fn validation_boundaries() {
        assert!(shape(96, 96).validate().is_ok());
        assert!(matches!(
            shape(97, 32).validate(),
            Err(PointerError::BadSize { .. })
        ));
        assert!(matches!(
            shape(0, 32).validate(),
            Err(PointerError::BadSize { .. })
        ));

        let mut s = shape(32, 32);
        s.hot_x = 33;
        assert!(matches!(s.validate(), Err(PointerError::BadHotspot { .. })));

        let mut s = shape(32, 32);
        s.xor_bpp = 16;
        assert!(matches!(s.validate(), Err(PointerError::BadDepth(16))));

        let mut s = shape(32, 32);
        s.xor_mask = vec![0; (MAX_XOR_MASK + 1) as usize];
        assert!(matches!(s.validate(), Err(PointerError::BadXorMask(_))));

        let mut s = shape(32, 32);
        s.and_mask = vec![0; (MAX_AND_MASK + 1) as usize];
        assert!(matches!(s.validate(), Err(PointerError::BadAndMask(_))));
    }

    #[test]
    fn hash_depends_on_masks() {
        let a = shape(32, 32);
        let mut b = shape(32, 32);
        b.xor_mask[0] = 0xFF;
        assert_ne!(a.shape_hash(), b.shape_hash());
        assert_eq!(a.shape_hash(), shape(32, 32).shape_hash());
    }

    #[test]
    fn cache_hits_and_eviction() {
        let mut cache = PointerCache::new(2);
        assert_eq!(cache.probe(1), Some(CacheProbe::Stored(0)));
        assert_eq!(cache.probe(1), Some(CacheProbe::Hit(0)));
        assert_eq!(cache.probe(2), Some(CacheProbe::Stored(1)));
        // Slot 1 has fewer hits than slot 0: it is the victim.
        assert_eq!(cache.probe(3), Some(CacheProbe::Stored(1)));
    }

    #[test]
    fn eviction_victim_is_hit_optimal() {
        let mut cache = PointerCache::new(4);
        for hash in 1..=4u32 {
            cache.probe(hash);
        }
        // Hit shapes 1..=3 a few times, leaving 4 the coldest.
        for _ in 0..3 {
            cache.probe(1);
            cache.probe(2);
            cache.probe(3);
        }
        let min_hits = *cache.hits().iter().min().unwrap();
        match cache.probe(99) {
            Some(CacheProbe::Stored(idx)) => {
                // The evicted slot had the minimal hit count.
                assert_eq!(idx, 3);
                assert_eq!(min_hits, 1);
            }
            other => panic!("unexpected probe result {other:?}"),
        }
    }

    #[test]
    fn zero_sized_cache_never_stores() {
        let mut cache = PointerCache::new(0);
        assert_eq!(cache.probe(42), None);
    }

    #[test]
    fn monochrome_conversion_strides() {
        let mut s = shape(20, 2);
        // Opaque white pixel at (0, 0); transparent elsewhere.
        s.xor_mask[0..4].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);

        let normal = s.to_monochrome(false).unwrap();
        assert_eq!(normal.xor_bpp, 24);
        assert_eq!(normal.and_mask.len(), 2 * (((20 + 15) / 16) * 2));
        assert_eq!(normal.xor_mask.len(), 20 * 2 * 3);
        // White output pixel, AND bit cleared.
        assert_eq!(&normal.xor_mask[0..3], &[0xFF, 0xFF, 0xFF]);
        assert_eq!(normal.and_mask[0] & 0x80, 0);
        // Transparent pixel keeps its AND bit.
        assert_ne!(normal.and_mask[0] & 0x40, 0);

        let legacy = s.to_monochrome(true).unwrap();
        assert_eq!(legacy.and_mask.len(), 2 * ((20 + 7) / 8));
    }
}
