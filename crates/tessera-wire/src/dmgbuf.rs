//! Shared-memory damage buffer.
//!
//! The RDP server allocates one buffer per backend framebuffer; the
//! backend maps it by id, writes the pixels and the list of damaged
//! rectangles, and answers the sync request with the buffer id. The
//! layout is a fixed header, a bounded rect table, then `height *
//! scanline` bytes of BGRX pixels.

use std::fs::OpenOptions;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};

use crate::WireError;

const MAGIC: u32 = 0x544d_4744; // "TMGD"
pub const MAX_RECTS: usize = 1024;
const HEADER_LEN: usize = 32;
const RECT_LEN: usize = 16;

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DamageRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

fn shm_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

fn buffer_path(id: i32) -> PathBuf {
    shm_dir().join(format!("tessera-dmg-{id}"))
}

struct Mapping {
    ptr: *mut u8,
    len: usize,
}

// The mapping is plain shared memory; access is coordinated by the sync
// request/reply protocol, never concurrently.
unsafe impl Send for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped
        // exactly once.
        unsafe {
            let _ = munmap(self.ptr.cast(), self.len);
        }
    }
}

pub struct DamageBuffer {
    mapping: Mapping,
    id: i32,
    owner: bool,
}

impl DamageBuffer {
    fn map_file(path: &Path, len: usize, create: bool) -> Result<Mapping, WireError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)?;
        if create {
            file.set_len(len as u64)?;
        }
        // SAFETY: len is non-zero and the fd stays open for the duration
        // of the call; the kernel keeps the mapping alive afterwards.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )?
        };
        Ok(Mapping {
            ptr: ptr.cast(),
            len,
        })
    }

    fn total_len(height: u32, scanline: u32) -> usize {
        HEADER_LEN + MAX_RECTS * RECT_LEN + (height as usize) * (scanline as usize)
    }

    /// Allocate a fresh buffer. The id is unique within the process tree
    /// (pid mixed into the counter).
    pub fn create(width: u32, height: u32, scanline: u32) -> Result<DamageBuffer, WireError> {
        let seq = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let id = ((std::process::id() & 0x3fff) << 16 | (seq & 0xffff)) as i32;
        let len = Self::total_len(height, scanline);
        let mapping = Self::map_file(&buffer_path(id), len, true)?;
        let mut buffer = DamageBuffer {
            mapping,
            id,
            owner: true,
        };
        buffer.write_u32(0, MAGIC);
        buffer.write_u32(4, id as u32);
        buffer.write_u32(8, width);
        buffer.write_u32(12, height);
        buffer.write_u32(16, scanline);
        buffer.write_u32(20, 0); // user id
        buffer.write_u32(24, 0); // num rects
        Ok(buffer)
    }

    /// Attach an existing buffer by id.
    pub fn open(id: i32) -> Result<DamageBuffer, WireError> {
        let path = buffer_path(id);
        let meta = std::fs::metadata(&path)?;
        let len = meta.len() as usize;
        if len < HEADER_LEN + MAX_RECTS * RECT_LEN {
            return Err(WireError::BadDamageBuffer);
        }
        let mapping = Self::map_file(&path, len, false)?;
        let buffer = DamageBuffer {
            mapping,
            id,
            owner: false,
        };
        if buffer.read_u32(0) != MAGIC || buffer.read_u32(4) != id as u32 {
            return Err(WireError::BadDamageBuffer);
        }
        if Self::total_len(buffer.height(), buffer.scanline()) > len {
            return Err(WireError::BadDamageBuffer);
        }
        Ok(buffer)
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping is valid for mapping.len bytes.
        unsafe { std::slice::from_raw_parts(self.mapping.ptr, self.mapping.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: the mapping is valid for mapping.len bytes and we hold
        // &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.mapping.ptr, self.mapping.len) }
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let b = &self.bytes()[offset..offset + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.bytes_mut()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[must_use]
    pub fn id(&self) -> i32 {
        self.id
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.read_u32(8)
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.read_u32(12)
    }

    #[must_use]
    pub fn scanline(&self) -> u32 {
        self.read_u32(16)
    }

    /// Record which session user owns the backend side of this buffer.
    pub fn set_user(&mut self, user_id: u32) {
        self.write_u32(20, user_id);
    }

    #[must_use]
    pub fn user(&self) -> u32 {
        self.read_u32(20)
    }

    /// Replace the damage rect list (backend side). Excess rects are
    /// dropped.
    pub fn set_rects(&mut self, rects: &[DamageRect]) {
        let n = rects.len().min(MAX_RECTS);
        for (i, r) in rects.iter().take(n).enumerate() {
            let off = HEADER_LEN + i * RECT_LEN;
            self.bytes_mut()[off..off + 4].copy_from_slice(&r.x.to_le_bytes());
            self.bytes_mut()[off + 4..off + 8].copy_from_slice(&r.y.to_le_bytes());
            self.bytes_mut()[off + 8..off + 12].copy_from_slice(&r.width.to_le_bytes());
            self.bytes_mut()[off + 12..off + 16].copy_from_slice(&r.height.to_le_bytes());
        }
        self.write_u32(24, n as u32);
    }

    #[must_use]
    pub fn rects(&self) -> Vec<DamageRect> {
        let n = (self.read_u32(24) as usize).min(MAX_RECTS);
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let off = HEADER_LEN + i * RECT_LEN;
            let b = self.bytes();
            let read_i32 = |o: usize| i32::from_le_bytes([b[o], b[o + 1], b[o + 2], b[o + 3]]);
            out.push(DamageRect {
                x: read_i32(off),
                y: read_i32(off + 4),
                width: read_i32(off + 8),
                height: read_i32(off + 12),
            });
        }
        out
    }

    /// The framebuffer pixels (BGRX, `height * scanline` bytes).
    #[must_use]
    pub fn data(&self) -> &[u8] {
        let start = HEADER_LEN + MAX_RECTS * RECT_LEN;
        let len = (self.height() as usize) * (self.scanline() as usize);
        &self.bytes()[start..start + len]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let start = HEADER_LEN + MAX_RECTS * RECT_LEN;
        let len = (self.height() as usize) * (self.scanline() as usize);
        &mut self.bytes_mut()[start..start + len]
    }
}

impl Drop for DamageBuffer {
    fn drop(&mut self) {
        if self.owner {
            let _ = std::fs::remove_file(buffer_path(self.id));
        }
    }
}

impl std::fmt::Debug for DamageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DamageBuffer")
            .field("id", &self.id)
            .field("width", &self.width())
            .field("height", &self.height())
            .field("scanline", &self.scanline())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_open_roundtrip() {
        let mut owner = DamageBuffer::create(64, 32, 64 * 4).unwrap();
        owner.set_user(1000);
        owner.set_rects(&[DamageRect {
            x: 4,
            y: 8,
            width: 16,
            height: 12,
        }]);
        owner.data_mut()[0] = 0xAB;

        let peer = DamageBuffer::open(owner.id()).unwrap();
        assert_eq!(peer.width(), 64);
        assert_eq!(peer.height(), 32);
        assert_eq!(peer.scanline(), 256);
        assert_eq!(peer.user(), 1000);
        assert_eq!(peer.rects().len(), 1);
        assert_eq!(peer.rects()[0].width, 16);
        assert_eq!(peer.data()[0], 0xAB);
    }

    #[test]
    fn open_unknown_id_fails() {
        assert!(DamageBuffer::open(-12345).is_err());
    }

    #[test]
    fn ids_are_unique() {
        let a = DamageBuffer::create(16, 16, 64).unwrap();
        let b = DamageBuffer::create(16, 16, 64).unwrap();
        assert_ne!(a.id(), b.id());
    }
}
