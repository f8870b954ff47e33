//! Framebuffer encoding for RDP front connections.
//!
//! Turns backend damage into client-ready payloads: the per-client
//! `clientView` mirror and damage simplification, bitmap fragmentation
//! for the legacy path, pointer shape caching, codec mode selection and
//! the seams for the external RemoteFX / H.264 transforms.

pub mod bmp;
pub mod codec;
pub mod encoder;
pub mod pointer;
pub mod region;

pub use codec::{CodecFactories, CodecMode, CodecSelection};
pub use encoder::BitmapEncoder;
pub use region::{Rect, Region};

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("scanline {0} is not a multiple of 16")]
    BadScanline(u32),
    #[error("destination depth {0} is not supported")]
    BadDepth(u32),
    #[error("multifrag max request size {0} is below the protocol minimum")]
    BadMaxRequestSize(u32),
    #[error("source buffer is too small for the declared geometry")]
    ShortSource,
    #[error("fragment of {0} bytes cannot fit the maximum request size")]
    FragmentTooLarge(usize),
    #[error("codec failed: {0}")]
    Codec(String),
}
