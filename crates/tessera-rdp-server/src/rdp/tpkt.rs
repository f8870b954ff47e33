//! TPKT framing and fastpath frame detection.
//!
//! Everything slowpath is wrapped in a TPKT header (version 3, big
//! endian length). A first byte with the low two bits zeroed and != 3 is
//! a fastpath input PDU whose length follows in 1 or 2 bytes.

use super::RdpError;

pub const TPKT_VERSION: u8 = 3;
pub const TPKT_HEADER_LEN: usize = 4;

/// What the next complete frame in a receive buffer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// A TPKT frame of `total` bytes (header included).
    Tpkt { total: usize },
    /// A fastpath input frame: `header_len` bytes of header + length,
    /// `total` bytes overall.
    FastPath { header_len: usize, total: usize },
}

/// Peek at `data` and classify the next frame. Returns `None` when more
/// bytes are needed.
pub fn peek_frame(data: &[u8]) -> Result<Option<Frame>, RdpError> {
    if data.is_empty() {
        return Ok(None);
    }

    if data[0] == TPKT_VERSION {
        if data.len() < TPKT_HEADER_LEN {
            return Ok(None);
        }
        let total = usize::from(u16::from_be_bytes([data[2], data[3]]));
        if total < TPKT_HEADER_LEN {
            return Err(RdpError::Malformed("tpkt length"));
        }
        return Ok(Some(Frame::Tpkt { total }));
    }

    // Fastpath: length1 (bit 7 set -> two byte length).
    if data.len() < 2 {
        return Ok(None);
    }
    let (header_len, total) = if data[1] & 0x80 != 0 {
        if data.len() < 3 {
            return Ok(None);
        }
        (
            3,
            usize::from(u16::from_be_bytes([data[1] & 0x7f, data[2]])),
        )
    } else {
        (2, usize::from(data[1]))
    };
    if total < header_len {
        return Err(RdpError::Malformed("fastpath length"));
    }
    Ok(Some(Frame::FastPath { header_len, total }))
}

/// Prepend a TPKT header to `payload_len` bytes of X.224 data.
pub fn write_header(out: &mut Vec<u8>, payload_len: usize) {
    let total = (payload_len + TPKT_HEADER_LEN) as u16;
    out.push(TPKT_VERSION);
    out.push(0);
    out.extend_from_slice(&total.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_tpkt() {
        let frame = peek_frame(&[3, 0, 0, 11, 0, 0, 0]).unwrap().unwrap();
        assert_eq!(frame, Frame::Tpkt { total: 11 });
    }

    #[test]
    fn classifies_fastpath_short_and_long() {
        let frame = peek_frame(&[0x44, 0x08]).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::FastPath {
                header_len: 2,
                total: 8
            }
        );
        let frame = peek_frame(&[0x44, 0x81, 0x20]).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::FastPath {
                header_len: 3,
                total: 0x120
            }
        );
    }

    #[test]
    fn incomplete_returns_none() {
        assert_eq!(peek_frame(&[]).unwrap(), None);
        assert_eq!(peek_frame(&[3, 0]).unwrap(), None);
        assert_eq!(peek_frame(&[0x44]).unwrap(), None);
        assert_eq!(peek_frame(&[0x44, 0x81]).unwrap(), None);
    }

    #[test]
    fn header_roundtrip() {
        let mut out = Vec::new();
        write_header(&mut out, 7);
        assert_eq!(peek_frame(&out).unwrap().unwrap(), Frame::Tpkt { total: 11 });
    }
}
