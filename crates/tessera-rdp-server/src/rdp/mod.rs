//! The MS-RDPBCGR subset implemented by the server: connection sequence,
//! capability exchange, input, and the output PDUs the frame pipeline
//! emits. Everything here is sans-io; [`peer::RdpPeer`] glues it to the
//! connection's socket.

pub mod caps;
pub mod gcc;
pub mod gfx;
pub mod input;
pub mod mcs;
pub mod peer;
pub mod sec;
pub mod tpkt;
pub mod update;
pub mod x224;

pub use peer::{PeerEvent, RdpPeer};

#[derive(Debug, thiserror::Error)]
pub enum RdpError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("truncated PDU while reading {0}")]
    Short(&'static str),
    #[error("malformed {0}")]
    Malformed(&'static str),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("peer closed the connection")]
    Disconnected,
}

/// Bounds-checked little/big-endian reader over a byte slice.
#[derive(Debug, Clone)]
pub struct ReadCursor<'a> {
    data: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> ReadCursor<'a> {
    #[must_use]
    pub fn new(data: &'a [u8], what: &'static str) -> ReadCursor<'a> {
        ReadCursor { data, pos: 0, what }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    #[must_use]
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8, RdpError> {
        let b = *self.data.get(self.pos).ok_or(RdpError::Short(self.what))?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_u16(&mut self) -> Result<u16, RdpError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u16_be(&mut self) -> Result<u16, RdpError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, RdpError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, RdpError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], RdpError> {
        if self.remaining() < n {
            return Err(RdpError::Short(self.what));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), RdpError> {
        self.read_bytes(n).map(|_| ())
    }

    #[must_use]
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

/// Decode a UTF-16LE buffer, stopping at the first NUL.
#[must_use]
pub fn utf16_to_string(data: &[u8]) -> String {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Encode a string as UTF-16LE without a terminator.
#[must_use]
pub fn string_to_utf16(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_bounds() {
        let mut c = ReadCursor::new(&[1, 2, 3], "test");
        assert_eq!(c.read_u8().unwrap(), 1);
        assert_eq!(c.read_u16().unwrap(), 0x0302);
        assert!(matches!(c.read_u8(), Err(RdpError::Short("test"))));
    }

    #[test]
    fn utf16_roundtrip() {
        let raw = string_to_utf16("user1");
        assert_eq!(utf16_to_string(&raw), "user1");
        let mut terminated = raw.clone();
        terminated.extend_from_slice(&[0, 0, b'x', 0]);
        assert_eq!(utf16_to_string(&terminated), "user1");
    }
}
