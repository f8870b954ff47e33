//! X.224 connection request/confirm and the RDP protocol negotiation
//! TLVs carried inside them.

use super::{ReadCursor, RdpError};

pub const PROTOCOL_RDP: u32 = 0x0000_0000;
pub const PROTOCOL_SSL: u32 = 0x0000_0001;
pub const PROTOCOL_HYBRID: u32 = 0x0000_0002;

const TPDU_CONNECTION_REQUEST: u8 = 0xE;
const TPDU_DATA: u8 = 0xF;

const TYPE_RDP_NEG_REQ: u8 = 0x01;
const TYPE_RDP_NEG_RSP: u8 = 0x02;
const TYPE_RDP_NEG_FAILURE: u8 = 0x03;

pub const SSL_REQUIRED_BY_SERVER: u32 = 0x01;

/// Parsed X.224 Connection Request.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRequest {
    /// `Cookie: mstshash=<user>` routing token, when present.
    pub cookie_user: Option<String>,
    /// Protocols the client is willing to speak (RDP_NEG_REQ); RDP-only
    /// clients omit the TLV entirely.
    pub requested_protocols: u32,
}

/// Parse an X.224 CR payload (TPKT header already stripped).
pub fn parse_connection_request(payload: &[u8]) -> Result<ConnectionRequest, RdpError> {
    let mut cur = ReadCursor::new(payload, "x224 connection request");
    let li = cur.read_u8()? as usize;
    let code = cur.read_u8()?;
    if code >> 4 != TPDU_CONNECTION_REQUEST {
        return Err(RdpError::Malformed("x224 tpdu code"));
    }
    cur.skip(5)?; // dst-ref, src-ref, class

    if li + 1 > payload.len() {
        return Err(RdpError::Short("x224 connection request"));
    }

    let mut request = ConnectionRequest::default();

    // The variable part may hold a routing cookie (ASCII, CRLF
    // terminated) followed by the negotiation TLV.
    let mut rest = &payload[cur.pos()..];
    if let Some(text_end) = find_crlf(rest) {
        if let Ok(text) = std::str::from_utf8(&rest[..text_end]) {
            let lower = text.to_ascii_lowercase();
            if let Some(idx) = lower.find("cookie: mstshash=") {
                let user = text[idx + "cookie: mstshash=".len()..].trim();
                if !user.is_empty() && user.len() <= 64 {
                    request.cookie_user = Some(user.to_string());
                }
            }
        }
        rest = &rest[text_end + 2..];
    }

    if rest.len() >= 8 && rest[0] == TYPE_RDP_NEG_REQ {
        let mut neg = ReadCursor::new(rest, "rdp neg req");
        neg.skip(1)?; // type
        neg.skip(1)?; // flags
        let length = neg.read_u16()?;
        if length != 8 {
            return Err(RdpError::Malformed("rdp neg req length"));
        }
        request.requested_protocols = neg.read_u32()?;
    }

    Ok(request)
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

/// Build the X.224 Connection Confirm with an RDP_NEG_RSP selecting
/// `protocol` (or a failure TLV when `failure_code` is set).
#[must_use]
pub fn build_connection_confirm(protocol: u32, failure_code: Option<u32>) -> Vec<u8> {
    let mut out = Vec::with_capacity(19);
    out.push(14); // LI: 6 fixed + 8 TLV
    out.push(0xD0); // CC TPDU
    out.extend_from_slice(&[0, 0]); // dst-ref
    out.extend_from_slice(&[0, 0]); // src-ref
    out.push(0); // class 0

    match failure_code {
        None => {
            out.push(TYPE_RDP_NEG_RSP);
            // EXTENDED_CLIENT_DATA_SUPPORTED | DYNVC_GFX_PROTOCOL_SUPPORTED
            out.push(0x01 | 0x02);
            out.extend_from_slice(&8u16.to_le_bytes());
            out.extend_from_slice(&protocol.to_le_bytes());
        }
        Some(code) => {
            out.push(TYPE_RDP_NEG_FAILURE);
            out.push(0);
            out.extend_from_slice(&8u16.to_le_bytes());
            out.extend_from_slice(&code.to_le_bytes());
        }
    }
    out
}

/// Strip an X.224 Data TPDU header, returning the payload.
pub fn parse_data(payload: &[u8]) -> Result<&[u8], RdpError> {
    if payload.len() < 3 {
        return Err(RdpError::Short("x224 data"));
    }
    if payload[1] >> 4 != TPDU_DATA {
        return Err(RdpError::Malformed("x224 data tpdu"));
    }
    Ok(&payload[3..])
}

/// The 3-byte X.224 Data TPDU header (class 0, EOT).
pub fn write_data_header(out: &mut Vec<u8>) {
    out.extend_from_slice(&[2, 0xF0, 0x80]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(cookie: &[u8], neg: &[u8]) -> Vec<u8> {
        let mut payload = vec![0u8; 7];
        payload[0] = (6 + cookie.len() + neg.len()) as u8;
        payload[1] = 0xE0;
        payload.extend_from_slice(cookie);
        payload.extend_from_slice(neg);
        payload
    }

    #[test]
    fn parses_cookie_and_protocols() {
        let mut neg = vec![TYPE_RDP_NEG_REQ, 0];
        neg.extend_from_slice(&8u16.to_le_bytes());
        neg.extend_from_slice(&(PROTOCOL_SSL | PROTOCOL_HYBRID).to_le_bytes());
        let payload = request_with(b"Cookie: mstshash=alice\r\n", &neg);

        let req = parse_connection_request(&payload).unwrap();
        assert_eq!(req.cookie_user.as_deref(), Some("alice"));
        assert_eq!(req.requested_protocols, PROTOCOL_SSL | PROTOCOL_HYBRID);
    }

    #[test]
    fn legacy_request_without_tlv() {
        let payload = request_with(b"", &[]);
        let req = parse_connection_request(&payload).unwrap();
        assert_eq!(req.cookie_user, None);
        assert_eq!(req.requested_protocols, PROTOCOL_RDP);
    }

    #[test]
    fn confirm_selects_tls() {
        let cc = build_connection_confirm(PROTOCOL_SSL, None);
        assert_eq!(cc[1], 0xD0);
        assert_eq!(cc[7], TYPE_RDP_NEG_RSP);
        assert_eq!(&cc[11..15], &PROTOCOL_SSL.to_le_bytes());
    }

    #[test]
    fn data_header_roundtrip() {
        let mut out = Vec::new();
        write_data_header(&mut out);
        out.extend_from_slice(b"payload");
        assert_eq!(parse_data(&out).unwrap(), b"payload");
    }
}
