//! Security layer leftovers used without legacy encryption: the basic
//! security header gating the client info PDU, and the licensing
//! short-circuit.

use super::{utf16_to_string, ReadCursor, RdpError};

pub const SEC_INFO_PKT: u16 = 0x4000;
pub const SEC_LICENSE_PKT: u16 = 0x0080;

const INFO_UNICODE: u32 = 0x0000_0010;
const INFO_AUTOLOGON: u32 = 0x0000_0008;

/// The parts of the client info PDU the server acts on.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub domain: String,
    pub username: String,
    pub password: String,
    pub autologon: bool,
    pub client_address: String,
    pub performance_flags: u32,
}

/// Read the basic security header; returns `(flags, payload)`.
pub fn parse_security_header(payload: &[u8]) -> Result<(u16, &[u8]), RdpError> {
    let mut cur = ReadCursor::new(payload, "security header");
    let flags = cur.read_u16()?;
    cur.read_u16()?; // flagsHi
    Ok((flags, cur.rest()))
}

/// Parse TS_INFO_PACKET (after the security header).
pub fn parse_client_info(payload: &[u8]) -> Result<ClientInfo, RdpError> {
    let mut cur = ReadCursor::new(payload, "client info");
    cur.read_u32()?; // codePage
    let flags = cur.read_u32()?;
    let unicode = flags & INFO_UNICODE != 0;

    let cb_domain = usize::from(cur.read_u16()?);
    let cb_username = usize::from(cur.read_u16()?);
    let cb_password = usize::from(cur.read_u16()?);
    let cb_alternate_shell = usize::from(cur.read_u16()?);
    let cb_working_dir = usize::from(cur.read_u16()?);

    // Lengths exclude the mandatory terminator.
    let term = if unicode { 2 } else { 1 };
    let read_string = |cur: &mut ReadCursor<'_>, len: usize| -> Result<String, RdpError> {
        let raw = cur.read_bytes(len + term)?;
        Ok(if unicode {
            utf16_to_string(&raw[..len])
        } else {
            String::from_utf8_lossy(&raw[..len]).to_string()
        })
    };

    let mut info = ClientInfo {
        autologon: flags & INFO_AUTOLOGON != 0,
        ..ClientInfo::default()
    };
    info.domain = read_string(&mut cur, cb_domain)?;
    info.username = read_string(&mut cur, cb_username)?;
    info.password = read_string(&mut cur, cb_password)?;
    let _alternate_shell = read_string(&mut cur, cb_alternate_shell)?;
    let _working_dir = read_string(&mut cur, cb_working_dir)?;

    // TS_EXTENDED_INFO_PACKET, optional.
    if cur.remaining() >= 4 {
        let _address_family = cur.read_u16()?;
        let cb_address = usize::from(cur.read_u16()?);
        if let Ok(raw) = cur.read_bytes(cb_address) {
            info.client_address = if unicode {
                utf16_to_string(raw)
            } else {
                String::from_utf8_lossy(raw).to_string()
            };
        }
        // clientDir + time zone + clientSessionId, then the flags.
        if cur.remaining() >= 2 {
            if let Ok(cb_dir) = cur.read_u16() {
                let _ = cur.skip(usize::from(cb_dir));
            }
        }
        if cur.remaining() >= 172 + 4 + 4 {
            let _ = cur.skip(172); // clientTimeZone
            let _ = cur.read_u32(); // clientSessionId
            if let Ok(perf) = cur.read_u32() {
                info.performance_flags = perf;
            }
        }
    }

    Ok(info)
}

/// Build the Server License Error PDU with STATUS_VALID_CLIENT: no
/// licensing round trips, transition straight to capability exchange.
#[must_use]
pub fn build_license_error_valid_client() -> Vec<u8> {
    let mut out = Vec::with_capacity(20);
    out.extend_from_slice(&SEC_LICENSE_PKT.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // flagsHi
    out.push(0xFF); // ERROR_ALERT
    out.push(0x03); // PREAMBLE_VERSION_3_0 | EXTENDED_ERROR_MSG_SUPPORTED
    out.extend_from_slice(&16u16.to_le_bytes()); // wMsgSize
    out.extend_from_slice(&0x0000_0007u32.to_le_bytes()); // STATUS_VALID_CLIENT
    out.extend_from_slice(&0x0000_0002u32.to_le_bytes()); // ST_NO_TRANSITION
    out.extend_from_slice(&0x0004u16.to_le_bytes()); // BB_ERROR_BLOB
    out.extend_from_slice(&0u16.to_le_bytes()); // wBlobLen
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdp::string_to_utf16;

    fn info_packet(domain: &str, user: &str, password: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0u32.to_le_bytes()); // codePage
        out.extend_from_slice(&(INFO_UNICODE | INFO_AUTOLOGON).to_le_bytes());
        let d = string_to_utf16(domain);
        let u = string_to_utf16(user);
        let p = string_to_utf16(password);
        out.extend_from_slice(&(d.len() as u16).to_le_bytes());
        out.extend_from_slice(&(u.len() as u16).to_le_bytes());
        out.extend_from_slice(&(p.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        for s in [d, u, p] {
            out.extend_from_slice(&s);
            out.extend_from_slice(&[0, 0]);
        }
        out.extend_from_slice(&[0, 0]); // empty alternate shell
        out.extend_from_slice(&[0, 0]); // empty working dir

        // Extended info with a client address.
        out.extend_from_slice(&2u16.to_le_bytes()); // AF_INET
        let addr = string_to_utf16("10.1.2.3\0");
        out.extend_from_slice(&(addr.len() as u16).to_le_bytes());
        out.extend_from_slice(&addr);
        out
    }

    #[test]
    fn parses_unicode_credentials() {
        let packet = info_packet("CORP", "alice", "s3cret");
        let info = parse_client_info(&packet).unwrap();
        assert_eq!(info.domain, "CORP");
        assert_eq!(info.username, "alice");
        assert_eq!(info.password, "s3cret");
        assert!(info.autologon);
        assert_eq!(info.client_address, "10.1.2.3");
    }

    #[test]
    fn security_header_flags() {
        let mut payload = SEC_INFO_PKT.to_le_bytes().to_vec();
        payload.extend_from_slice(&[0, 0, 1, 2, 3]);
        let (flags, rest) = parse_security_header(&payload).unwrap();
        assert_eq!(flags, SEC_INFO_PKT);
        assert_eq!(rest, &[1, 2, 3]);
    }

    #[test]
    fn license_error_shape() {
        let pdu = build_license_error_valid_client();
        assert_eq!(u16::from_le_bytes([pdu[0], pdu[1]]), SEC_LICENSE_PKT);
        assert_eq!(pdu[4], 0xFF);
        assert_eq!(&pdu[8..12], &7u32.to_le_bytes());
        assert_eq!(pdu.len(), 20);
    }
}
