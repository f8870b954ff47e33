//! T.125 MCS: BER-encoded connect PDUs and the PER-encoded domain PDUs
//! of the established channel layer.

use super::{ReadCursor, RdpError};

pub const IO_CHANNEL_ID: u16 = 1003;
pub const USER_CHANNEL_BASE: u16 = 1001;
pub const SERVER_USER_ID: u16 = 1002;
/// First dynamically assigned SVC channel id.
pub const SVC_CHANNEL_BASE: u16 = 1004;

/* BER helpers (definite lengths only) */

fn ber_read_length(cur: &mut ReadCursor<'_>) -> Result<usize, RdpError> {
    let b = cur.read_u8()?;
    if b & 0x80 == 0 {
        return Ok(usize::from(b));
    }
    match b & 0x7f {
        1 => Ok(usize::from(cur.read_u8()?)),
        2 => Ok(usize::from(cur.read_u16_be()?)),
        _ => Err(RdpError::Malformed("ber length")),
    }
}

fn ber_write_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else if len < 0x100 {
        out.push(0x81);
        out.push(len as u8);
    } else {
        out.push(0x82);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    }
}

fn ber_expect_tag(cur: &mut ReadCursor<'_>, tag: u8) -> Result<usize, RdpError> {
    if cur.read_u8()? != tag {
        return Err(RdpError::Malformed("ber tag"));
    }
    ber_read_length(cur)
}

fn ber_expect_application_tag(cur: &mut ReadCursor<'_>, tag: u8) -> Result<usize, RdpError> {
    // Constructed application class with a two-byte tag form.
    if cur.read_u8()? != 0x7f || cur.read_u8()? != 0x60 | tag {
        return Err(RdpError::Malformed("ber application tag"));
    }
    ber_read_length(cur)
}

const BER_TAG_BOOLEAN: u8 = 0x01;
const BER_TAG_INTEGER: u8 = 0x02;
const BER_TAG_OCTET_STRING: u8 = 0x04;
const BER_TAG_ENUMERATED: u8 = 0x0A;
const BER_TAG_SEQUENCE: u8 = 0x30;

const MCS_TAG_CONNECT_INITIAL: u8 = 101;
const MCS_TAG_CONNECT_RESPONSE: u8 = 102;

fn ber_write_integer(out: &mut Vec<u8>, value: u32) {
    out.push(BER_TAG_INTEGER);
    if value <= 0x7f {
        out.push(1);
        out.push(value as u8);
    } else if value <= 0x7fff {
        out.push(2);
        out.extend_from_slice(&(value as u16).to_be_bytes());
    } else {
        out.push(4);
        out.extend_from_slice(&value.to_be_bytes());
    }
}

/// Extract the GCC conference-create blob from an MCS Connect Initial.
pub fn parse_connect_initial(payload: &[u8]) -> Result<Vec<u8>, RdpError> {
    let mut cur = ReadCursor::new(payload, "mcs connect initial");
    ber_expect_application_tag(&mut cur, MCS_TAG_CONNECT_INITIAL)?;

    // callingDomainSelector, calledDomainSelector
    for _ in 0..2 {
        let len = ber_expect_tag(&mut cur, BER_TAG_OCTET_STRING)?;
        cur.skip(len)?;
    }
    // upwardFlag
    let len = ber_expect_tag(&mut cur, BER_TAG_BOOLEAN)?;
    cur.skip(len)?;
    // target/minimum/maximum DomainParameters
    for _ in 0..3 {
        let len = ber_expect_tag(&mut cur, BER_TAG_SEQUENCE)?;
        cur.skip(len)?;
    }
    // userData holds the GCC ConferenceCreateRequest.
    let len = ber_expect_tag(&mut cur, BER_TAG_OCTET_STRING)?;
    Ok(cur.read_bytes(len)?.to_vec())
}

fn write_domain_parameters(out: &mut Vec<u8>) {
    let mut body = Vec::new();
    ber_write_integer(&mut body, 34); // maxChannelIds
    ber_write_integer(&mut body, 3); // maxUserIds
    ber_write_integer(&mut body, 0); // maxTokenIds
    ber_write_integer(&mut body, 1); // numPriorities
    ber_write_integer(&mut body, 0); // minThroughput
    ber_write_integer(&mut body, 1); // maxHeight
    ber_write_integer(&mut body, 0xfff8); // maxMCSPDUsize
    ber_write_integer(&mut body, 2); // protocolVersion
    out.push(BER_TAG_SEQUENCE);
    ber_write_length(out, body.len());
    out.extend_from_slice(&body);
}

/// Build an MCS Connect Response wrapping the GCC response blob.
#[must_use]
pub fn build_connect_response(gcc_blob: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(BER_TAG_ENUMERATED); // result: rt-successful
    body.push(1);
    body.push(0);
    ber_write_integer(&mut body, 0); // calledConnectId
    write_domain_parameters(&mut body);
    body.push(BER_TAG_OCTET_STRING);
    ber_write_length(&mut body, gcc_blob.len());
    body.extend_from_slice(gcc_blob);

    let mut out = Vec::with_capacity(body.len() + 8);
    out.push(0x7f);
    out.push(0x60 | MCS_TAG_CONNECT_RESPONSE);
    ber_write_length(&mut out, body.len());
    out.extend_from_slice(&body);
    out
}

/* Domain PDUs (PER) */

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainPdu<'a> {
    ErectDomainRequest,
    AttachUserRequest,
    ChannelJoinRequest { initiator: u16, channel_id: u16 },
    SendDataRequest { initiator: u16, channel_id: u16, data: &'a [u8] },
    DisconnectProviderUltimatum { reason: u8 },
}

/// Parse one domain PDU (X.224 data payload).
pub fn parse_domain_pdu(payload: &'_ [u8]) -> Result<DomainPdu<'_>, RdpError> {
    let mut cur = ReadCursor::new(payload, "mcs domain pdu");
    let first = cur.read_u8()?;
    let choice = first >> 2;
    match choice {
        1 => Ok(DomainPdu::ErectDomainRequest),
        8 => {
            // Reason is split across the choice byte and the next one.
            let b = cur.read_u8().unwrap_or(0);
            let reason = ((first & 0x01) << 2) | (b >> 6);
            Ok(DomainPdu::DisconnectProviderUltimatum { reason })
        }
        10 => Ok(DomainPdu::AttachUserRequest),
        14 => {
            let initiator = cur.read_u16_be()? + USER_CHANNEL_BASE;
            let channel_id = cur.read_u16_be()?;
            Ok(DomainPdu::ChannelJoinRequest {
                initiator,
                channel_id,
            })
        }
        25 => {
            let initiator = cur.read_u16_be()? + USER_CHANNEL_BASE;
            let channel_id = cur.read_u16_be()?;
            cur.skip(1)?; // dataPriority + segmentation
            let first_len = cur.read_u8()?;
            let length = if first_len & 0x80 != 0 {
                (usize::from(first_len & 0x7f) << 8) | usize::from(cur.read_u8()?)
            } else {
                usize::from(first_len)
            };
            let data = cur.read_bytes(length)?;
            Ok(DomainPdu::SendDataRequest {
                initiator,
                channel_id,
                data,
            })
        }
        _ => Err(RdpError::Malformed("mcs domain pdu choice")),
    }
}

/// Attach User Confirm granting `user_id`.
#[must_use]
pub fn build_attach_user_confirm(user_id: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    out.push((11 << 2) | 2); // choice + initiator present
    out.push(0); // result successful
    out.extend_from_slice(&(user_id - USER_CHANNEL_BASE).to_be_bytes());
    out
}

/// Channel Join Confirm for `channel_id`.
#[must_use]
pub fn build_channel_join_confirm(user_id: u16, channel_id: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.push((15 << 2) | 2); // choice + channelId present
    out.push(0); // result successful
    out.extend_from_slice(&(user_id - USER_CHANNEL_BASE).to_be_bytes());
    out.extend_from_slice(&channel_id.to_be_bytes());
    out.extend_from_slice(&channel_id.to_be_bytes());
    out
}

/// Send Data Indication header for `data_len` payload bytes.
#[must_use]
pub fn build_send_data_indication_header(channel_id: u16, data_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.push(26 << 2);
    out.extend_from_slice(&(SERVER_USER_ID - USER_CHANNEL_BASE).to_be_bytes());
    out.extend_from_slice(&channel_id.to_be_bytes());
    out.push(0x70); // dataPriority high, segmentation begin|end
    out.extend_from_slice(&((data_len as u16) | 0x8000).to_be_bytes());
    out
}

/// Disconnect Provider Ultimatum (reason rn-user-requested).
#[must_use]
pub fn build_disconnect_provider_ultimatum() -> Vec<u8> {
    // choice 8, reason 3 (rn-user-requested) spread over two bytes.
    vec![(8 << 2) | 0, 3 << 6]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_initial_roundtrip() {
        // Build a minimal Connect Initial by hand and re-extract the blob.
        let blob = b"gcc-blob-bytes".to_vec();
        let mut body = Vec::new();
        body.extend_from_slice(&[BER_TAG_OCTET_STRING, 1, 0x01]); // calling
        body.extend_from_slice(&[BER_TAG_OCTET_STRING, 1, 0x01]); // called
        body.extend_from_slice(&[BER_TAG_BOOLEAN, 1, 0xff]); // upward
        for _ in 0..3 {
            let mut params = Vec::new();
            write_domain_parameters(&mut params);
            body.extend_from_slice(&params);
        }
        body.push(BER_TAG_OCTET_STRING);
        ber_write_length(&mut body, blob.len());
        body.extend_from_slice(&blob);

        let mut pdu = vec![0x7f, 0x60 | MCS_TAG_CONNECT_INITIAL];
        ber_write_length(&mut pdu, body.len());
        pdu.extend_from_slice(&body);

        assert_eq!(parse_connect_initial(&pdu).unwrap(), blob);
    }

    #[test]
    fn domain_pdus_parse() {
        assert_eq!(
            parse_domain_pdu(&[1 << 2]).unwrap(),
            DomainPdu::ErectDomainRequest
        );
        assert_eq!(
            parse_domain_pdu(&[10 << 2]).unwrap(),
            DomainPdu::AttachUserRequest
        );
        let join = [14 << 2, 0x00, 0x01, 0x03, 0xEB];
        assert_eq!(
            parse_domain_pdu(&join).unwrap(),
            DomainPdu::ChannelJoinRequest {
                initiator: 1002,
                channel_id: 1003
            }
        );
    }

    #[test]
    fn send_data_request_short_and_long_length() {
        let mut pdu = vec![25 << 2, 0x00, 0x01, 0x03, 0xEB, 0x70, 3];
        pdu.extend_from_slice(b"abc");
        match parse_domain_pdu(&pdu).unwrap() {
            DomainPdu::SendDataRequest {
                initiator,
                channel_id,
                data,
            } => {
                assert_eq!(initiator, 1002);
                assert_eq!(channel_id, 1003);
                assert_eq!(data, b"abc");
            }
            other => panic!("unexpected {other:?}"),
        }

        let payload = vec![0xAA; 0x90];
        let mut pdu = vec![25 << 2, 0x00, 0x01, 0x03, 0xEB, 0x70, 0x80, 0x90];
        pdu.extend_from_slice(&payload);
        match parse_domain_pdu(&pdu).unwrap() {
            DomainPdu::SendDataRequest { data, .. } => assert_eq!(data.len(), 0x90),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn indication_header_length_flag() {
        let hdr = build_send_data_indication_header(IO_CHANNEL_ID, 0x1234);
        assert_eq!(hdr[0] >> 2, 26);
        assert_eq!(u16::from_be_bytes([hdr[3], hdr[4]]), IO_CHANNEL_ID);
        assert_eq!(u16::from_be_bytes([hdr[6], hdr[7]]), 0x9234);
    }
}
