//! GCC conference create blobs: client data block parsing and the
//! server response.

use super::{utf16_to_string, ReadCursor, RdpError};

const CS_CORE: u16 = 0xC001;
const CS_SECURITY: u16 = 0xC002;
const CS_NET: u16 = 0xC003;
const CS_CLUSTER: u16 = 0xC004;

const SC_CORE: u16 = 0x0C01;
const SC_SECURITY: u16 = 0x0C02;
const SC_NET: u16 = 0x0C03;

/// RNS_UD_CS_SUPPORT_DYNVC_GFX_PROTOCOL in earlyCapabilityFlags.
pub const EARLY_CAP_SUPPORT_DYNVC_GFX: u16 = 0x0100;

pub const RNS_UD_COLOR_16BPP_565: u16 = 0xCA03;
pub const RNS_UD_COLOR_24BPP: u16 = 0xCA01;

#[derive(Debug, Clone)]
pub struct ClientChannelDef {
    pub name: String,
    pub options: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ClientGccData {
    pub version: u32,
    pub desktop_width: u32,
    pub desktop_height: u32,
    pub color_depth: u32,
    pub keyboard_layout: u32,
    pub keyboard_type: u32,
    pub keyboard_subtype: u32,
    pub client_name: String,
    pub client_build: u32,
    pub client_product_id: u16,
    pub client_dig_product_id: String,
    pub connection_type: u32,
    pub early_capability_flags: u16,
    pub channels: Vec<ClientChannelDef>,
    pub redirected_session_id: u32,
    pub cluster_flags: u32,
}

impl ClientGccData {
    #[must_use]
    pub fn supports_gfx(&self) -> bool {
        self.early_capability_flags & EARLY_CAP_SUPPORT_DYNVC_GFX != 0
    }
}

/// Locate the client data blocks inside a ConferenceCreateRequest: the
/// H.221 "Duca" key, then a PER length determinant, then the blocks.
fn client_blocks(blob: &[u8]) -> Result<&[u8], RdpError> {
    let marker = blob
        .windows(4)
        .position(|w| w == b"Duca")
        .ok_or(RdpError::Malformed("gcc client marker"))?;
    let mut cur = ReadCursor::new(&blob[marker + 4..], "gcc client blocks");
    let first = cur.read_u8()?;
    let length = if first & 0x80 != 0 {
        (usize::from(first & 0x7f) << 8) | usize::from(cur.read_u8()?)
    } else {
        usize::from(first)
    };
    let rest = cur.rest();
    if rest.len() < length {
        return Err(RdpError::Short("gcc client blocks"));
    }
    Ok(&rest[..length])
}

fn parse_core(data: &[u8], out: &mut ClientGccData) -> Result<(), RdpError> {
    let mut cur = ReadCursor::new(data, "cs core");
    out.version = cur.read_u32()?;
    out.desktop_width = u32::from(cur.read_u16()?);
    out.desktop_height = u32::from(cur.read_u16()?);
    cur.read_u16()?; // colorDepth (pre-beta2)
    cur.read_u16()?; // SASSequence
    out.keyboard_layout = cur.read_u32()?;
    out.client_build = cur.read_u32()?;
    out.client_name = utf16_to_string(cur.read_bytes(32)?);
    out.keyboard_type = cur.read_u32()?;
    out.keyboard_subtype = cur.read_u32()?;
    cur.read_u32()?; // keyboardFunctionKey
    cur.skip(64)?; // imeFileName

    // Everything below is optional and may be truncated at any field.
    let post_beta2 = match cur.read_u16() {
        Ok(v) => v,
        Err(_) => return Ok(()),
    };
    out.color_depth = match post_beta2 {
        RNS_UD_COLOR_16BPP_565 => 16,
        RNS_UD_COLOR_24BPP => 24,
        _ => 8,
    };
    if let Ok(product_id) = cur.read_u16() {
        out.client_product_id = product_id;
    }
    if cur.read_u32().is_err() {
        return Ok(()); // serialNumber
    }
    if let Ok(high_color) = cur.read_u16() {
        if high_color != 0 {
            out.color_depth = u32::from(high_color);
        }
    }
    if cur.read_u16().is_err() {
        return Ok(()); // supportedColorDepths
    }
    if let Ok(flags) = cur.read_u16() {
        out.early_capability_flags = flags;
        // RNS_UD_CS_WANT_32BPP_SESSION
        if flags & 0x0002 != 0 {
            out.color_depth = 32;
        }
    }
    if let Ok(dig) = cur.read_bytes(64) {
        out.client_dig_product_id = utf16_to_string(dig);
    }
    if let Ok(connection_type) = cur.read_u8() {
        out.connection_type = u32::from(connection_type);
    }
    Ok(())
}

fn parse_net(data: &[u8], out: &mut ClientGccData) -> Result<(), RdpError> {
    let mut cur = ReadCursor::new(data, "cs net");
    let count = cur.read_u32()?;
    if count > 31 {
        return Err(RdpError::Malformed("cs net channel count"));
    }
    for _ in 0..count {
        let raw = cur.read_bytes(8)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(8);
        let name = String::from_utf8_lossy(&raw[..end]).to_string();
        let options = cur.read_u32()?;
        out.channels.push(ClientChannelDef { name, options });
    }
    Ok(())
}

fn parse_cluster(data: &[u8], out: &mut ClientGccData) -> Result<(), RdpError> {
    let mut cur = ReadCursor::new(data, "cs cluster");
    out.cluster_flags = cur.read_u32()?;
    out.redirected_session_id = cur.read_u32().unwrap_or(0);
    Ok(())
}

/// Parse all client data blocks of a ConferenceCreateRequest.
pub fn parse_client_data(blob: &[u8]) -> Result<ClientGccData, RdpError> {
    let blocks = client_blocks(blob)?;
    let mut cur = ReadCursor::new(blocks, "gcc block header");
    let mut out = ClientGccData::default();

    while cur.remaining() >= 4 {
        let block_type = cur.read_u16()?;
        let block_len = usize::from(cur.read_u16()?);
        if block_len < 4 {
            return Err(RdpError::Malformed("gcc block length"));
        }
        let data = cur.read_bytes(block_len - 4)?;
        match block_type {
            CS_CORE => parse_core(data, &mut out)?,
            CS_NET => parse_net(data, &mut out)?,
            CS_CLUSTER => parse_cluster(data, &mut out)?,
            CS_SECURITY => {} // no legacy encryption
            other => {
                tracing::debug!(block_type = other, "skipping unknown gcc client block");
            }
        }
    }
    Ok(out)
}

fn per_write_length(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(&((len as u16) | 0x8000).to_be_bytes());
}

/// Build the ConferenceCreateResponse wrapping our server data blocks.
#[must_use]
pub fn build_server_data(
    requested_protocols: u32,
    channel_ids: &[u16],
    io_channel_id: u16,
) -> Vec<u8> {
    let mut blocks = Vec::new();

    // SC_CORE
    blocks.extend_from_slice(&SC_CORE.to_le_bytes());
    blocks.extend_from_slice(&12u16.to_le_bytes());
    blocks.extend_from_slice(&0x0008_0004u32.to_le_bytes()); // RDP 5+
    blocks.extend_from_slice(&requested_protocols.to_le_bytes());

    // SC_NET
    let mut net = Vec::new();
    net.extend_from_slice(&io_channel_id.to_le_bytes());
    net.extend_from_slice(&(channel_ids.len() as u16).to_le_bytes());
    for id in channel_ids {
        net.extend_from_slice(&id.to_le_bytes());
    }
    if channel_ids.len() % 2 != 0 {
        net.extend_from_slice(&[0, 0]); // pad to dword
    }
    blocks.extend_from_slice(&SC_NET.to_le_bytes());
    blocks.extend_from_slice(&((net.len() + 4) as u16).to_le_bytes());
    blocks.extend_from_slice(&net);

    // SC_SECURITY: no legacy encryption.
    blocks.extend_from_slice(&SC_SECURITY.to_le_bytes());
    blocks.extend_from_slice(&12u16.to_le_bytes());
    blocks.extend_from_slice(&0u32.to_le_bytes()); // encryptionMethod
    blocks.extend_from_slice(&0u32.to_le_bytes()); // encryptionLevel

    // T.124 ConferenceCreateResponse wrapper.
    let mut out = Vec::with_capacity(blocks.len() + 32);
    out.push(0x00); // ConnectData choice
    out.extend_from_slice(&[0x05, 0x00, 0x14, 0x7C, 0x00, 0x01]); // t124 OID
    per_write_length(&mut out, blocks.len() + 14);
    out.push(0x14); // ConferenceCreateResponse choice
    out.extend_from_slice(&[0x76, 0x0A]); // nodeID
    out.extend_from_slice(&[0x01, 0x01]); // tag
    out.push(0x00); // result: success
    out.push(0x01); // one user data set
    out.push(0xC0); // h221NonStandard key
    out.push(0x00); // key length determinant
    out.extend_from_slice(b"McDn");
    per_write_length(&mut out, blocks.len());
    out.extend_from_slice(&blocks);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdp::string_to_utf16;

    fn core_block(width: u16, height: u16, early_flags: u16) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&0x0008_0004u32.to_le_bytes()); // version
        data.extend_from_slice(&width.to_le_bytes());
        data.extend_from_slice(&height.to_le_bytes());
        data.extend_from_slice(&0xCA01u16.to_le_bytes()); // colorDepth
        data.extend_from_slice(&0xAA03u16.to_le_bytes()); // SASSequence
        data.extend_from_slice(&0x0409u32.to_le_bytes()); // kbd layout
        data.extend_from_slice(&2600u32.to_le_bytes()); // clientBuild
        let mut name = string_to_utf16("testbox");
        name.resize(32, 0);
        data.extend_from_slice(&name);
        data.extend_from_slice(&4u32.to_le_bytes()); // keyboardType
        data.extend_from_slice(&0u32.to_le_bytes()); // subtype
        data.extend_from_slice(&12u32.to_le_bytes()); // fn keys
        data.extend_from_slice(&[0u8; 64]); // imeFileName
        data.extend_from_slice(&RNS_UD_COLOR_24BPP.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes()); // clientProductId
        data.extend_from_slice(&0u32.to_le_bytes()); // serial
        data.extend_from_slice(&24u16.to_le_bytes()); // highColorDepth
        data.extend_from_slice(&0x0007u16.to_le_bytes()); // supportedColorDepths
        data.extend_from_slice(&(early_flags | 0x0002).to_le_bytes());
        let mut dig = string_to_utf16("rdesktop");
        dig.resize(64, 0);
        data.extend_from_slice(&dig);
        data.push(6); // connectionType: LAN
        data.push(0); // pad

        let mut block = Vec::new();
        block.extend_from_slice(&CS_CORE.to_le_bytes());
        block.extend_from_slice(&((data.len() + 4) as u16).to_le_bytes());
        block.extend_from_slice(&data);
        block
    }

    fn wrap_request(blocks: &[u8]) -> Vec<u8> {
        let mut blob = vec![0x00, 0x05, 0x00, 0x14, 0x7C, 0x00, 0x01];
        blob.extend_from_slice(b"\x2a\x76\x0a"); // arbitrary preamble
        blob.extend_from_slice(b"Duca");
        blob.extend_from_slice(&((blocks.len() as u16) | 0x8000).to_be_bytes());
        blob.extend_from_slice(blocks);
        blob
    }

    #[test]
    fn parses_core_and_net() {
        let mut blocks = core_block(1920, 1080, EARLY_CAP_SUPPORT_DYNVC_GFX);

        let mut net = Vec::new();
        net.extend_from_slice(&2u32.to_le_bytes());
        net.extend_from_slice(b"cliprdr\0");
        net.extend_from_slice(&0x80000000u32.to_le_bytes());
        net.extend_from_slice(b"drdynvc\0");
        net.extend_from_slice(&0x80000000u32.to_le_bytes());
        blocks.extend_from_slice(&CS_NET.to_le_bytes());
        blocks.extend_from_slice(&((net.len() + 4) as u16).to_le_bytes());
        blocks.extend_from_slice(&net);

        let parsed = parse_client_data(&wrap_request(&blocks)).unwrap();
        assert_eq!(parsed.desktop_width, 1920);
        assert_eq!(parsed.desktop_height, 1080);
        assert_eq!(parsed.color_depth, 32); // WANT_32BPP_SESSION
        assert_eq!(parsed.client_name, "testbox");
        assert_eq!(parsed.client_dig_product_id, "rdesktop");
        assert_eq!(parsed.connection_type, 6);
        assert!(parsed.supports_gfx());
        assert_eq!(parsed.channels.len(), 2);
        assert_eq!(parsed.channels[1].name, "drdynvc");
    }

    #[test]
    fn server_data_block_layout() {
        let blob = build_server_data(1, &[1004, 1005, 1006], 1003);
        // The wrapper starts with the t124 object identifier.
        assert_eq!(&blob[1..7], &[0x05, 0x00, 0x14, 0x7C, 0x00, 0x01]);
        let mcdn = blob.windows(4).position(|w| w == b"McDn").unwrap();
        let blocks = &blob[mcdn + 6..];
        assert_eq!(u16::from_le_bytes([blocks[0], blocks[1]]), SC_CORE);
        // SC_NET carries the io channel and the three SVC ids, padded.
        let net = blob
            .windows(2)
            .position(|w| u16::from_le_bytes([w[0], w[1]]) == SC_NET)
            .unwrap();
        let io = u16::from_le_bytes([blob[net + 4], blob[net + 5]]);
        assert_eq!(io, 1003);
    }
}
