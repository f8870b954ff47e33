//! The per-connection RDP protocol driver.
//!
//! Sans-io: the runloop calls [`RdpPeer::drive_input`] on read readiness
//! and [`RdpPeer::flush`] on write readiness; everything else appends to
//! the transmit queue. TLS (when negotiated) is a rustls
//! `ServerConnection` pumped by the same two entry points.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use bytes::BytesMut;

use super::caps::{self, ClientCapabilities};
use super::gcc::{self, ClientGccData};
use super::input::{self, InputEvent};
use super::mcs::{self, DomainPdu};
use super::sec::{self, ClientInfo};
use super::update;
use super::x224;
use super::{tpkt, ReadCursor, RdpError};
use tessera_encode::Rect;

/* share control PDU types */
const PDUTYPE_DEMAND_ACTIVE: u16 = 1;
const PDUTYPE_CONFIRM_ACTIVE: u16 = 3;
const PDUTYPE_DEACTIVATE_ALL: u16 = 6;
const PDUTYPE_DATA: u16 = 7;

/* share data PDU types */
const PDUTYPE2_UPDATE: u8 = 2;
const PDUTYPE2_CONTROL: u8 = 20;
const PDUTYPE2_INPUT: u8 = 28;
const PDUTYPE2_SYNCHRONIZE: u8 = 31;
const PDUTYPE2_REFRESH_RECT: u8 = 33;
const PDUTYPE2_SUPPRESS_OUTPUT: u8 = 35;
const PDUTYPE2_SHUTDOWN_REQUEST: u8 = 36;
const PDUTYPE2_FONTLIST: u8 = 39;
const PDUTYPE2_FONTMAP: u8 = 40;
const PDUTYPE2_FRAME_ACKNOWLEDGE: u8 = 56;

const CTRLACTION_REQUEST_CONTROL: u16 = 1;
const CTRLACTION_GRANTED_CONTROL: u16 = 2;
const CTRLACTION_COOPERATE: u16 = 4;

pub const CHANNEL_FLAG_FIRST: u32 = 0x01;
pub const CHANNEL_FLAG_LAST: u32 = 0x02;
pub const CHANNEL_FLAG_SHOW_PROTOCOL: u32 = 0x10;

/// Server → client channel chunk size (we advertise this in the VC
/// capability set).
pub const VC_CHUNK_SIZE: usize = 1600;

const SHARE_ID: u32 = 0x0001_03EA;

/// ERRCONNECT_PRE_CONNECT_FAILED, what a failed logon maps to.
pub const ERRINFO_PRE_CONNECT_FAILED: u32 = 0x0001_0002;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SequenceState {
    WaitingNego,
    WaitingConnectInitial,
    WaitingErect,
    WaitingAttach,
    WaitingJoins,
    WaitingInfo,
    /// Client info arrived; the owner is authenticating via ICP.
    WaitingLogon,
    WaitingConfirmActive,
    Finalization,
    Active,
}

/// A static channel the client asked to join.
#[derive(Debug, Clone)]
pub struct ChannelDef {
    pub name: String,
    pub id: u16,
    pub options: u32,
    pub joined: bool,
}

/// What the protocol layer hands up to the connection logic.
#[derive(Debug)]
pub enum PeerEvent {
    /// Client info received; authenticate and then call
    /// [`RdpPeer::proceed_after_logon`].
    PostConnect,
    /// Capability exchange plus finalization finished (again, on
    /// reactivation).
    Activated,
    Input(InputEvent),
    FrameAck(u32),
    /// `allow` with the repaint rect, or a full suppress.
    SuppressOutput { allow: bool },
    /// Exclusive rects, clamped by the caller.
    RefreshRect(Vec<Rect>),
    ChannelData {
        channel_id: u16,
        flags: u32,
        total_size: usize,
        chunk: Vec<u8>,
    },
    ShutdownRequest,
    Disconnected,
}

pub struct RdpPeer {
    stream: TcpStream,
    tls: Option<rustls::ServerConnection>,
    tls_config: Option<Arc<rustls::ServerConfig>>,

    rx: BytesMut,
    tx: VecDeque<u8>,
    write_blocked: bool,
    bytes_sent: u64,
    state: SequenceState,

    pub gcc: ClientGccData,
    pub client_info: Option<ClientInfo>,
    pub caps: ClientCapabilities,
    pub channels: Vec<ChannelDef>,
    pub selected_protocol: u32,

    /// Size the next demand active announces (resizes update it).
    demand_width: u32,
    demand_height: u32,
    demand_depth: u32,
    rfx_offered: bool,

    finalize_synced: bool,
    finalize_cooperated: bool,
}

impl RdpPeer {
    pub fn new(stream: TcpStream, tls_config: Option<Arc<rustls::ServerConfig>>) -> RdpPeer {
        RdpPeer {
            stream,
            tls: None,
            tls_config,
            rx: BytesMut::with_capacity(0x10000),
            tx: VecDeque::new(),
            write_blocked: false,
            bytes_sent: 0,
            state: SequenceState::WaitingNego,
            gcc: ClientGccData::default(),
            client_info: None,
            caps: ClientCapabilities::default(),
            channels: Vec::new(),
            selected_protocol: x224::PROTOCOL_RDP,
            demand_width: 0,
            demand_height: 0,
            demand_depth: 32,
            rfx_offered: false,
            finalize_synced: false,
            finalize_cooperated: false,
        }
    }

    #[must_use]
    pub fn is_activated(&self) -> bool {
        self.state == SequenceState::Active
    }

    #[must_use]
    pub fn is_write_blocked(&self) -> bool {
        self.write_blocked
    }

    /// Bytes flushed toward the client since the last call (bandwidth
    /// accounting).
    pub fn take_bytes_sent(&mut self) -> u64 {
        std::mem::take(&mut self.bytes_sent)
    }

    #[must_use]
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn channel_by_name(&self, name: &str) -> Option<&ChannelDef> {
        self.channels
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /* ---------------- io pumping ---------------- */

    fn pump_socket_read(&mut self) -> Result<(), RdpError> {
        let mut buf = [0u8; 0x4000];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Err(RdpError::Disconnected),
                Ok(n) => {
                    if let Some(tls) = self.tls.as_mut() {
                        let mut slice = &buf[..n];
                        while !slice.is_empty() {
                            let read = tls
                                .read_tls(&mut slice)
                                .map_err(|_| RdpError::Protocol("tls record"))?;
                            if read == 0 {
                                break;
                            }
                            let io_state = tls.process_new_packets()?;
                            let mut plaintext = vec![0u8; io_state.plaintext_bytes_to_read()];
                            if !plaintext.is_empty() {
                                tls.reader()
                                    .read_exact(&mut plaintext)
                                    .map_err(RdpError::Io)?;
                                self.rx.extend_from_slice(&plaintext);
                            }
                        }
                    } else {
                        self.rx.extend_from_slice(&buf[..n]);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RdpError::Io(e)),
            }
        }
    }

    /// Flush queued plaintext (and TLS records). Returns `true` while
    /// bytes remain blocked on the socket.
    pub fn flush(&mut self) -> Result<bool, RdpError> {
        if let Some(tls) = self.tls.as_mut() {
            // Feed pending plaintext into the TLS session.
            while !self.tx.is_empty() {
                let (head, _) = self.tx.as_slices();
                let written = tls.writer().write(head).map_err(RdpError::Io)?;
                self.tx.drain(..written);
                self.bytes_sent += written as u64;
                if written == 0 {
                    break;
                }
            }
            loop {
                if !tls.wants_write() {
                    self.write_blocked = false;
                    return Ok(false);
                }
                match tls.write_tls(&mut self.stream) {
                    Ok(0) => return Err(RdpError::Disconnected),
                    Ok(_) => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        self.write_blocked = true;
                        return Ok(true);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(RdpError::Io(e)),
                }
            }
        }

        while !self.tx.is_empty() {
            let (head, _) = self.tx.as_slices();
            match self.stream.write(head) {
                Ok(0) => return Err(RdpError::Disconnected),
                Ok(n) => {
                    self.tx.drain(..n);
                    self.bytes_sent += n as u64;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.write_blocked = true;
                    return Ok(true);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RdpError::Io(e)),
            }
        }
        self.write_blocked = false;
        Ok(false)
    }

    fn queue(&mut self, data: &[u8]) {
        self.tx.extend(data.iter().copied());
    }

    /// Read what the socket has and process every complete frame.
    pub fn drive_input(&mut self) -> Result<Vec<PeerEvent>, RdpError> {
        self.pump_socket_read()?;

        let mut events = Vec::new();
        loop {
            let Some(frame) = tpkt::peek_frame(&self.rx)? else {
                break;
            };
            let (total, fastpath_header_len) = match frame {
                tpkt::Frame::Tpkt { total } => (total, None),
                tpkt::Frame::FastPath { header_len, total } => (total, Some(header_len)),
            };
            if self.rx.len() < total {
                break;
            }
            let frame_bytes = self.rx.split_to(total);
            match fastpath_header_len {
                None => self.process_tpkt(&frame_bytes[tpkt::TPKT_HEADER_LEN..], &mut events)?,
                Some(header_len) => {
                    let header = frame_bytes[0];
                    for ev in input::parse_fastpath_input(header, &frame_bytes[header_len..])? {
                        events.push(PeerEvent::Input(ev));
                    }
                }
            }
        }

        // Push out whatever the handlers queued.
        self.flush()?;
        Ok(events)
    }

    /* ---------------- connection sequence ---------------- */

    fn process_tpkt(&mut self, payload: &[u8], events: &mut Vec<PeerEvent>) -> Result<(), RdpError> {
        if self.state == SequenceState::WaitingNego {
            let request = x224::parse_connection_request(payload)?;
            let use_tls = request.requested_protocols & x224::PROTOCOL_SSL != 0
                && self.tls_config.is_some();
            self.selected_protocol = if use_tls {
                x224::PROTOCOL_SSL
            } else {
                x224::PROTOCOL_RDP
            };
            tracing::debug!(
                requested = request.requested_protocols,
                selected = self.selected_protocol,
                cookie = ?request.cookie_user,
                "negotiated security protocol"
            );
            let confirm = x224::build_connection_confirm(self.selected_protocol, None);
            let mut out = Vec::new();
            tpkt::write_header(&mut out, confirm.len());
            out.extend_from_slice(&confirm);
            self.queue(&out);
            self.flush()?;
            if use_tls {
                let config = self.tls_config.clone().expect("checked above");
                self.tls = Some(rustls::ServerConnection::new(config)?);
            }
            self.state = SequenceState::WaitingConnectInitial;
            return Ok(());
        }

        let x224_payload = x224::parse_data(payload)?;

        if self.state == SequenceState::WaitingConnectInitial {
            let gcc_blob = mcs::parse_connect_initial(x224_payload)?;
            self.gcc = gcc::parse_client_data(&gcc_blob)?;
            self.demand_width = self.gcc.desktop_width;
            self.demand_height = self.gcc.desktop_height;
            self.demand_depth = self.gcc.color_depth;

            let mut id = mcs::SVC_CHANNEL_BASE;
            self.channels = self
                .gcc
                .channels
                .iter()
                .map(|c| {
                    let def = ChannelDef {
                        name: c.name.clone(),
                        id,
                        options: c.options,
                        joined: false,
                    };
                    id += 1;
                    def
                })
                .collect();

            let channel_ids: Vec<u16> = self.channels.iter().map(|c| c.id).collect();
            let server_blob = gcc::build_server_data(
                u32::from(self.selected_protocol != x224::PROTOCOL_RDP),
                &channel_ids,
                mcs::IO_CHANNEL_ID,
            );
            let response = mcs::build_connect_response(&server_blob);
            self.send_x224(&response);
            self.state = SequenceState::WaitingErect;
            return Ok(());
        }

        match mcs::parse_domain_pdu(x224_payload)? {
            DomainPdu::ErectDomainRequest => {
                if self.state == SequenceState::WaitingErect {
                    self.state = SequenceState::WaitingAttach;
                }
            }
            DomainPdu::AttachUserRequest => {
                let confirm = mcs::build_attach_user_confirm(mcs::SERVER_USER_ID);
                self.send_x224(&confirm);
                self.state = SequenceState::WaitingJoins;
            }
            DomainPdu::ChannelJoinRequest { channel_id, .. } => {
                let confirm = mcs::build_channel_join_confirm(mcs::SERVER_USER_ID, channel_id);
                self.send_x224(&confirm);
                if let Some(channel) = self.channels.iter_mut().find(|c| c.id == channel_id) {
                    channel.joined = true;
                }
                // The user and io channels come first; once the io
                // channel is in, the client info may follow.
                if channel_id == mcs::IO_CHANNEL_ID {
                    self.state = SequenceState::WaitingInfo;
                }
            }
            DomainPdu::DisconnectProviderUltimatum { reason } => {
                tracing::debug!(reason, "client sent disconnect provider ultimatum");
                events.push(PeerEvent::Disconnected);
            }
            DomainPdu::SendDataRequest {
                channel_id, data, ..
            } => {
                self.process_send_data(channel_id, data, events)?;
            }
        }
        Ok(())
    }

    fn process_send_data(
        &mut self,
        channel_id: u16,
        data: &[u8],
        events: &mut Vec<PeerEvent>,
    ) -> Result<(), RdpError> {
        if channel_id != mcs::IO_CHANNEL_ID {
            // Static virtual channel traffic.
            let mut cur = ReadCursor::new(data, "channel pdu");
            let total_size = cur.read_u32()? as usize;
            let flags = cur.read_u32()?;
            events.push(PeerEvent::ChannelData {
                channel_id,
                flags,
                total_size,
                chunk: cur.rest().to_vec(),
            });
            return Ok(());
        }

        if self.state == SequenceState::WaitingInfo {
            let (flags, payload) = sec::parse_security_header(data)?;
            if flags & sec::SEC_INFO_PKT == 0 {
                return Err(RdpError::Protocol("expected client info"));
            }
            self.client_info = Some(sec::parse_client_info(payload)?);
            self.state = SequenceState::WaitingLogon;
            events.push(PeerEvent::PostConnect);
            return Ok(());
        }

        self.process_share_control(data, events)
    }

    fn process_share_control(
        &mut self,
        data: &[u8],
        events: &mut Vec<PeerEvent>,
    ) -> Result<(), RdpError> {
        let mut cur = ReadCursor::new(data, "share control header");
        let _total_length = cur.read_u16()?;
        let pdu_type = cur.read_u16()? & 0x0f;
        let _pdu_source = cur.read_u16()?;
        let body = cur.rest();

        match pdu_type {
            PDUTYPE_CONFIRM_ACTIVE => {
                if self.state != SequenceState::WaitingConfirmActive {
                    tracing::debug!("ignoring unexpected confirm active");
                    return Ok(());
                }
                self.caps = caps::parse_confirm_active(body)?;
                if self.caps.multifrag_max_request_size < 1024 {
                    return Err(RdpError::Protocol("multifrag max request size too small"));
                }
                self.finalize_synced = false;
                self.finalize_cooperated = false;
                self.state = SequenceState::Finalization;
            }
            PDUTYPE_DATA => self.process_share_data(body, events)?,
            other => {
                tracing::debug!(pdu_type = other, "ignoring share control pdu");
            }
        }
        Ok(())
    }

    fn process_share_data(
        &mut self,
        body: &[u8],
        events: &mut Vec<PeerEvent>,
    ) -> Result<(), RdpError> {
        let mut cur = ReadCursor::new(body, "share data header");
        let _share_id = cur.read_u32()?;
        cur.read_u8()?; // pad
        cur.read_u8()?; // streamId
        let _uncompressed_len = cur.read_u16()?;
        let pdu_type2 = cur.read_u8()?;
        cur.read_u8()?; // compressedType
        cur.read_u16()?; // compressedLength
        let payload = cur.rest();

        match pdu_type2 {
            PDUTYPE2_SYNCHRONIZE => {
                if self.state == SequenceState::Finalization && !self.finalize_synced {
                    self.finalize_synced = true;
                    let mut sync = Vec::with_capacity(4);
                    sync.extend_from_slice(&1u16.to_le_bytes()); // SYNCMSGTYPE_SYNC
                    sync.extend_from_slice(&mcs::SERVER_USER_ID.to_le_bytes());
                    self.send_share_data(PDUTYPE2_SYNCHRONIZE, &sync);
                }
            }
            PDUTYPE2_CONTROL => {
                let mut ctl = ReadCursor::new(payload, "control pdu");
                let action = ctl.read_u16()?;
                match action {
                    CTRLACTION_COOPERATE if self.state == SequenceState::Finalization => {
                        self.finalize_cooperated = true;
                        self.send_control(CTRLACTION_COOPERATE, 0, 0);
                    }
                    CTRLACTION_REQUEST_CONTROL if self.state == SequenceState::Finalization => {
                        self.send_control(
                            CTRLACTION_GRANTED_CONTROL,
                            mcs::SERVER_USER_ID,
                            0x03EA,
                        );
                    }
                    _ => {}
                }
            }
            PDUTYPE2_FONTLIST => {
                if self.state == SequenceState::Finalization {
                    let mut map = Vec::with_capacity(8);
                    map.extend_from_slice(&0u16.to_le_bytes()); // numberEntries
                    map.extend_from_slice(&0u16.to_le_bytes()); // totalNumEntries
                    map.extend_from_slice(&0x0003u16.to_le_bytes()); // FONTMAP_FIRST|LAST
                    map.extend_from_slice(&4u16.to_le_bytes()); // entrySize
                    self.send_share_data(PDUTYPE2_FONTMAP, &map);
                    self.state = SequenceState::Active;
                    events.push(PeerEvent::Activated);
                }
            }
            PDUTYPE2_INPUT => {
                for ev in input::parse_slowpath_input(payload)? {
                    events.push(PeerEvent::Input(ev));
                }
            }
            PDUTYPE2_REFRESH_RECT => {
                let mut refresh = ReadCursor::new(payload, "refresh rect");
                let count = refresh.read_u8()?;
                refresh.skip(3)?;
                let mut rects = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    let left = u32::from(refresh.read_u16()?);
                    let top = u32::from(refresh.read_u16()?);
                    let right = u32::from(refresh.read_u16()?);
                    let bottom = u32::from(refresh.read_u16()?);
                    // Inclusive on the wire.
                    if right < left || bottom < top {
                        continue;
                    }
                    rects.push(Rect::new(left, top, right + 1, bottom + 1));
                }
                events.push(PeerEvent::RefreshRect(rects));
            }
            PDUTYPE2_SUPPRESS_OUTPUT => {
                let mut sup = ReadCursor::new(payload, "suppress output");
                let allow = sup.read_u8()? != 0;
                sup.skip(3)?;
                // allow carries the desktop rect, suppress must not.
                if allow && sup.remaining() < 8 {
                    tracing::error!("protocol error, area must not be null");
                    return Ok(());
                }
                if !allow && sup.remaining() >= 8 {
                    tracing::error!("protocol error, area must be null");
                    return Ok(());
                }
                events.push(PeerEvent::SuppressOutput { allow });
            }
            PDUTYPE2_FRAME_ACKNOWLEDGE => {
                let mut ack = ReadCursor::new(payload, "frame acknowledge");
                events.push(PeerEvent::FrameAck(ack.read_u32()?));
            }
            PDUTYPE2_SHUTDOWN_REQUEST => {
                events.push(PeerEvent::ShutdownRequest);
            }
            PDUTYPE2_UPDATE => {} // never sent client→server
            other => {
                tracing::debug!(pdu_type2 = other, "ignoring share data pdu");
            }
        }
        Ok(())
    }

    /* ---------------- output helpers ---------------- */

    fn send_x224(&mut self, payload: &[u8]) {
        let mut out = Vec::with_capacity(payload.len() + 7);
        tpkt::write_header(&mut out, payload.len() + 3);
        x224::write_data_header(&mut out);
        out.extend_from_slice(payload);
        self.queue(&out);
    }

    fn send_mcs_io(&mut self, payload: &[u8]) {
        let header = mcs::build_send_data_indication_header(mcs::IO_CHANNEL_ID, payload.len());
        let mut body = Vec::with_capacity(header.len() + payload.len());
        body.extend_from_slice(&header);
        body.extend_from_slice(payload);
        self.send_x224(&body);
    }

    fn send_share_control(&mut self, pdu_type: u16, body: &[u8]) {
        let total = body.len() + 6;
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&(total as u16).to_le_bytes());
        out.extend_from_slice(&(pdu_type | 0x10).to_le_bytes());
        out.extend_from_slice(&mcs::SERVER_USER_ID.to_le_bytes());
        out.extend_from_slice(body);
        self.send_mcs_io(&out);
    }

    fn send_share_data(&mut self, pdu_type2: u8, body: &[u8]) {
        let mut data = Vec::with_capacity(body.len() + 12);
        data.extend_from_slice(&SHARE_ID.to_le_bytes());
        data.push(0); // pad
        data.push(1); // STREAM_LOW
        data.extend_from_slice(&((body.len() + 12) as u16).to_le_bytes());
        data.push(pdu_type2);
        data.push(0); // compressedType
        data.extend_from_slice(&0u16.to_le_bytes()); // compressedLength
        data.extend_from_slice(body);
        self.send_share_control(PDUTYPE_DATA, &data);
    }

    fn send_control(&mut self, action: u16, grant_id: u16, control_id: u32) {
        let mut body = Vec::with_capacity(8);
        body.extend_from_slice(&action.to_le_bytes());
        body.extend_from_slice(&grant_id.to_le_bytes());
        body.extend_from_slice(&control_id.to_le_bytes());
        self.send_share_data(PDUTYPE2_CONTROL, &body);
    }

    fn send_demand_active(&mut self) {
        let capsets = caps::build_server_capsets(
            self.demand_width,
            self.demand_height,
            self.demand_depth,
            0xFFFF,
            self.rfx_offered,
        );
        let combined: usize = capsets.iter().map(Vec::len).sum();

        let mut body = Vec::with_capacity(combined + 32);
        body.extend_from_slice(&SHARE_ID.to_le_bytes());
        body.extend_from_slice(&4u16.to_le_bytes()); // lengthSourceDescriptor
        body.extend_from_slice(&((combined + 4) as u16).to_le_bytes());
        body.extend_from_slice(b"RDP\0");
        body.extend_from_slice(&(capsets.len() as u16).to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes()); // pad
        for set in &capsets {
            body.extend_from_slice(set);
        }
        body.extend_from_slice(&0u32.to_le_bytes()); // sessionId
        self.send_share_control(PDUTYPE_DEMAND_ACTIVE, &body);
        self.state = SequenceState::WaitingConfirmActive;
    }

    /// Logon succeeded: run licensing and capability exchange.
    pub fn proceed_after_logon(&mut self, rfx_offered: bool) -> Result<(), RdpError> {
        if self.state != SequenceState::WaitingLogon {
            return Err(RdpError::Protocol("not waiting for logon"));
        }
        self.rfx_offered = rfx_offered;
        let license = sec::build_license_error_valid_client();
        self.send_mcs_io(&license);
        self.send_demand_active();
        self.flush()?;
        Ok(())
    }

    /// Kick off a deactivation-reactivation to resize the session.
    pub fn start_resize(&mut self, width: u32, height: u32) -> Result<(), RdpError> {
        self.demand_width = width;
        self.demand_height = height;
        let mut body = Vec::with_capacity(8);
        body.extend_from_slice(&SHARE_ID.to_le_bytes());
        body.extend_from_slice(&1u16.to_le_bytes());
        body.push(0);
        self.send_share_control(PDUTYPE_DEACTIVATE_ALL, &body);
        self.send_demand_active();
        self.flush()?;
        Ok(())
    }

    /// Force the color depth for the next (re)activation.
    pub fn set_color_depth(&mut self, depth: u32) {
        self.demand_depth = depth;
    }

    #[must_use]
    pub fn desktop_size(&self) -> (u32, u32) {
        (self.demand_width, self.demand_height)
    }

    /// Append a raw fastpath-update blob produced by the update writers.
    pub fn queue_update(&mut self, data: &[u8]) {
        self.queue(data);
    }

    pub fn send_play_sound(&mut self, duration: u32, frequency: u32) {
        let body = update::build_play_sound(duration, frequency);
        self.send_share_data(update::PDUTYPE2_PLAY_SOUND, &body);
    }

    pub fn send_keyboard_indicators(&mut self, led_flags: u16) {
        let body = update::build_set_keyboard_indicators(led_flags);
        self.send_share_data(update::PDUTYPE2_SET_KEYBOARD_INDICATORS, &body);
    }

    pub fn send_error_info(&mut self, error_info: u32) {
        let body = update::build_set_error_info(error_info);
        self.send_share_data(update::PDUTYPE2_SET_ERROR_INFO_PDU, &body);
    }

    /// Send bytes to a static virtual channel, chunked and flagged.
    pub fn send_channel_data(&mut self, channel_id: u16, data: &[u8]) {
        let total = data.len();
        let mut offset = 0;
        while offset < total {
            let end = (offset + VC_CHUNK_SIZE).min(total);
            let mut flags = 0;
            if offset == 0 {
                flags |= CHANNEL_FLAG_FIRST;
            }
            if end == total {
                flags |= CHANNEL_FLAG_LAST;
            }
            let mut payload = Vec::with_capacity(8 + end - offset);
            payload.extend_from_slice(&(total as u32).to_le_bytes());
            payload.extend_from_slice(&flags.to_le_bytes());
            payload.extend_from_slice(&data[offset..end]);

            let header = mcs::build_send_data_indication_header(channel_id, payload.len());
            let mut body = Vec::with_capacity(header.len() + payload.len());
            body.extend_from_slice(&header);
            body.extend_from_slice(&payload);
            self.send_x224(&body);
            offset = end;
        }
    }

    /// MCS-level goodbye before closing the socket.
    pub fn send_disconnect(&mut self) {
        let pdu = mcs::build_disconnect_provider_ultimatum();
        self.send_x224(&pdu);
        let _ = self.flush();
    }
}

impl std::fmt::Debug for RdpPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdpPeer")
            .field("state", &self.state)
            .field("tls", &self.tls.is_some())
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdp::caps::{CAPSET_BITMAP, CAPSET_MULTIFRAGMENT_UPDATE};
    use std::io::{Read as _, Write as _};
    use std::net::{TcpListener, TcpStream};

    fn pair() -> (RdpPeer, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (RdpPeer::new(server, None), client)
    }

    fn send(client: &mut TcpStream, payload: &[u8]) {
        let mut out = Vec::new();
        tpkt::write_header(&mut out, payload.len());
        out.extend_from_slice(&payload[..]);
        client.write_all(&out).unwrap();
    }

    fn send_x224(client: &mut TcpStream, payload: &[u8]) {
        let mut body = vec![2, 0xF0, 0x80];
        body.extend_from_slice(payload);
        send(client, &body);
    }

    fn send_data_request(client: &mut TcpStream, channel: u16, payload: &[u8]) {
        let mut pdu = vec![25 << 2];
        pdu.extend_from_slice(&1u16.to_be_bytes()); // initiator 1002
        pdu.extend_from_slice(&channel.to_be_bytes());
        pdu.push(0x70);
        pdu.push(0x80 | ((payload.len() >> 8) as u8));
        pdu.push((payload.len() & 0xff) as u8);
        pdu.extend_from_slice(payload);
        send_x224(client, &pdu);
    }

    fn drain_server_output(client: &mut TcpStream) -> Vec<u8> {
        client.set_nonblocking(true).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match client.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        client.set_nonblocking(false).unwrap();
        out
    }

    fn connection_request() -> Vec<u8> {
        let mut payload = vec![0u8; 7];
        payload[0] = 6 + 8;
        payload[1] = 0xE0;
        payload.extend_from_slice(&[0x01, 0x00]); // RDP_NEG_REQ
        payload.extend_from_slice(&8u16.to_le_bytes());
        payload.extend_from_slice(&x224::PROTOCOL_RDP.to_le_bytes());
        payload
    }

    fn gcc_core_block() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&0x0008_0004u32.to_le_bytes());
        data.extend_from_slice(&1024u16.to_le_bytes());
        data.extend_from_slice(&768u16.to_le_bytes());
        data.extend_from_slice(&0xCA01u16.to_le_bytes());
        data.extend_from_slice(&0xAA03u16.to_le_bytes());
        data.extend_from_slice(&0x0409u32.to_le_bytes());
        data.extend_from_slice(&2600u32.to_le_bytes());
        data.extend_from_slice(&[0u8; 32]); // clientName
        data.extend_from_slice(&4u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&12u32.to_le_bytes());
        data.extend_from_slice(&[0u8; 64]); // imeFileName
        data.extend_from_slice(&0xCA01u16.to_le_bytes()); // postBeta2ColorDepth
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&24u16.to_le_bytes()); // highColorDepth
        data.extend_from_slice(&0x0007u16.to_le_bytes());
        data.extend_from_slice(&0x0002u16.to_le_bytes()); // WANT_32BPP
        data.extend_from_slice(&[0u8; 64]); // clientDigProductId
        data.push(6); // LAN
        data.push(0);

        let mut block = Vec::new();
        block.extend_from_slice(&0xC001u16.to_le_bytes());
        block.extend_from_slice(&((data.len() + 4) as u16).to_le_bytes());
        block.extend_from_slice(&data);
        block
    }

    fn connect_initial() -> Vec<u8> {
        let mut blocks = gcc_core_block();
        // One channel: cliprdr.
        let mut net = Vec::new();
        net.extend_from_slice(&1u32.to_le_bytes());
        net.extend_from_slice(b"cliprdr\0");
        net.extend_from_slice(&0x8000_0000u32.to_le_bytes());
        blocks.extend_from_slice(&0xC003u16.to_le_bytes());
        blocks.extend_from_slice(&((net.len() + 4) as u16).to_le_bytes());
        blocks.extend_from_slice(&net);

        let mut gcc_blob = vec![0x00, 0x05, 0x00, 0x14, 0x7C, 0x00, 0x01, 0x2A];
        gcc_blob.extend_from_slice(b"Duca");
        gcc_blob.extend_from_slice(&((blocks.len() as u16) | 0x8000).to_be_bytes());
        gcc_blob.extend_from_slice(&blocks);

        // Minimal BER Connect Initial around the blob.
        let mut body = Vec::new();
        body.extend_from_slice(&[0x04, 1, 0x01]); // calling selector
        body.extend_from_slice(&[0x04, 1, 0x01]); // called selector
        body.extend_from_slice(&[0x01, 1, 0xFF]); // upwardFlag
        for _ in 0..3 {
            body.extend_from_slice(&[0x30, 2, 0x02, 0x00]); // domain params
        }
        body.push(0x04);
        body.push(0x82);
        body.extend_from_slice(&(gcc_blob.len() as u16).to_be_bytes());
        body.extend_from_slice(&gcc_blob);

        let mut pdu = vec![0x7F, 0x65, 0x82];
        pdu.extend_from_slice(&(body.len() as u16).to_be_bytes());
        pdu.extend_from_slice(&body);
        pdu
    }

    fn client_info() -> Vec<u8> {
        let mut info = Vec::new();
        info.extend_from_slice(&sec::SEC_INFO_PKT.to_le_bytes());
        info.extend_from_slice(&0u16.to_le_bytes());
        info.extend_from_slice(&0u32.to_le_bytes()); // codePage
        info.extend_from_slice(&0x0000_0010u32.to_le_bytes()); // INFO_UNICODE
        for _ in 0..5 {
            info.extend_from_slice(&0u16.to_le_bytes()); // cb* lengths
        }
        for _ in 0..5 {
            info.extend_from_slice(&[0, 0]); // terminators
        }
        info
    }

    fn confirm_active() -> Vec<u8> {
        let mut bitmap = Vec::new();
        bitmap.extend_from_slice(&32u16.to_le_bytes());
        bitmap.extend_from_slice(&[0u8; 6]);
        bitmap.extend_from_slice(&1024u16.to_le_bytes());
        bitmap.extend_from_slice(&768u16.to_le_bytes());
        bitmap.extend_from_slice(&0u16.to_le_bytes());
        bitmap.extend_from_slice(&1u16.to_le_bytes());

        let mut multifrag = Vec::new();
        multifrag.extend_from_slice(&65535u32.to_le_bytes());

        let mut capsets = Vec::new();
        for (set_type, body) in [
            (CAPSET_BITMAP, bitmap),
            (CAPSET_MULTIFRAGMENT_UPDATE, multifrag),
        ] {
            capsets.extend_from_slice(&set_type.to_le_bytes());
            capsets.extend_from_slice(&((body.len() + 4) as u16).to_le_bytes());
            capsets.extend_from_slice(&body);
        }

        let mut body = Vec::new();
        body.extend_from_slice(&SHARE_ID.to_le_bytes());
        body.extend_from_slice(&1002u16.to_le_bytes());
        body.extend_from_slice(&4u16.to_le_bytes());
        body.extend_from_slice(&((capsets.len() + 4) as u16).to_le_bytes());
        body.extend_from_slice(b"TEST");
        body.extend_from_slice(&2u16.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&capsets);

        let mut pdu = Vec::new();
        pdu.extend_from_slice(&((body.len() + 6) as u16).to_le_bytes());
        pdu.extend_from_slice(&(PDUTYPE_CONFIRM_ACTIVE | 0x10).to_le_bytes());
        pdu.extend_from_slice(&1002u16.to_le_bytes());
        pdu.extend_from_slice(&body);
        pdu
    }

    fn share_data(pdu_type2: u8, body: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&SHARE_ID.to_le_bytes());
        data.push(0);
        data.push(1);
        data.extend_from_slice(&((body.len() + 12) as u16).to_le_bytes());
        data.push(pdu_type2);
        data.push(0);
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(body);

        let mut pdu = Vec::new();
        pdu.extend_from_slice(&((data.len() + 6) as u16).to_le_bytes());
        pdu.extend_from_slice(&(PDUTYPE_DATA | 0x10).to_le_bytes());
        pdu.extend_from_slice(&1002u16.to_le_bytes());
        pdu.extend_from_slice(&data);
        pdu
    }

    fn drive(peer: &mut RdpPeer) -> Vec<PeerEvent> {
        std::thread::sleep(std::time::Duration::from_millis(20));
        peer.drive_input().unwrap()
    }

    #[test]
    fn full_connection_sequence_reaches_activation() {
        let (mut peer, mut client) = pair();

        // Negotiation.
        send(&mut client, &connection_request());
        assert!(drive(&mut peer).is_empty());
        let cc = drain_server_output(&mut client);
        assert_eq!(cc[0], 3); // TPKT back
        assert_eq!(cc[5], 0xD0); // connection confirm

        // MCS connect.
        send_x224(&mut client, &connect_initial());
        assert!(drive(&mut peer).is_empty());
        assert_eq!(peer.gcc.desktop_width, 1024);
        assert_eq!(peer.gcc.color_depth, 32);
        assert_eq!(peer.channels.len(), 1);
        let response = drain_server_output(&mut client);
        assert!(response.windows(4).any(|w| w == b"McDn"));

        // Erect + attach + joins (user, io, cliprdr).
        send_x224(&mut client, &[1 << 2]);
        send_x224(&mut client, &[10 << 2]);
        for channel in [1002u16, 1003, 1004] {
            let mut join = vec![14 << 2];
            join.extend_from_slice(&1u16.to_be_bytes());
            join.extend_from_slice(&channel.to_be_bytes());
            send_x224(&mut client, &join);
        }
        assert!(drive(&mut peer).is_empty());
        let _ = drain_server_output(&mut client);
        assert!(peer.channel_by_name("cliprdr").unwrap().joined);

        // Client info: the owner must now authenticate.
        send_data_request(&mut client, 1003, &client_info());
        let events = drive(&mut peer);
        assert!(matches!(events.as_slice(), [PeerEvent::PostConnect]));
        assert!(peer.client_info.is_some());

        // Logon done: license + demand active go out.
        peer.proceed_after_logon(false).unwrap();
        let out = drain_server_output(&mut client);
        assert!(!out.is_empty());

        // Confirm active + finalization.
        send_data_request(&mut client, 1003, &confirm_active());
        assert!(drive(&mut peer).is_empty());

        let mut sync = Vec::new();
        sync.extend_from_slice(&1u16.to_le_bytes());
        sync.extend_from_slice(&1002u16.to_le_bytes());
        send_data_request(&mut client, 1003, &share_data(PDUTYPE2_SYNCHRONIZE, &sync));

        let mut cooperate = Vec::new();
        cooperate.extend_from_slice(&CTRLACTION_COOPERATE.to_le_bytes());
        cooperate.extend_from_slice(&0u16.to_le_bytes());
        cooperate.extend_from_slice(&0u32.to_le_bytes());
        send_data_request(&mut client, 1003, &share_data(PDUTYPE2_CONTROL, &cooperate));

        let mut request_control = Vec::new();
        request_control.extend_from_slice(&CTRLACTION_REQUEST_CONTROL.to_le_bytes());
        request_control.extend_from_slice(&0u16.to_le_bytes());
        request_control.extend_from_slice(&0u32.to_le_bytes());
        send_data_request(&mut client, 1003, &share_data(PDUTYPE2_CONTROL, &request_control));

        let mut font_list = Vec::new();
        font_list.extend_from_slice(&0u16.to_le_bytes());
        font_list.extend_from_slice(&0u16.to_le_bytes());
        font_list.extend_from_slice(&0x0003u16.to_le_bytes());
        font_list.extend_from_slice(&50u16.to_le_bytes());
        send_data_request(&mut client, 1003, &share_data(PDUTYPE2_FONTLIST, &font_list));

        let events = drive(&mut peer);
        assert!(matches!(events.as_slice(), [PeerEvent::Activated]));
        assert!(peer.is_activated());
        assert_eq!(peer.caps.color_depth, 32);
        assert_eq!(peer.caps.multifrag_max_request_size, 65535);

        // Steady state: a frame acknowledge comes through as an event.
        send_data_request(
            &mut client,
            1003,
            &share_data(PDUTYPE2_FRAME_ACKNOWLEDGE, &7u32.to_le_bytes()),
        );
        let events = drive(&mut peer);
        assert!(matches!(events.as_slice(), [PeerEvent::FrameAck(7)]));
    }

    #[test]
    fn channel_data_surfaces_with_flags() {
        let (mut peer, mut client) = pair();
        send(&mut client, &connection_request());
        let _ = drive(&mut peer);
        send_x224(&mut client, &connect_initial());
        let _ = drive(&mut peer);
        let _ = drain_server_output(&mut client);

        // Channel PDU on the cliprdr channel id (1004).
        let mut channel_pdu = Vec::new();
        channel_pdu.extend_from_slice(&5u32.to_le_bytes()); // totalSize
        channel_pdu.extend_from_slice(&(CHANNEL_FLAG_FIRST | CHANNEL_FLAG_LAST).to_le_bytes());
        channel_pdu.extend_from_slice(b"hello");
        send_data_request(&mut client, 1004, &channel_pdu);

        let events = drive(&mut peer);
        match events.as_slice() {
            [PeerEvent::ChannelData {
                channel_id,
                flags,
                total_size,
                chunk,
            }] => {
                assert_eq!(*channel_id, 1004);
                assert_eq!(*flags, CHANNEL_FLAG_FIRST | CHANNEL_FLAG_LAST);
                assert_eq!(*total_size, 5);
                assert_eq!(chunk, b"hello");
            }
            other => panic!("unexpected events {other:?}"),
        }
    }
}
