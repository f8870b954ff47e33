//! Virtual channel fan-in/fan-out: static channels bridged to named
//! pipes, the drdynvc sub-protocol multiplexing dynamic channels, and
//! internal channels (the graphics pipeline) terminated in-process.

use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};

use crate::rdp::peer::{RdpPeer, CHANNEL_FLAG_FIRST, CHANNEL_FLAG_LAST, CHANNEL_FLAG_SHOW_PROTOCOL};
use crate::rdp::RdpError;
use tessera_wire::pipe;
use tessera_wire::ring::RingBuffer;

/// Per-turn traffic cap so one busy channel cannot monopolize the loop.
pub const VC_BYTES_LIMIT_PER_TURN: usize = 0x10000;

const XMIT_INITIAL: usize = 0x10000;
const XMIT_CEILING: usize = 8 * 1024 * 1024;

/* drdynvc sub-protocol command ids */
const CREATE_REQUEST_PDU: u8 = 1;
const DATA_FIRST_PDU: u8 = 2;
const DATA_PDU: u8 = 3;
const CLOSE_REQUEST_PDU: u8 = 4;
const CAPABILITY_PDU: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Svc,
    Dvc,
    InternalDvc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DvcOpenState {
    None,
    Succeeded,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrdynvcState {
    None,
    Failed,
    Initialized,
    Ready,
}

/// What channel processing asks the owner to do.
#[derive(Debug)]
pub enum MuxEvent {
    /// Answer a pending VirtualChannelOpen ICP call.
    OpenReply {
        tag: u32,
        success: bool,
        pipe_name: String,
        instance: u32,
    },
    /// The drdynvc handshake finished; internal channels may open.
    DrdynvcReady,
    DrdynvcFailed,
    /// A complete client payload for the internal gfx channel.
    GfxData(Vec<u8>),
    /// The internal gfx channel was created (or refused) by the client.
    GfxOpenResult { success: bool },
    GfxClosed,
}

pub struct VirtualChannel {
    pub key: u32,
    pub name: String,
    /// MCS channel id for SVCs, drdynvc channel id for DVCs.
    pub channel_id: u32,
    pub kind: ChannelKind,
    pub pipe_name: Option<String>,
    pub listener: Option<UnixListener>,
    pub client_pipe: Option<UnixStream>,
    pub write_blocked: bool,
    xmit: RingBuffer,

    /* pipe → client framing: 4-byte length then payload */
    pipe_waiting_length: bool,
    pipe_expected: usize,
    pipe_filled: usize,
    pipe_buf: Vec<u8>,

    /* client → pipe reassembly */
    receive: Vec<u8>,
    pub dvc_total_length: u64,
    pub dvc_open_state: DvcOpenState,
    pub dvc_open_tag: Option<u32>,
    pub channel_instance: u32,
}

impl VirtualChannel {
    fn new(key: u32, name: &str, channel_id: u32, kind: ChannelKind) -> VirtualChannel {
        VirtualChannel {
            key,
            name: name.to_string(),
            channel_id,
            kind,
            pipe_name: None,
            listener: None,
            client_pipe: None,
            write_blocked: false,
            xmit: RingBuffer::new(XMIT_INITIAL, XMIT_CEILING),
            pipe_waiting_length: true,
            pipe_expected: 4,
            pipe_filled: 0,
            pipe_buf: vec![0; 4],
            receive: Vec::new(),
            dvc_total_length: 0,
            dvc_open_state: DvcOpenState::None,
            dvc_open_tag: None,
            channel_instance: 0,
        }
    }

    #[must_use]
    pub fn listener_fd(&self) -> Option<RawFd> {
        self.listener.as_ref().map(|l| l.as_fd().as_raw_fd())
    }

    #[must_use]
    pub fn client_fd(&self) -> Option<RawFd> {
        self.client_pipe.as_ref().map(|p| p.as_fd().as_raw_fd())
    }

    /// Flush the pipe transmit ring. Returns false when the pipe died.
    fn flush_xmit(&mut self, send_limit: usize) -> bool {
        if self.write_blocked {
            return true;
        }
        let Some(pipe) = self.client_pipe.as_mut() else {
            return false;
        };
        let mut committed = 0usize;
        while !self.xmit.is_empty() {
            let (head, _) = self.xmit.readable();
            match pipe.write(head) {
                Ok(0) => return false,
                Ok(n) => {
                    self.xmit.commit_read(n);
                    committed += n;
                    if committed > send_limit {
                        // Fake a blocked write so the loop reschedules
                        // us instead of starving other sources.
                        self.write_blocked = true;
                        return true;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.write_blocked = true;
                    return true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!(channel = %self.name, error = %e, "pipe write failed");
                    return false;
                }
            }
        }
        true
    }

    fn queue_to_pipe(&mut self, data: &[u8]) -> bool {
        if self.xmit.write(data).is_err() {
            tracing::error!(channel = %self.name, "transmit ring exhausted");
            return false;
        }
        self.flush_xmit(VC_BYTES_LIMIT_PER_TURN)
    }

    /// Pipe became writable again.
    pub fn on_pipe_writable(&mut self) -> bool {
        self.write_blocked = false;
        self.flush_xmit(VC_BYTES_LIMIT_PER_TURN)
    }

    #[must_use]
    pub fn wants_pipe_write(&self) -> bool {
        self.write_blocked
    }

    /// Accept a new pipe peer, replacing any previous one.
    pub fn accept_pipe(&mut self) -> std::io::Result<()> {
        let Some(listener) = self.listener.as_ref() else {
            return Err(std::io::Error::other("channel has no listener"));
        };
        let (stream, _) = listener.accept()?;
        stream.set_nonblocking(true)?;
        self.client_pipe = Some(stream);
        self.channel_instance += 1;
        self.write_blocked = false;
        self.xmit.clear();
        self.pipe_waiting_length = true;
        self.pipe_expected = 4;
        self.pipe_filled = 0;
        Ok(())
    }

    pub fn disconnect_pipe(&mut self) {
        self.client_pipe = None;
        self.xmit.clear();
        self.write_blocked = false;
        self.pipe_waiting_length = true;
        self.pipe_expected = 4;
        self.pipe_filled = 0;
    }
}

pub struct ChannelMux {
    connection_id: u32,
    channels: Vec<VirtualChannel>,
    next_key: u32,
    pub drdynvc_state: DrdynvcState,
    drdynvc_channel_id: Option<u16>,
    drdynvc_buf: Vec<u8>,
    dvc_id_seq: u32,
    gfx_key: Option<u32>,
}

impl ChannelMux {
    #[must_use]
    pub fn new(connection_id: u32) -> ChannelMux {
        ChannelMux {
            connection_id,
            channels: Vec::new(),
            next_key: 1,
            drdynvc_state: DrdynvcState::None,
            drdynvc_channel_id: None,
            drdynvc_buf: Vec::new(),
            dvc_id_seq: 1,
            gfx_key: None,
        }
    }

    fn alloc_key(&mut self) -> u32 {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    #[must_use]
    pub fn channel(&self, key: u32) -> Option<&VirtualChannel> {
        self.channels.iter().find(|c| c.key == key)
    }

    pub fn channel_mut(&mut self, key: u32) -> Option<&mut VirtualChannel> {
        self.channels.iter_mut().find(|c| c.key == key)
    }

    fn by_name_and_kind(&self, name: &str, kind: ChannelKind) -> Option<&VirtualChannel> {
        self.channels
            .iter()
            .find(|c| c.kind == kind && c.name.eq_ignore_ascii_case(name))
    }

    fn by_dvc_id_mut(&mut self, dvc_id: u32) -> Option<&mut VirtualChannel> {
        self.channels.iter_mut().find(|c| {
            matches!(c.kind, ChannelKind::Dvc | ChannelKind::InternalDvc) && c.channel_id == dvc_id
        })
    }

    /// Channel keys that currently own pipes (for teardown iteration).
    #[must_use]
    pub fn keys(&self) -> Vec<u32> {
        self.channels.iter().map(|c| c.key).collect()
    }

    #[must_use]
    pub fn is_gfx(&self, key: u32) -> bool {
        self.gfx_key == Some(key)
    }

    /// After activation: kick off the drdynvc capability handshake if
    /// the client joined the channel.
    pub fn post_connect(&mut self, peer: &mut RdpPeer) -> DrdynvcState {
        if self.drdynvc_state != DrdynvcState::None {
            tracing::error!(state = ?self.drdynvc_state, "unexpected drdynvc state in post connect");
            return self.drdynvc_state;
        }
        let Some(channel) = peer.channel_by_name("drdynvc").filter(|c| c.joined) else {
            tracing::debug!("drdynvc channel is not joined");
            return self.drdynvc_state;
        };
        let channel_id = channel.id;
        self.drdynvc_channel_id = Some(channel_id);

        // DYNVC_CAPS_VERSION1
        peer.send_channel_data(channel_id, &[0x50, 0x00, 0x01, 0x00]);
        self.drdynvc_state = DrdynvcState::Initialized;
        self.drdynvc_state
    }

    /// Open a static channel toward a named pipe. Returns the pipe name
    /// and the channel key; the caller registers the listener with its
    /// event loop.
    pub fn open_svc(&mut self, peer: &RdpPeer, name: &str) -> Result<(String, u32), RdpError> {
        if name.len() > 8 {
            return Err(RdpError::Protocol("svc name too long"));
        }
        let Some(def) = peer.channel_by_name(name).filter(|c| c.joined) else {
            return Err(RdpError::Protocol("channel not joined by client"));
        };
        if let Some(existing) = self.by_name_and_kind(name, ChannelKind::Svc) {
            let pipe_name = existing.pipe_name.clone().unwrap_or_default();
            return Ok((pipe_name, existing.key));
        }

        let pipe_name = format!("{}{}_{}", pipe::PIPE_PREFIX, name, self.connection_id);
        let listener = pipe::create(&pipe_name).map_err(|e| {
            tracing::error!(pipe = %pipe_name, error = %e, "error creating channel pipe");
            RdpError::Protocol("pipe create failed")
        })?;

        let key = self.alloc_key();
        let mut channel = VirtualChannel::new(key, name, u32::from(def.id), ChannelKind::Svc);
        channel.pipe_name = Some(pipe_name.clone());
        channel.listener = Some(listener);
        self.channels.push(channel);
        tracing::debug!(name, pipe = %pipe_name, "static channel created");
        Ok((pipe_name, key))
    }

    /// Open a dynamic channel toward a named pipe: allocates the dvc id
    /// and sends the create request; the open completes when the create
    /// response arrives.
    pub fn open_dvc(
        &mut self,
        peer: &mut RdpPeer,
        name: &str,
        icp_tag: u32,
    ) -> Result<(String, u32), RdpError> {
        if self.drdynvc_state != DrdynvcState::Ready {
            return Err(RdpError::Protocol("drdynvc transport not ready"));
        }
        if let Some(existing) = self.by_name_and_kind(name, ChannelKind::Dvc) {
            let pipe_name = existing.pipe_name.clone().unwrap_or_default();
            return Ok((pipe_name, existing.key));
        }

        let pipe_name = format!(
            "{}{}_DYN_{}",
            pipe::PIPE_PREFIX,
            name,
            self.connection_id
        );
        let listener = pipe::create(&pipe_name)
            .map_err(|_| RdpError::Protocol("pipe create failed"))?;

        let dvc_id = self.dvc_id_seq;
        self.dvc_id_seq += 1;

        let key = self.alloc_key();
        let mut channel = VirtualChannel::new(key, name, dvc_id, ChannelKind::Dvc);
        channel.pipe_name = Some(pipe_name.clone());
        channel.listener = Some(listener);
        channel.dvc_open_tag = Some(icp_tag);
        self.channels.push(channel);

        self.send_create_request(peer, dvc_id, name);
        tracing::debug!(name, dvc_id, "dynamic channel creation requested");
        Ok((pipe_name, key))
    }

    /// Open the internal graphics pipeline channel.
    pub fn open_internal_gfx(&mut self, peer: &mut RdpPeer, name: &str) -> Result<u32, RdpError> {
        if self.drdynvc_state != DrdynvcState::Ready {
            return Err(RdpError::Protocol("drdynvc transport not ready"));
        }
        if self.gfx_key.is_some() {
            return Err(RdpError::Protocol("gfx channel already open"));
        }
        let dvc_id = self.dvc_id_seq;
        self.dvc_id_seq += 1;
        let key = self.alloc_key();
        self.channels
            .push(VirtualChannel::new(key, name, dvc_id, ChannelKind::InternalDvc));
        self.gfx_key = Some(key);
        self.send_create_request(peer, dvc_id, name);
        Ok(key)
    }

    fn send_create_request(&self, peer: &mut RdpPeer, dvc_id: u32, name: &str) {
        let Some(channel_id) = self.drdynvc_channel_id else {
            return;
        };
        let mut payload = Vec::with_capacity(name.len() + 6);
        payload.push(0); // patched below
        let cb_id = write_variable_uint(&mut payload, dvc_id);
        payload[0] = (CREATE_REQUEST_PDU << 4) | cb_id;
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        peer.send_channel_data(channel_id, &payload);
    }

    /// Send a close request for a dvc and drop the channel.
    pub fn close_dvc(&mut self, peer: &mut RdpPeer, key: u32) {
        let Some(index) = self.channels.iter().position(|c| c.key == key) else {
            return;
        };
        let channel = &self.channels[index];
        if matches!(channel.kind, ChannelKind::Dvc | ChannelKind::InternalDvc)
            && channel.dvc_open_state == DvcOpenState::Succeeded
        {
            if let Some(drdynvc_id) = self.drdynvc_channel_id {
                let mut payload = Vec::with_capacity(6);
                payload.push(0);
                let cb_id = write_variable_uint(&mut payload, channel.channel_id);
                payload[0] = (CLOSE_REQUEST_PDU << 4) | cb_id;
                peer.send_channel_data(drdynvc_id, &payload);
            }
        }
        self.remove_key(key);
    }

    pub fn remove_key(&mut self, key: u32) {
        if self.gfx_key == Some(key) {
            self.gfx_key = None;
        }
        if let Some(index) = self.channels.iter().position(|c| c.key == key) {
            let channel = self.channels.remove(index);
            if let Some(pipe_name) = &channel.pipe_name {
                let _ = pipe::clean(pipe_name);
            }
        }
    }

    /// Find a channel by its name and (optional) instance for the
    /// VirtualChannelClose path.
    #[must_use]
    pub fn find_for_close(&self, name: &str, instance: u32) -> Option<(u32, bool)> {
        self.channels
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .map(|c| (c.key, c.channel_instance == instance))
    }

    /* ------------- client → server path ------------- */

    /// Feed one SVC chunk from the RDP peer.
    pub fn process_channel_data(
        &mut self,
        peer: &mut RdpPeer,
        channel_id: u16,
        mut flags: u32,
        total_size: usize,
        chunk: &[u8],
    ) -> Vec<MuxEvent> {
        let mut events = Vec::new();

        if self.drdynvc_channel_id == Some(channel_id) {
            // The drdynvc SVC itself reassembles into the sub-protocol.
            self.reassemble_drdynvc(peer, flags, total_size, chunk, &mut events);
            return events;
        }

        let Some(key) = self
            .channels
            .iter()
            .find(|c| c.kind == ChannelKind::Svc && c.channel_id == u32::from(channel_id))
            .map(|c| c.key)
        else {
            tracing::warn!(channel_id, "data for an unhandled channel");
            return events;
        };
        let channel = self.channel_mut(key).expect("svc channel key resolved above");

        // RDPDR never sets SHOW_PROTOCOL but its pipe consumer needs the
        // headers; enforce the flag.
        if channel.name.eq_ignore_ascii_case("rdpdr") {
            flags |= CHANNEL_FLAG_SHOW_PROTOCOL;
        }

        if flags & CHANNEL_FLAG_SHOW_PROTOCOL != 0 {
            // Each PDU goes to the pipe with the (totalSize, flags)
            // prefix, unreassembled.
            let mut buf = Vec::with_capacity(8 + chunk.len());
            buf.extend_from_slice(&(total_size as u32).to_le_bytes());
            buf.extend_from_slice(&flags.to_le_bytes());
            buf.extend_from_slice(chunk);
            if !channel.queue_to_pipe(&buf) {
                let key = channel.key;
                self.remove_key(key);
            }
            return events;
        }

        if flags & CHANNEL_FLAG_FIRST != 0 {
            channel.receive.clear();
        }
        channel.receive.extend_from_slice(chunk);
        if flags & CHANNEL_FLAG_LAST != 0 {
            if channel.receive.len() != total_size {
                tracing::error!(channel = %channel.name, "packet badly fragmented");
                let key = channel.key;
                self.remove_key(key);
                return events;
            }
            let data = std::mem::take(&mut channel.receive);
            if !channel.queue_to_pipe(&data) {
                let key = channel.key;
                self.remove_key(key);
            }
        }
        events
    }

    fn reassemble_drdynvc(
        &mut self,
        peer: &mut RdpPeer,
        flags: u32,
        total_size: usize,
        chunk: &[u8],
        events: &mut Vec<MuxEvent>,
    ) {
        // Reassembly buffer shared for the control channel.
        if flags & CHANNEL_FLAG_FIRST != 0 {
            self.drdynvc_reassembly().clear();
        }
        self.drdynvc_reassembly().extend_from_slice(chunk);
        if flags & CHANNEL_FLAG_LAST == 0 {
            return;
        }
        let data = std::mem::take(self.drdynvc_reassembly());
        if data.len() != total_size {
            tracing::error!("drdynvc packet badly fragmented");
            self.drdynvc_state = DrdynvcState::Failed;
            events.push(MuxEvent::DrdynvcFailed);
            return;
        }
        if let Err(e) = self.process_drdynvc_pdu(peer, &data, events) {
            tracing::error!(error = %e, "error processing drdynvc pdu");
        }
    }

    fn drdynvc_reassembly(&mut self) -> &mut Vec<u8> {
        // Stored on the mux itself: only one control stream exists.
        &mut self.drdynvc_buf
    }

    fn process_drdynvc_pdu(
        &mut self,
        peer: &mut RdpPeer,
        data: &[u8],
        events: &mut Vec<MuxEvent>,
    ) -> Result<(), RdpError> {
        if data.len() < 2 {
            return Err(RdpError::Short("drdynvc pdu"));
        }
        let header = data[0];
        let cmd = (header & 0xf0) >> 4;
        let sp = (header & 0x0c) >> 2;
        let cb_ch_id = header & 0x03;
        let mut rest = &data[1..];

        if cmd == CAPABILITY_PDU {
            if rest.len() < 3 {
                return Err(RdpError::Short("drdynvc capabilities response"));
            }
            let version = u16::from_le_bytes([rest[1], rest[2]]);
            tracing::debug!(version, "received drdynvc capabilities response");
            if self.drdynvc_state != DrdynvcState::Ready {
                self.drdynvc_state = DrdynvcState::Ready;
                events.push(MuxEvent::DrdynvcReady);
            }
            return Ok(());
        }

        if self.drdynvc_state != DrdynvcState::Ready {
            tracing::error!(cmd, "received drdynvc command but channel is not ready");
            return Err(RdpError::Protocol("drdynvc not ready"));
        }

        let dvc_id = read_variable_uint(&mut rest, cb_ch_id)
            .ok_or(RdpError::Short("drdynvc channel id"))?;

        let Some(channel_key) = self.by_dvc_id_mut(dvc_id).map(|c| c.key) else {
            if cmd != CLOSE_REQUEST_PDU {
                tracing::error!(dvc_id, cmd, "drdynvc request for unknown channel");
                return Err(RdpError::Protocol("unknown dvc channel"));
            }
            return Ok(());
        };

        match cmd {
            CREATE_REQUEST_PDU => {
                // Server-initiated create: this is the response.
                if rest.len() < 4 {
                    return Err(RdpError::Short("drdynvc create response"));
                }
                let status = i32::from_le_bytes(rest[..4].try_into().expect("4 bytes"));
                self.handle_create_response(channel_key, status, events);
            }
            DATA_FIRST_PDU => {
                self.handle_data_first(peer, channel_key, sp, rest, events)?;
            }
            DATA_PDU => {
                self.handle_data(peer, channel_key, rest, events)?;
            }
            CLOSE_REQUEST_PDU => {
                self.handle_close_response(channel_key, events);
            }
            other => {
                tracing::error!(cmd = other, "drdynvc pdu not recognized");
                return Err(RdpError::Protocol("unknown drdynvc pdu"));
            }
        }
        Ok(())
    }

    fn handle_create_response(&mut self, key: u32, status: i32, events: &mut Vec<MuxEvent>) {
        let is_gfx = self.is_gfx(key);
        let Some(channel) = self.channel_mut(key) else {
            return;
        };
        if status < 0 {
            tracing::error!(
                channel = %channel.name,
                dvc_id = channel.channel_id,
                status,
                "dynamic channel creation failed"
            );
            channel.dvc_open_state = DvcOpenState::Failed;
            let tag = channel.dvc_open_tag.take();
            let pipe_name = channel.pipe_name.clone().unwrap_or_default();
            self.remove_key(key);
            if is_gfx {
                events.push(MuxEvent::GfxOpenResult { success: false });
            } else if let Some(tag) = tag {
                events.push(MuxEvent::OpenReply {
                    tag,
                    success: false,
                    pipe_name,
                    instance: 0,
                });
            }
            return;
        }

        tracing::debug!(channel = %channel.name, dvc_id = channel.channel_id, "dynamic channel created");
        channel.dvc_open_state = DvcOpenState::Succeeded;
        let tag = channel.dvc_open_tag.take();
        let pipe_name = channel.pipe_name.clone().unwrap_or_default();
        let instance = channel.channel_instance;
        if is_gfx {
            events.push(MuxEvent::GfxOpenResult { success: true });
        } else if let Some(tag) = tag {
            events.push(MuxEvent::OpenReply {
                tag,
                success: true,
                pipe_name,
                instance,
            });
        }
    }

    fn handle_close_response(&mut self, key: u32, events: &mut Vec<MuxEvent>) {
        let is_gfx = self.is_gfx(key);
        if let Some(channel) = self.channel_mut(key) {
            tracing::debug!(channel = %channel.name, "dynamic channel close response");
            channel.dvc_open_state = DvcOpenState::Closed;
        }
        self.remove_key(key);
        if is_gfx {
            events.push(MuxEvent::GfxClosed);
        }
    }

    fn handle_data_first(
        &mut self,
        peer: &mut RdpPeer,
        key: u32,
        sp: u8,
        mut rest: &[u8],
        events: &mut Vec<MuxEvent>,
    ) -> Result<(), RdpError> {
        let is_gfx = self.is_gfx(key);
        let Some(channel) = self.channel_mut(key) else {
            return Ok(());
        };
        if channel.dvc_total_length != 0 {
            tracing::error!(channel = %channel.name, "incomplete fragmented packet chain");
            let key = channel.key;
            self.close_dvc(peer, key);
            return Err(RdpError::Protocol("dvc fragment chain restarted"));
        }
        let total = read_variable_uint(&mut rest, sp)
            .ok_or(RdpError::Short("dvc data first length"))?;
        let total = u64::from(total);
        let length = rest.len() as u64;

        // DATA_FIRST with nothing left to fragment is a protocol error.
        if length >= total {
            tracing::error!(
                channel = %channel.name,
                length,
                total,
                "invalid first fragment: length >= announced total"
            );
            let key = channel.key;
            self.close_dvc(peer, key);
            return Err(RdpError::Protocol("dvc data first overflow"));
        }
        channel.dvc_total_length = total - length;
        self.deliver_dvc_bytes(peer, key, rest, is_gfx, events)
    }

    fn handle_data(
        &mut self,
        peer: &mut RdpPeer,
        key: u32,
        rest: &[u8],
        events: &mut Vec<MuxEvent>,
    ) -> Result<(), RdpError> {
        let is_gfx = self.is_gfx(key);
        let Some(channel) = self.channel_mut(key) else {
            return Ok(());
        };
        let length = rest.len() as u64;
        if channel.dvc_total_length > 0 {
            if length > channel.dvc_total_length {
                tracing::error!(
                    channel = %channel.name,
                    length,
                    remaining = channel.dvc_total_length,
                    "fragment exceeds announced length"
                );
                channel.dvc_total_length = 0;
                let key = channel.key;
                self.close_dvc(peer, key);
                return Err(RdpError::Protocol("dvc fragment overflow"));
            }
            channel.dvc_total_length -= length;
        }
        self.deliver_dvc_bytes(peer, key, rest, is_gfx, events)
    }

    fn deliver_dvc_bytes(
        &mut self,
        _peer: &mut RdpPeer,
        key: u32,
        data: &[u8],
        is_gfx: bool,
        events: &mut Vec<MuxEvent>,
    ) -> Result<(), RdpError> {
        let Some(channel) = self.channel_mut(key) else {
            return Ok(());
        };
        if is_gfx {
            // Internal channel: reassemble the full payload, then hand
            // it to the gfx server.
            channel.receive.extend_from_slice(data);
            if channel.dvc_total_length == 0 {
                events.push(MuxEvent::GfxData(std::mem::take(&mut channel.receive)));
            }
            return Ok(());
        }
        if !channel.queue_to_pipe(data) {
            let key = channel.key;
            self.remove_key(key);
        }
        Ok(())
    }

    /* ------------- pipe → client path ------------- */

    /// Pipe readable: pull length-prefixed packets and forward them to
    /// the RDP peer. Returns false when the pipe peer vanished (the
    /// caller tears the channel down). `rescheduled` is set when the
    /// read limit was hit with data still pending.
    pub fn pipe_readable(
        &mut self,
        peer: &mut RdpPeer,
        key: u32,
        rescheduled: &mut bool,
    ) -> bool {
        let drdynvc_id = self.drdynvc_channel_id;
        let drdynvc_ready = self.drdynvc_state == DrdynvcState::Ready;
        let Some(channel) = self.channel_mut(key) else {
            return false;
        };

        let mut total_read = 0usize;
        loop {
            if total_read >= VC_BYTES_LIMIT_PER_TURN {
                *rescheduled = true;
                return true;
            }
            let expected = channel.pipe_expected;
            if channel.pipe_buf.len() < expected {
                channel.pipe_buf.resize(expected, 0);
            }
            let Some(pipe) = channel.client_pipe.as_mut() else {
                return false;
            };
            match pipe.read(&mut channel.pipe_buf[channel.pipe_filled..expected]) {
                Ok(0) => return false,
                Ok(n) => {
                    channel.pipe_filled += n;
                    total_read += n;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
            if channel.pipe_filled < expected {
                continue;
            }

            if channel.pipe_waiting_length {
                let len = u32::from_le_bytes(
                    channel.pipe_buf[..4].try_into().expect("length header"),
                ) as usize;
                channel.pipe_waiting_length = false;
                channel.pipe_expected = len;
                channel.pipe_filled = 0;
                if len == 0 {
                    channel.pipe_waiting_length = true;
                    channel.pipe_expected = 4;
                }
                continue;
            }

            let payload = channel.pipe_buf[..expected].to_vec();
            channel.pipe_waiting_length = true;
            channel.pipe_expected = 4;
            channel.pipe_filled = 0;

            match channel.kind {
                ChannelKind::Svc => {
                    peer.send_channel_data(channel.channel_id as u16, &payload);
                }
                ChannelKind::Dvc | ChannelKind::InternalDvc => {
                    if !drdynvc_ready {
                        tracing::error!("dynamic virtual channel is not ready");
                        return false;
                    }
                    let Some(drdynvc_id) = drdynvc_id else {
                        return false;
                    };
                    send_dvc_payload(peer, drdynvc_id, channel.channel_id, &payload);
                }
            }
        }
    }

    /// Write bytes server→client on a dynamic channel (the gfx path).
    pub fn write_dvc(&mut self, peer: &mut RdpPeer, key: u32, data: &[u8]) -> bool {
        if self.drdynvc_state != DrdynvcState::Ready {
            return false;
        }
        let Some(drdynvc_id) = self.drdynvc_channel_id else {
            return false;
        };
        let Some(channel) = self.channel(key) else {
            return false;
        };
        send_dvc_payload(peer, drdynvc_id, channel.channel_id, data);
        true
    }

    /// Drop every channel (connection teardown).
    pub fn close_all(&mut self) {
        let keys = self.keys();
        for key in keys {
            self.remove_key(key);
        }
        self.drdynvc_state = DrdynvcState::None;
        self.drdynvc_channel_id = None;
    }
}

/// Split a DVC payload into DATA_FIRST/DATA chunks sized for the SVC
/// transport.
fn send_dvc_payload(peer: &mut RdpPeer, drdynvc_id: u16, dvc_id: u32, payload: &[u8]) {
    use crate::rdp::peer::VC_CHUNK_SIZE;

    let mut remaining = payload;
    let mut first = true;
    while !remaining.is_empty() {
        let mut chunk = Vec::with_capacity(VC_CHUNK_SIZE);
        chunk.push(0);
        let cb_id = write_variable_uint(&mut chunk, dvc_id);
        let header_budget = VC_CHUNK_SIZE - chunk.len();

        if first && remaining.len() > header_budget {
            let mut with_len = chunk.clone();
            let cb_len = write_variable_uint(&mut with_len, remaining.len() as u32);
            with_len[0] = (DATA_FIRST_PDU << 4) | (cb_len << 2) | cb_id;
            let take = (VC_CHUNK_SIZE - with_len.len()).min(remaining.len());
            with_len.extend_from_slice(&remaining[..take]);
            peer.send_channel_data(drdynvc_id, &with_len);
            remaining = &remaining[take..];
        } else {
            chunk[0] = (DATA_PDU << 4) | cb_id;
            let take = (VC_CHUNK_SIZE - chunk.len()).min(remaining.len());
            chunk.extend_from_slice(&remaining[..take]);
            peer.send_channel_data(drdynvc_id, &chunk);
            remaining = &remaining[take..];
        }
        first = false;
    }
}

fn write_variable_uint(out: &mut Vec<u8>, value: u32) -> u8 {
    if value <= 0xFF {
        out.push(value as u8);
        0
    } else if value <= 0xFFFF {
        out.extend_from_slice(&(value as u16).to_le_bytes());
        1
    } else {
        out.extend_from_slice(&value.to_le_bytes());
        2
    }
}

fn read_variable_uint(data: &mut &[u8], cb: u8) -> Option<u32> {
    match cb {
        0 => {
            let v = *data.first()?;
            *data = &data[1..];
            Some(u32::from(v))
        }
        1 => {
            if data.len() < 2 {
                return None;
            }
            let v = u16::from_le_bytes([data[0], data[1]]);
            *data = &data[2..];
            Some(u32::from(v))
        }
        _ => {
            if data.len() < 4 {
                return None;
            }
            let v = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            *data = &data[4..];
            Some(v)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdp::peer::RdpPeer;
    use std::net::{TcpListener, TcpStream};

    fn test_peer() -> RdpPeer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        drop(client);
        RdpPeer::new(server, None)
    }

    fn mux_with_dvc(dvc_id: u32) -> (ChannelMux, UnixStream) {
        let mut mux = ChannelMux::new(1);
        mux.drdynvc_channel_id = Some(1004);
        mux.drdynvc_state = DrdynvcState::Ready;

        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        theirs.set_nonblocking(true).unwrap();

        let key = mux.alloc_key();
        let mut channel = VirtualChannel::new(key, "echo", dvc_id, ChannelKind::Dvc);
        channel.client_pipe = Some(ours);
        channel.dvc_open_state = DvcOpenState::Succeeded;
        mux.channels.push(channel);
        (mux, theirs)
    }

    fn dvc_data_first(dvc_id: u8, total: u32, payload: &[u8]) -> Vec<u8> {
        // cbChId = 0 (1 byte), Sp/cbLen = 2 (4 byte length)
        let mut pdu = vec![(DATA_FIRST_PDU << 4) | (2 << 2), dvc_id];
        pdu.extend_from_slice(&total.to_le_bytes());
        pdu.extend_from_slice(payload);
        pdu
    }

    fn dvc_data(dvc_id: u8, payload: &[u8]) -> Vec<u8> {
        let mut pdu = vec![DATA_PDU << 4, dvc_id];
        pdu.extend_from_slice(payload);
        pdu
    }

    fn feed(mux: &mut ChannelMux, peer: &mut RdpPeer, pdu: &[u8]) -> Vec<MuxEvent> {
        mux.process_channel_data(
            peer,
            1004,
            CHANNEL_FLAG_FIRST | CHANNEL_FLAG_LAST,
            pdu.len(),
            pdu,
        )
    }

    fn read_available(pipe: &mut UnixStream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        out
    }

    #[test]
    fn dvc_fragment_chain_delivers_exact_total() {
        let (mut mux, mut far_end) = mux_with_dvc(5);
        let mut peer = test_peer();

        let first = dvc_data_first(5, 600, &[0xAA; 400]);
        feed(&mut mux, &mut peer, &first);
        assert_eq!(mux.channels[0].dvc_total_length, 200);

        let second = dvc_data(5, &[0xBB; 200]);
        feed(&mut mux, &mut peer, &second);
        assert_eq!(mux.channels[0].dvc_total_length, 0);

        let delivered = read_available(&mut far_end);
        assert_eq!(delivered.len(), 600);
        assert_eq!(&delivered[..400], &[0xAA; 400][..]);
        assert_eq!(&delivered[400..], &[0xBB; 200][..]);
    }

    #[test]
    fn data_first_with_full_payload_closes_channel() {
        let (mut mux, _far_end) = mux_with_dvc(5);
        let mut peer = test_peer();

        // length == announced total: fragmentation was not needed, so
        // DATA_FIRST is a protocol violation.
        let bad = dvc_data_first(5, 400, &[0u8; 400]);
        feed(&mut mux, &mut peer, &bad);
        assert!(mux.channels.is_empty());
    }

    #[test]
    fn oversized_fragment_closes_channel() {
        let (mut mux, _far_end) = mux_with_dvc(5);
        let mut peer = test_peer();

        feed(&mut mux, &mut peer, &dvc_data_first(5, 600, &[0u8; 400]));
        // 300 > the 200 bytes remaining in the chain.
        feed(&mut mux, &mut peer, &dvc_data(5, &[0u8; 300]));
        assert!(mux.channels.is_empty());
    }

    #[test]
    fn capability_response_makes_transport_ready() {
        let mut mux = ChannelMux::new(1);
        mux.drdynvc_channel_id = Some(1004);
        mux.drdynvc_state = DrdynvcState::Initialized;
        let mut peer = test_peer();

        let caps = [CAPABILITY_PDU << 4, 0x00, 0x01, 0x00];
        let events = feed(&mut mux, &mut peer, &caps);
        assert_eq!(mux.drdynvc_state, DrdynvcState::Ready);
        assert!(matches!(events.as_slice(), [MuxEvent::DrdynvcReady]));
    }

    #[test]
    fn internal_gfx_channel_reassembles_payload() {
        let mut mux = ChannelMux::new(1);
        mux.drdynvc_channel_id = Some(1004);
        mux.drdynvc_state = DrdynvcState::Ready;
        let key = mux.alloc_key();
        let mut channel = VirtualChannel::new(key, "gfx", 9, ChannelKind::InternalDvc);
        channel.dvc_open_state = DvcOpenState::Succeeded;
        mux.channels.push(channel);
        mux.gfx_key = Some(key);
        let mut peer = test_peer();

        feed(&mut mux, &mut peer, &dvc_data_first(9, 10, &[1, 2, 3, 4]));
        let events = feed(&mut mux, &mut peer, &dvc_data(9, &[5, 6, 7, 8, 9, 10]));
        match events.as_slice() {
            [MuxEvent::GfxData(data)] => assert_eq!(data, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]),
            other => panic!("unexpected events {other:?}"),
        }
    }
}
