//! Per-connection runtime: one thread per client owning a reactor and
//! all connection state. Handles the RDPEPS pre-connection phase, the
//! RDP socket, the backend pipe, channel pipes, the frame timer and the
//! cross-runloop command mailbox.

use std::collections::HashMap;
use std::net::TcpStream;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::sync::{Arc, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use crate::appctx::{drain_event, AppContext, Command, ConnHandle, ConnectionId};
use crate::backend::BackendLink;
use crate::channels::{ChannelMux, DrdynvcState, MuxEvent};
use crate::frontend::{self, FrontCtx, FrontState};
use crate::rdp::gfx::{GfxEvent, GfxServer, CHANNEL_NAME as GFX_CHANNEL_NAME};
use crate::rdp::peer::{PeerEvent, RdpPeer, ERRINFO_PRE_CONNECT_FAILED};
use crate::state::{FrameEvent, FrameState};
use tessera_encode::{BitmapEncoder, CodecMode};
use tessera_eventloop::{EventLoop, EventSource, Interest};
use tessera_icp::header::IcpStatus;
use tessera_icp::msgs::{
    self, BackendProps, StartRemoteControl, REMOTECONTROL_FLAG_DISABLE_KEYBOARD,
    REMOTECONTROL_FLAG_DISABLE_MOUSE, REMOTECONTROL_KBD_HOTKEY_ALT, REMOTECONTROL_KBD_HOTKEY_CTRL,
    REMOTECONTROL_KBD_HOTKEY_SHIFT,
};
use tessera_wire::dmgbuf::DamageBuffer;
use tessera_wire::msg::{self as wiremsg, SbpStatus, WireMessage};

pub const DEFAULT_FPS: u32 = 20;

/// Monotonic milliseconds since process start.
pub fn now_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

#[derive(Default)]
pub struct ChannelSources {
    pub listener: Option<EventSource>,
    pub client: Option<EventSource>,
}

/// Everything one connection owns. Locked by the runloop thread that
/// currently drives the connection (its own, or the shadow target's).
pub struct ConnState {
    pub id: ConnectionId,
    pub fps: u32,
    pub peer: RdpPeer,
    pub shadowing: ConnectionId,
    /// Self plus spies; only meaningful on a group owner.
    pub front_ids: Vec<ConnectionId>,
    pub backend: Option<BackendLink>,
    pub mux: ChannelMux,
    pub front: FrontState,
    pub running: bool,
    pub send_disconnect: bool,
    /// A spy asked to close while shadowing: finish when the rewire
    /// message brings the socket home.
    pub close_after_rewire: bool,

    pub rdp_source: Option<EventSource>,
    pub frame_source: Option<EventSource>,
    pub frame_timer: Option<tessera_eventloop::TimerSource>,
    pub backend_source: Option<EventSource>,
    pub channel_sources: HashMap<u32, ChannelSources>,
    pub gfx_channel_key: Option<u32>,

    /// Backend endpoint from LogonUser, consumed at first activation.
    pub backend_props: Option<BackendProps>,
    pub max_width: u32,
    pub max_height: u32,
}

impl ConnState {
    pub fn new(id: ConnectionId, stream: TcpStream, tls: Option<Arc<rustls::ServerConfig>>) -> ConnState {
        ConnState {
            id,
            fps: DEFAULT_FPS,
            peer: RdpPeer::new(stream, tls),
            shadowing: id,
            front_ids: vec![id],
            backend: None,
            mux: ChannelMux::new(id),
            front: FrontState::default(),
            running: true,
            send_disconnect: true,
            close_after_rewire: false,
            rdp_source: None,
            frame_source: None,
            frame_timer: None,
            backend_source: None,
            channel_sources: HashMap::new(),
            gfx_channel_key: None,
            backend_props: None,
            max_width: 0,
            max_height: 0,
        }
    }

    #[cfg(test)]
    pub fn for_tests(id: ConnectionId) -> ConnState {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        server.set_nonblocking(true).expect("nonblocking");
        drop(client);
        ConnState::new(id, server, None)
    }

    /// Send a ZGFX-wrapped payload over the internal gfx channel.
    pub fn write_gfx(&mut self, payload: &[u8]) {
        let Some(key) = self.gfx_channel_key else {
            return;
        };
        let ConnState { mux, peer, .. } = self;
        mux.write_dvc(peer, key, payload);
    }
}

fn lock_state(handle: &ConnHandle) -> MutexGuard<'_, ConnState> {
    handle.state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Keep the rdp source's write interest in sync with the peer's output
/// backlog.
fn sync_rdp_mask(evloop: &mut EventLoop, state: &mut ConnState) {
    let Some(source) = state.rdp_source.as_ref() else {
        return;
    };
    let mask = if state.peer.is_write_blocked() {
        Interest::READ | Interest::WRITE
    } else {
        Interest::READ
    };
    if evloop.mask(source) != Some(mask) {
        let _ = evloop.change_mask(source, mask);
    }
}

/* ------------------------------------------------------------------ */
/* accept path                                                         */
/* ------------------------------------------------------------------ */

/// Accepted socket → registered connection with its own runloop thread.
pub fn spawn_connection(app: &Arc<AppContext>, stream: TcpStream) -> std::io::Result<()> {
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;

    let id = app.next_connection_id();
    let state = ConnState::new(id, stream, app.tls.clone());
    let handle = ConnHandle::new(id, state);
    app.add_connection(Arc::clone(&handle));

    let thread_app = Arc::clone(app);
    let thread_handle = Arc::clone(&handle);
    let thread = std::thread::Builder::new()
        .name(format!("conn-{id}"))
        .spawn(move || run_connection(&thread_app, &thread_handle))?;
    *handle.thread.lock().expect("thread slot") = Some(thread);
    Ok(())
}

/* ------------------------------------------------------------------ */
/* RDPEPS pre-connection                                               */
/* ------------------------------------------------------------------ */

const PRECONNECT_MAGIC: [u8; 3] = [0xC0, 0xFF, 0x33];
const PRECONNECT_BUDGET: Duration = Duration::from_secs(10);

fn wait_readable(fd: BorrowedFd<'_>, deadline: Instant) -> bool {
    use rustix::event::{poll, PollFd, PollFlags};
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        let mut fds = [PollFd::new(&fd, PollFlags::IN)];
        match poll(&mut fds, remaining.as_millis() as i32) {
            Ok(0) => return false,
            Ok(_) => return true,
            Err(rustix::io::Errno::INTR) => continue,
            Err(_) => return false,
        }
    }
}

fn read_exact_deadline(stream: &TcpStream, buf: &mut [u8], deadline: Instant) -> bool {
    use std::io::Read;
    let mut filled = 0;
    let mut stream = stream;
    while filled < buf.len() {
        if !wait_readable(stream.as_fd(), deadline) {
            return false;
        }
        match Read::read(&mut stream, &mut buf[filled..]) {
            Ok(0) => return false,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => return false,
        }
    }
    true
}

/// Scan for the RDPEPS pre-connection blob. Returns false when the
/// connection must be dropped.
fn handle_preconnection(stream: &TcpStream) -> bool {
    use std::io::Write;

    let deadline = Instant::now() + PRECONNECT_BUDGET;
    loop {
        if !wait_readable(stream.as_fd(), deadline) {
            // Nothing arrived inside the budget: proceed with RDP.
            return true;
        }

        let mut peek = [0u8; 3];
        let n = match rustix::net::recv(
            stream.as_fd(),
            &mut peek,
            rustix::net::RecvFlags::PEEK,
        ) {
            Ok(n) => n,
            Err(_) => return false,
        };
        if n < 3 {
            // Not enough to classify; avoid busy waiting on a stalled
            // peer.
            std::thread::sleep(Duration::from_millis(100));
            continue;
        }
        if peek != PRECONNECT_MAGIC {
            // Regular RDP handshake bytes.
            return true;
        }

        // Consume the magic, then the length-prefixed blob.
        let mut magic = [0u8; 3];
        if !read_exact_deadline(stream, &mut magic, deadline) {
            return false;
        }
        let mut length_buf = [0u8; 4];
        if !read_exact_deadline(stream, &mut length_buf, deadline) {
            return false;
        }
        let total = u32::from_le_bytes(length_buf) as usize;
        if total <= 4 {
            tracing::error!(total, "preconnection blob length too small");
            return false;
        }
        let body_len = total - 4;
        if body_len < 12 {
            // Too small to hold flags/version/id: echo the magic and
            // drop the session.
            let mut stream_ref = stream;
            let _ = Write::write(&mut stream_ref, &PRECONNECT_MAGIC);
            return false;
        }
        if body_len > 0x10000 {
            tracing::error!(body_len, "preconnection blob length too large");
            return false;
        }
        let mut body = vec![0u8; body_len];
        if !read_exact_deadline(stream, &mut body, deadline) {
            return false;
        }

        let flags = u32::from_le_bytes(body[0..4].try_into().expect("12 bytes checked"));
        let version = u32::from_le_bytes(body[4..8].try_into().expect("12 bytes checked"));
        let id = u32::from_le_bytes(body[8..12].try_into().expect("12 bytes checked"));
        tracing::debug!(flags, version, id, "preconnection blob");

        match version {
            1 => return true,
            2 => {
                // v2 carries a counted unicode PCB string; already read.
                if body_len >= 14 {
                    let cch =
                        u16::from_le_bytes(body[12..14].try_into().expect("14 bytes checked"));
                    tracing::debug!(cch, "preconnection v2 payload");
                }
                return true;
            }
            other => {
                // Unknown version: echo the magic back; the peer may
                // retry with something we understand.
                tracing::debug!(version = other, "unknown preconnection version");
                let mut stream_ref = stream;
                if Write::write(&mut stream_ref, &PRECONNECT_MAGIC).is_err() {
                    return false;
                }
            }
        }
    }
}

/* ------------------------------------------------------------------ */
/* the runloop                                                         */
/* ------------------------------------------------------------------ */

fn configure_keepalive(app: &AppContext, id: ConnectionId, stream: &TcpStream) {
    let Some(icp) = app.icp() else {
        return;
    };
    let params = match icp.property_string(id, "tcp.keepalive.params") {
        Ok(Some(params)) => params,
        _ => return,
    };
    let mut parts = params.splitn(2, ',');
    let idle: u64 = parts.next().and_then(|p| p.trim().parse().ok()).unwrap_or(0);
    let maxpkt: u32 = parts.next().and_then(|p| p.trim().parse().ok()).unwrap_or(0);

    let fd = stream.as_fd();
    if rustix::net::sockopt::set_socket_keepalive(fd, true).is_err() {
        tracing::error!(id, "unable to activate TCP keepalive on the socket");
        return;
    }
    if idle > 0 {
        let _ = rustix::net::sockopt::set_tcp_keepidle(fd, Duration::from_secs(idle));
    }
    if maxpkt > 0 {
        let _ = rustix::net::sockopt::set_tcp_keepcnt(fd, maxpkt);
    }
}

fn run_connection(app: &Arc<AppContext>, handle: &Arc<ConnHandle>) {
    let id = handle.id;

    // The pre-connect phase may wait up to its whole budget; run it on
    // a duplicated fd so the state lock is not held for seconds.
    let preconnect_stream = lock_state(handle).peer.stream().try_clone();
    let preconnect_ok = match preconnect_stream {
        Ok(stream) => handle_preconnection(&stream),
        Err(_) => false,
    };
    if !preconnect_ok {
        tracing::debug!(id, "dropping connection in pre-connect phase");
        app.remove_connection(id);
        return;
    }

    let mut evloop = match EventLoop::new() {
        Ok(evloop) => evloop,
        Err(e) => {
            tracing::error!(id, error = %e, "unable to create the connection event loop");
            app.remove_connection(id);
            return;
        }
    };

    {
        let state = lock_state(handle);
        configure_keepalive(app, id, state.peer.stream());
    }

    // Stop event.
    let stop_app = Arc::clone(app);
    let stop_handle = Arc::clone(handle);
    if evloop
        .add_handle(
            &handle.stop_event,
            Interest::READ,
            Box::new(move |evloop, _mask, fd| {
                // SAFETY: the eventfd outlives the source registration.
                drain_event(unsafe { BorrowedFd::borrow_raw(fd) });
                handle_stop(&stop_app, evloop, &stop_handle);
            }),
        )
        .is_err()
    {
        app.remove_connection(id);
        return;
    }

    // Command mailbox.
    let mbox_app = Arc::clone(app);
    let mbox_handle = Arc::clone(handle);
    if evloop
        .add_handle(
            &handle.mailbox_event,
            Interest::READ,
            Box::new(move |evloop, _mask, _fd| {
                handle_mailbox(&mbox_app, evloop, &mbox_handle);
            }),
        )
        .is_err()
    {
        app.remove_connection(id);
        return;
    }

    // The RDP socket.
    let rdp_app = Arc::clone(app);
    let rdp_handle = Arc::clone(handle);
    let rdp_fd = {
        let state = lock_state(handle);
        state.peer.stream().as_fd().as_raw_fd()
    };
    match evloop.add_fd(
        rdp_fd,
        Interest::READ,
        Box::new(move |evloop, mask, _fd| {
            handle_front_rdp_event(&rdp_app, evloop, &rdp_handle, mask);
        }),
    ) {
        Ok(source) => lock_state(handle).rdp_source = Some(source),
        Err(e) => {
            tracing::error!(id, error = %e, "error adding peer socket to event loop");
            app.remove_connection(id);
            return;
        }
    }

    tracing::debug!(id, "connection runloop started");

    loop {
        {
            let state = lock_state(handle);
            if !state.running {
                break;
            }
        }
        if let Err(e) = evloop.dispatch(10_000) {
            tracing::error!(id, error = %e, "event loop dispatch failed");
            break;
        }
    }

    // Teardown: destroy the backend, notify the session manager and
    // give mobile clients a moment to close first.
    let send_disconnect = {
        let mut state = lock_state(handle);
        state.backend = None;
        state.mux.close_all();
        state.peer.send_disconnect();
        state.send_disconnect
    };

    if send_disconnect {
        if let Some(icp) = app.icp() {
            icp.disconnect_user_session_async(id);
        }
    }

    app.remove_connection(id);
    std::thread::sleep(Duration::from_secs(1));
    tracing::debug!(id, "connection runloop finished");
}

/* ------------------------------------------------------------------ */
/* group iteration                                                     */
/* ------------------------------------------------------------------ */

/// Run `f` for every front connection of the group owned by `state`
/// (state itself plus its spies). Must run on the owning thread.
fn for_each_front(app: &AppContext, state: &mut ConnState, mut f: impl FnMut(&mut FrontCtx<'_>)) {
    let front_ids = state.front_ids.clone();
    let own_id = state.id;
    for front_id in front_ids {
        if front_id == own_id {
            let mut ctx = FrontCtx {
                conn: &mut *state,
                target: None,
            };
            f(&mut ctx);
        } else {
            let Some(front_handle) = app.get(front_id) else {
                continue;
            };
            let mut guard = lock_state(&front_handle);
            let mut ctx = FrontCtx {
                conn: &mut guard,
                target: Some(&mut *state),
            };
            f(&mut ctx);
        }
    }
}

/// Context for a connection driven on its own loop: resolves the shadow
/// target (locking it) when needed, then runs `f`.
fn with_own_ctx(
    app: &AppContext,
    state: &mut ConnState,
    f: impl FnOnce(&mut FrontCtx<'_>),
) {
    if state.shadowing == state.id {
        let mut ctx = FrontCtx {
            conn: &mut *state,
            target: None,
        };
        f(&mut ctx);
        return;
    }
    let Some(target_handle) = app.get(state.shadowing) else {
        let mut ctx = FrontCtx {
            conn: &mut *state,
            target: None,
        };
        f(&mut ctx);
        return;
    };
    let mut target = lock_state(&target_handle);
    let mut ctx = FrontCtx {
        conn: &mut *state,
        target: Some(&mut *target),
    };
    f(&mut ctx);
}

/* ------------------------------------------------------------------ */
/* stop / close                                                        */
/* ------------------------------------------------------------------ */

fn handle_stop(app: &Arc<AppContext>, evloop: &mut EventLoop, handle: &Arc<ConnHandle>) {
    let mut state = lock_state(handle);
    close_connection(app, evloop, &mut state);
}

/// Port of the connection close logic: spies die in their own loop,
/// targets unwire their spies first.
fn close_connection(app: &Arc<AppContext>, evloop: &mut EventLoop, state: &mut ConnState) {
    let id = state.id;

    if state.shadowing != id {
        // We are a spy: ask the target to give the socket back, then
        // terminate once it arrives.
        let target = state.shadowing;
        state.close_after_rewire = true;
        if !app.post_command(
            target,
            Command::UnwireSpy {
                spy_id: id,
                tag: None,
            },
        ) {
            // Target is already gone; just die.
            state.shadowing = id;
            state.running = false;
        }
        return;
    }

    // Unwire every spy back into its own loop.
    let spies: Vec<ConnectionId> = state
        .front_ids
        .iter()
        .copied()
        .filter(|&f| f != id)
        .collect();
    for spy_id in spies {
        unwire_spy(app, evloop, state, spy_id, None, true);
    }
    state.front_ids = vec![id];

    if let Some(mut source) = state.rdp_source.take() {
        evloop.remove_source(&mut source);
    }
    if let Some(mut source) = state.frame_source.take() {
        evloop.remove_source(&mut source);
    }
    state.frame_timer = None;
    if let Some(mut source) = state.backend_source.take() {
        evloop.remove_source(&mut source);
    }
    for (_, mut sources) in state.channel_sources.drain() {
        if let Some(mut s) = sources.listener.take() {
            evloop.remove_source(&mut s);
        }
        if let Some(mut s) = sources.client.take() {
            evloop.remove_source(&mut s);
        }
    }

    state.running = false;
}

/* ------------------------------------------------------------------ */
/* the RDP socket                                                      */
/* ------------------------------------------------------------------ */

fn handle_front_rdp_event(
    app: &Arc<AppContext>,
    evloop: &mut EventLoop,
    handle: &Arc<ConnHandle>,
    mask: Interest,
) {
    let mut state = lock_state(handle);
    if !state.running && state.shadowing == state.id {
        if let Some(mut source) = state.rdp_source.take() {
            evloop.remove_source(&mut source);
        }
        return;
    }

    if mask.intersects(Interest::HANGUP | Interest::ERROR) {
        tracing::debug!(id = state.id, "peer socket hangup");
        close_connection(app, evloop, &mut state);
        return;
    }

    if mask.contains(Interest::WRITE) {
        match state.peer.flush() {
            Ok(false) => {
                sync_rdp_mask(evloop, &mut state);
                let app_ref: &AppContext = app;
                with_own_ctx(app_ref, &mut state, |ctx| {
                    frontend::handle_frame_sent(ctx);
                });
            }
            Ok(true) => {}
            Err(e) => {
                tracing::error!(id = state.id, error = %e, "error draining peer output");
                close_connection(app, evloop, &mut state);
                return;
            }
        }
    }

    if mask.contains(Interest::READ) {
        let events = match state.peer.drive_input() {
            Ok(events) => events,
            Err(e) => {
                tracing::debug!(id = state.id, error = %e, "peer input failed");
                close_connection(app, evloop, &mut state);
                return;
            }
        };
        for event in events {
            if !state.running {
                break;
            }
            process_peer_event(app, evloop, &mut state, event);
        }
    }

    if state.running {
        let _ = state.peer.flush();
        sync_rdp_mask(evloop, &mut state);
    }
}

fn process_peer_event(
    app: &Arc<AppContext>,
    evloop: &mut EventLoop,
    state: &mut ConnState,
    event: PeerEvent,
) {
    match event {
        PeerEvent::PostConnect => {
            if !post_connect(app, state) {
                state.peer.send_error_info(ERRINFO_PRE_CONNECT_FAILED);
                let _ = state.peer.flush();
                close_connection(app, evloop, state);
            }
        }
        PeerEvent::Activated => {
            if !peer_activate(app, evloop, state) {
                close_connection(app, evloop, state);
            }
        }
        PeerEvent::Input(input_event) => {
            let broadcast = {
                let mut result = Vec::new();
                let app_ref: &AppContext = app;
                with_own_ctx(app_ref, state, |ctx| {
                    result = frontend::process_input(app_ref, ctx, input_event);
                });
                result
            };
            deliver_indicator_broadcast(app, evloop, state, &broadcast);
        }
        PeerEvent::FrameAck(frame_id) => {
            handle_frame_ack_front(app, state, frame_id);
        }
        PeerEvent::SuppressOutput { allow } => {
            let app_ref: &AppContext = app;
            with_own_ctx(app_ref, state, |ctx| {
                frontend::handle_suppress_output(ctx, allow);
            });
        }
        PeerEvent::RefreshRect(rects) => {
            let app_ref: &AppContext = app;
            with_own_ctx(app_ref, state, |ctx| {
                frontend::handle_refresh_rect(ctx, &rects);
            });
        }
        PeerEvent::ChannelData {
            channel_id,
            flags,
            total_size,
            chunk,
        } => {
            let events = {
                let ConnState { mux, peer, .. } = state;
                mux.process_channel_data(peer, channel_id, flags, total_size, &chunk)
            };
            for mux_event in events {
                process_mux_event(app, evloop, state, mux_event);
            }
        }
        PeerEvent::ShutdownRequest | PeerEvent::Disconnected => {
            close_connection(app, evloop, state);
        }
    }
}

fn handle_frame_ack_front(app: &Arc<AppContext>, state: &mut ConnState, frame_id: u32) {
    // An ack answers an outstanding RTT probe too.
    if let Some((sent_at, probe_frame)) = state.front.rtt_probe {
        if frame_id >= probe_frame {
            let rtt = (now_ms().saturating_sub(sent_at)) as u32;
            let fps = state.fps;
            let frame_acknowledge = state.front.frame_acknowledge;
            state.front.bandwidth.rtt_measured(rtt, fps, frame_acknowledge);
            if let Some(hint) = state.front.bandwidth.frame_ack_hint.take() {
                state.front.frame_acknowledge = hint;
            }
            state.front.rtt_probe = None;
        }
    }
    let app_ref: &AppContext = app;
    with_own_ctx(app_ref, state, |ctx| {
        frontend::handle_frame_ack(ctx, frame_id);
    });
}

fn deliver_indicator_broadcast(
    app: &Arc<AppContext>,
    evloop: &mut EventLoop,
    state: &mut ConnState,
    broadcast: &[(ConnectionId, u16)],
) {
    for &(front_id, indicators) in broadcast {
        if front_id == state.id {
            continue;
        }
        let Some(front_handle) = app.get(front_id) else {
            continue;
        };
        let mut sibling = lock_state(&front_handle);
        sibling.front.indicators = indicators;
        sibling.peer.send_keyboard_indicators(indicators);
        let _ = sibling.peer.flush();
        sync_rdp_mask(evloop, &mut sibling);
    }
}

/* ------------------------------------------------------------------ */
/* gfx / mux events                                                    */
/* ------------------------------------------------------------------ */

fn process_mux_event(
    app: &Arc<AppContext>,
    evloop: &mut EventLoop,
    state: &mut ConnState,
    event: MuxEvent,
) {
    match event {
        MuxEvent::OpenReply {
            tag,
            success,
            pipe_name,
            instance,
        } => {
            if let Some(icp) = app.icp() {
                let _ = icp.send_response_json(
                    tag,
                    msgs::MSG_VC_OPEN,
                    IcpStatus::Success,
                    &msgs::VirtualChannelOpenReply {
                        success,
                        pipe_name,
                        instance,
                    },
                );
            }
            // A successful DVC open has a pipe listener to watch.
            if success {
                register_pending_channel_sources(app, evloop, state);
            }
        }
        MuxEvent::DrdynvcReady => {
            if state.front.codec.gfx_required && state.gfx_channel_key.is_none() {
                open_gfx_channel(state);
            }
        }
        MuxEvent::DrdynvcFailed => {
            gfx_unavailable(app, state);
        }
        MuxEvent::GfxOpenResult { success } => {
            if !success {
                gfx_unavailable(app, state);
            }
            // On success the client follows up with CapsAdvertise.
        }
        MuxEvent::GfxData(data) => {
            let (events, response) = match state.front.gfx.process(&data) {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(id = state.id, error = %e, "gfx protocol error");
                    gfx_unavailable(app, state);
                    return;
                }
            };
            if let Some(response) = response {
                state.write_gfx(&response);
            }
            for gfx_event in events {
                process_gfx_event(app, state, gfx_event);
            }
        }
        MuxEvent::GfxClosed => {
            state.front.gfx_connected = false;
            state.front.gfx_output_ready = false;
            state.gfx_channel_key = None;
        }
    }
}

fn open_gfx_channel(state: &mut ConnState) {
    let ConnState { mux, peer, .. } = state;
    match mux.open_internal_gfx(peer, GFX_CHANNEL_NAME) {
        Ok(key) => {
            tracing::debug!(id = state.id, "opening internal dynamic graphics channel");
            state.gfx_channel_key = Some(key);
        }
        Err(e) => {
            tracing::error!(id = state.id, error = %e, "unable to open gfx channel");
        }
    }
}

/// The graphics pipeline is not coming up: fall back to the bitmap path
/// so the session still renders.
fn gfx_unavailable(app: &Arc<AppContext>, state: &mut ConnState) {
    if !state.front.codec.gfx_required {
        return;
    }
    tracing::error!(id = state.id, "graphics pipeline unavailable, falling back to bitmap updates");
    state.front.codec.mode = CodecMode::Bmp;
    state.front.codec.gfx_required = false;
    state.front.gfx_h264_supported = false;
    state.front.state.set_event(FrameEvent::FrontendStopWaitingGfx);
    let app_ref: &AppContext = app;
    with_own_ctx(app_ref, state, |ctx| {
        if ctx.conn.front.state.get() == FrameState::WaitingTimer {
            frontend::initiate_immediate_request(ctx, true);
            frontend::handle_wait_timer_state(ctx);
        }
    });
}

fn process_gfx_event(app: &Arc<AppContext>, state: &mut ConnState, event: GfxEvent) {
    match event {
        GfxEvent::Ready { h264, avc444 } => {
            state.front.gfx_connected = true;
            let h264_allowed =
                h264 && !state.front.gfx_h264_forbidden && state.front.avc.is_some();
            state.front.gfx_h264_supported = h264_allowed;
            state.front.gfx_avc444_supported = avc444 && h264_allowed;
            state.front.state.set_event(FrameEvent::FrontendStopWaitingGfx);

            let app_ref: &AppContext = app;
            with_own_ctx(app_ref, state, |ctx| {
                if ctx.conn.front.state.get() == FrameState::WaitingTimer {
                    frontend::initiate_immediate_request(ctx, true);
                    frontend::handle_wait_timer_state(ctx);
                }
            });
        }
        GfxEvent::FrameAck {
            frame_id,
            queue_depth,
        } => {
            if queue_depth == crate::rdp::gfx::QUEUE_DEPTH_SUSPENDED {
                tracing::trace!(id = state.id, "gfx frame acks suspended");
            }
            handle_frame_ack_front(app, state, frame_id);
        }
    }
}

/* ------------------------------------------------------------------ */
/* logon and activation                                                */
/* ------------------------------------------------------------------ */

fn post_connect(app: &Arc<AppContext>, state: &mut ConnState) -> bool {
    let Some(icp) = app.icp() else {
        tracing::error!(id = state.id, "no session manager connection");
        return false;
    };
    let Some(info) = state.peer.client_info.clone() else {
        return false;
    };

    if state.backend_props.is_some() {
        tracing::error!(id = state.id, "service endpoint must be unset in post connect");
        return false;
    }
    if state.front.activation_count != 0 {
        tracing::error!(id = state.id, "activation count must be 0 in post connect");
        return false;
    }
    if info.autologon {
        tracing::debug!(
            id = state.id,
            user = %info.username,
            domain = %info.domain,
            "autologon enabled"
        );
    }

    let gcc = &state.peer.gcc;
    tracing::debug!(
        id = state.id,
        width = gcc.desktop_width,
        height = gcc.desktop_height,
        depth = gcc.color_depth,
        "requested desktop"
    );

    let request = msgs::LogonUser {
        connection_id: state.id,
        username: info.username.clone(),
        domain: info.domain.clone(),
        password: info.password.clone(),
        client_hostname: gcc.client_name.clone(),
        client_address: info.client_address.clone(),
        client_build: gcc.client_build,
        client_product_id: 1,
        hardware_id: 0,
        protocol: 2, // WTS_PROTOCOL_TYPE_RDP
        width: gcc.desktop_width,
        height: gcc.desktop_height,
        color_depth: gcc.color_depth,
    };

    let reply = match icp.logon_user(&request) {
        Ok(reply) => reply,
        Err(e) => {
            tracing::error!(id = state.id, error = %e, "logon user call failed");
            return false;
        }
    };

    tracing::debug!(
        id = state.id,
        endpoint = %reply.props.service_endpoint,
        "logon user call successful"
    );
    state.backend_props = Some(reply.props);
    state.max_width = reply.max_width;
    state.max_height = reply.max_height;

    // Server-side codec policy.
    state.front.gfx_forbidden = icp
        .property_bool(state.id, "gfx.forbidden")
        .ok()
        .flatten()
        .unwrap_or(false);
    state.front.gfx_h264_forbidden = icp
        .property_bool(state.id, "gfx.forbidH264")
        .ok()
        .flatten()
        .unwrap_or(false);
    if let Ok(Some(bitrate)) = icp.property_number(state.id, "session.bitrate") {
        state.front.bandwidth.configured_bitrate = bitrate.max(0) as u32;
    }
    if let Ok(Some(fps)) = icp.property_number(state.id, "session.fps") {
        if fps > 0 && fps <= 60 {
            state.fps = fps as u32;
        }
    }

    state.peer.proceed_after_logon(app.codecs.has_rfx()).is_ok()
}

fn install_frame_timer(
    app: &Arc<AppContext>,
    evloop: &mut EventLoop,
    handle: &Arc<ConnHandle>,
    state: &mut ConnState,
) -> bool {
    let timer_app = Arc::clone(app);
    let timer_handle = Arc::clone(handle);
    match evloop.add_timer(1000 / state.fps.max(1), move |evloop| {
        frame_timer_tick(&timer_app, evloop, &timer_handle);
    }) {
        Ok((source, timer)) => {
            state.frame_source = Some(source);
            state.frame_timer = Some(timer);
            true
        }
        Err(e) => {
            tracing::error!(id = state.id, error = %e, "unable to add frame timer");
            false
        }
    }
}

/// Attach the backend pipe to the loop.
fn install_backend_source(
    app: &Arc<AppContext>,
    evloop: &mut EventLoop,
    handle: &Arc<ConnHandle>,
    state: &mut ConnState,
) -> bool {
    let Some(backend) = state.backend.as_ref() else {
        return false;
    };
    let pipe_fd = backend.pipe_fd();
    let pipe_app = Arc::clone(app);
    let pipe_handle = Arc::clone(handle);
    match evloop.add_fd(
        pipe_fd,
        Interest::READ,
        Box::new(move |evloop, mask, _fd| {
            handle_backend_pipe(&pipe_app, evloop, &pipe_handle, mask);
        }),
    ) {
        Ok(source) => {
            state.backend_source = Some(source);
            true
        }
        Err(e) => {
            tracing::error!(id = state.id, error = %e, "error adding backend pipe to event loop");
            false
        }
    }
}

/// Runs on every Activated event (first activation and reactivations).
fn peer_activate(app: &Arc<AppContext>, evloop: &mut EventLoop, state: &mut ConnState) -> bool {
    let handle = match app.get(state.id) {
        Some(handle) => handle,
        None => return false,
    };

    state.front.activation_count += 1;
    tracing::debug!(
        id = state.id,
        activation = state.front.activation_count,
        backend = state.backend.is_some(),
        "performing activation"
    );

    // Microsoft clients insist on a fresh gfx channel after every
    // reactivation; close it here and reopen from init_output.
    if state.gfx_channel_key.is_some() {
        if let Some(shutdown) = state.front.gfx.shutdown_output() {
            state.write_gfx(&shutdown);
        }
        let key = state.gfx_channel_key.take();
        if let Some(key) = key {
            let ConnState { mux, peer, .. } = state;
            mux.close_dvc(peer, key);
        }
        state.front.gfx = GfxServer::new();
        state.front.gfx_connected = false;
        state.front.gfx_output_ready = false;
    }

    frontend::select_codec_mode(state, app.codecs.has_rfx());

    if state.backend.is_some() || state.shadowing != state.id {
        return reactivate(app, state);
    }

    /* first activation */

    if state.front.activation_count > 2 {
        tracing::error!(id = state.id, "re-activation loop detected, bailing out");
        return false;
    }
    if state.front.activation_count == 1 {
        let (width, height) = state.peer.desktop_size();
        state.front.initial_width = width;
        state.front.initial_height = height;
    }

    let mut resize = false;
    let (mut width, mut height) = state.peer.desktop_size();

    if state.peer.caps.color_depth == 24 && state.front.codec.mode == CodecMode::Bmp {
        // 24 bpp would need interleaved RLE in the planar path; fall
        // back to 16 bpp instead.
        tracing::info!(id = state.id, "color depth 24 not supported in bitmap mode, switching to 16bpp");
        state.peer.set_color_depth(16);
        resize = true;
    }
    if state.max_width != 0 && width > state.max_width {
        tracing::info!(id = state.id, width, max = state.max_width, "client width exceeds limit");
        width = state.max_width;
        resize = true;
    }
    if state.max_height != 0 && height > state.max_height {
        tracing::info!(id = state.id, height, max = state.max_height, "client height exceeds limit");
        height = state.max_height;
        resize = true;
    }

    if resize {
        state.front.state.set_event(FrameEvent::FrontendTriggerResize);
        return state.peer.start_resize(width, height).is_ok();
    }

    if state.front.state.get() == FrameState::WaitingResize {
        state.front.state.set_event(FrameEvent::FrontendResized);
    }

    let Some(props) = state.backend_props.take() else {
        tracing::error!(id = state.id, "no backend endpoint for activation");
        return false;
    };

    let mut backend = match BackendLink::connect(props) {
        Ok(backend) => backend,
        Err(e) => {
            tracing::error!(id = state.id, error = %e, "error creating backend");
            return false;
        }
    };

    let capabilities = wiremsg::Capabilities {
        desktop_width: width,
        desktop_height: height,
        color_depth: state.peer.caps.color_depth,
        keyboard_layout: state.peer.gcc.keyboard_layout,
        keyboard_type: state.peer.gcc.keyboard_type,
        keyboard_subtype: state.peer.gcc.keyboard_subtype,
        client_id: state.id,
    };
    let indicators = u32::from(state.front.indicators);
    if backend.send_capabilities(capabilities).is_err()
        || backend.send_sync_keyboard(indicators, state.id).is_err()
    {
        tracing::error!(id = state.id, "error sending capabilities to backend");
        return false;
    }
    state.backend = Some(backend);

    if !install_backend_source(app, evloop, &handle, state) {
        state.backend = None;
        return false;
    }
    if !install_frame_timer(app, evloop, &handle, state) {
        return false;
    }

    let cache_size = state.peer.caps.pointer_cache_size;
    if cache_size > 0 {
        tracing::debug!(id = state.id, cache_size, "creating pointer cache table");
    }
    state.front.pointer_cache = tessera_encode::pointer::PointerCache::new(cache_size);

    state.front.bandwidth = crate::bandwidth::BandwidthMgmt::new(
        state.front.bandwidth.configured_bitrate,
    );
    state
        .front
        .bandwidth
        .init_buckets(state.front.bandwidth.configured_bitrate, state.fps);

    let drdynvc = state.mux.post_connect(&mut state.peer);
    if drdynvc == DrdynvcState::Failed {
        return false;
    }

    init_output(app, state);
    true
}

fn reactivate(app: &Arc<AppContext>, state: &mut ConnState) -> bool {
    // Color depth changes on reactivation are not supported once the
    // encoder exists.
    if let Some(encoder) = state.front.encoder.as_ref() {
        if encoder.dst_bits_per_pixel != state.peer.caps.color_depth {
            tracing::error!(id = state.id, "reactivation with new color depth is not supported");
            return false;
        }
    }
    let max_request = state.peer.caps.multifrag_max_request_size;
    if let Some(encoder) = state.front.encoder.as_mut() {
        if encoder.multifrag_max_request_size != max_request
            && encoder.update_max_request_size(max_request).is_err()
        {
            tracing::error!(id = state.id, "failed to update encoder max request size");
            return false;
        }
    }

    // A finished resize may immediately uncover another pending one.
    if state.front.state.get() == FrameState::WaitingResize {
        if let Some((width, height)) = state.front.pending_resize.take() {
            let (cur_w, cur_h) = state.peer.desktop_size();
            if width != cur_w || height != cur_h {
                return state.peer.start_resize(width, height).is_ok();
            }
        }
        state.front.state.set_event(FrameEvent::FrontendResized);
    }

    // Restore the pointer state the client lost in the reactivation.
    state.front.pointer_cache.clear();
    let replay = {
        let app_ref: &AppContext = app;
        let mut snapshot = None;
        with_own_ctx(app_ref, state, |ctx| {
            snapshot = ctx.backend_ref().map(|b| {
                (
                    b.last_system_pointer,
                    b.have_backend_pointer,
                    b.last_set_pointer.clone(),
                )
            });
        });
        snapshot
    };
    if let Some((system_pointer, have_pointer, last_pointer)) = replay {
        frontend::set_system_pointer(state, system_pointer);
        if have_pointer {
            if let Some(last) = last_pointer {
                let shape = frontend::shape_from_wire(last);
                frontend::set_pointer(state, &shape);
            }
        }
    }

    init_output(app, state);
    true
}

/// Decide how output starts after an activation: straight to frames, or
/// gated on the graphics pipeline.
fn init_output(app: &Arc<AppContext>, state: &mut ConnState) {
    tracing::debug!(
        id = state.id,
        gfx_required = state.front.codec.gfx_required,
        drdynvc = ?state.mux.drdynvc_state,
        "initializing output"
    );

    // Buggy clients forget to lift suppress-output after reactivating
    // while minimized; always start with output enabled.
    state.front.state.set_event(FrameEvent::FrontendEnableOutput);

    if !state.front.codec.gfx_required {
        state.front.state.set_event(FrameEvent::FrontendStopWaitingGfx);
        let app_ref: &AppContext = app;
        with_own_ctx(app_ref, state, |ctx| {
            if ctx.conn.front.state.get() == FrameState::WaitingTimer {
                frontend::initiate_immediate_request(ctx, true);
                frontend::handle_wait_timer_state(ctx);
            }
        });
        return;
    }

    state.front.state.set_event(FrameEvent::FrontendWaitingGfx);
    if state.mux.drdynvc_state == DrdynvcState::Ready && state.gfx_channel_key.is_none() {
        open_gfx_channel(state);
    }
}

/// Recreate this front's encoder for the (possibly new) backend
/// geometry, then drive the client resize when needed.
fn resize_frontend(ctx: &mut FrontCtx<'_>) -> bool {
    let Some(screen) = ctx.backend_ref().map(|b| b.screen) else {
        return false;
    };

    let front = &mut ctx.conn.front;
    if ctx.conn.peer.desktop_size() == (screen.width, screen.height) {
        // Same size: only the encoder needs recreating.
    } else if front.state.get() == FrameState::WaitingResize {
        // Already resizing; remember the new target for reactivation.
        front.pending_resize = Some((screen.width, screen.height));
    } else if ctx.conn.peer.start_resize(screen.width, screen.height).is_err() {
        return false;
    } else {
        ctx.conn.front.state.set_event(FrameEvent::FrontendTriggerResize);
    }

    let caps = &ctx.conn.peer.caps;
    match BitmapEncoder::new(
        screen.width,
        screen.height,
        screen.scanline,
        caps.color_depth,
        caps.multifrag_max_request_size,
    ) {
        Ok(encoder) => {
            ctx.conn.front.encoder = Some(encoder);
            true
        }
        Err(e) => {
            tracing::error!(id = ctx.conn.id, error = %e, "failed to recreate bitmap encoder");
            ctx.conn.peer.send_error_info(ERRINFO_PRE_CONNECT_FAILED);
            ctx.conn.running = false;
            false
        }
    }
}

/* ------------------------------------------------------------------ */
/* backend pipe                                                        */
/* ------------------------------------------------------------------ */

fn handle_backend_pipe(
    app: &Arc<AppContext>,
    evloop: &mut EventLoop,
    handle: &Arc<ConnHandle>,
    mask: Interest,
) {
    let mut state = lock_state(handle);

    if mask.contains(Interest::WRITE) {
        let result = state.backend.as_mut().map(|b| b.on_writable());
        if matches!(result, Some(Err(_))) {
            tracing::error!(id = state.id, "backend pipe write failed");
            close_connection(app, evloop, &mut state);
            return;
        }
    }

    if mask.intersects(Interest::READ | Interest::HANGUP) {
        let messages = match state.backend.as_mut().map(|b| b.drain_input()) {
            Some(Ok(messages)) => messages,
            Some(Err(e)) => {
                tracing::error!(id = state.id, error = %e, "backend link failed");
                close_connection(app, evloop, &mut state);
                return;
            }
            None => return,
        };
        for message in messages {
            if !state.running {
                break;
            }
            process_backend_message(app, evloop, &mut state, message);
        }
    }

    // Track pipe write interest.
    if state.running {
        if let (Some(source), Some(backend)) = (state.backend_source.as_ref(), state.backend.as_ref())
        {
            let mask = if backend.wants_write() {
                Interest::READ | Interest::WRITE
            } else {
                Interest::READ
            };
            if evloop.mask(source) != Some(mask) {
                let _ = evloop.change_mask(source, mask);
            }
        }
    }
}

fn process_backend_message(
    app: &Arc<AppContext>,
    evloop: &mut EventLoop,
    state: &mut ConnState,
    message: WireMessage,
) {
    match message {
        WireMessage::FramebufferInfo(info) => {
            handle_framebuffer_info(app, evloop, state, info);
        }
        WireMessage::SetPointer(pointer) => {
            handle_set_pointer(app, evloop, state, pointer);
        }
        WireMessage::SetSystemPointer(msg) => {
            let Some(backend) = state.backend.as_mut() else {
                return;
            };
            backend.last_system_pointer = msg.ptr_type;
            if msg.ptr_type == wiremsg::SYSPTR_NULL {
                backend.have_backend_pointer = false;
            }
            if !backend.active {
                return;
            }
            for_each_front(app, state, |ctx| {
                if msg.client_id == 0 || ctx.conn.id == msg.client_id {
                    frontend::set_system_pointer(ctx.conn, msg.ptr_type);
                    let _ = ctx.conn.peer.flush();
                }
            });
        }
        WireMessage::Beep(beep) => {
            if !state.backend.as_ref().is_some_and(|b| b.active) {
                tracing::error!(id = state.id, "ignoring beep, backend is not active");
                return;
            }
            for_each_front(app, state, |ctx| {
                ctx.conn.peer.send_play_sound(beep.duration, beep.frequency);
                let _ = ctx.conn.peer.flush();
            });
        }
        WireMessage::SbpRequest(request) => {
            handle_sbp_request(app, state, request);
        }
        WireMessage::FramebufferSyncReply(reply) => {
            let expected = state
                .backend
                .as_ref()
                .and_then(|b| b.damage.as_ref())
                .map(|d| d.id());
            if !state.backend.as_ref().is_some_and(|b| b.active) {
                tracing::error!(id = state.id, "ignoring sync reply, backend is not active");
                return;
            }
            if expected != Some(reply.buffer_id) {
                tracing::error!(
                    id = state.id,
                    buffer_id = reply.buffer_id,
                    "sync reply for an unknown buffer"
                );
                return;
            }
            handle_sync_reply(app, evloop, state);
        }
        WireMessage::MessageReply(reply) => {
            let answer = state
                .backend
                .as_mut()
                .and_then(|b| b.take_message_answer(reply.message_id));
            match answer {
                Some((icp_tag, icp_type)) => {
                    if let Some(icp) = app.icp() {
                        let _ = icp.send_response_json(
                            icp_tag,
                            icp_type,
                            IcpStatus::Success,
                            &msgs::UserMessageReply {
                                result: reply.result,
                            },
                        );
                    }
                }
                None => {
                    tracing::error!(id = state.id, message_id = reply.message_id, "unmatched message reply");
                }
            }
        }
        other => {
            tracing::error!(
                id = state.id,
                msg = WireMessage::name(other.tag()),
                "unexpected message from backend"
            );
        }
    }
}

fn handle_framebuffer_info(
    app: &Arc<AppContext>,
    evloop: &mut EventLoop,
    state: &mut ConnState,
    info: wiremsg::FramebufferInfo,
) {
    let Some(backend) = state.backend.as_mut() else {
        return;
    };
    backend.waiting_sync_reply = false;
    backend.backend_version = info.version;
    backend.multiseat_capable = info.multiseat_capable;

    tracing::debug!(
        id = state.id,
        width = info.width,
        height = info.height,
        bpp = info.bits_per_pixel,
        scanline = info.scanline,
        user_id = info.user_id,
        "framebuffer info"
    );

    if !backend.active {
        tracing::debug!(id = state.id, "backend is not active, ignoring framebuffer info");
        return;
    }

    let new_size =
        info.width != backend.screen.width || info.height != backend.screen.height;
    let new_encoders = !new_size && info.scanline != backend.screen.scanline;

    if new_size || new_encoders || backend.damage.is_none() {
        match DamageBuffer::create(info.width, info.height, info.scanline) {
            Ok(mut damage) => {
                damage.set_user(info.user_id);
                backend.damage = Some(damage);
            }
            Err(e) => {
                tracing::error!(id = state.id, error = %e, "problem creating damage buffer");
                close_connection(app, evloop, state);
                return;
            }
        }
    } else if let Some(damage) = backend.damage.as_mut() {
        damage.set_user(info.user_id);
    }

    backend.screen.width = info.width;
    backend.screen.height = info.height;
    backend.screen.scanline = info.scanline;
    backend.screen.bits_per_pixel = info.bits_per_pixel;
    backend.screen.bytes_per_pixel = info.bytes_per_pixel;

    // The backend needs the buffer id before it can answer syncs; tell
    // it right away with a sync request once a frame is wanted.
    let codecs = &app.codecs;
    for_each_front(app, state, |ctx| {
        let caps_depth = ctx.conn.peer.caps.color_depth;
        let max_request = ctx.conn.peer.caps.multifrag_max_request_size;
        let screen = ctx.backend_ref().map(|b| b.screen);
        let Some(screen) = screen else {
            return;
        };

        if !new_size && (ctx.conn.front.encoder.is_none() || new_encoders) {
            match BitmapEncoder::new(
                screen.width,
                screen.height,
                screen.scanline,
                caps_depth,
                max_request,
            ) {
                Ok(encoder) => ctx.conn.front.encoder = Some(encoder),
                Err(e) => {
                    tracing::error!(id = ctx.conn.id, error = %e, "failed to create bitmap encoder");
                    ctx.conn.running = false;
                    return;
                }
            }
            // Codec transforms are recreated alongside the encoder.
            ctx.conn.front.rfx = codecs.new_rfx();
            ctx.conn.front.avc = codecs.new_avc();
        }

        ctx.conn.front.state.set_event(FrameEvent::BackendAttached);
        if new_size {
            if !resize_frontend(ctx) {
                return;
            }
            ctx.conn.front.rfx = codecs.new_rfx();
            ctx.conn.front.avc = codecs.new_avc();
        } else {
            frontend::handle_wait_timer_state(ctx);
        }
    });
}

fn handle_set_pointer(
    app: &Arc<AppContext>,
    _evloop: &mut EventLoop,
    state: &mut ConnState,
    pointer: wiremsg::SetPointer,
) {
    let shape = frontend::shape_from_wire(pointer.clone());
    if let Err(e) = shape.validate() {
        tracing::error!(id = state.id, error = %e, "rejecting pointer shape");
        return;
    }

    let Some(backend) = state.backend.as_mut() else {
        return;
    };
    backend.have_backend_pointer = true;
    backend.last_system_pointer = wiremsg::SYSPTR_DEFAULT;
    backend.last_set_pointer = Some(pointer.clone());

    if !backend.active {
        tracing::debug!(id = state.id, "not treating pointer, backend is not active");
        return;
    }

    for_each_front(app, state, |ctx| {
        if pointer.client_id == 0 || ctx.conn.id == pointer.client_id {
            frontend::set_pointer(ctx.conn, &shape);
            let _ = ctx.conn.peer.flush();
        }
    });
}

fn handle_sbp_request(app: &Arc<AppContext>, state: &mut ConnState, request: wiremsg::SbpRequest) {
    let Some(icp) = app.icp() else {
        tracing::error!(id = state.id, "no icp connection for sbp request");
        return;
    };
    let connection_id = state.id;
    let original_tag = request.tag;
    let original_type = request.sbp_type;
    let app_clone = Arc::clone(app);

    let result = icp.call_raw_async(request.sbp_type, &request.data, move |result| {
        let reply = match result {
            Ok((IcpStatus::Success, data)) => wiremsg::SbpReply {
                sbp_type: original_type,
                tag: original_tag,
                status: SbpStatus::Success,
                data,
            },
            Ok((IcpStatus::NotFound, _)) => wiremsg::SbpReply {
                sbp_type: original_type,
                tag: original_tag,
                status: SbpStatus::NotFound,
                data: Vec::new(),
            },
            Ok((IcpStatus::Failed, _)) => wiremsg::SbpReply {
                sbp_type: original_type,
                tag: original_tag,
                status: SbpStatus::TransportError,
                data: Vec::new(),
            },
            Err(tessera_icp::IcpError::Timeout) => wiremsg::SbpReply {
                sbp_type: original_type,
                tag: original_tag,
                status: SbpStatus::Timeout,
                data: Vec::new(),
            },
            Err(_) => wiremsg::SbpReply {
                sbp_type: original_type,
                tag: original_tag,
                status: SbpStatus::TransportError,
                data: Vec::new(),
            },
        };
        if !app_clone.post_command(connection_id, Command::SbpReply(reply)) {
            tracing::error!(connection_id, "sbp reply for a vanished connection");
        }
    });
    if result.is_err() {
        tracing::error!(id = state.id, "failed to forward sbp request");
    }
}

/// A framebuffer sync reply fans out to every front connection.
fn handle_sync_reply(app: &Arc<AppContext>, evloop: &mut EventLoop, state: &mut ConnState) {
    if let Some(backend) = state.backend.as_mut() {
        backend.waiting_sync_reply = false;
    }

    // First pass: consume the shared damage and emit frames. Keeping
    // this separate from the frame-sent bookkeeping preserves coherent
    // damage data for every front connection.
    for_each_front(app, state, |ctx| {
        frontend::consume_backend_damage(ctx);

        if ctx.conn.front.state.get() != FrameState::WaitingSyncReply {
            return;
        }
        ctx.conn
            .front
            .state
            .set_event(FrameEvent::BackendSyncReplyReceived);

        if ctx.conn.front.encoder.is_none() {
            tracing::error!(id = ctx.conn.id, "sync reply without an encoder");
            ctx.conn.running = false;
            return;
        }
        if ctx.conn.front.state.get() == FrameState::WaitingActiveOutput {
            return;
        }
        if let Err(e) = frontend::send_surface_bits(ctx) {
            tracing::error!(id = ctx.conn.id, error = %e, "error sending surface bits");
            ctx.conn.running = false;
        }
    });

    // Second pass: flush and either finish the frame or wait for the
    // socket to drain.
    for_each_front(app, state, |ctx| {
        match ctx.conn.peer.flush() {
            Ok(false) => frontend::handle_frame_sent(ctx),
            Ok(true) => { /* write-blocked: the mask update below re-arms us */ }
            Err(_) => ctx.conn.running = false,
        }
    });

    // Mask maintenance happens outside the ctx borrows.
    let front_ids = state.front_ids.clone();
    for front_id in front_ids {
        if front_id == state.id {
            sync_rdp_mask(evloop, state);
        } else if let Some(front_handle) = app.get(front_id) {
            let mut front = lock_state(&front_handle);
            sync_rdp_mask(evloop, &mut front);
        }
    }
}

/* ------------------------------------------------------------------ */
/* frame timer                                                         */
/* ------------------------------------------------------------------ */

fn frame_timer_tick(app: &Arc<AppContext>, evloop: &mut EventLoop, handle: &Arc<ConnHandle>) {
    let mut state = lock_state(handle);
    if !state.running {
        return;
    }
    let now = now_ms();
    let fps = state.fps;

    for_each_front(app, &mut state, |ctx| {
        let front = &mut ctx.conn.front;

        // Per-second fps / throughput windows.
        if front.stats.fps_timestamp + 1000 < now {
            front.stats.fps_timestamp = now;
            front.stats.fps_measured = front.stats.fps_current;
            front.stats.fps_current = 0;
        }
        let bytes = ctx.conn.peer.take_bytes_sent();
        let front = &mut ctx.conn.front;
        front.stats.bytes_sent_current += bytes;
        if front.stats.bytes_sent_timestamp + 1000 < now {
            let window_ms = (now - front.stats.bytes_sent_timestamp) as u32;
            front.stats.bytes_sent_timestamp = now;
            front.stats.bytes_sent = front.stats.bytes_sent_current;
            // Feed the sliding bitrate estimate.
            front
                .bandwidth
                .bandwidth_measured(front.stats.bytes_sent as u32, window_ms.max(1));
            front.stats.bytes_sent_current = 0;
        }

        front.state.set_event(FrameEvent::FrameTimer);

        let mut bandwidth_exceeded = false;
        if front.codec.mode == CodecMode::H264 {
            let frame_acknowledge = front.frame_acknowledge;
            front
                .bandwidth
                .update_data_usage(bytes as u32, frame_acknowledge, fps);
            if front.bandwidth.update_bucket(fps) == 0 {
                bandwidth_exceeded = true;
            }
        }

        if bandwidth_exceeded {
            ctx.conn
                .front
                .state
                .set_event(FrameEvent::FrontendBandwidthFail);
            return;
        }

        ctx.conn
            .front
            .state
            .set_event(FrameEvent::FrontendBandwidthGood);
        frontend::handle_progressive_updates(ctx);

        // RTT probe: the next emitted frame's ack closes the window.
        let front = &mut ctx.conn.front;
        if front.rtt_probe.is_none()
            && front.bandwidth.should_probe_rtt(
                now,
                front.last_ack_frame,
                front.next_frame_id,
                front.frame_acknowledge,
            )
        {
            front.rtt_probe = Some((now, front.next_frame_id));
        }

        frontend::handle_wait_timer_state(ctx);
    });

    // Flush whatever the tick produced.
    let front_ids = state.front_ids.clone();
    for front_id in front_ids {
        if front_id == state.id {
            let _ = state.peer.flush();
            sync_rdp_mask(evloop, &mut state);
        } else if let Some(front_handle) = app.get(front_id) {
            let mut front = lock_state(&front_handle);
            let _ = front.peer.flush();
            sync_rdp_mask(evloop, &mut front);
        }
    }
}

/* ------------------------------------------------------------------ */
/* channel pipe sources                                                */
/* ------------------------------------------------------------------ */

/// Register event sources for channels that have a pipe listener but no
/// source yet.
fn register_pending_channel_sources(
    app: &Arc<AppContext>,
    evloop: &mut EventLoop,
    state: &mut ConnState,
) {
    let handle = match app.get(state.id) {
        Some(handle) => handle,
        None => return,
    };
    for key in state.mux.keys() {
        if state.channel_sources.contains_key(&key) {
            continue;
        }
        let Some(listener_fd) = state.mux.channel(key).and_then(|c| c.listener_fd()) else {
            continue;
        };
        let cb_app = Arc::clone(app);
        let cb_handle = Arc::clone(&handle);
        match evloop.add_fd(
            listener_fd,
            Interest::READ,
            Box::new(move |evloop, _mask, _fd| {
                handle_channel_listener(&cb_app, evloop, &cb_handle, key);
            }),
        ) {
            Ok(source) => {
                state.channel_sources.insert(
                    key,
                    ChannelSources {
                        listener: Some(source),
                        client: None,
                    },
                );
            }
            Err(e) => {
                tracing::error!(id = state.id, error = %e, "error adding channel listener source");
            }
        }
    }
}

fn handle_channel_listener(
    app: &Arc<AppContext>,
    evloop: &mut EventLoop,
    handle: &Arc<ConnHandle>,
    key: u32,
) {
    let mut state = lock_state(handle);

    let accepted = match state.mux.channel_mut(key) {
        Some(channel) => channel.accept_pipe(),
        None => return,
    };
    if let Err(e) = accepted {
        tracing::error!(id = state.id, error = %e, "error accepting channel pipe");
        return;
    }

    // Replace any previous client source.
    if let Some(sources) = state.channel_sources.get_mut(&key) {
        if let Some(mut old) = sources.client.take() {
            evloop.remove_source(&mut old);
        }
    }

    let Some(client_fd) = state.mux.channel(key).and_then(|c| c.client_fd()) else {
        return;
    };
    let cb_app = Arc::clone(app);
    let cb_handle = Arc::clone(handle);
    match evloop.add_fd(
        client_fd,
        Interest::READ,
        Box::new(move |evloop, mask, _fd| {
            handle_channel_pipe(&cb_app, evloop, &cb_handle, key, mask);
        }),
    ) {
        Ok(source) => {
            if let Some(sources) = state.channel_sources.get_mut(&key) {
                sources.client = Some(source);
            }
        }
        Err(e) => {
            tracing::error!(id = state.id, error = %e, "error adding channel pipe source");
        }
    }
}

fn teardown_channel(evloop: &mut EventLoop, state: &mut ConnState, key: u32, send_close: bool) {
    if let Some(mut sources) = state.channel_sources.remove(&key) {
        if let Some(mut s) = sources.listener.take() {
            evloop.remove_source(&mut s);
        }
        if let Some(mut s) = sources.client.take() {
            evloop.remove_source(&mut s);
        }
    }
    if send_close {
        let ConnState { mux, peer, .. } = state;
        mux.close_dvc(peer, key);
    } else {
        state.mux.remove_key(key);
    }
}

fn handle_channel_pipe(
    app: &Arc<AppContext>,
    evloop: &mut EventLoop,
    handle: &Arc<ConnHandle>,
    key: u32,
    mask: Interest,
) {
    let mut state = lock_state(handle);

    if mask.contains(Interest::WRITE) {
        let alive = match state.mux.channel_mut(key) {
            Some(channel) => channel.on_pipe_writable(),
            None => return,
        };
        if !alive {
            teardown_channel(evloop, &mut state, key, true);
            return;
        }
    }

    if mask.intersects(Interest::READ | Interest::HANGUP) {
        let mut rescheduled = false;
        let alive = {
            let ConnState { mux, peer, .. } = &mut *state;
            mux.pipe_readable(peer, key, &mut rescheduled)
        };
        if !alive {
            teardown_channel(evloop, &mut state, key, true);
            let _ = state.peer.flush();
            sync_rdp_mask(evloop, &mut state);
            return;
        }
        if rescheduled {
            if let Some(source) = state
                .channel_sources
                .get(&key)
                .and_then(|s| s.client.as_ref())
            {
                let _ = evloop.reschedule_for_read(source);
            }
        }
    }

    // Adjust the pipe write interest.
    let wants_write = state
        .mux
        .channel(key)
        .map(|c| c.wants_pipe_write())
        .unwrap_or(false);
    if let Some(source) = state
        .channel_sources
        .get(&key)
        .and_then(|s| s.client.as_ref())
    {
        let target_mask = if wants_write {
            Interest::READ | Interest::WRITE
        } else {
            Interest::READ
        };
        if evloop.mask(source) != Some(target_mask) {
            let _ = evloop.change_mask(source, target_mask);
        }
    }

    let _ = state.peer.flush();
    sync_rdp_mask(evloop, &mut state);
}

/* ------------------------------------------------------------------ */
/* command mailbox                                                     */
/* ------------------------------------------------------------------ */

fn icp_generic_response(app: &AppContext, tag: u32, msg_type: u32, success: bool) {
    if let Some(icp) = app.icp() {
        let _ = icp.send_response_json(
            tag,
            msg_type,
            IcpStatus::Success,
            &msgs::GenericReply { success },
        );
    }
}

fn handle_mailbox(app: &Arc<AppContext>, evloop: &mut EventLoop, handle: &Arc<ConnHandle>) {
    let commands = handle.drain_mailbox();
    let mut state = lock_state(handle);
    for command in commands {
        match command {
            Command::SwitchTo {
                tag,
                props,
                max_width,
                max_height,
            } => {
                if !process_switch_to(app, evloop, &mut state, tag, props, max_width, max_height) {
                    tracing::error!(id = state.id, "error processing backend switch");
                    close_connection(app, evloop, &mut state);
                }
            }
            Command::Logoff { tag } => {
                close_connection(app, evloop, &mut state);
                state.mux.close_all();
                icp_generic_response(app, tag, msgs::MSG_LOGOFF_USER_SESSION, true);
                state.send_disconnect = false;
            }
            Command::SbpReply(reply) => {
                let delivered = state
                    .backend
                    .as_mut()
                    .map(|b| b.send_sbp_reply(reply).is_ok());
                match delivered {
                    Some(true) => {}
                    Some(false) => {
                        tracing::error!(id = state.id, "error sending sbp reply to backend");
                        close_connection(app, evloop, &mut state);
                    }
                    None => {
                        tracing::error!(id = state.id, "sbp reply without a backend");
                    }
                }
            }
            Command::VcConnect {
                tag,
                vc_name,
                flags,
            } => {
                process_vc_connect(app, evloop, &mut state, tag, &vc_name, flags);
            }
            Command::VcDisconnect {
                tag,
                vc_name,
                instance,
            } => {
                let response = match state.mux.find_for_close(&vc_name, instance) {
                    Some((key, current)) => {
                        if current {
                            teardown_channel(evloop, &mut state, key, true);
                        }
                        // An old instance was already replaced; report
                        // success either way.
                        true
                    }
                    None => false,
                };
                icp_generic_response(app, tag, msgs::MSG_VC_CLOSE, response);
            }
            Command::UserMessage {
                tag,
                message_type,
                style,
                timeout,
                parameters,
            } => {
                let message = wiremsg::UserMessage {
                    message_id: 0,
                    message_type,
                    style,
                    timeout,
                    parameters,
                    icp_tag: tag,
                    icp_type: msgs::MSG_USER_MESSAGE,
                };
                let sent = state
                    .backend
                    .as_mut()
                    .map(|b| b.send_user_message(message).is_ok())
                    .unwrap_or(false);
                if !sent {
                    tracing::error!(id = state.id, "unable to forward user message");
                    icp_generic_response(app, tag, msgs::MSG_USER_MESSAGE, false);
                }
            }
            Command::StartRemoteControl { tag, request } => {
                process_start_remote_control(app, evloop, &mut state, tag, request);
            }
            Command::NewShadowingFrontend {
                tag,
                spy_id,
                rdp_source,
                request,
            } => {
                process_new_shadowing_frontend(
                    app, evloop, &mut state, tag, spy_id, rdp_source, request,
                );
            }
            Command::RewireOriginalBackend { rdp_source, rewire } => {
                process_rewire_original_backend(app, evloop, handle, &mut state, rdp_source, rewire);
            }
            Command::UnwireSpy { spy_id, tag } => {
                if !state.front_ids.contains(&spy_id) {
                    tracing::error!(id = state.id, spy_id, "spy to remove is not a front connection");
                    if let Some(tag) = tag {
                        icp_generic_response(app, tag, msgs::MSG_STOP_REMOTE_CONTROL, false);
                    }
                    continue;
                }
                unwire_spy(app, evloop, &mut state, spy_id, tag, true);
            }
            Command::StopShadowing { tag } => {
                if state.shadowing == state.id {
                    tracing::error!(id = state.id, "not shadowing, cannot stop");
                    icp_generic_response(app, tag, msgs::MSG_STOP_REMOTE_CONTROL, false);
                    continue;
                }
                let target = state.shadowing;
                let spy_id = state.id;
                if !app.post_command(
                    target,
                    Command::UnwireSpy {
                        spy_id,
                        tag: Some(tag),
                    },
                ) {
                    icp_generic_response(app, tag, msgs::MSG_STOP_REMOTE_CONTROL, false);
                }
            }
        }
        if !state.running && state.shadowing == state.id {
            break;
        }
    }

    if state.running {
        let _ = state.peer.flush();
        sync_rdp_mask(evloop, &mut state);
    }
}

fn process_switch_to(
    app: &Arc<AppContext>,
    evloop: &mut EventLoop,
    state: &mut ConnState,
    tag: u32,
    props: BackendProps,
    max_width: u32,
    max_height: u32,
) -> bool {
    // Tear down the old backend link.
    if let Some(mut source) = state.backend_source.take() {
        evloop.remove_source(&mut source);
    }
    state.backend = None;

    let (cur_w, cur_h) = state.peer.desktop_size();
    let mut resize = false;
    let mut width = cur_w;
    let mut height = cur_h;
    if max_width != 0 && max_width != cur_w {
        width = max_width.min(state.front.initial_width.max(1));
        resize = true;
    }
    if max_height != 0 && max_height != cur_h {
        height = max_height.min(state.front.initial_height.max(1));
        resize = true;
    }

    let backend = match BackendLink::connect(props) {
        Ok(mut backend) => {
            let capabilities = wiremsg::Capabilities {
                desktop_width: width,
                desktop_height: height,
                color_depth: state.peer.caps.color_depth,
                keyboard_layout: state.peer.gcc.keyboard_layout,
                keyboard_type: state.peer.gcc.keyboard_type,
                keyboard_subtype: state.peer.gcc.keyboard_subtype,
                client_id: state.id,
            };
            let ok = backend.send_capabilities(capabilities).is_ok()
                && backend
                    .send_sync_keyboard(u32::from(state.front.indicators), state.id)
                    .is_ok();
            if ok {
                Some(backend)
            } else {
                None
            }
        }
        Err(e) => {
            tracing::error!(id = state.id, error = %e, "error creating switched backend");
            None
        }
    };

    let success = backend.is_some();
    state.backend = backend;
    if success {
        state.max_width = max_width;
        state.max_height = max_height;
        let handle = match app.get(state.id) {
            Some(handle) => handle,
            None => return false,
        };
        if !install_backend_source(app, evloop, &handle, state) {
            state.backend = None;
            icp_generic_response(app, tag, msgs::MSG_SWITCH_TO, false);
            return false;
        }
    }
    icp_generic_response(app, tag, msgs::MSG_SWITCH_TO, success);
    if !success {
        return false;
    }

    state.front.state.set_event(FrameEvent::BackendSwitch);

    if resize && (width != cur_w || height != cur_h) {
        if state.front.state.get() == FrameState::WaitingResize {
            state.front.pending_resize = Some((width, height));
        } else {
            state.front.state.set_event(FrameEvent::FrontendTriggerResize);
            if state.peer.start_resize(width, height).is_err() {
                return false;
            }
        }
    }
    true
}

fn process_vc_connect(
    app: &Arc<AppContext>,
    evloop: &mut EventLoop,
    state: &mut ConnState,
    tag: u32,
    vc_name: &str,
    flags: u32,
) {
    let dynamic = flags & msgs::VC_FLAG_DYNAMIC != 0;

    if dynamic {
        let result = {
            let ConnState { mux, peer, .. } = state;
            mux.open_dvc(peer, vc_name, tag)
        };
        match result {
            Ok((_pipe, _key)) => {
                // The ICP response goes out when the create response
                // arrives; just make sure the pipe is watched.
                register_pending_channel_sources(app, evloop, state);
            }
            Err(e) => {
                tracing::error!(id = state.id, name = vc_name, error = %e, "dvc open failed");
                if let Some(icp) = app.icp() {
                    let _ = icp.send_response_json(
                        tag,
                        msgs::MSG_VC_OPEN,
                        IcpStatus::Success,
                        &msgs::VirtualChannelOpenReply {
                            success: false,
                            pipe_name: String::new(),
                            instance: 0,
                        },
                    );
                }
            }
        }
        return;
    }

    let result = {
        let ConnState { mux, peer, .. } = state;
        mux.open_svc(peer, vc_name)
    };
    match result {
        Ok((pipe_name, key)) => {
            register_pending_channel_sources(app, evloop, state);
            let instance = state
                .mux
                .channel(key)
                .map(|c| c.channel_instance)
                .unwrap_or(0);
            if let Some(icp) = app.icp() {
                let _ = icp.send_response_json(
                    tag,
                    msgs::MSG_VC_OPEN,
                    IcpStatus::Success,
                    &msgs::VirtualChannelOpenReply {
                        success: true,
                        pipe_name,
                        instance,
                    },
                );
            }
        }
        Err(e) => {
            tracing::error!(id = state.id, name = vc_name, error = %e, "svc open failed");
            if let Some(icp) = app.icp() {
                let _ = icp.send_response_json(
                    tag,
                    msgs::MSG_VC_OPEN,
                    IcpStatus::Success,
                    &msgs::VirtualChannelOpenReply {
                        success: false,
                        pipe_name: String::new(),
                        instance: 0,
                    },
                );
            }
        }
    }
}

/* ------------------------------------------------------------------ */
/* shadowing                                                           */
/* ------------------------------------------------------------------ */

/// Runs on the spy's loop: hand the RDP socket to the target.
fn process_start_remote_control(
    app: &Arc<AppContext>,
    evloop: &mut EventLoop,
    state: &mut ConnState,
    tag: u32,
    request: StartRemoteControl,
) {
    if state.shadowing != state.id {
        tracing::error!(
            id = state.id,
            target = state.shadowing,
            "already shadowing another session"
        );
        icp_generic_response(app, tag, msgs::MSG_START_REMOTE_CONTROL, false);
        return;
    }
    let Some(rdp_source) = state.rdp_source.take() else {
        icp_generic_response(app, tag, msgs::MSG_START_REMOTE_CONTROL, false);
        return;
    };
    let rdp_state = match evloop.store_state(rdp_source) {
        Ok(rdp_state) => rdp_state,
        Err(e) => {
            tracing::error!(id = state.id, error = %e, "unable to store the rdp event source");
            icp_generic_response(app, tag, msgs::MSG_START_REMOTE_CONTROL, false);
            return;
        }
    };
    if let Some(mut source) = state.frame_source.take() {
        evloop.remove_source(&mut source);
    }
    state.frame_timer = None;
    if let Some(backend) = state.backend.as_mut() {
        backend.active = false;
    }

    let spy_id = state.id;
    if !app.post_command(
        request.target_id,
        Command::NewShadowingFrontend {
            tag,
            spy_id,
            rdp_source: rdp_state,
            request,
        },
    ) {
        tracing::error!(id = spy_id, target = request.target_id, "shadow target not found");
        // Rewire ourselves: the source state was consumed by the failed
        // post, so the socket is gone; terminate the connection.
        state.front.state.set_event(FrameEvent::FrontendRewireError);
        if let Some(backend) = state.backend.as_mut() {
            backend.active = true;
        }
        icp_generic_response(app, tag, msgs::MSG_START_REMOTE_CONTROL, false);
        close_connection(app, evloop, state);
        return;
    }

    state.front.state.set_event(FrameEvent::BackendTriggerRewire);
}

/// Runs on the target's loop: adopt the spy's socket.
#[allow(clippy::too_many_arguments)]
fn process_new_shadowing_frontend(
    app: &Arc<AppContext>,
    evloop: &mut EventLoop,
    state: &mut ConnState,
    tag: u32,
    spy_id: ConnectionId,
    rdp_source: tessera_eventloop::SourceState,
    request: StartRemoteControl,
) {
    if state.shadowing != state.id {
        tracing::error!(
            id = state.id,
            "cannot be shadowed while shadowing another session"
        );
        post_rewire(app, spy_id, Some(rdp_source), true);
        icp_generic_response(app, tag, msgs::MSG_START_REMOTE_CONTROL, false);
        return;
    }
    let Some(spy_handle) = app.get(spy_id) else {
        icp_generic_response(app, tag, msgs::MSG_START_REMOTE_CONTROL, false);
        return;
    };

    // Reinstall the spy's socket in this loop.
    let restored = match evloop.restore_source(rdp_source) {
        Ok(source) => source,
        Err(e) => {
            tracing::error!(id = state.id, spy_id, error = %e, "unable to install spy event source");
            post_rewire(app, spy_id, None, true);
            icp_generic_response(app, tag, msgs::MSG_START_REMOTE_CONTROL, false);
            return;
        }
    };

    let seat = {
        let mut spy = lock_state(&spy_handle);
        spy.rdp_source = Some(restored);
        spy.front.state.prepare_shadowing(&state.front.state);

        let mut escape_modifiers = 0u16;
        if request.hot_key_modifiers & REMOTECONTROL_KBD_HOTKEY_CTRL != 0 {
            escape_modifiers |= frontend::MOD_CTRL;
        }
        if request.hot_key_modifiers & REMOTECONTROL_KBD_HOTKEY_ALT != 0 {
            escape_modifiers |= frontend::MOD_ALT;
        }
        if request.hot_key_modifiers & REMOTECONTROL_KBD_HOTKEY_SHIFT != 0 {
            escape_modifiers |= frontend::MOD_SHIFT;
        }
        spy.front.shadow_escape_modifiers = escape_modifiers;
        spy.front.shadow_escape_vk = request.hot_key_vk;

        if request.flags & REMOTECONTROL_FLAG_DISABLE_KEYBOARD != 0 {
            spy.front.input_filter |= frontend::INPUT_FILTER_KEYBOARD;
        }
        if request.flags & REMOTECONTROL_FLAG_DISABLE_MOUSE != 0 {
            spy.front.input_filter |= frontend::INPUT_FILTER_MOUSE;
        }

        if spy.front.indicators != state.front.indicators {
            spy.front.indicators = state.front.indicators;
            let indicators = spy.front.indicators;
            spy.peer.send_keyboard_indicators(indicators);
        }
        spy.shadowing = state.id;

        wiremsg::SeatNew {
            client_id: spy_id,
            keyboard_layout: spy.peer.gcc.keyboard_layout,
            keyboard_type: spy.peer.gcc.keyboard_type,
            keyboard_subtype: spy.peer.gcc.keyboard_subtype,
        }
    };

    state.front_ids.push(spy_id);
    state.front.state.set_event(FrameEvent::FrontendNewShadowing);

    let seat_ok = state
        .backend
        .as_mut()
        .map(|b| b.send_seat_new(seat).is_ok())
        .unwrap_or(false);
    if !seat_ok {
        tracing::error!(id = state.id, spy_id, "error notifying the seat arrival");
        state.front_ids.retain(|&f| f != spy_id);
        {
            let mut spy = lock_state(&spy_handle);
            spy.shadowing = spy_id;
            if let Some(source) = spy.rdp_source.take() {
                if let Ok(stored) = evloop.store_state(source) {
                    drop(spy);
                    post_rewire(app, spy_id, Some(stored), true);
                }
            }
        }
        icp_generic_response(app, tag, msgs::MSG_START_REMOTE_CONTROL, false);
        return;
    }

    let sizes_differ = {
        let spy = lock_state(&spy_handle);
        let backend_size = state
            .backend
            .as_ref()
            .map(|b| (b.screen.width, b.screen.height));
        backend_size.is_some_and(|size| size != spy.peer.desktop_size())
    };

    let mut ok = true;
    if sizes_differ {
        let mut spy = lock_state(&spy_handle);
        let mut ctx = FrontCtx {
            conn: &mut *spy,
            target: Some(&mut *state),
        };
        ok = resize_frontend(&mut ctx);
    } else {
        // Mirror the target's pointer state, then force a full frame.
        let pointer_snapshot = state.backend.as_ref().map(|b| {
            (
                b.last_system_pointer,
                b.have_backend_pointer,
                b.last_set_pointer.clone(),
            )
        });
        let mut spy = lock_state(&spy_handle);
        if let Some((system_pointer, have_pointer, last)) = pointer_snapshot {
            frontend::set_system_pointer(&mut spy, system_pointer);
            if have_pointer {
                if let Some(last) = last {
                    let shape = frontend::shape_from_wire(last);
                    frontend::set_pointer(&mut spy, &shape);
                }
            }
        }
        let mut ctx = FrontCtx {
            conn: &mut *spy,
            target: Some(&mut *state),
        };
        frontend::initiate_immediate_request(&mut ctx, true);
        frontend::handle_wait_timer_state(&mut ctx);
        let _ = spy.peer.flush();
        sync_rdp_mask(evloop, &mut spy);
    }

    icp_generic_response(app, tag, msgs::MSG_START_REMOTE_CONTROL, ok);
}

fn post_rewire(
    app: &Arc<AppContext>,
    spy_id: ConnectionId,
    rdp_source: Option<tessera_eventloop::SourceState>,
    rewire: bool,
) {
    if !app.post_command(spy_id, Command::RewireOriginalBackend { rdp_source, rewire }) {
        tracing::error!(spy_id, "unable to post rewire notification");
    }
}

/// Runs on the target's loop: detach a spy and send its socket home.
fn unwire_spy(
    app: &Arc<AppContext>,
    evloop: &mut EventLoop,
    state: &mut ConnState,
    spy_id: ConnectionId,
    tag: Option<u32>,
    rewire: bool,
) {
    state.front_ids.retain(|&f| f != spy_id);

    if let Some(backend) = state.backend.as_mut() {
        if backend.send_seat_removed(spy_id).is_err() {
            tracing::error!(id = state.id, spy_id, "error notifying seat removal");
        }
    }

    let stored = app.get(spy_id).and_then(|spy_handle| {
        let mut spy = lock_state(&spy_handle);
        spy.front.state.set_event(FrameEvent::BackendTriggerRewire);
        spy.rdp_source
            .take()
            .and_then(|source| evloop.store_state(source).ok())
    });

    post_rewire(app, spy_id, stored, rewire);

    if let Some(tag) = tag {
        icp_generic_response(app, tag, msgs::MSG_STOP_REMOTE_CONTROL, true);
    } else if let Some(icp) = app.icp() {
        // Spy-initiated exit (escape sequence or close): tell the
        // session manager the shadow ended.
        let payload = serde_json::to_vec(&msgs::RemoteControlEnded {
            spy_id,
            spied_id: state.id,
        })
        .unwrap_or_default();
        let _ = icp.call_raw_async(msgs::MSG_REMOTE_CONTROL_ENDED, &payload, |_| {});
    }
}

/// Runs on the spy's own loop: take the socket back (or just die).
fn process_rewire_original_backend(
    app: &Arc<AppContext>,
    evloop: &mut EventLoop,
    handle: &Arc<ConnHandle>,
    state: &mut ConnState,
    rdp_source: Option<tessera_eventloop::SourceState>,
    rewire: bool,
) {
    state.shadowing = state.id;
    state.front.input_filter = 0;

    if !rewire || state.close_after_rewire {
        state.running = false;
        return;
    }

    let Some(rdp_source) = rdp_source else {
        tracing::error!(id = state.id, "rewire without an event source");
        state.running = false;
        return;
    };
    match evloop.restore_source(rdp_source) {
        Ok(source) => state.rdp_source = Some(source),
        Err(e) => {
            tracing::error!(id = state.id, error = %e, "unable to reinstall rdp event source");
            state.running = false;
            return;
        }
    }

    if !install_frame_timer(app, evloop, handle, state) {
        close_connection(app, evloop, state);
        return;
    }

    state.front.state.set_event(FrameEvent::BackendRewireOriginal);

    let indicators = u32::from(state.front.indicators);
    let id = state.id;
    let sync_ok = match state.backend.as_mut() {
        Some(backend) => {
            backend.active = true;
            backend.send_sync_keyboard(indicators, id).is_ok()
        }
        None => true,
    };
    if !sync_ok {
        close_connection(app, evloop, state);
        return;
    }

    let screen = state.backend.as_ref().map(|b| b.screen);
    let desktop = state.peer.desktop_size();
    if let Some(screen) = screen {
        if (screen.width, screen.height) != desktop {
            let mut ctx = FrontCtx {
                conn: &mut *state,
                target: None,
            };
            resize_frontend(&mut ctx);
            return;
        }
    }

    // Restore our own backend's pointer and refresh the screen.
    let pointer_snapshot = state.backend.as_ref().map(|b| {
        (
            b.last_system_pointer,
            b.have_backend_pointer,
            b.last_set_pointer.clone(),
        )
    });
    if let Some((system_pointer, have_pointer, last)) = pointer_snapshot {
        frontend::set_system_pointer(state, system_pointer);
        if have_pointer {
            if let Some(last) = last {
                let shape = frontend::shape_from_wire(last);
                frontend::set_pointer(state, &shape);
            }
        }
    }

    let mut ctx = FrontCtx {
        conn: &mut *state,
        target: None,
    };
    frontend::initiate_immediate_request(&mut ctx, true);
    frontend::handle_wait_timer_state(&mut ctx);
    let _ = state.peer.flush();
    sync_rdp_mask(evloop, state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (server, client)
    }

    fn preconnect_blob(version: u32) -> Vec<u8> {
        let mut blob = PRECONNECT_MAGIC.to_vec();
        let body_len = 12u32;
        blob.extend_from_slice(&(body_len + 4).to_le_bytes());
        blob.extend_from_slice(&0u32.to_le_bytes()); // flags
        blob.extend_from_slice(&version.to_le_bytes());
        blob.extend_from_slice(&7u32.to_le_bytes()); // id
        blob
    }

    #[test]
    fn preconnect_passthrough_without_magic() {
        let (server, mut client) = tcp_pair();
        client.write_all(&[0x03, 0x00, 0x00, 0x13]).unwrap(); // TPKT start
        assert!(handle_preconnection(&server));
        // The RDP bytes are still unread for the peer driver.
        let mut peek = [0u8; 4];
        let n = rustix::net::recv(
            server.as_fd(),
            &mut peek,
            rustix::net::RecvFlags::PEEK,
        )
        .unwrap();
        assert_eq!(n, 4);
        assert_eq!(peek[0], 0x03);
    }

    #[test]
    fn preconnect_v1_blob_is_consumed() {
        let (server, mut client) = tcp_pair();
        let mut bytes = preconnect_blob(1);
        bytes.extend_from_slice(&[0x03, 0x00]); // RDP follows
        client.write_all(&bytes).unwrap();
        assert!(handle_preconnection(&server));
        let mut peek = [0u8; 2];
        let n = rustix::net::recv(
            server.as_fd(),
            &mut peek,
            rustix::net::RecvFlags::PEEK,
        )
        .unwrap();
        assert_eq!(n, 2);
        assert_eq!(peek[0], 0x03);
    }

    #[test]
    fn preconnect_unknown_version_echoes_magic_then_continues() {
        let (server, mut client) = tcp_pair();
        let mut bytes = preconnect_blob(9);
        // After the echo the client retries with a known version and
        // then starts RDP: the handshake must still come through.
        bytes.extend_from_slice(&preconnect_blob(1));
        bytes.extend_from_slice(&[0x03, 0x00, 0x00]);
        client.write_all(&bytes).unwrap();
        assert!(handle_preconnection(&server));

        client.set_nonblocking(true).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let mut echoed = [0u8; 3];
        client.read_exact(&mut echoed).unwrap();
        assert_eq!(echoed, PRECONNECT_MAGIC);
    }

    #[test]
    fn preconnect_undersized_blob_drops_connection() {
        let (server, mut client) = tcp_pair();
        let mut bytes = PRECONNECT_MAGIC.to_vec();
        bytes.extend_from_slice(&8u32.to_le_bytes()); // 4 bytes of body only
        bytes.extend_from_slice(&[0u8; 4]);
        client.write_all(&bytes).unwrap();
        assert!(!handle_preconnection(&server));
    }
}
