//! Front-connection logic: codec selection at activation, the frame
//! pipeline (sync requests, damage simplification, emission, acks),
//! pointer handling and keyboard bookkeeping.


use crate::appctx::{AppContext, Command};
use crate::backend::BackendLink;
use crate::bandwidth::BandwidthMgmt;
use crate::connection::ConnState;
use crate::rdp::gfx::{self, GfxServer};
use crate::rdp::input::{
    InputEvent, KBD_FLAGS_DOWN, KBD_FLAGS_EXTENDED, KBD_FLAGS_RELEASE, KBD_SYNC_CAPS_LOCK,
    KBD_SYNC_NUM_LOCK, KBD_SYNC_SCROLL_LOCK,
};
use crate::rdp::update;
use crate::state::{FrameEvent, FrameState, FrameStateMachine};
use tessera_encode::bmp;
use tessera_encode::codec::{
    select_codec, write_avc420_stream, write_avc444_stream1, AvcCompressMode, AvcFrameEncoder,
    ClientCaps, CodecMode, CodecSelection, RfxEntropy, RfxFrameEncoder,
};
use tessera_encode::pointer::{CacheProbe, PointerCache, PointerShape};
use tessera_encode::{BitmapEncoder, Rect};
use tessera_wire::msg::SYSPTR_NULL;

/* keyboard modifier bits */
pub const MOD_CTRL: u16 = 0x01;
pub const MOD_ALT: u16 = 0x02;
pub const MOD_SHIFT: u16 = 0x04;

/* input filter bits for shadowing */
pub const INPUT_FILTER_MOUSE: u8 = 0x1;
pub const INPUT_FILTER_KEYBOARD: u8 = 0x2;

/* virtual key codes used by the modifier tracking and shadow escape */
pub const VK_SHIFT: u32 = 0x10;
pub const VK_CONTROL: u32 = 0x11;
pub const VK_MENU: u32 = 0x12;
pub const VK_CAPITAL: u32 = 0x14;
pub const VK_LSHIFT: u32 = 0xA0;
pub const VK_RSHIFT: u32 = 0xA1;
pub const VK_LCONTROL: u32 = 0xA2;
pub const VK_RCONTROL: u32 = 0xA3;
pub const VK_LMENU: u32 = 0xA4;
pub const VK_RMENU: u32 = 0xA5;
pub const VK_NUMLOCK: u32 = 0x90;
pub const VK_SCROLL: u32 = 0x91;

/// Scancode → virtual key for the keys the server tracks itself.
#[must_use]
pub fn scancode_to_vk(code: u32, extended: bool) -> u32 {
    match (code, extended) {
        (0x1D, false) => VK_LCONTROL,
        (0x1D, true) => VK_RCONTROL,
        (0x2A, false) => VK_LSHIFT,
        (0x36, false) => VK_RSHIFT,
        (0x38, false) => VK_LMENU,
        (0x38, true) => VK_RMENU,
        (0x3A, false) => VK_CAPITAL,
        (0x45, false) => VK_NUMLOCK,
        (0x46, false) => VK_SCROLL,
        (0x3B..=0x44, false) => 0x70 + (code - 0x3B), // F1..F10
        (0x57, false) => 0x7A,                        // F11
        (0x58, false) => 0x7B,                        // F12
        _ => 0,
    }
}

/// Virtual key → scancode (0 when the key has no mapping), used for the
/// synthetic releases during a shadow unwire.
#[must_use]
pub fn vk_to_scancode(vk: u32) -> u32 {
    match vk {
        VK_CONTROL | VK_LCONTROL => 0x1D,
        VK_RCONTROL => 0x1D, // extended handled by the caller
        VK_SHIFT | VK_LSHIFT => 0x2A,
        VK_RSHIFT => 0x36,
        VK_MENU | VK_LMENU | VK_RMENU => 0x38,
        VK_CAPITAL => 0x3A,
        VK_NUMLOCK => 0x45,
        VK_SCROLL => 0x46,
        0x70..=0x79 => 0x3B + (vk - 0x70),
        0x7A => 0x57,
        0x7B => 0x58,
        _ => 0,
    }
}

/// One front connection's display/input state.
pub struct FrontState {
    pub state: FrameStateMachine,
    pub encoder: Option<BitmapEncoder>,
    pub rfx: Option<Box<dyn RfxFrameEncoder>>,
    pub avc: Option<Box<dyn AvcFrameEncoder>>,
    pub codec: CodecSelection,
    pub gfx: GfxServer,
    pub gfx_connected: bool,
    pub gfx_forbidden: bool,
    pub gfx_h264_forbidden: bool,
    pub gfx_h264_supported: bool,
    pub gfx_avc444_supported: bool,
    pub gfx_output_ready: bool,
    pub pointer_cache: PointerCache,
    pub next_frame_id: u32,
    pub last_ack_frame: u32,
    pub frame_acknowledge: u32,
    pub bandwidth: BandwidthMgmt,
    pub activation_count: u32,
    pub initial_width: u32,
    pub initial_height: u32,
    pub pending_resize: Option<(u32, u32)>,
    pub modifiers: u16,
    pub indicators: u16,
    pub input_filter: u8,
    pub shadow_escape_vk: u32,
    pub shadow_escape_modifiers: u16,
    pub progressive_ticks: u32,
    /// Outstanding RTT probe: (sent at ms, frame id whose ack ends it).
    pub rtt_probe: Option<(u64, u32)>,
    pub stats: Stats,
}

#[derive(Debug, Default)]
pub struct Stats {
    pub bytes_sent_current: u64,
    pub bytes_sent: u64,
    pub bytes_sent_timestamp: u64,
    pub fps_current: u32,
    pub fps_measured: u32,
    pub fps_timestamp: u64,
}

impl Default for FrontState {
    fn default() -> FrontState {
        FrontState {
            state: FrameStateMachine::new(),
            encoder: None,
            rfx: None,
            avc: None,
            codec: CodecSelection {
                mode: CodecMode::Bmp,
                gfx_required: false,
                frame_acknowledge: 0,
            },
            gfx: GfxServer::new(),
            gfx_connected: false,
            gfx_forbidden: false,
            gfx_h264_forbidden: false,
            gfx_h264_supported: false,
            gfx_avc444_supported: false,
            gfx_output_ready: false,
            pointer_cache: PointerCache::new(0),
            next_frame_id: 1,
            last_ack_frame: 0,
            frame_acknowledge: 0,
            bandwidth: BandwidthMgmt::new(0),
            activation_count: 0,
            initial_width: 0,
            initial_height: 0,
            pending_resize: None,
            modifiers: 0,
            indicators: 0,
            input_filter: 0,
            shadow_escape_vk: 0,
            shadow_escape_modifiers: 0,
            progressive_ticks: 0,
            rtt_probe: None,
            stats: Stats::default(),
        }
    }
}

/// A front connection plus, when it spies on another session, the
/// (already locked) target owning the backend. All pipeline code
/// reaches the backend through here so the shadowing indirection stays
/// in one place.
pub struct FrontCtx<'a> {
    pub conn: &'a mut ConnState,
    pub target: Option<&'a mut ConnState>,
}

impl FrontCtx<'_> {
    pub fn backend(&mut self) -> Option<&mut BackendLink> {
        match self.target.as_mut() {
            Some(t) => t.backend.as_mut(),
            None => self.conn.backend.as_mut(),
        }
    }

    pub fn backend_ref(&self) -> Option<&BackendLink> {
        match self.target.as_ref() {
            Some(t) => t.backend.as_ref(),
            None => self.conn.backend.as_ref(),
        }
    }
}

/// The codec decision taken at every (re)activation.
pub fn select_codec_mode(conn: &mut ConnState, rfx_available: bool) {
    let caps = ClientCaps {
        connection_type: conn.peer.gcc.connection_type,
        color_depth: conn.peer.caps.color_depth,
        remotefx_codec: conn.peer.caps.remotefx_codec_id.is_some(),
        surface_commands_enabled: conn.peer.caps.surface_bits_enabled(),
        frame_marker_enabled: conn.peer.caps.frame_marker_enabled(),
        frame_ack_capset_received: conn.peer.caps.frame_ack_received,
        frame_acknowledge: conn.peer.caps.frame_acknowledge,
        supports_gfx: conn.peer.gcc.supports_gfx(),
        drdynvc_joined: conn
            .peer
            .channel_by_name("drdynvc")
            .is_some_and(|c| c.joined),
        gfx_forbidden: conn.front.gfx_forbidden,
    };

    let selection = select_codec(&caps, rfx_available);
    conn.front.codec = selection;
    conn.front.gfx_connected = false;
    conn.front.gfx_h264_supported = false;
    conn.front.gfx_output_ready = false;
    conn.front.progressive_ticks = 0;
    conn.front.frame_acknowledge = selection.frame_acknowledge;

    tracing::debug!(
        id = conn.id,
        mode = ?selection.mode,
        gfx_required = selection.gfx_required,
        frame_acknowledge = selection.frame_acknowledge,
        "codec mode selected"
    );
}

/// Request a backend sync when the state machine allows a frame.
pub fn handle_wait_timer_state(ctx: &mut FrontCtx<'_>) {
    if !ctx.conn.front.state.should_create_frame() {
        return;
    }
    let Some(buffer_id) = ctx.backend_ref().and_then(|b| b.damage.as_ref()).map(|d| d.id())
    else {
        return;
    };

    ctx.conn.front.state.set_event(FrameEvent::BackendSyncRequested);
    if ctx.conn.front.state.get() != FrameState::WaitingSyncReply {
        return;
    }

    // A slower shadow member may still hold accumulated damage from a
    // reply it could not process; flush it with an immediate request so
    // the shared state machine stays intact.
    let leftover = ctx
        .conn
        .front
        .encoder
        .as_ref()
        .is_some_and(|e| !e.accumulated_damage.is_empty());
    if leftover {
        initiate_immediate_request(ctx, false);
        return;
    }

    let backend = ctx.backend().expect("backend checked above");
    if !backend.waiting_sync_reply {
        if let Err(e) = backend.send_sync_request(buffer_id) {
            tracing::error!(error = %e, "error sending framebuffer sync request");
            ctx.conn.running = false;
        }
    }
}

/// Force the backend to answer even without fresh damage. With
/// `set_damage` the whole screen is marked dirty first (shadow joins,
/// gfx restarts).
pub fn initiate_immediate_request(ctx: &mut FrontCtx<'_>, set_damage: bool) {
    let Some(backend) = ctx.backend_ref() else {
        tracing::debug!("immediate request ignored, backend has vanished");
        return;
    };
    let (width, height) = (backend.screen.width, backend.screen.height);
    let Some(buffer_id) = backend.damage.as_ref().map(|d| d.id()) else {
        return;
    };

    if set_damage {
        if let Some(encoder) = ctx.conn.front.encoder.as_mut() {
            encoder.accumulated_damage.clear();
            encoder.accumulate_damage(0, 0, width as i32, height as i32);
        }
    }

    match ctx.conn.front.state.get() {
        FrameState::WaitingActiveOutput
        | FrameState::WaitingAck
        | FrameState::WaitingFrameSent
        | FrameState::WaitingTimer
        | FrameState::WaitingSyncReply => {
            ctx.conn
                .front
                .state
                .set_event(FrameEvent::FrontendImmediateRequest);
            let backend = ctx.backend().expect("backend checked above");
            if let Err(e) = backend.send_immediate_sync_request(buffer_id) {
                tracing::error!(error = %e, "error sending immediate sync request");
            }
        }
        FrameState::WaitingResize | FrameState::EventloopMove => {}
        other => {
            tracing::error!(state = ?other, "immediate request initiated from unexpected state");
        }
    }
}

/// Bookkeeping after a frame fully left the socket.
pub fn handle_frame_sent(ctx: &mut FrontCtx<'_>) {
    if ctx.conn.front.state.get() != FrameState::WaitingFrameSent {
        return;
    }

    let front = &mut ctx.conn.front;
    if front.frame_acknowledge > 0
        && front.last_ack_frame + front.frame_acknowledge + 1 < front.next_frame_id
    {
        front.state.set_event(FrameEvent::FrontendFrameAckSend);
        return;
    }

    front.state.set_event(FrameEvent::FrontendFrameSent);
    handle_wait_timer_state(ctx);
}

/// A frame acknowledge arrived (legacy PDU or gfx).
pub fn handle_frame_ack(ctx: &mut FrontCtx<'_>, frame_id: u32) {
    let front = &mut ctx.conn.front;
    front.last_ack_frame = frame_id;

    if front.state.get() != FrameState::WaitingAck {
        return;
    }
    if front.frame_acknowledge > 0
        && front.last_ack_frame + front.frame_acknowledge + 1 < front.next_frame_id
    {
        return;
    }
    front.state.set_event(FrameEvent::FrontendFrameAckReceived);
    handle_wait_timer_state(ctx);
}

/// Suppress-output PDU.
pub fn handle_suppress_output(ctx: &mut FrontCtx<'_>, allow: bool) {
    if allow {
        ctx.conn
            .front
            .state
            .set_event(FrameEvent::FrontendEnableOutput);
        handle_wait_timer_state(ctx);
    } else {
        ctx.conn
            .front
            .state
            .set_event(FrameEvent::FrontendDisableOutput);
    }
}

/// Refresh-rect PDU: blank the mirror under the areas and force a sync.
pub fn handle_refresh_rect(ctx: &mut FrontCtx<'_>, rects: &[Rect]) {
    if ctx.backend_ref().is_none() || rects.is_empty() {
        return;
    }
    let Some(encoder) = ctx.conn.front.encoder.as_mut() else {
        return;
    };
    for rect in rects {
        let clamped = rect.clamp(encoder.desktop_width, encoder.desktop_height);
        if clamped.is_empty() {
            continue;
        }
        encoder.accumulate_damage(
            clamped.left as i32,
            clamped.top as i32,
            clamped.width() as i32,
            clamped.height() as i32,
        );
        encoder.blank_client_view(&clamped);
    }
    initiate_immediate_request(ctx, false);
}

/* ---------------- pointer handling ---------------- */

/// Deliver a backend pointer shape to one front connection, through the
/// cache when the client supports it.
pub fn set_pointer(conn: &mut ConnState, shape: &PointerShape) {
    let is_rdesktop = conn.peer.gcc.client_dig_product_id == "rdesktop";

    if is_rdesktop || conn.peer.caps.pointer_cache_size == 0 {
        // Legacy client: monochrome color pointer only.
        if let Some(mono) = shape.to_monochrome(is_rdesktop) {
            let mut out = Vec::new();
            update::write_pointer_color(&mut out, 0, &mono);
            conn.peer.queue_update(&out);
        }
        return;
    }

    let hash = shape.shape_hash();
    let mut out = Vec::new();
    match conn.front.pointer_cache.probe(hash) {
        Some(CacheProbe::Hit(index)) => {
            update::write_pointer_cached(&mut out, index as u16);
        }
        Some(CacheProbe::Stored(index)) => {
            update::write_pointer_new(&mut out, index as u16, shape);
        }
        None => {
            update::write_pointer_new(&mut out, 0, shape);
        }
    }
    conn.peer.queue_update(&out);
}

pub fn set_system_pointer(conn: &mut ConnState, ptr_type: u32) {
    let mut out = Vec::new();
    update::write_pointer_system(&mut out, ptr_type == SYSPTR_NULL);
    conn.peer.queue_update(&out);
}

/// A backend SetPointer message as an encoder shape.
#[must_use]
pub fn shape_from_wire(last: tessera_wire::msg::SetPointer) -> PointerShape {
    PointerShape {
        xor_bpp: last.xor_bpp,
        hot_x: last.x_pos,
        hot_y: last.y_pos,
        width: last.width,
        height: last.height,
        xor_mask: last.xor_mask,
        and_mask: last.and_mask,
    }
}

/* ---------------- keyboard bookkeeping ---------------- */

pub fn update_modifiers(front: &mut FrontState, flags: u32, vk: u32) {
    let bit = match vk {
        VK_CONTROL | VK_LCONTROL | VK_RCONTROL => MOD_CTRL,
        VK_MENU | VK_LMENU | VK_RMENU => MOD_ALT,
        VK_SHIFT | VK_LSHIFT | VK_RSHIFT => MOD_SHIFT,
        _ => return,
    };
    if flags & KBD_FLAGS_DOWN != 0 {
        front.modifiers |= bit;
    }
    if flags & KBD_FLAGS_RELEASE != 0 {
        front.modifiers &= !bit;
    }
}

pub fn update_indicators(front: &mut FrontState, flags: u32, vk: u32) {
    if flags & KBD_FLAGS_RELEASE != 0 || flags & KBD_FLAGS_DOWN == 0 {
        return;
    }
    let bit = match vk {
        VK_CAPITAL => KBD_SYNC_CAPS_LOCK,
        VK_SCROLL => KBD_SYNC_SCROLL_LOCK,
        VK_NUMLOCK => KBD_SYNC_NUM_LOCK,
        _ => return,
    };
    front.indicators ^= bit as u16;
}

/// Release every possibly-held modifier on the backend (shadow escape).
/// The exact pressed key is unknown, so every variant of a held
/// modifier gets a synthetic KEY_UP.
pub fn release_modifiers(
    backend: &mut BackendLink,
    modifiers: u16,
    keyboard_type: u32,
    client_id: u32,
) {
    let mut release = |vks: &[u32]| {
        for &vk in vks {
            let code = vk_to_scancode(vk);
            if code == 0 {
                continue;
            }
            let mut flags = KBD_FLAGS_RELEASE;
            if vk == VK_RCONTROL || vk == VK_RMENU {
                flags |= KBD_FLAGS_EXTENDED;
            }
            let _ = backend.send_scancode(flags, code, keyboard_type, client_id);
        }
    };
    if modifiers & MOD_ALT != 0 {
        release(&[VK_MENU, VK_LMENU, VK_RMENU]);
    }
    if modifiers & MOD_SHIFT != 0 {
        release(&[VK_SHIFT, VK_LSHIFT, VK_RSHIFT]);
    }
    if modifiers & MOD_CTRL != 0 {
        release(&[VK_CONTROL, VK_RCONTROL, VK_LCONTROL]);
    }
}

/// Route one input event to the backend, handling modifier tracking,
/// the shadow escape sequence, input filters and the non-multiseat
/// indicator broadcast. Returns ids of sibling front connections whose
/// indicators must be refreshed.
pub fn process_input(
    app: &AppContext,
    ctx: &mut FrontCtx<'_>,
    event: InputEvent,
) -> Vec<(u32, u16)> {
    let conn_id = ctx.conn.id;
    let shadowing = ctx.conn.shadowing;
    let keyboard_type = ctx.conn.peer.gcc.keyboard_type;
    let mut broadcast = Vec::new();

    match event {
        InputEvent::Sync { flags } => {
            // Synchronize means every key is up, modifiers included.
            ctx.conn.front.modifiers = 0;
            let before = ctx.conn.front.indicators;
            ctx.conn.front.indicators = flags as u16;

            if ctx.conn.front.input_filter & INPUT_FILTER_KEYBOARD != 0 {
                return broadcast;
            }
            let Some(backend) = ctx.backend() else {
                return broadcast;
            };
            if backend.send_sync_keyboard(flags, conn_id).is_err() {
                ctx.conn.running = false;
                return broadcast;
            }
            if !backend.multiseat_capable && before != flags as u16 {
                broadcast = sibling_fronts(ctx, conn_id, flags as u16);
            }
        }
        InputEvent::Scancode { flags, code } => {
            let vk = scancode_to_vk(code, flags & KBD_FLAGS_EXTENDED != 0);
            let indicators_before = ctx.conn.front.indicators;
            update_modifiers(&mut ctx.conn.front, flags, vk);
            update_indicators(&mut ctx.conn.front, flags, vk);

            if ctx.backend_ref().is_none() {
                return broadcast;
            }

            // Shadow escape: a spy pressing the configured sequence is
            // unwired from the target.
            if shadowing != conn_id && flags & KBD_FLAGS_DOWN != 0 {
                let front = &ctx.conn.front;
                if vk != 0
                    && vk == front.shadow_escape_vk
                    && front.modifiers & front.shadow_escape_modifiers
                        == front.shadow_escape_modifiers
                {
                    if !app.post_command(
                        shadowing,
                        Command::UnwireSpy {
                            spy_id: conn_id,
                            tag: None,
                        },
                    ) {
                        tracing::error!(target = shadowing, "error posting unwire spy");
                    }
                    let held = ctx.conn.front.modifiers;
                    if let Some(backend) = ctx.backend() {
                        release_modifiers(backend, held, keyboard_type, conn_id);
                    }
                    ctx.conn.front.modifiers = 0;
                    return broadcast;
                }
            }

            if ctx.conn.front.input_filter & INPUT_FILTER_KEYBOARD != 0 {
                return broadcast;
            }

            let Some(backend) = ctx.backend() else {
                return broadcast;
            };

            // mstsc sends CONTROL_L together with AltGr; release it.
            if code == 0x38
                && flags == (KBD_FLAGS_DOWN | KBD_FLAGS_EXTENDED)
                && backend
                    .send_scancode(KBD_FLAGS_RELEASE, 0x1D, keyboard_type, conn_id)
                    .is_err()
            {
                ctx.conn.running = false;
                return broadcast;
            }

            let backend = ctx.backend().expect("still attached");
            if backend
                .send_scancode(flags, code, keyboard_type, conn_id)
                .is_err()
            {
                ctx.conn.running = false;
                return broadcast;
            }

            let multiseat = backend.multiseat_capable;
            let current = ctx.conn.front.indicators;
            if !multiseat && current != indicators_before {
                // Indicator changes mirror onto every sibling seat.
                broadcast = sibling_fronts(ctx, conn_id, current);
            }
        }
        InputEvent::Unicode { flags, code } => {
            if ctx.conn.front.input_filter & INPUT_FILTER_KEYBOARD != 0 {
                return broadcast;
            }
            if let Some(backend) = ctx.backend() {
                if backend.send_unicode(flags, code, conn_id).is_err() {
                    ctx.conn.running = false;
                }
            }
        }
        InputEvent::Mouse { flags, x, y } => {
            if ctx.conn.front.input_filter & INPUT_FILTER_MOUSE != 0 {
                return broadcast;
            }
            if let Some(backend) = ctx.backend() {
                if backend.send_mouse(false, flags, x, y, conn_id).is_err() {
                    ctx.conn.running = false;
                }
            }
        }
        InputEvent::ExtendedMouse { flags, x, y } => {
            if ctx.conn.front.input_filter & INPUT_FILTER_MOUSE != 0 {
                return broadcast;
            }
            if let Some(backend) = ctx.backend() {
                if backend.send_mouse(true, flags, x, y, conn_id).is_err() {
                    ctx.conn.running = false;
                }
            }
        }
    }

    broadcast
}

/// Siblings of `conn_id` in its shadow group, paired with the indicator
/// state they must take over. The caller delivers (it owns the locks).
fn sibling_fronts(ctx: &mut FrontCtx<'_>, conn_id: u32, indicators: u16) -> Vec<(u32, u16)> {
    let front_ids = match ctx.target.as_ref() {
        Some(t) => t.front_ids.clone(),
        None => ctx.conn.front_ids.clone(),
    };
    front_ids
        .into_iter()
        .filter(|&id| id != conn_id)
        .map(|id| (id, indicators))
        .collect()
}

/* ---------------- frame emission ---------------- */

fn send_frame_marker(ctx: &mut FrontCtx<'_>, begin: bool) {
    let frame_id = ctx.conn.front.next_frame_id;

    if ctx.conn.front.gfx_connected && ctx.conn.front.gfx_output_ready {
        let payload = if begin {
            ctx.conn.front.gfx.start_frame(frame_id)
        } else {
            ctx.conn.front.gfx.end_frame(frame_id)
        };
        ctx.conn.write_gfx(&payload);
    } else if ctx.conn.peer.caps.frame_marker_enabled()
        && ctx.conn.front.codec.mode != CodecMode::Bmp
    {
        let mut out = Vec::new();
        let action = if begin {
            update::SURFACECMD_FRAMEACTION_BEGIN
        } else {
            update::SURFACECMD_FRAMEACTION_END
        };
        update::write_surface_frame_marker(&mut out, action, frame_id);
        ctx.conn.peer.queue_update(&out);
    }

    if !begin {
        ctx.conn.front.next_frame_id = ctx.conn.front.next_frame_id.wrapping_add(1);
    }
}

fn send_bmp_bits(ctx: &mut FrontCtx<'_>, data: &[u8], rects: &[Rect]) -> Result<(), String> {
    let encoder = ctx.conn.front.encoder.as_ref().expect("encoder exists");
    let updates = bmp::encode_bitmap_updates(
        data,
        encoder.scanline,
        encoder.desktop_width,
        encoder.desktop_height,
        encoder.dst_bits_per_pixel,
        encoder.multifrag_max_request_size,
        rects,
    )
    .map_err(|e| e.to_string())?;
    for update in &updates {
        let mut out = Vec::new();
        update::write_bitmap_update(&mut out, update);
        ctx.conn.peer.queue_update(&out);
    }
    Ok(())
}

fn send_rfx_surface_bits(
    ctx: &mut FrontCtx<'_>,
    data: &[u8],
    rects: &[Rect],
) -> Result<(), String> {
    let encoder = ctx.conn.front.encoder.as_ref().expect("encoder exists");
    let (width, height, scanline) = (
        encoder.desktop_width,
        encoder.desktop_height,
        encoder.scanline,
    );
    let max_request = encoder.multifrag_max_request_size as usize;
    let codec_id = ctx.conn.peer.caps.remotefx_codec_id.unwrap_or(0);
    let frame_index = ctx.conn.front.next_frame_id;

    let rfx = ctx
        .conn
        .front
        .rfx
        .as_mut()
        .ok_or_else(|| "no rfx encoder".to_string())?;

    // One message covering all rects, sent in a single surface command
    // (the server advertises a request size that always fits).
    let full = Rect::new(0, 0, width, height);
    let mut bitstream = Vec::new();
    for rect in rects {
        let encoded = rfx
            .encode(
                RfxEntropy::Rlgr3,
                false,
                rect,
                data,
                width,
                height,
                scanline,
                frame_index,
            )
            .map_err(|e| e.to_string())?;
        bitstream.extend_from_slice(&encoded);
    }

    if bitstream.len() + 22 > max_request {
        return Err(format!(
            "rfx message size {} exceeds max request size {max_request}",
            bitstream.len() + 22,
        ));
    }

    let mut out = Vec::new();
    update::write_surface_bits(
        &mut out,
        true,
        &full,
        32,
        codec_id,
        width as u16,
        height as u16,
        &bitstream,
    );
    ctx.conn.peer.queue_update(&out);
    Ok(())
}

fn send_gfx_rfx_bits(
    ctx: &mut FrontCtx<'_>,
    data: &[u8],
    rects: &[Rect],
    progressive: bool,
) -> Result<(), String> {
    let encoder = ctx.conn.front.encoder.as_ref().expect("encoder exists");
    let (width, height, scanline) = (
        encoder.desktop_width,
        encoder.desktop_height,
        encoder.scanline,
    );
    let frame_index = ctx.conn.front.next_frame_id;

    for rect in rects {
        if rect.left % 64 != 0 || rect.top % 64 != 0 {
            return Err(format!("invalid gfx rectangle at {},{}", rect.left, rect.top));
        }
        let encoded = {
            let rfx = ctx
                .conn
                .front
                .rfx
                .as_mut()
                .ok_or_else(|| "no rfx encoder".to_string())?;
            rfx.encode(
                if progressive {
                    RfxEntropy::Rlgr1
                } else {
                    RfxEntropy::Rlgr3
                },
                progressive,
                rect,
                data,
                width,
                height,
                scanline,
                frame_index,
            )
            .map_err(|e| e.to_string())?
        };
        let payload = if progressive {
            ctx.conn.front.gfx.wire_to_surface_2(&encoded)
        } else {
            ctx.conn
                .front
                .gfx
                .wire_to_surface_1(gfx::CODECID_CAVIDEO, rect, &encoded)
        };
        ctx.conn.write_gfx(&payload);
    }
    Ok(())
}

fn send_gfx_h264_bits(ctx: &mut FrontCtx<'_>, data: &[u8]) -> Result<(), String> {
    let encoder = ctx.conn.front.encoder.as_ref().expect("encoder exists");
    let (width, height, scanline) = (
        encoder.desktop_width,
        encoder.desktop_height,
        encoder.scanline,
    );
    let fps = ctx.conn.fps;
    let use_avc444 = ctx.conn.front.gfx_avc444_supported;
    let target_bits = ctx
        .conn
        .front
        .bandwidth
        .max_target_frame_size(ctx.conn.front.frame_acknowledge, fps);

    let full = Rect::new(0, 0, width, height);
    let rects = [full];

    let (mut max_rate, mut target) = (fps, target_bits);
    if use_avc444 {
        // The frame is encoded twice.
        max_rate *= 2;
        target /= 2;
    }

    let avc = ctx
        .conn
        .front
        .avc
        .as_mut()
        .ok_or_else(|| "no h264 encoder".to_string())?;

    let luma = avc
        .compress(
            if use_avc444 {
                AvcCompressMode::Avc444V1Luma
            } else {
                AvcCompressMode::Avc420
            },
            max_rate,
            target,
            data,
            width,
            height,
            scanline,
        )
        .map_err(|e| e.to_string())?;

    let mut optimizable = luma.optimizable;
    let (codec_id, payload) = if use_avc444 {
        let chroma = avc
            .compress(
                AvcCompressMode::Avc444Chroma,
                max_rate,
                target,
                data,
                width,
                height,
                scanline,
            )
            .map_err(|e| e.to_string())?;
        // Full AVC444 cannot be refined afterwards.
        optimizable = false;
        let mut payload = write_avc444_stream1(&rects, &luma.data, false);
        payload.extend_from_slice(&write_avc420_stream(&rects, &chroma.data));
        (gfx::CODECID_AVC444, payload)
    } else {
        (gfx::CODECID_AVC420, write_avc420_stream(&rects, &luma.data))
    };

    let wrapped = ctx.conn.front.gfx.wire_to_surface_1(codec_id, &full, &payload);
    ctx.conn.write_gfx(&wrapped);

    if optimizable {
        if ctx.conn.front.progressive_ticks == 0 {
            ctx.conn.front.progressive_ticks = 1;
        }
    } else {
        ctx.conn.front.progressive_ticks = 0;
    }
    Ok(())
}

/// Encode and send whatever survives damage simplification.
pub fn send_surface_bits(ctx: &mut FrontCtx<'_>) -> Result<(), String> {
    // Late H.264 switch: the gfx channel reported AVC support after the
    // codec decision.
    if ctx.conn.front.codec.gfx_required {
        if !ctx.conn.front.gfx_connected {
            return Err("gfx required but pipeline is not connected".to_string());
        }
        if !ctx.conn.front.gfx_output_ready {
            let (width, height) = {
                let encoder = ctx.conn.front.encoder.as_ref().expect("encoder exists");
                (encoder.desktop_width, encoder.desktop_height)
            };
            let batch = ctx.conn.front.gfx.init_output(width, height);
            ctx.conn.write_gfx(&batch);
            ctx.conn.front.gfx_output_ready = true;
        }
        if ctx.conn.front.gfx_h264_supported
            && ctx.conn.front.avc.is_some()
            && ctx.conn.front.codec.mode != CodecMode::H264
        {
            tracing::debug!(id = ctx.conn.id, "switching to H264 codec mode");
            ctx.conn.front.codec.mode = CodecMode::H264;
        }
    }

    let mode = ctx.conn.front.codec.mode;
    let (tile_size, full_tiles) = if ctx.conn.front.gfx_connected {
        (64, true)
    } else {
        (32, false)
    };

    // Copy the backend framebuffer view; simplification compares and
    // updates the per-client mirror.
    let data: Vec<u8> = {
        let Some(backend) = ctx.backend_ref() else {
            return Ok(());
        };
        let Some(damage) = backend.damage.as_ref() else {
            return Ok(());
        };
        damage.data().to_vec()
    };

    let (region, _damaged) = {
        let encoder = ctx
            .conn
            .front
            .encoder
            .as_mut()
            .ok_or_else(|| "no encoder".to_string())?;
        encoder
            .simplify_damage(&data, tile_size, full_tiles)
            .map_err(|e| e.to_string())?
    };

    if region.is_empty() && ctx.conn.front.progressive_ticks == 0 {
        if let Some(encoder) = ctx.conn.front.encoder.as_mut() {
            encoder.accumulated_damage.clear();
        }
        return Ok(());
    }
    if !region.is_empty() {
        ctx.conn.front.progressive_ticks = 0;
    }

    send_frame_marker(ctx, true);

    let result = match mode {
        CodecMode::Bmp => send_bmp_bits(ctx, &data, region.rects()),
        CodecMode::Rfx1 => send_rfx_surface_bits(ctx, &data, region.rects()),
        CodecMode::Rfx2 => send_gfx_rfx_bits(ctx, &data, region.rects(), false),
        CodecMode::Rfx3 => send_gfx_rfx_bits(ctx, &data, region.rects(), true),
        CodecMode::H264 => send_gfx_h264_bits(ctx, &data),
    };

    ctx.conn.front.stats.fps_current += 1;
    send_frame_marker(ctx, false);

    if let Some(encoder) = ctx.conn.front.encoder.as_mut() {
        encoder.accumulated_damage.clear();
    }

    result
}

/// Pull the backend's damage rect list into this front's accumulator.
pub fn consume_backend_damage(ctx: &mut FrontCtx<'_>) {
    let rects = {
        let Some(backend) = ctx.backend_ref() else {
            return;
        };
        let Some(damage) = backend.damage.as_ref() else {
            return;
        };
        damage.rects()
    };
    let Some(encoder) = ctx.conn.front.encoder.as_mut() else {
        return;
    };
    for r in rects {
        encoder.accumulate_damage(r.x, r.y, r.width, r.height);
    }
}

/// H.264 progressive refresh: after an optimizable frame, idle ticks
/// re-request the screen so quality converges; capped at 10 seconds.
pub fn handle_progressive_updates(ctx: &mut FrontCtx<'_>) {
    if ctx.conn.front.codec.mode != CodecMode::H264 {
        return;
    }
    if ctx.conn.front.progressive_ticks == 0 {
        return;
    }
    let fps = ctx.conn.fps;
    ctx.conn.front.progressive_ticks += 1;
    if ctx.conn.front.progressive_ticks < fps / 4 {
        return;
    }
    if ctx.conn.front.progressive_ticks > 10 * fps {
        ctx.conn.front.progressive_ticks = 0;
        return;
    }
    if ctx.conn.front.state.get() != FrameState::WaitingSyncReply {
        return;
    }
    initiate_immediate_request(ctx, false);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modifier_keymap_is_symmetric() {
        for vk in [
            VK_LCONTROL,
            VK_RCONTROL,
            VK_LSHIFT,
            VK_RSHIFT,
            VK_LMENU,
            VK_RMENU,
            VK_CAPITAL,
            VK_NUMLOCK,
            VK_SCROLL,
        ] {
            let code = vk_to_scancode(vk);
            assert_ne!(code, 0, "vk {vk:#x} must map to a scancode");
        }
        assert_eq!(scancode_to_vk(0x1D, false), VK_LCONTROL);
        assert_eq!(scancode_to_vk(0x1D, true), VK_RCONTROL);
        assert_eq!(scancode_to_vk(0x58, false), 0x7B); // F12
        assert_eq!(vk_to_scancode(0x7B), 0x58);
        assert_eq!(scancode_to_vk(0x10, false), 0); // plain letter
    }

    #[test]
    fn modifier_tracking_follows_key_state() {
        let mut front = FrontState::default();
        update_modifiers(&mut front, KBD_FLAGS_DOWN, VK_LCONTROL);
        update_modifiers(&mut front, KBD_FLAGS_DOWN, VK_LMENU);
        assert_eq!(front.modifiers, MOD_CTRL | MOD_ALT);
        update_modifiers(&mut front, KBD_FLAGS_RELEASE, VK_CONTROL);
        assert_eq!(front.modifiers, MOD_ALT);
        // Unknown keys leave the state alone.
        update_modifiers(&mut front, KBD_FLAGS_DOWN, 0x41);
        assert_eq!(front.modifiers, MOD_ALT);
    }

    #[test]
    fn indicator_toggles_on_down_only() {
        let mut front = FrontState::default();
        update_indicators(&mut front, KBD_FLAGS_DOWN, VK_CAPITAL);
        assert_eq!(u32::from(front.indicators), KBD_SYNC_CAPS_LOCK);
        update_indicators(&mut front, KBD_FLAGS_RELEASE, VK_CAPITAL);
        assert_eq!(u32::from(front.indicators), KBD_SYNC_CAPS_LOCK);
        update_indicators(&mut front, KBD_FLAGS_DOWN, VK_CAPITAL);
        assert_eq!(front.indicators, 0);
    }

    #[test]
    fn frame_ack_window_gates_emission() {
        // frameAcknowledge = 2: with frames 1..4 in flight and nothing
        // acked, the machine parks in WaitingAck until FrameAck{2}.
        let mut conn = crate::connection::ConnState::for_tests(1);
        conn.front.frame_acknowledge = 2;
        conn.front.next_frame_id = 5;
        conn.front.last_ack_frame = 0;
        conn.front.state.set_event(FrameEvent::BackendAttached);
        conn.front.state.set_event(FrameEvent::BackendSyncRequested);
        conn.front.state.set_event(FrameEvent::BackendSyncReplyReceived);
        assert_eq!(conn.front.state.get(), FrameState::WaitingFrameSent);

        let mut ctx = FrontCtx {
            conn: &mut conn,
            target: None,
        };
        handle_frame_sent(&mut ctx);
        assert_eq!(ctx.conn.front.state.get(), FrameState::WaitingAck);

        // An ack for frame 1 still leaves the window exceeded.
        handle_frame_ack(&mut ctx, 1);
        assert_eq!(ctx.conn.front.state.get(), FrameState::WaitingAck);

        // FrameAck{2} satisfies the invariant and releases the machine.
        handle_frame_ack(&mut ctx, 2);
        assert_eq!(ctx.conn.front.state.get(), FrameState::WaitingTimer);
    }

    #[test]
    fn codec_selection_consumes_peer_caps() {
        let mut conn = crate::connection::ConnState::for_tests(2);
        // Nothing negotiated: the bitmap path with no ack pacing.
        select_codec_mode(&mut conn, true);
        assert_eq!(conn.front.codec.mode, CodecMode::Bmp);
        assert_eq!(conn.front.frame_acknowledge, 0);
    }
}
