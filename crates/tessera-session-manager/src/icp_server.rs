//! The ICP server: answers the RDP server's calls (logon, properties,
//! disconnects) and can initiate calls of its own (logoff, backend
//! switches, remote control).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};

use tessera_icp::header::{IcpHeader, IcpStatus, HEADER_LEN};
use tessera_icp::msgs::{self, BackendProps};
use tessera_icp::{ICP_ENDPOINT, ICP_VERSION_MAJOR, ICP_VERSION_MINOR};
use tessera_wire::pipe;

use crate::auth::AuthModuleRegistry;
use crate::config::Config;
use crate::module::{BackendModuleRegistry, ModuleContext};
use crate::monitor::ProcessMonitor;
use crate::properties::PropertyStore;
use crate::session::{
    resolution_class, Session, SessionKey, SessionRegistry, SessionState,
};

/// Everything the call handlers need.
pub struct SmServices {
    pub store: Arc<PropertyStore>,
    pub config: std::sync::RwLock<Config>,
    pub auth: AuthModuleRegistry,
    pub modules: BackendModuleRegistry,
    pub sessions: SessionRegistry,
    pub monitor: Arc<ProcessMonitor>,
    /// The connected RDP server, for server-initiated calls.
    pub peer: Mutex<Option<PeerHandle>>,
}

/// Handle for calls toward a connected RDP server.
#[derive(Clone)]
pub struct PeerHandle {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    pending: Arc<Mutex<HashMap<u32, oneshot::Sender<(IcpStatus, Vec<u8>)>>>>,
    next_tag: Arc<AtomicU32>,
}

impl PeerHandle {
    /// Call into the RDP server with the standard 15 s budget.
    pub async fn call(
        &self,
        msg_type: u32,
        payload: Vec<u8>,
    ) -> Result<(IcpStatus, Vec<u8>)> {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed).max(1);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("peer pending lock")
            .insert(tag, reply_tx);

        let mut frame = IcpHeader::request(tag, msg_type, payload.len() as u32)
            .encode()
            .to_vec();
        frame.extend_from_slice(&payload);
        self.tx.send(frame).context("peer connection closed")?;

        match tokio::time::timeout(Duration::from_secs(tessera_icp::CALL_TIMEOUT_SECS), reply_rx)
            .await
        {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => anyhow::bail!("peer connection closed"),
            Err(_) => {
                self.pending.lock().expect("peer pending lock").remove(&tag);
                anyhow::bail!("icp call timed out")
            }
        }
    }
}

fn json<T: serde::Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

fn random_cookie() -> String {
    let mut raw = [0u8; 16];
    let _ = rustix::rand::getrandom(&mut raw, rustix::rand::GetRandomFlags::empty());
    raw.iter().map(|b| format!("{b:02x}")).collect()
}

/// Serve ICP on the well-known endpoint until the task is cancelled.
pub async fn serve(services: Arc<SmServices>) -> Result<()> {
    let path: PathBuf = pipe::pipe_path(ICP_ENDPOINT);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)
        .with_context(|| format!("failed to bind icp endpoint {}", path.display()))?;
    tracing::info!(path = %path.display(), "icp endpoint ready");

    loop {
        let (stream, _) = listener.accept().await?;
        tracing::info!("rdp server connected");
        let services = Arc::clone(&services);
        tokio::spawn(async move {
            if let Err(e) = serve_peer(services, stream).await {
                tracing::warn!(error = %e, "icp peer session ended with error");
            }
        });
    }
}

async fn serve_peer(services: Arc<SmServices>, stream: UnixStream) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let handle = PeerHandle {
        tx: tx.clone(),
        pending: Arc::new(Mutex::new(HashMap::new())),
        next_tag: Arc::new(AtomicU32::new(1)),
    };
    *services.peer.lock().expect("peer lock") = Some(handle.clone());

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let result = async {
        loop {
            let mut header_buf = [0u8; HEADER_LEN];
            if reader.read_exact(&mut header_buf).await.is_err() {
                break;
            }
            let header = IcpHeader::decode(&header_buf);
            let mut payload = vec![0u8; header.length as usize];
            reader.read_exact(&mut payload).await?;

            if header.is_response {
                let pending = handle
                    .pending
                    .lock()
                    .expect("peer pending lock")
                    .remove(&header.tag);
                if let Some(reply_tx) = pending {
                    let _ = reply_tx.send((header.status, payload));
                }
                continue;
            }

            let services = Arc::clone(&services);
            let tx = tx.clone();
            tokio::spawn(async move {
                let (status, body) = handle_request(&services, header.msg_type, payload).await;
                let mut frame = IcpHeader::response(
                    header.tag,
                    header.msg_type,
                    status,
                    body.len() as u32,
                )
                .encode()
                .to_vec();
                frame.extend_from_slice(&body);
                let _ = tx.send(frame);
            });
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    *services.peer.lock().expect("peer lock") = None;
    writer_task.abort();
    tracing::info!("rdp server disconnected");
    result
}

async fn handle_request(
    services: &Arc<SmServices>,
    msg_type: u32,
    payload: Vec<u8>,
) -> (IcpStatus, Vec<u8>) {
    match msg_type {
        msgs::MSG_VERSION_INFO => (
            IcpStatus::Success,
            json(&msgs::VersionInfo {
                version_major: ICP_VERSION_MAJOR,
                version_minor: ICP_VERSION_MINOR,
            }),
        ),
        msgs::MSG_PING => (IcpStatus::Success, json(&msgs::PingReply { pong: true })),
        msgs::MSG_LOGON_USER => {
            let Ok(request) = serde_json::from_slice::<msgs::LogonUser>(&payload) else {
                return (IcpStatus::Failed, Vec::new());
            };
            let services = Arc::clone(services);
            match tokio::task::spawn_blocking(move || logon_user(&services, &request)).await {
                Ok(Ok(reply)) => (IcpStatus::Success, json(&reply)),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "logon failed");
                    (IcpStatus::Failed, Vec::new())
                }
                Err(_) => (IcpStatus::Failed, Vec::new()),
            }
        }
        msgs::MSG_DISCONNECT_USER_SESSION => {
            let Ok(request) = serde_json::from_slice::<msgs::DisconnectUserSession>(&payload)
            else {
                return (IcpStatus::Failed, Vec::new());
            };
            let services = Arc::clone(services);
            let disconnected = tokio::task::spawn_blocking(move || {
                disconnect_session(&services, request.connection_id)
            })
            .await
            .unwrap_or(false);
            (
                IcpStatus::Success,
                json(&msgs::DisconnectUserSessionReply { disconnected }),
            )
        }
        msgs::MSG_PROPERTY_BOOL => {
            let Ok(request) = serde_json::from_slice::<msgs::PropertyGet>(&payload) else {
                return (IcpStatus::Failed, Vec::new());
            };
            let value = services.store.get_bool(request.connection_id, &request.path);
            (
                IcpStatus::Success,
                json(&msgs::PropertyBoolReply {
                    success: value.is_some(),
                    value: value.unwrap_or(false),
                }),
            )
        }
        msgs::MSG_PROPERTY_NUMBER => {
            let Ok(request) = serde_json::from_slice::<msgs::PropertyGet>(&payload) else {
                return (IcpStatus::Failed, Vec::new());
            };
            let value = services
                .store
                .get_number(request.connection_id, &request.path);
            (
                IcpStatus::Success,
                json(&msgs::PropertyNumberReply {
                    success: value.is_some(),
                    value: value.unwrap_or(0),
                }),
            )
        }
        msgs::MSG_PROPERTY_STRING => {
            let Ok(request) = serde_json::from_slice::<msgs::PropertyGet>(&payload) else {
                return (IcpStatus::Failed, Vec::new());
            };
            let value = services
                .store
                .get_string(request.connection_id, &request.path);
            (
                IcpStatus::Success,
                json(&msgs::PropertyStringReply {
                    success: value.is_some(),
                    value: value.unwrap_or_default(),
                }),
            )
        }
        msgs::MSG_PROPERTY_BULK => {
            let Ok(request) = serde_json::from_slice::<msgs::PropertyBulk>(&payload) else {
                return (IcpStatus::Failed, Vec::new());
            };
            let results = services
                .store
                .get_bulk(request.connection_id, &request.requests);
            (
                IcpStatus::Success,
                json(&msgs::PropertyBulkReply { results }),
            )
        }
        msgs::MSG_REMOTE_CONTROL_ENDED => {
            if let Ok(request) = serde_json::from_slice::<msgs::RemoteControlEnded>(&payload) {
                tracing::info!(
                    spy = request.spy_id,
                    spied = request.spied_id,
                    "remote control ended"
                );
            }
            (
                IcpStatus::Success,
                json(&msgs::GenericReply { success: true }),
            )
        }
        sbp if sbp >= msgs::SBP_TYPE_BASE => {
            // Session broker pass-through: no in-tree handler claims
            // these, surface NotFound so the backend gets its reply.
            tracing::debug!(msg_type = sbp, "unhandled sbp request");
            (IcpStatus::NotFound, Vec::new())
        }
        other => {
            tracing::warn!(msg_type = other, "unknown icp request");
            (IcpStatus::NotFound, Vec::new())
        }
    }
}

fn logon_user(
    services: &Arc<SmServices>,
    request: &msgs::LogonUser,
) -> Result<msgs::LogonUserReply> {
    let store = &services.store;
    let connection_id = request.connection_id;

    // Authentication first, via the configured backend.
    let auth_name = store
        .get_string(connection_id, "auth.module")
        .unwrap_or_else(|| "builtin".to_string());
    let auth = services
        .auth
        .get(&auth_name)
        .with_context(|| format!("auth module '{auth_name}' is not registered"))?;
    let auth_result = auth
        .logon_user(&request.username, &request.domain, &request.password)
        .context("authentication failed")?;

    // Per-user property overlay becomes this connection's overlay.
    {
        let config = services.config.read().expect("config lock");
        store.set_overlay(connection_id, config.user_overlay(&auth_result.username));
    }

    let any_resolution = store
        .get_bool(connection_id, "session.reconnect.anyResolution")
        .unwrap_or(true);
    let key = SessionKey {
        username: auth_result.username.clone(),
        resolution_class: resolution_class(any_resolution, request.width, request.height),
        protocol: request.protocol,
    };

    let max_width = store
        .get_number(connection_id, "session.maxXRes")
        .unwrap_or(0)
        .max(0) as u32;
    let max_height = store
        .get_number(connection_id, "session.maxYRes")
        .unwrap_or(0)
        .max(0) as u32;

    // Reconnect to an existing session when one is alive.
    if let Some(session) = services.sessions.find_for_key(&key) {
        tracing::info!(
            session = session.id,
            user = %key.username,
            "reconnecting to existing session"
        );
        {
            let mut ctx = session.ctx.lock().expect("session ctx lock");
            if let Err(e) = session.module.connect(&mut ctx) {
                tracing::warn!(session = session.id, error = %e, "module connect failed");
            }
        }
        *session.connection_id.lock().expect("session connection lock") = Some(connection_id);
        session.set_state(SessionState::Active);
        return Ok(msgs::LogonUserReply {
            props: session.props.clone(),
            max_width,
            max_height,
        });
    }

    // Start a fresh backend.
    let module_name = store
        .get_string(connection_id, "module")
        .unwrap_or_else(|| "x11".to_string());
    let use_launcher = store
        .get_bool(connection_id, "module.useLauncher")
        .unwrap_or(false);
    let module = services
        .modules
        .get(&module_name, use_launcher)
        .with_context(|| format!("backend module '{module_name}' is not registered"))?;

    let session_id = services.sessions.next_session_id();
    let mut ctx = ModuleContext::new(session_id, &auth_result.username);
    ctx.uid = auth_result.uid;
    ctx.gid = auth_result.gid;
    ctx.home = auth_result.home.clone();
    ctx.width = request.width.min(if max_width == 0 { u32::MAX } else { max_width });
    ctx.height = request.height.min(if max_height == 0 { u32::MAX } else { max_height });
    ctx.color_depth = request.color_depth;

    let endpoint = module
        .start(&mut ctx)
        .context("backend module start failed")?;

    let props = BackendProps {
        service_endpoint: endpoint,
        server_cookie: random_cookie(),
        backend_cookie: random_cookie(),
    };

    let session = Arc::new(Session {
        id: session_id,
        key,
        props: props.clone(),
        module,
        ctx: Mutex::new(ctx),
        state: Mutex::new(SessionState::Active),
        connection_id: Mutex::new(Some(connection_id)),
    });
    services.sessions.insert(Arc::clone(&session));

    tracing::info!(
        session = session_id,
        user = %auth_result.username,
        endpoint = %session.props.service_endpoint,
        "session started"
    );

    Ok(msgs::LogonUserReply {
        props,
        max_width,
        max_height,
    })
}

fn disconnect_session(services: &Arc<SmServices>, connection_id: u32) -> bool {
    let Some(session) = services.sessions.find_by_connection(connection_id) else {
        return false;
    };
    tracing::info!(session = session.id, connection_id, "client disconnected, session idle");
    {
        let mut ctx = session.ctx.lock().expect("session ctx lock");
        if let Err(e) = session.module.disconnect(&mut ctx) {
            tracing::warn!(session = session.id, error = %e, "module disconnect failed");
        }
    }
    *session.connection_id.lock().expect("session connection lock") = None;
    session.set_state(SessionState::Idle);
    services.store.remove_overlay(connection_id);
    true
}

/// Tear a session down: stop the backend and, when a client is still
/// attached, log it off through the RDP server.
pub fn terminate_session(services: &Arc<SmServices>, session_id: u32) {
    let Some(session) = services.sessions.remove(session_id) else {
        return;
    };
    session.set_state(SessionState::Stopping);

    let connection = *session.connection_id.lock().expect("session connection lock");
    if let Some(connection_id) = connection {
        let peer = services.peer.lock().expect("peer lock").clone();
        if let Some(peer) = peer {
            let payload = json(&msgs::LogoffUserSession { connection_id });
            tokio::spawn(async move {
                if let Err(e) = peer.call(msgs::MSG_LOGOFF_USER_SESSION, payload).await {
                    tracing::warn!(connection_id, error = %e, "logoff call failed");
                }
            });
        }
    }

    let mut ctx = session.ctx.lock().expect("session ctx lock");
    if let Err(e) = session.module.stop(&mut ctx) {
        tracing::warn!(session = session.id, error = %e, "module stop failed");
    }
    tracing::info!(session = session.id, "session terminated");
}
