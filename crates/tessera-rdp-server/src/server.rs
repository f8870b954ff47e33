//! The accept loop: a small reactor watching the listening socket, the
//! termination signals, and nothing else. Every accepted connection
//! gets its own thread and reactor.

use std::net::TcpListener;
use std::os::fd::{AsFd, AsRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};

use crate::appctx::{AppContext, Command};
use crate::connection::spawn_connection;
use tessera_eventloop::{EventLoop, Interest};
use tessera_icp::msgs;
use tessera_icp::{IcpClient, IcpStatus, ServerCall};

/// Wire the ICP client into the app context: requests originating at
/// the session manager are posted to the right connection mailbox.
pub fn install_icp(app: &Arc<AppContext>, icp: IcpClient) {
    let dispatch_app = Arc::clone(app);
    icp.set_server_call_handler(move |call| {
        dispatch_server_call(&dispatch_app, call);
    });

    let lost_app = Arc::clone(app);
    icp.set_disconnect_handler(move || {
        tracing::info!("session manager connection lost, stopping all sessions");
        let app = Arc::clone(&lost_app);
        std::thread::spawn(move || {
            app.stop_all_connections();
        });
    });

    app.icp
        .set(icp)
        .unwrap_or_else(|_| tracing::error!("icp client installed twice"));
}

fn dispatch_server_call(app: &Arc<AppContext>, call: ServerCall) {
    let icp = match app.icp() {
        Some(icp) => icp,
        None => return,
    };

    fn parse<'a, T: serde::Deserialize<'a>>(payload: &'a [u8]) -> Option<T> {
        serde_json::from_slice(payload).ok()
    }

    let posted = match call.msg_type {
        msgs::MSG_SWITCH_TO => parse::<msgs::SwitchTo>(&call.payload).map(|request| {
            app.post_command(
                request.connection_id,
                Command::SwitchTo {
                    tag: call.tag,
                    props: request.props,
                    max_width: request.max_width,
                    max_height: request.max_height,
                },
            )
        }),
        msgs::MSG_LOGOFF_USER_SESSION => {
            parse::<msgs::LogoffUserSession>(&call.payload).map(|request| {
                app.post_command(request.connection_id, Command::Logoff { tag: call.tag })
            })
        }
        msgs::MSG_USER_MESSAGE => parse::<msgs::UserMessageCall>(&call.payload).map(|request| {
            app.post_command(
                request.connection_id,
                Command::UserMessage {
                    tag: call.tag,
                    message_type: request.message_type,
                    style: request.style,
                    timeout: request.timeout,
                    parameters: request.parameters,
                },
            )
        }),
        msgs::MSG_VC_OPEN => parse::<msgs::VirtualChannelOpen>(&call.payload).map(|request| {
            app.post_command(
                request.connection_id,
                Command::VcConnect {
                    tag: call.tag,
                    vc_name: request.vc_name,
                    flags: request.flags,
                },
            )
        }),
        msgs::MSG_VC_CLOSE => parse::<msgs::VirtualChannelClose>(&call.payload).map(|request| {
            app.post_command(
                request.connection_id,
                Command::VcDisconnect {
                    tag: call.tag,
                    vc_name: request.vc_name,
                    instance: request.instance,
                },
            )
        }),
        msgs::MSG_START_REMOTE_CONTROL => {
            parse::<msgs::StartRemoteControl>(&call.payload).map(|request| {
                app.post_command(
                    request.connection_id,
                    Command::StartRemoteControl {
                        tag: call.tag,
                        request,
                    },
                )
            })
        }
        msgs::MSG_STOP_REMOTE_CONTROL => {
            parse::<msgs::StopRemoteControl>(&call.payload).map(|request| {
                app.post_command(request.connection_id, Command::StopShadowing { tag: call.tag })
            })
        }
        other => {
            tracing::warn!(msg_type = other, "unknown icp server call");
            let _ = icp.send_response(call.tag, call.msg_type, IcpStatus::NotFound, &[]);
            return;
        }
    };

    match posted {
        Some(true) => {} // the connection answers when done
        Some(false) => {
            let _ = icp.send_response(call.tag, call.msg_type, IcpStatus::NotFound, &[]);
        }
        None => {
            tracing::error!(msg_type = call.msg_type, "malformed icp call payload");
            let _ = icp.send_response(call.tag, call.msg_type, IcpStatus::Failed, &[]);
        }
    }
}

/// Run the accept loop until a termination signal arrives, then stop
/// every connection.
pub fn run(app: &Arc<AppContext>, port: u16) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .with_context(|| format!("error opening listener on port {port}"))?;
    listener.set_nonblocking(true)?;
    tracing::info!(port, "listening for RDP connections");

    // Route the termination signals through a signalfd so they surface
    // in the reactor like everything else.
    let mut sigset = SigSet::empty();
    sigset.add(Signal::SIGINT);
    sigset.add(Signal::SIGTERM);
    sigset.thread_block().context("error blocking signals")?;
    let signal_fd = SignalFd::with_flags(&sigset, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
        .context("error creating signalfd")?;

    let mut evloop = EventLoop::new().context("unable to create the accept event loop")?;
    let running = Arc::new(AtomicBool::new(true));

    let accept_app = Arc::clone(app);
    let accept_running = Arc::clone(&running);
    let listener_fd = listener.as_fd().as_raw_fd();
    evloop
        .add_fd(
            listener_fd,
            Interest::READ,
            Box::new(move |_evloop, _mask, _fd| loop {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        tracing::info!(%addr, "new connection");
                        if let Err(e) = spawn_connection(&accept_app, stream) {
                            tracing::error!(%addr, error = %e, "unable to start connection thread");
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                        accept_running.store(false, Ordering::Release);
                        break;
                    }
                }
            }),
        )
        .map_err(|e| anyhow::anyhow!("unable to watch the listener: {e}"))?;

    let signal_running = Arc::clone(&running);
    let mut signal_fd = signal_fd;
    evloop
        .add_fd(
            signal_fd.as_raw_fd(),
            Interest::READ,
            Box::new(move |_evloop, _mask, _fd| {
                while let Ok(Some(info)) = signal_fd.read_signal() {
                    tracing::info!(
                        signal = info.ssi_signo,
                        pid = info.ssi_pid,
                        uid = info.ssi_uid,
                        "received signal, shutting down"
                    );
                }
                signal_running.store(false, Ordering::Release);
            }),
        )
        .map_err(|e| anyhow::anyhow!("unable to watch the signalfd: {e}"))?;

    tracing::debug!("entering main loop");
    while running.load(Ordering::Acquire) {
        evloop
            .dispatch(1000)
            .map_err(|e| anyhow::anyhow!("accept loop dispatch failed: {e}"))?;
    }

    tracing::debug!("returned from main loop, stopping connections");
    app.stop_all_connections();
    tracing::debug!("all connections stopped");
    Ok(())
}

/// Connect to the session manager, retrying briefly so service startup
/// order does not matter.
pub fn connect_icp() -> Result<IcpClient> {
    let icp = IcpClient::connect(Duration::from_secs(10))
        .context("error connecting to the session manager")?;
    let peer = icp.announce().context("icp version exchange failed")?;
    tracing::info!(
        peer_major = peer.version_major,
        peer_minor = peer.version_minor,
        bulk = icp.peer_supports_bulk(),
        "connected to session manager"
    );
    Ok(icp)
}
