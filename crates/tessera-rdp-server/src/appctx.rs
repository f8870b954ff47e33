//! Process-wide state: the connection registry, id allocation, the
//! cross-runloop command mailboxes and the codec factories.

use std::collections::HashMap;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::{Arc, Mutex, OnceLock};

use rustix::event::{eventfd, EventfdFlags};

use tessera_encode::CodecFactories;
use tessera_eventloop::SourceState;
use tessera_icp::msgs::{BackendProps, StartRemoteControl};
use tessera_icp::IcpClient;
use tessera_wire::msg::SbpReply;

use crate::connection::ConnState;

pub type ConnectionId = u32;

/// A message posted into a connection's runloop.
pub enum Command {
    /// Replace the backend with a freshly brokered one.
    SwitchTo {
        tag: u32,
        props: BackendProps,
        max_width: u32,
        max_height: u32,
    },
    Logoff {
        tag: u32,
    },
    SbpReply(SbpReply),
    VcConnect {
        tag: u32,
        vc_name: String,
        flags: u32,
    },
    VcDisconnect {
        tag: u32,
        vc_name: String,
        instance: u32,
    },
    UserMessage {
        tag: u32,
        message_type: u32,
        style: u32,
        timeout: u32,
        parameters: Vec<String>,
    },
    /// Start observing `target_id` (runs on the spy's loop).
    StartRemoteControl {
        tag: u32,
        request: StartRemoteControl,
    },
    /// A spy's RDP socket arriving in the target's loop.
    NewShadowingFrontend {
        tag: u32,
        spy_id: ConnectionId,
        rdp_source: SourceState,
        request: StartRemoteControl,
    },
    /// Reinstall the spy's socket in its own loop. Without a state the
    /// spy simply terminates.
    RewireOriginalBackend {
        rdp_source: Option<SourceState>,
        rewire: bool,
    },
    /// Detach a spy from this (target) connection.
    UnwireSpy {
        spy_id: ConnectionId,
        tag: Option<u32>,
    },
    StopShadowing {
        tag: u32,
    },
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::SwitchTo { .. } => "SwitchTo",
            Command::Logoff { .. } => "Logoff",
            Command::SbpReply(_) => "SbpReply",
            Command::VcConnect { .. } => "VcConnect",
            Command::VcDisconnect { .. } => "VcDisconnect",
            Command::UserMessage { .. } => "UserMessage",
            Command::StartRemoteControl { .. } => "StartRemoteControl",
            Command::NewShadowingFrontend { .. } => "NewShadowingFrontend",
            Command::RewireOriginalBackend { .. } => "RewireOriginalBackend",
            Command::UnwireSpy { .. } => "UnwireSpy",
            Command::StopShadowing { .. } => "StopShadowing",
        };
        f.write_str(name)
    }
}

fn make_event() -> OwnedFd {
    eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK).expect("eventfd")
}

fn signal_event(fd: BorrowedFd<'_>) {
    let _ = rustix::io::write(fd, &1u64.to_ne_bytes());
}

/// Drain an eventfd so it stops polling readable.
pub fn drain_event(fd: BorrowedFd<'_>) {
    let mut buf = [0u8; 8];
    let _ = rustix::io::read(fd, &mut buf);
}

/// The registry entry for one connection. The heavy state is behind a
/// mutex: by protocol it is only ever locked by the runloop thread that
/// currently owns the connection (its own, or the shadow target's).
pub struct ConnHandle {
    pub id: ConnectionId,
    pub state: Mutex<ConnState>,
    mailbox: Mutex<Vec<Command>>,
    pub mailbox_event: OwnedFd,
    pub stop_event: OwnedFd,
    pub thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ConnHandle {
    pub fn new(id: ConnectionId, state: ConnState) -> Arc<ConnHandle> {
        Arc::new(ConnHandle {
            id,
            state: Mutex::new(state),
            mailbox: Mutex::new(Vec::new()),
            mailbox_event: make_event(),
            stop_event: make_event(),
            thread: Mutex::new(None),
        })
    }

    pub fn post(&self, command: Command) {
        self.mailbox.lock().expect("mailbox lock").push(command);
        signal_event(self.mailbox_event.as_fd());
    }

    #[must_use]
    pub fn drain_mailbox(&self) -> Vec<Command> {
        drain_event(self.mailbox_event.as_fd());
        std::mem::take(&mut *self.mailbox.lock().expect("mailbox lock"))
    }

    pub fn signal_stop(&self) {
        signal_event(self.stop_event.as_fd());
    }
}

/// Process-global context shared by the accept loop, the runloops and
/// the ICP client thread.
pub struct AppContext {
    connections: Mutex<HashMap<ConnectionId, Arc<ConnHandle>>>,
    next_id: Mutex<ConnectionId>,
    pub icp: OnceLock<IcpClient>,
    pub codecs: CodecFactories,
    pub tls: Option<Arc<rustls::ServerConfig>>,
}

impl AppContext {
    #[must_use]
    pub fn new(codecs: CodecFactories, tls: Option<Arc<rustls::ServerConfig>>) -> Arc<AppContext> {
        Arc::new(AppContext {
            connections: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
            icp: OnceLock::new(),
            codecs,
            tls,
        })
    }

    #[must_use]
    pub fn icp(&self) -> Option<&IcpClient> {
        self.icp.get()
    }

    /// Allocate the next free positive connection id, probing
    /// monotonically and wrapping without going non-positive.
    pub fn next_connection_id(&self) -> ConnectionId {
        let connections = self.connections.lock().expect("registry lock");
        let mut next = self.next_id.lock().expect("id lock");
        loop {
            *next = next.wrapping_add(1);
            if *next == 0 {
                *next = 1;
            }
            if !connections.contains_key(&next) {
                return *next;
            }
        }
    }

    pub fn add_connection(&self, handle: Arc<ConnHandle>) {
        let id = handle.id;
        self.connections
            .lock()
            .expect("registry lock")
            .insert(id, handle);
        tracing::debug!(id, "added connection");
    }

    pub fn remove_connection(&self, id: ConnectionId) {
        self.connections.lock().expect("registry lock").remove(&id);
        tracing::debug!(id, "removed connection");
    }

    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnHandle>> {
        self.connections
            .lock()
            .expect("registry lock")
            .get(&id)
            .cloned()
    }

    /// Post a command to a connection's mailbox. Returns false when the
    /// connection is gone.
    pub fn post_command(&self, id: ConnectionId, command: Command) -> bool {
        match self.get(id) {
            Some(handle) => {
                handle.post(command);
                true
            }
            None => false,
        }
    }

    /// Stop every connection and join its runloop thread. Shadowing
    /// spies are unwired while their targets stop and go down on a
    /// later pass; the loop terminates once the registry is empty (a
    /// pass that finds only shadowing entries stops them directly).
    pub fn stop_all_connections(&self) {
        loop {
            // Snapshot the handles first: state locks are never taken
            // while the registry lock is held (the runloops lock in the
            // opposite order).
            let all: Vec<Arc<ConnHandle>> = {
                let connections = self.connections.lock().expect("registry lock");
                if connections.is_empty() {
                    return;
                }
                connections.values().cloned().collect()
            };
            let mut targets: Vec<Arc<ConnHandle>> = all
                .iter()
                .filter(|h| {
                    h.state
                        .lock()
                        .map(|s| s.shadowing == h.id)
                        .unwrap_or(true)
                })
                .cloned()
                .collect();
            if targets.is_empty() {
                targets = all;
            }

            let mut joined_any = false;
            for handle in targets {
                handle.signal_stop();
                let thread = handle.thread.lock().expect("thread lock").take();
                if let Some(thread) = thread {
                    joined_any = true;
                    if thread.join().is_err() {
                        tracing::error!(id = handle.id, "runloop thread panicked");
                    }
                }
                // A handle without a thread belongs to a connection that
                // never fully started; drop its registry slot directly.
                self.remove_connection(handle.id);
            }

            if !joined_any {
                // Nothing left to join: avoid spinning forever on
                // entries whose threads are already gone.
                let mut connections = self.connections.lock().expect("registry lock");
                connections.clear();
                return;
            }
        }
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.lock().expect("registry lock").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> Arc<AppContext> {
        AppContext::new(CodecFactories::default(), None)
    }

    #[test]
    fn ids_are_positive_and_probe_past_used_slots() {
        let ctx = context();
        let first = ctx.next_connection_id();
        assert!(first > 0);
        let state = ConnState::for_tests(first);
        ctx.add_connection(ConnHandle::new(first, state));
        let second = ctx.next_connection_id();
        assert_ne!(first, second);
    }

    #[test]
    fn post_command_hits_mailbox() {
        let ctx = context();
        let id = ctx.next_connection_id();
        let handle = ConnHandle::new(id, ConnState::for_tests(id));
        ctx.add_connection(Arc::clone(&handle));

        assert!(ctx.post_command(id, Command::Logoff { tag: 9 }));
        let drained = handle.drain_mailbox();
        assert_eq!(drained.len(), 1);
        assert!(matches!(drained[0], Command::Logoff { tag: 9 }));

        ctx.remove_connection(id);
        assert!(!ctx.post_command(id, Command::Logoff { tag: 9 }));
    }

    #[test]
    fn stop_all_terminates_on_threadless_entries() {
        let ctx = context();
        for _ in 0..3 {
            let id = ctx.next_connection_id();
            ctx.add_connection(ConnHandle::new(id, ConnState::for_tests(id)));
        }
        ctx.stop_all_connections();
        assert_eq!(ctx.connection_count(), 0);
    }
}
