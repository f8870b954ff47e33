//! Out-of-process modules: a launcher child speaks the same framed RPC
//! as ICP over its stdin/stdout. Calls carry a 15 second budget; a
//! timeout kills the launcher.

use std::io::Write;
use std::os::fd::{AsFd, AsRawFd};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tessera_icp::header::{IcpHeader, IcpStatus, HEADER_LEN};
use tessera_icp::msgs::{
    self, ModuleCall, ModuleStartReply, ModuleStringReply,
};

use super::{BackendModule, ModuleContext, ModuleError};
use crate::properties::PropertyStore;
use std::sync::Arc;

const CALL_TIMEOUT: Duration = Duration::from_secs(15);

struct Launcher {
    child: Child,
    next_tag: u32,
}

impl Launcher {
    fn spawn(program: &str, username: &str) -> Result<Launcher, ModuleError> {
        let child = Command::new(program)
            .arg("--user")
            .arg(username)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(Launcher { child, next_tag: 1 })
    }

    fn read_with_deadline(&mut self, buf: &mut [u8], deadline: Instant) -> Result<(), ModuleError> {
        use rustix::event::{poll, PollFd, PollFlags};
        use std::io::Read;

        let stdout = self
            .child
            .stdout
            .as_mut()
            .ok_or_else(|| ModuleError::Transport("launcher stdout closed".into()))?;
        let mut filled = 0;
        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ModuleError::Timeout);
            }
            {
                let fd = stdout.as_fd();
                let mut fds = [PollFd::new(&fd, PollFlags::IN)];
                match poll(&mut fds, remaining.as_millis() as i32) {
                    Ok(0) => return Err(ModuleError::Timeout),
                    Ok(_) => {}
                    Err(rustix::io::Errno::INTR) => continue,
                    Err(e) => return Err(ModuleError::Transport(e.to_string())),
                }
            }
            match stdout.read(&mut buf[filled..]) {
                Ok(0) => return Err(ModuleError::Transport("launcher exited".into())),
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ModuleError::Transport(e.to_string())),
            }
        }
        Ok(())
    }

    /// One request/response round trip, answering reverse property
    /// lookups in between.
    fn call(
        &mut self,
        store: &PropertyStore,
        session_id: u32,
        msg_type: u32,
        payload: &[u8],
    ) -> Result<(IcpStatus, Vec<u8>), ModuleError> {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1).max(1);

        {
            let stdin = self
                .child
                .stdin
                .as_mut()
                .ok_or_else(|| ModuleError::Transport("launcher stdin closed".into()))?;
            stdin
                .write_all(&IcpHeader::request(tag, msg_type, payload.len() as u32).encode())?;
            stdin.write_all(payload)?;
            stdin.flush()?;
        }

        let deadline = Instant::now() + CALL_TIMEOUT;
        loop {
            let mut header_buf = [0u8; HEADER_LEN];
            self.read_with_deadline(&mut header_buf, deadline)?;
            let header = IcpHeader::decode(&header_buf);
            let mut body = vec![0u8; header.length as usize];
            self.read_with_deadline(&mut body, deadline)?;

            if header.is_response {
                if header.tag != tag {
                    tracing::debug!(tag = header.tag, "stale launcher response, dropping");
                    continue;
                }
                return Ok((header.status, body));
            }

            // Reverse property lookup from the launcher.
            let response = self.answer_property(store, session_id, header.msg_type, &body);
            let stdin = self
                .child
                .stdin
                .as_mut()
                .ok_or_else(|| ModuleError::Transport("launcher stdin closed".into()))?;
            stdin.write_all(
                &IcpHeader::response(
                    header.tag,
                    header.msg_type,
                    IcpStatus::Success,
                    response.len() as u32,
                )
                .encode(),
            )?;
            stdin.write_all(&response)?;
            stdin.flush()?;
        }
    }

    fn answer_property(
        &self,
        store: &PropertyStore,
        session_id: u32,
        msg_type: u32,
        body: &[u8],
    ) -> Vec<u8> {
        let path = serde_json::from_slice::<msgs::PropertyGet>(body)
            .map(|p| p.path)
            .unwrap_or_default();
        match msg_type {
            msgs::MSG_LAUNCHER_PROPERTY_BOOL => {
                let value = store.get_bool(session_id, &path);
                serde_json::to_vec(&msgs::PropertyBoolReply {
                    success: value.is_some(),
                    value: value.unwrap_or(false),
                })
                .unwrap_or_default()
            }
            msgs::MSG_LAUNCHER_PROPERTY_NUMBER => {
                let value = store.get_number(session_id, &path);
                serde_json::to_vec(&msgs::PropertyNumberReply {
                    success: value.is_some(),
                    value: value.unwrap_or(0),
                })
                .unwrap_or_default()
            }
            msgs::MSG_LAUNCHER_PROPERTY_STRING => {
                let value = store.get_string(session_id, &path);
                serde_json::to_vec(&msgs::PropertyStringReply {
                    success: value.is_some(),
                    value: value.unwrap_or_default(),
                })
                .unwrap_or_default()
            }
            other => {
                tracing::error!(msg_type = other, "unexpected launcher request");
                Vec::new()
            }
        }
    }

    fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// A backend module whose implementation lives in a launcher process.
pub struct RemoteModule {
    name: String,
    launcher_program: String,
    store: Arc<PropertyStore>,
}

struct RemoteState {
    launcher: Launcher,
}

impl RemoteModule {
    #[must_use]
    pub fn new(name: &str, launcher_program: &str, store: Arc<PropertyStore>) -> RemoteModule {
        RemoteModule {
            name: name.to_string(),
            launcher_program: launcher_program.to_string(),
            store,
        }
    }

    fn module_call_payload(&self, ctx: &ModuleContext) -> Vec<u8> {
        serde_json::to_vec(&ModuleCall {
            session_id: ctx.session_id,
            username: ctx.username.clone(),
            base_config_path: format!("session.{}", ctx.session_id),
            env: ctx.env.clone(),
        })
        .unwrap_or_default()
    }

    fn with_launcher<R>(
        &self,
        ctx: &mut ModuleContext,
        f: impl FnOnce(&mut Launcher, &PropertyStore) -> Result<R, ModuleError>,
    ) -> Result<R, ModuleError> {
        if ctx.custom.is_none() {
            let launcher = Launcher::spawn(&self.launcher_program, &ctx.username)?;
            ctx.custom = Some(Box::new(RemoteState { launcher }));
        }
        let state = ctx
            .custom
            .as_mut()
            .and_then(|c| c.downcast_mut::<RemoteState>())
            .ok_or_else(|| ModuleError::Transport("module context mixup".into()))?;

        let result = f(&mut state.launcher, &self.store);
        if matches!(result, Err(ModuleError::Timeout)) {
            // A hung launcher is not coming back.
            tracing::error!(module = %self.name, "launcher call timed out, killing launcher");
            state.launcher.kill();
            ctx.custom = None;
        }
        result
    }
}

impl BackendModule for RemoteModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self, ctx: &mut ModuleContext) -> Result<String, ModuleError> {
        let payload = self.module_call_payload(ctx);
        let session_id = ctx.session_id;
        self.with_launcher(ctx, |launcher, store| {
            let (status, body) =
                launcher.call(store, session_id, msgs::MSG_MODULE_START, &payload)?;
            if status != IcpStatus::Success {
                return Err(ModuleError::Failed("launcher refused start".into()));
            }
            let reply: ModuleStartReply = serde_json::from_slice(&body)
                .map_err(|e| ModuleError::Transport(e.to_string()))?;
            if !reply.success {
                return Err(ModuleError::Failed("module start failed".into()));
            }
            Ok(reply.pipe_name)
        })
    }

    fn stop(&self, ctx: &mut ModuleContext) -> Result<(), ModuleError> {
        let payload = self.module_call_payload(ctx);
        let session_id = ctx.session_id;
        let result = self.with_launcher(ctx, |launcher, store| {
            let (status, _) = launcher.call(store, session_id, msgs::MSG_MODULE_STOP, &payload)?;
            if status != IcpStatus::Success {
                return Err(ModuleError::Failed("module stop failed".into()));
            }
            let _ = launcher.call(store, session_id, msgs::MSG_MODULE_EXIT, &[]);
            Ok(())
        });
        // The launcher exits with the session.
        if let Some(state) = ctx
            .custom
            .take()
            .and_then(|c| c.downcast::<RemoteState>().ok())
        {
            let mut state = *state;
            state.launcher.kill();
        }
        result
    }

    fn connect(&self, ctx: &mut ModuleContext) -> Result<(), ModuleError> {
        let payload = self.module_call_payload(ctx);
        let session_id = ctx.session_id;
        self.with_launcher(ctx, |launcher, store| {
            let (status, _) =
                launcher.call(store, session_id, msgs::MSG_MODULE_CONNECT, &payload)?;
            if status != IcpStatus::Success {
                return Err(ModuleError::Failed("module connect failed".into()));
            }
            Ok(())
        })
    }

    fn disconnect(&self, ctx: &mut ModuleContext) -> Result<(), ModuleError> {
        let payload = self.module_call_payload(ctx);
        let session_id = ctx.session_id;
        self.with_launcher(ctx, |launcher, store| {
            let (status, _) =
                launcher.call(store, session_id, msgs::MSG_MODULE_DISCONNECT, &payload)?;
            if status != IcpStatus::Success {
                return Err(ModuleError::Failed("module disconnect failed".into()));
            }
            Ok(())
        })
    }

    fn get_custom_info(&self, ctx: &mut ModuleContext) -> Result<String, ModuleError> {
        let payload = self.module_call_payload(ctx);
        let session_id = ctx.session_id;
        self.with_launcher(ctx, |launcher, store| {
            let (status, body) =
                launcher.call(store, session_id, msgs::MSG_MODULE_GET_CUSTOM_INFO, &payload)?;
            if status != IcpStatus::Success {
                return Err(ModuleError::Failed("get_custom_info failed".into()));
            }
            let reply: ModuleStringReply = serde_json::from_slice(&body)
                .map_err(|e| ModuleError::Transport(e.to_string()))?;
            Ok(reply.value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A shell script standing in for a launcher: answers every call
    /// with a canned ModuleStart reply after issuing one reverse
    /// property lookup.
    fn fake_launcher_script(dir: &std::path::Path) -> String {
        // The script is python3 for binary-safe pipe handling.
        let path = dir.join("launcher.py");
        let script = r#"
import json
import struct
import sys

def read_exact(n):
    data = b""
    while len(data) < n:
        chunk = sys.stdin.buffer.read(n - len(data))
        if not chunk:
            sys.exit(0)
        data += chunk
    return data

def write_frame(tag, is_response, status, msg_type, payload):
    header = struct.pack("<I", tag)
    header += bytes([1 if is_response else 0, status])
    header += struct.pack("<I", msg_type)
    header += struct.pack("<I", len(payload))
    sys.stdout.buffer.write(header + payload)
    sys.stdout.buffer.flush()

asked_property = False
while True:
    header = read_exact(14)
    tag = struct.unpack("<I", header[0:4])[0]
    msg_type = struct.unpack("<I", header[6:10])[0]
    length = struct.unpack("<I", header[10:14])[0]
    payload = read_exact(length)

    if msg_type == 100:  # ModuleStart
        if not asked_property:
            asked_property = True
            req = json.dumps({"connection_id": 0, "path": "module"}).encode()
            write_frame(777, False, 0, 112, req)  # reverse PropertyString
            reply_header = read_exact(14)
            reply_len = struct.unpack("<I", reply_header[10:14])[0]
            read_exact(reply_len)
        body = json.dumps({"success": True, "pipe_name": "\\\\.\\pipe\\fake_backend"}).encode()
        write_frame(tag, True, 0, msg_type, body)
    elif msg_type == 105:  # Exit
        write_frame(tag, True, 0, msg_type, b"null")
        sys.exit(0)
    else:
        write_frame(tag, True, 0, msg_type, b"null")
"#;
        std::fs::write(&path, script).unwrap();
        path.to_string_lossy().to_string()
    }

    #[test]
    fn remote_start_round_trip_with_reverse_lookup() {
        if std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_err()
        {
            // Not available in this environment.
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let script = fake_launcher_script(dir.path());

        let store = Arc::new(PropertyStore::new());
        let module = RemoteModule::new("fake", "python3", Arc::clone(&store));
        // Point the launcher at the script by abusing the username arg
        // slot: spawn manually instead.
        let mut ctx = ModuleContext::new(3, "alice");
        let launcher = Launcher {
            child: Command::new("python3")
                .arg(&script)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
                .unwrap(),
            next_tag: 1,
        };
        ctx.custom = Some(Box::new(RemoteState { launcher }));

        let endpoint = module.start(&mut ctx).unwrap();
        assert_eq!(endpoint, "\\\\.\\pipe\\fake_backend");
        module.stop(&mut ctx).unwrap();
    }
}
