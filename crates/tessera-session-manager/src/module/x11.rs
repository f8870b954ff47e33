//! The X11 backend module: allocates a display, writes the session's
//! Xauthority cookie and launches the configured backend command. The
//! backend program itself (an X server with the tessera backend driver)
//! is deployment-provided; its command line comes from the property
//! store.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::{BackendModule, ModuleContext, ModuleError};
use crate::monitor::ProcessMonitor;
use crate::properties::PropertyStore;
use tessera_wire::pipe;

static NEXT_DISPLAY: AtomicU32 = AtomicU32::new(10);

pub struct X11Module {
    store: Arc<PropertyStore>,
    monitor: Arc<ProcessMonitor>,
}

struct X11State {
    display: u32,
    child: Option<Child>,
    xauthority: PathBuf,
}

impl X11Module {
    #[must_use]
    pub fn new(store: Arc<PropertyStore>, monitor: Arc<ProcessMonitor>) -> X11Module {
        X11Module { store, monitor }
    }

    /// `~/.Xauthority.tessera.<session>` with a fresh MIT-MAGIC-COOKIE-1,
    /// mode 0600, owned by the session user.
    fn write_xauthority(ctx: &ModuleContext, display: u32) -> Result<PathBuf, ModuleError> {
        let path = PathBuf::from(&ctx.home).join(format!(".Xauthority.tessera.{}", ctx.session_id));

        let mut cookie = [0u8; 16];
        rustix::rand::getrandom(&mut cookie, rustix::rand::GetRandomFlags::empty())
            .map_err(|e| ModuleError::Failed(format!("getrandom failed: {e}")))?;

        // One Xauthority entry: family FamilyLocal, this host, the
        // display number and the cookie.
        let hostname = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());
        let display_str = display.to_string();

        let mut data = Vec::new();
        data.extend_from_slice(&0x0100u16.to_be_bytes()); // FamilyLocal
        let mut put = |bytes: &[u8]| {
            data.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
            data.extend_from_slice(bytes);
        };
        put(hostname.as_bytes());
        put(display_str.as_bytes());
        put(b"MIT-MAGIC-COOKIE-1");
        put(&cookie);

        std::fs::write(&path, &data)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        let uid = nix::unistd::Uid::from_raw(ctx.uid);
        let gid = nix::unistd::Gid::from_raw(ctx.gid);
        nix::unistd::chown(&path, Some(uid), Some(gid))
            .map_err(|e| ModuleError::Failed(format!("chown xauthority failed: {e}")))?;
        Ok(path)
    }

    fn state<'a>(ctx: &'a mut ModuleContext) -> Option<&'a mut X11State> {
        ctx.custom.as_mut().and_then(|c| c.downcast_mut::<X11State>())
    }
}

impl BackendModule for X11Module {
    fn name(&self) -> &str {
        "x11"
    }

    fn start(&self, ctx: &mut ModuleContext) -> Result<String, ModuleError> {
        let display_num = NEXT_DISPLAY.fetch_add(1, Ordering::Relaxed);
        let endpoint = pipe::endpoint_name(ctx.session_id, "x11");
        let xauthority = Self::write_xauthority(ctx, display_num)?;

        // The concrete server command is deployment policy.
        let command = self
            .store
            .get_string(ctx.session_id, "module.x11.command")
            .unwrap_or_default();

        let child = if command.is_empty() {
            tracing::info!(
                session = ctx.session_id,
                display = display_num,
                "module.x11.command not configured, expecting an externally started backend"
            );
            None
        } else {
            let mut parts = command.split_whitespace();
            let program = parts
                .next()
                .ok_or_else(|| ModuleError::Failed("empty x11 command".into()))?;
            let child = Command::new(program)
                .args(parts)
                .env("DISPLAY", format!(":{display_num}"))
                .env("XAUTHORITY", &xauthority)
                .env("TESSERA_ENDPOINT", &endpoint)
                .env("TESSERA_SESSION_ID", ctx.session_id.to_string())
                .env("USER", &ctx.username)
                .env("HOME", &ctx.home)
                .envs(ctx.env.iter().map(|(k, v)| (k.clone(), v.clone())))
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()?;
            self.monitor.watch(child.id(), ctx.session_id, true);
            tracing::info!(
                session = ctx.session_id,
                display = display_num,
                pid = child.id(),
                "x11 backend started"
            );
            Some(child)
        };

        ctx.custom = Some(Box::new(X11State {
            display: display_num,
            child,
            xauthority,
        }));
        Ok(endpoint)
    }

    fn stop(&self, ctx: &mut ModuleContext) -> Result<(), ModuleError> {
        let Some(state) = Self::state(ctx) else {
            return Ok(());
        };
        if let Some(child) = state.child.as_ref() {
            let pid = child.id();
            self.monitor.unwatch(pid);
            self.monitor
                .terminate_child_process(pid, std::time::Duration::from_secs(5));
        }
        let _ = std::fs::remove_file(&state.xauthority);
        let display_num = state.display;
        let session_id = ctx.session_id;
        tracing::info!(session = session_id, display = display_num, "x11 backend stopped");
        ctx.custom = None;
        Ok(())
    }

    fn connect(&self, _ctx: &mut ModuleContext) -> Result<(), ModuleError> {
        Ok(())
    }

    fn disconnect(&self, _ctx: &mut ModuleContext) -> Result<(), ModuleError> {
        Ok(())
    }

    fn get_custom_info(&self, ctx: &mut ModuleContext) -> Result<String, ModuleError> {
        let display = Self::state(ctx).map(|s| s.display).unwrap_or(0);
        Ok(format!(":{display}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xauthority_cookie_shape() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ModuleContext::new(12, "tester");
        ctx.home = dir.path().to_string_lossy().to_string();
        ctx.uid = nix::unistd::Uid::current().as_raw();
        ctx.gid = nix::unistd::Gid::current().as_raw();

        let path = X11Module::write_xauthority(&ctx, 42).unwrap();
        assert!(path.ends_with(".Xauthority.tessera.12"));

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let data = std::fs::read(&path).unwrap();
        // Entry ends with the 18-byte auth name and the 16-byte cookie.
        let marker = b"MIT-MAGIC-COOKIE-1";
        let pos = data
            .windows(marker.len())
            .position(|w| w == marker)
            .expect("auth name present");
        assert_eq!(data.len(), pos + marker.len() + 2 + 16);
    }

    #[test]
    fn displays_are_unique() {
        let a = NEXT_DISPLAY.fetch_add(1, Ordering::Relaxed);
        let b = NEXT_DISPLAY.fetch_add(1, Ordering::Relaxed);
        assert_ne!(a, b);
    }
}
