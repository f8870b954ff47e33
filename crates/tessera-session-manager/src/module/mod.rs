//! Backend modules: the capability that turns a logon into a running
//! graphical backend. Two strategies exist: in-process modules
//! ([`crate::module::x11::X11Module`] style) and out-of-process modules
//! driven through a launcher ([`remote::RemoteModule`]).

pub mod remote;
pub mod x11;

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("module i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("module call timed out")]
    Timeout,
    #[error("launcher transport failed: {0}")]
    Transport(String),
    #[error("module failure: {0}")]
    Failed(String),
}

/// Everything a module needs to know about the session it serves. The
/// `custom` slot carries module-private state between calls.
pub struct ModuleContext {
    pub session_id: u32,
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub width: u32,
    pub height: u32,
    pub color_depth: u32,
    pub env: Vec<(String, String)>,
    pub custom: Option<Box<dyn Any + Send>>,
}

impl ModuleContext {
    #[must_use]
    pub fn new(session_id: u32, username: &str) -> ModuleContext {
        ModuleContext {
            session_id,
            username: username.to_string(),
            uid: 0,
            gid: 0,
            home: String::new(),
            width: 1024,
            height: 768,
            color_depth: 32,
            env: Vec::new(),
            custom: None,
        }
    }
}

/// The backend module capability: start/stop the
/// backend program and track attach/detach.
pub trait BackendModule: Send + Sync {
    fn name(&self) -> &str;
    /// Launch the backend; returns the service endpoint pipe name the
    /// RDP server connects to.
    fn start(&self, ctx: &mut ModuleContext) -> Result<String, ModuleError>;
    fn stop(&self, ctx: &mut ModuleContext) -> Result<(), ModuleError>;
    fn connect(&self, ctx: &mut ModuleContext) -> Result<(), ModuleError>;
    fn disconnect(&self, ctx: &mut ModuleContext) -> Result<(), ModuleError>;
    fn get_custom_info(&self, ctx: &mut ModuleContext) -> Result<String, ModuleError>;
}

/// Registry of backend modules, split by launch strategy: the same
/// module name can exist both in-process and behind a launcher.
#[derive(Default)]
pub struct BackendModuleRegistry {
    local: HashMap<String, Arc<dyn BackendModule>>,
    remote: HashMap<String, Arc<dyn BackendModule>>,
}

impl BackendModuleRegistry {
    #[must_use]
    pub fn new() -> BackendModuleRegistry {
        BackendModuleRegistry::default()
    }

    pub fn register_local(&mut self, module: Arc<dyn BackendModule>) -> bool {
        let name = module.name().to_string();
        if self.local.contains_key(&name) {
            tracing::info!(name, "another module already registered this name");
            return false;
        }
        tracing::info!(name, "backend module registered (local)");
        self.local.insert(name, module);
        true
    }

    pub fn register_remote(&mut self, module: Arc<dyn BackendModule>) -> bool {
        let name = module.name().to_string();
        if self.remote.contains_key(&name) {
            tracing::info!(name, "another module already registered this name (remote)");
            return false;
        }
        tracing::info!(name, "backend module registered (remote)");
        self.remote.insert(name, module);
        true
    }

    #[must_use]
    pub fn get(&self, name: &str, use_launcher: bool) -> Option<Arc<dyn BackendModule>> {
        if use_launcher {
            self.remote.get(name).cloned()
        } else {
            self.local.get(name).cloned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullModule(&'static str);

    impl BackendModule for NullModule {
        fn name(&self) -> &str {
            self.0
        }
        fn start(&self, ctx: &mut ModuleContext) -> Result<String, ModuleError> {
            Ok(format!("pipe_{}", ctx.session_id))
        }
        fn stop(&self, _ctx: &mut ModuleContext) -> Result<(), ModuleError> {
            Ok(())
        }
        fn connect(&self, _ctx: &mut ModuleContext) -> Result<(), ModuleError> {
            Ok(())
        }
        fn disconnect(&self, _ctx: &mut ModuleContext) -> Result<(), ModuleError> {
            Ok(())
        }
        fn get_custom_info(&self, _ctx: &mut ModuleContext) -> Result<String, ModuleError> {
            Ok(String::new())
        }
    }

    #[test]
    fn registry_strategies_are_separate() {
        let mut registry = BackendModuleRegistry::new();
        assert!(registry.register_local(Arc::new(NullModule("x11"))));
        assert!(!registry.register_local(Arc::new(NullModule("x11"))));
        assert!(registry.register_remote(Arc::new(NullModule("x11"))));

        assert!(registry.get("x11", false).is_some());
        assert!(registry.get("x11", true).is_some());
        assert!(registry.get("weston", false).is_none());

        let module = registry.get("x11", false).unwrap();
        let mut ctx = ModuleContext::new(4, "alice");
        assert_eq!(module.start(&mut ctx).unwrap(), "pipe_4");
    }
}
