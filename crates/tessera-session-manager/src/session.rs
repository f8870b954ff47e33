//! Sessions and the registry mapping `(user, resolution class,
//! protocol)` to a live backend endpoint, so reconnecting clients reach
//! their existing desktop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tessera_icp::msgs::BackendProps;

use crate::module::{BackendModule, ModuleContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Active,
    Idle,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub username: String,
    pub resolution_class: String,
    pub protocol: u16,
}

/// Exact geometry unless deployment policy collapses everything into
/// one class.
#[must_use]
pub fn resolution_class(any_resolution: bool, width: u32, height: u32) -> String {
    if any_resolution {
        "any".to_string()
    } else {
        format!("{width}x{height}")
    }
}

pub struct Session {
    pub id: u32,
    pub key: SessionKey,
    pub props: BackendProps,
    pub module: Arc<dyn BackendModule>,
    pub ctx: Mutex<ModuleContext>,
    pub state: Mutex<SessionState>,
    /// The RDP connection currently attached, if any.
    pub connection_id: Mutex<Option<u32>>,
}

impl Session {
    pub fn set_state(&self, state: SessionState) {
        *self.state.lock().expect("session state lock") = state;
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state lock")
    }
}

#[derive(Default)]
struct RegistryInner {
    by_key: HashMap<SessionKey, u32>,
    by_id: HashMap<u32, Arc<Session>>,
    next_id: u32,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> SessionRegistry {
        SessionRegistry::default()
    }

    pub fn next_session_id(&self) -> u32 {
        let mut inner = self.inner.lock().expect("session registry lock");
        inner.next_id += 1;
        inner.next_id
    }

    pub fn insert(&self, session: Arc<Session>) {
        let mut inner = self.inner.lock().expect("session registry lock");
        inner.by_key.insert(session.key.clone(), session.id);
        inner.by_id.insert(session.id, session);
    }

    /// A reusable session for this key (not stopping).
    #[must_use]
    pub fn find_for_key(&self, key: &SessionKey) -> Option<Arc<Session>> {
        let inner = self.inner.lock().expect("session registry lock");
        let id = inner.by_key.get(key)?;
        let session = inner.by_id.get(id)?.clone();
        drop(inner);
        if session.state() == SessionState::Stopping {
            return None;
        }
        Some(session)
    }

    #[must_use]
    pub fn get(&self, id: u32) -> Option<Arc<Session>> {
        self.inner
            .lock()
            .expect("session registry lock")
            .by_id
            .get(&id)
            .cloned()
    }

    #[must_use]
    pub fn find_by_connection(&self, connection_id: u32) -> Option<Arc<Session>> {
        let inner = self.inner.lock().expect("session registry lock");
        inner
            .by_id
            .values()
            .find(|s| *s.connection_id.lock().expect("session connection lock") == Some(connection_id))
            .cloned()
    }

    pub fn remove(&self, id: u32) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock().expect("session registry lock");
        let session = inner.by_id.remove(&id)?;
        inner.by_key.retain(|_, v| *v != id);
        Some(session)
    }

    #[must_use]
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.inner
            .lock()
            .expect("session registry lock")
            .by_id
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleError;

    struct NullModule;

    impl BackendModule for NullModule {
        fn name(&self) -> &str {
            "null"
        }
        fn start(&self, _ctx: &mut ModuleContext) -> Result<String, ModuleError> {
            Ok("pipe".into())
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

    fn session(registry: &SessionRegistry, user: &str, class: &str) -> Arc<Session> {
        let id = registry.next_session_id();
        let session = Arc::new(Session {
            id,
            key: SessionKey {
                username: user.into(),
                resolution_class: class.into(),
                protocol: 2,
            },
            props: BackendProps::default(),
            module: Arc::new(NullModule),
            ctx: Mutex::new(ModuleContext::new(id, user)),
            state: Mutex::new(SessionState::Starting),
            connection_id: Mutex::new(None),
        });
        registry.insert(Arc::clone(&session));
        session
    }

    #[test]
    fn reconnect_finds_existing_session() {
        let registry = SessionRegistry::new();
        let created = session(&registry, "alice", "1920x1080");
        created.set_state(SessionState::Idle);

        let key = SessionKey {
            username: "alice".into(),
            resolution_class: "1920x1080".into(),
            protocol: 2,
        };
        let found = registry.find_for_key(&key).expect("session by key");
        assert_eq!(found.id, created.id);

        // Different class misses.
        let other = SessionKey {
            username: "alice".into(),
            resolution_class: "800x600".into(),
            protocol: 2,
        };
        assert!(registry.find_for_key(&other).is_none());
    }

    #[test]
    fn stopping_sessions_are_not_reused() {
        let registry = SessionRegistry::new();
        let created = session(&registry, "bob", "any");
        created.set_state(SessionState::Stopping);
        assert!(registry.find_for_key(&created.key).is_none());
    }

    #[test]
    fn lookup_by_connection() {
        let registry = SessionRegistry::new();
        let created = session(&registry, "carol", "any");
        *created.connection_id.lock().unwrap() = Some(33);
        assert_eq!(registry.find_by_connection(33).unwrap().id, created.id);
        assert!(registry.find_by_connection(34).is_none());

        registry.remove(created.id);
        assert!(registry.find_by_connection(33).is_none());
    }

    #[test]
    fn resolution_class_policy() {
        assert_eq!(resolution_class(false, 1920, 1080), "1920x1080");
        assert_eq!(resolution_class(true, 1920, 1080), "any");
    }
}
