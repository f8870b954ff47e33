//! The property store: hierarchical `path → bool | number | string`
//! settings with three scopes. Lookups for a connection check the
//! per-connection overlay first, then `session.*`, then `global.*`.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Deserialize;

use tessera_icp::msgs::{PropertyBulkRequest, PropertyBulkValue, PropertyKind};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Number(i64),
    String(String),
}

impl PropertyValue {
    fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(v) => Some(*v),
            PropertyValue::Number(v) => Some(*v != 0),
            PropertyValue::String(_) => None,
        }
    }

    fn as_number(&self) -> Option<i64> {
        match self {
            PropertyValue::Number(v) => Some(*v),
            PropertyValue::Bool(v) => Some(i64::from(*v)),
            PropertyValue::String(_) => None,
        }
    }

    fn as_string(&self) -> Option<String> {
        match self {
            PropertyValue::String(v) => Some(v.clone()),
            PropertyValue::Number(v) => Some(v.to_string()),
            PropertyValue::Bool(v) => Some(v.to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    global: HashMap<String, PropertyValue>,
    session: HashMap<String, PropertyValue>,
    overlays: HashMap<u32, HashMap<String, PropertyValue>>,
}

/// Read-mostly store behind a reader-writer lock; writes happen at
/// config (re)load and at logon when user overlays are installed.
#[derive(Debug, Default)]
pub struct PropertyStore {
    inner: RwLock<StoreInner>,
}

impl PropertyStore {
    #[must_use]
    pub fn new() -> PropertyStore {
        PropertyStore::default()
    }

    /// Replace the global/session scopes (config load or SIGHUP reload).
    pub fn load_scopes(
        &self,
        global: HashMap<String, PropertyValue>,
        session: HashMap<String, PropertyValue>,
    ) {
        let mut inner = self.inner.write().expect("property store lock");
        inner.global = global;
        inner.session = session;
    }

    /// Install the per-connection overlay (typically the user's own
    /// settings, applied at logon).
    pub fn set_overlay(&self, connection_id: u32, overlay: HashMap<String, PropertyValue>) {
        let mut inner = self.inner.write().expect("property store lock");
        inner.overlays.insert(connection_id, overlay);
    }

    pub fn remove_overlay(&self, connection_id: u32) {
        let mut inner = self.inner.write().expect("property store lock");
        inner.overlays.remove(&connection_id);
    }

    fn lookup(&self, connection_id: u32, path: &str) -> Option<PropertyValue> {
        let inner = self.inner.read().expect("property store lock");
        if let Some(overlay) = inner.overlays.get(&connection_id) {
            if let Some(value) = overlay.get(path) {
                return Some(value.clone());
            }
        }
        if let Some(value) = inner.session.get(path) {
            return Some(value.clone());
        }
        inner.global.get(path).cloned()
    }

    #[must_use]
    pub fn get_bool(&self, connection_id: u32, path: &str) -> Option<bool> {
        self.lookup(connection_id, path).and_then(|v| v.as_bool())
    }

    #[must_use]
    pub fn get_number(&self, connection_id: u32, path: &str) -> Option<i64> {
        self.lookup(connection_id, path).and_then(|v| v.as_number())
    }

    #[must_use]
    pub fn get_string(&self, connection_id: u32, path: &str) -> Option<String> {
        self.lookup(connection_id, path).and_then(|v| v.as_string())
    }

    /// Answer a heterogeneous batch in one go.
    #[must_use]
    pub fn get_bulk(
        &self,
        connection_id: u32,
        requests: &[PropertyBulkRequest],
    ) -> Vec<PropertyBulkValue> {
        requests
            .iter()
            .map(|request| match request.kind {
                PropertyKind::Bool => self
                    .get_bool(connection_id, &request.path)
                    .map_or(PropertyBulkValue::Missing, PropertyBulkValue::Bool),
                PropertyKind::Number => self
                    .get_number(connection_id, &request.path)
                    .map_or(PropertyBulkValue::Missing, PropertyBulkValue::Number),
                PropertyKind::String => self
                    .get_string(connection_id, &request.path)
                    .map_or(PropertyBulkValue::Missing, PropertyBulkValue::String),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PropertyStore {
        let store = PropertyStore::new();
        let mut global = HashMap::new();
        global.insert(
            "tcp.keepalive.params".into(),
            PropertyValue::String("600,9".into()),
        );
        global.insert("ogon.fps".into(), PropertyValue::Number(20));
        let mut session = HashMap::new();
        session.insert("ogon.fps".into(), PropertyValue::Number(30));
        session.insert("module".into(), PropertyValue::String("x11".into()));
        store.load_scopes(global, session);
        store
    }

    #[test]
    fn session_scope_beats_global() {
        let store = store();
        assert_eq!(store.get_number(1, "ogon.fps"), Some(30));
        assert_eq!(
            store.get_string(1, "tcp.keepalive.params").as_deref(),
            Some("600,9")
        );
    }

    #[test]
    fn overlay_beats_everything() {
        let store = store();
        let mut overlay = HashMap::new();
        overlay.insert("ogon.fps".into(), PropertyValue::Number(60));
        store.set_overlay(7, overlay);
        assert_eq!(store.get_number(7, "ogon.fps"), Some(60));
        assert_eq!(store.get_number(8, "ogon.fps"), Some(30));
        store.remove_overlay(7);
        assert_eq!(store.get_number(7, "ogon.fps"), Some(30));
    }

    #[test]
    fn type_coercion() {
        let store = store();
        assert_eq!(store.get_string(1, "ogon.fps").as_deref(), Some("30"));
        assert_eq!(store.get_bool(1, "ogon.fps"), Some(true));
        assert_eq!(store.get_bool(1, "module"), None);
        assert_eq!(store.get_number(1, "missing"), None);
    }

    #[test]
    fn bulk_mixes_kinds_and_misses() {
        let store = store();
        let results = store.get_bulk(
            1,
            &[
                PropertyBulkRequest {
                    kind: PropertyKind::Number,
                    path: "ogon.fps".into(),
                },
                PropertyBulkRequest {
                    kind: PropertyKind::String,
                    path: "module".into(),
                },
                PropertyBulkRequest {
                    kind: PropertyKind::Bool,
                    path: "nope".into(),
                },
            ],
        );
        assert_eq!(
            results,
            vec![
                PropertyBulkValue::Number(30),
                PropertyBulkValue::String("x11".into()),
                PropertyBulkValue::Missing,
            ]
        );
    }
}
