//! TOML configuration feeding the property store.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::properties::{PropertyStore, PropertyValue};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// `global.*` properties.
    #[serde(default)]
    pub global: HashMap<String, PropertyValue>,
    /// `session.*` properties (defaults for every session).
    #[serde(default)]
    pub session: HashMap<String, PropertyValue>,
    /// Per-user property overlays, installed at logon.
    #[serde(default)]
    pub users: HashMap<String, HashMap<String, PropertyValue>>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Push the config's scopes into the store.
    pub fn apply(&self, store: &PropertyStore) {
        store.load_scopes(self.global.clone(), self.session.clone());
    }

    #[must_use]
    pub fn user_overlay(&self, username: &str) -> HashMap<String, PropertyValue> {
        self.users.get(username).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[global]
"tcp.keepalive.params" = "600,9"
"ssl.certificate" = "/etc/tessera/server.crt"

[session]
module = "x11"
"ogon.fps" = 30

[users.alice]
"ogon.fps" = 60
"#;

    #[test]
    fn parses_and_applies() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let store = PropertyStore::new();
        config.apply(&store);
        assert_eq!(store.get_string(1, "module").as_deref(), Some("x11"));
        assert_eq!(store.get_number(1, "ogon.fps"), Some(30));

        store.set_overlay(5, config.user_overlay("alice"));
        assert_eq!(store.get_number(5, "ogon.fps"), Some(60));
        assert!(config.user_overlay("bob").is_empty());
    }

    #[test]
    fn unknown_top_level_keys_are_rejected() {
        let result: Result<Config, _> = toml::from_str("[nonsense]\nx = 1\n");
        assert!(result.is_err());
    }
}
