//! Pluggable authentication: the `AuthBackend` capability and its
//! registry. The built-in module verifies the account exists and checks
//! the password through a helper command, which works on any
//! PAM-configured system without linking libpam.

use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unknown user '{0}'")]
    UnknownUser(String),
    #[error("authentication failed for user '{0}'")]
    BadCredentials(String),
    #[error("authentication backend failure: {0}")]
    Backend(String),
}

/// Result of a successful logon.
#[derive(Debug, Clone)]
pub struct AuthResult {
    /// Possibly canonicalized by the backend.
    pub username: String,
    /// The domain the account was actually found in.
    pub effective_domain: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
}

/// The authentication capability. One instance serves many logons.
pub trait AuthBackend: Send + Sync {
    fn name(&self) -> &str;
    fn logon_user(
        &self,
        username: &str,
        domain: &str,
        password: &str,
    ) -> Result<AuthResult, AuthError>;
}

/// Registry of authentication modules keyed by name.
#[derive(Default)]
pub struct AuthModuleRegistry {
    modules: HashMap<String, Arc<dyn AuthBackend>>,
}

impl AuthModuleRegistry {
    #[must_use]
    pub fn new() -> AuthModuleRegistry {
        AuthModuleRegistry::default()
    }

    /// Register a module; refuses duplicate names.
    pub fn register(&mut self, module: Arc<dyn AuthBackend>) -> bool {
        let name = module.name().to_string();
        if self.modules.contains_key(&name) {
            tracing::info!(name, "another module already registered this auth name");
            return false;
        }
        tracing::info!(name, "auth module registered");
        self.modules.insert(name, module);
        true
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn AuthBackend>> {
        self.modules.get(name).cloned()
    }
}

/// The built-in backend: account lookup via the passwd database, then
/// password verification through `su` so PAM policy still applies.
pub struct BuiltinAuth;

impl BuiltinAuth {
    fn lookup(username: &str) -> Result<nix::unistd::User, AuthError> {
        nix::unistd::User::from_name(username)
            .map_err(|e| AuthError::Backend(e.to_string()))?
            .ok_or_else(|| AuthError::UnknownUser(username.to_string()))
    }

    fn verify_password(username: &str, password: &str) -> Result<(), AuthError> {
        use std::io::Write;
        use std::process::{Command, Stdio};

        // `su --command true` validates credentials against PAM; the
        // password goes in on stdin when there is no tty.
        let mut child = Command::new("su")
            .args(["--command", "true", "--", username])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| AuthError::Backend(format!("failed to spawn su: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = writeln!(stdin, "{password}");
        }

        let status = child
            .wait()
            .map_err(|e| AuthError::Backend(format!("failed to wait for su: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(AuthError::BadCredentials(username.to_string()))
        }
    }
}

impl AuthBackend for BuiltinAuth {
    fn name(&self) -> &str {
        "builtin"
    }

    fn logon_user(
        &self,
        username: &str,
        domain: &str,
        password: &str,
    ) -> Result<AuthResult, AuthError> {
        let user = Self::lookup(username)?;
        Self::verify_password(username, password)?;
        tracing::info!(username, uid = user.uid.as_raw(), "authentication successful");
        Ok(AuthResult {
            username: user.name,
            effective_domain: domain.to_string(),
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: user.dir.to_string_lossy().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeAuth {
        name: &'static str,
        accept: &'static str,
    }

    impl AuthBackend for FakeAuth {
        fn name(&self) -> &str {
            self.name
        }

        fn logon_user(
            &self,
            username: &str,
            domain: &str,
            password: &str,
        ) -> Result<AuthResult, AuthError> {
            if password == self.accept {
                Ok(AuthResult {
                    username: username.to_string(),
                    effective_domain: domain.to_string(),
                    uid: 1000,
                    gid: 1000,
                    home: format!("/home/{username}"),
                })
            } else {
                Err(AuthError::BadCredentials(username.to_string()))
            }
        }
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let mut registry = AuthModuleRegistry::new();
        assert!(registry.register(Arc::new(FakeAuth {
            name: "fake",
            accept: "pw",
        })));
        assert!(!registry.register(Arc::new(FakeAuth {
            name: "fake",
            accept: "other",
        })));
        assert!(registry.get("fake").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn logon_routes_through_module() {
        let mut registry = AuthModuleRegistry::new();
        registry.register(Arc::new(FakeAuth {
            name: "fake",
            accept: "s3cret",
        }));
        let module = registry.get("fake").unwrap();
        assert!(module.logon_user("alice", "CORP", "s3cret").is_ok());
        assert!(matches!(
            module.logon_user("alice", "CORP", "wrong"),
            Err(AuthError::BadCredentials(_))
        ));
    }
}
