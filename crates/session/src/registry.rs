//! Registry of active tunnel sessions

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    /// A session with this client-connection id already exists. The newer
    /// attempt is terminated; the existing session keeps running.
    #[error("duplicate session: {0}")]
    DuplicateSession(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),
}

/// One tunnel session: a client connection paired with its remote relay link.
///
/// The registry entry owns both handles for the session's lifetime; removing
/// the entry drops them, which closes the backing channels and unwinds the
/// writer tasks on the other end.
#[derive(Debug, Clone)]
pub struct Session<L, R> {
    pub local: L,
    pub remote: Option<R>,
    pub target_host: String,
    pub target_port: u16,
    pub relay_activated: bool,
}

/// Map of client-connection id -> session.
///
/// This is the only data shared across session tasks. All mutations are
/// atomic per entry and never wait on any session's relay I/O.
pub struct SessionRegistry<L, R> {
    sessions: DashMap<String, Session<L, R>>,
}

impl<L: Clone, R: Clone> SessionRegistry<L, R> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
        })
    }

    /// Register a new pending session holding only the local handle.
    pub fn create(&self, id: &str, local: L) -> Result<(), RegistryError> {
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateSession(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Session {
                    local,
                    remote: None,
                    target_host: String::new(),
                    target_port: 0,
                    relay_activated: false,
                });
                Ok(())
            }
        }
    }

    /// Pair a pending session with its remote link and target address.
    pub fn bind_remote(
        &self,
        id: &str,
        remote: R,
        target_host: &str,
        target_port: u16,
    ) -> Result<(), RegistryError> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::SessionNotFound(id.to_string()))?;
        session.remote = Some(remote);
        session.target_host = target_host.to_string();
        session.target_port = target_port;
        Ok(())
    }

    /// Allow client bytes to flow toward the confirmed target connection.
    pub fn activate(&self, id: &str) -> Result<(), RegistryError> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::SessionNotFound(id.to_string()))?;
        session.relay_activated = true;
        Ok(())
    }

    pub fn is_activated(&self, id: &str) -> bool {
        self.sessions
            .get(id)
            .map(|session| session.relay_activated)
            .unwrap_or(false)
    }

    pub fn local(&self, id: &str) -> Option<L> {
        self.sessions.get(id).map(|session| session.local.clone())
    }

    pub fn remote(&self, id: &str) -> Option<R> {
        self.sessions.get(id).and_then(|session| session.remote.clone())
    }

    /// Release both handles. Idempotent: removing a missing id is a no-op.
    pub fn remove(&self, id: &str) {
        self.sessions.remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of active sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestRegistry = SessionRegistry<&'static str, &'static str>;

    #[test]
    fn create_twice_fails_with_duplicate() {
        let registry = TestRegistry::new();
        registry.create("s1", "local").unwrap();

        let err = registry.create("s1", "other").unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateSession(id) if id == "s1"));

        // The original session survives the rejected attempt.
        assert_eq!(registry.local("s1"), Some("local"));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = TestRegistry::new();
        registry.create("s1", "local").unwrap();

        registry.remove("s1");
        registry.remove("s1");
        assert!(!registry.contains("s1"));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn bind_and_activate_flow() {
        let registry = TestRegistry::new();
        registry.create("s1", "local").unwrap();
        assert!(!registry.is_activated("s1"));
        assert_eq!(registry.remote("s1"), None);

        registry.bind_remote("s1", "remote", "example.com", 80).unwrap();
        assert_eq!(registry.remote("s1"), Some("remote"));
        assert!(!registry.is_activated("s1"));

        registry.activate("s1").unwrap();
        assert!(registry.is_activated("s1"));
    }

    #[test]
    fn operations_on_missing_session_fail() {
        let registry = TestRegistry::new();
        assert!(matches!(
            registry.bind_remote("nope", "remote", "h", 1),
            Err(RegistryError::SessionNotFound(_))
        ));
        assert!(matches!(
            registry.activate("nope"),
            Err(RegistryError::SessionNotFound(_))
        ));
        assert!(!registry.is_activated("nope"));
    }
}
