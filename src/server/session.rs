//! Session identity for disconnection-tolerant clients
//!
//! A session is created at authentication and outlives the transport: a
//! client that loses its connection can present the opaque token again
//! and be reattached to its remembered room until the absolute TTL runs
//! out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::server::user_store::User;

/// A live authenticated session
pub struct Session {
    token: String,
    user: User,
    expires_at: Instant,
    /// Name of the room the session last joined, if any. The room
    /// registry is consulted at use time; the name may no longer resolve.
    current_room: RwLock<Option<String>>,
}

impl Session {
    fn new(user: User, ttl: Duration) -> Self {
        Self {
            token: generate_token(),
            user,
            expires_at: Instant::now() + ttl,
            current_room: RwLock::new(None),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// Expiry is absolute from creation; reads never extend it.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub async fn current_room(&self) -> Option<String> {
        self.current_room.read().await.clone()
    }

    pub async fn set_current_room(&self, room: Option<String>) {
        *self.current_room.write().await = room;
    }
}

/// Opaque 256-bit token, hex-encoded
fn generate_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    hex::encode(bytes)
}

/// Token → session map with background expiry sweeping
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create and register a fresh session for `user`.
    pub async fn create(&self, user: User, ttl: Duration) -> Arc<Session> {
        let session = Arc::new(Session::new(user, ttl));
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.token().to_string(), Arc::clone(&session));
        session
    }

    /// Look up a token. Expired sessions read as absent; removal is the
    /// sweeper's job.
    pub async fn get(&self, token: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(token)?;
        if session.is_expired() {
            return None;
        }
        Some(Arc::clone(session))
    }

    /// Drop a session (explicit logout).
    pub async fn remove(&self, token: &str) {
        let mut sessions = self.sessions.write().await;
        sessions.remove(token);
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Remove every expired session.
    pub async fn sweep(&self) {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired());
        let removed = before - sessions.len();
        if removed > 0 {
            debug!("Swept {} expired sessions", removed);
        }
    }

    /// Spawn the periodic sweeper. Dropping or aborting the returned
    /// handle stops it.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                registry.sweep().await;
            }
        })
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::user_store::test_support::user;

    #[tokio::test]
    async fn test_create_and_get() {
        let registry = SessionRegistry::new();

        let session = registry.create(user("alice"), Duration::from_secs(60)).await;
        assert_eq!(session.user().username(), "alice");
        // 32 bytes hex-encoded
        assert_eq!(session.token().len(), 64);

        let found = registry.get(session.token()).await.expect("lookup");
        assert_eq!(found.token(), session.token());
        assert!(registry.get("no-such-token").await.is_none());
    }

    #[tokio::test]
    async fn test_tokens_are_unique() {
        let registry = SessionRegistry::new();
        let s1 = registry.create(user("alice"), Duration::from_secs(60)).await;
        let s2 = registry.create(user("alice"), Duration::from_secs(60)).await;
        assert_ne!(s1.token(), s2.token());
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_expired_session_reads_as_absent() {
        let registry = SessionRegistry::new();
        let session = registry.create(user("alice"), Duration::ZERO).await;

        assert!(session.is_expired());
        assert!(registry.get(session.token()).await.is_none());
        // get does not remove; the sweeper does
        assert_eq!(registry.len().await, 1);
        registry.sweep().await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_on_logout() {
        let registry = SessionRegistry::new();
        let session = registry.create(user("alice"), Duration::from_secs(60)).await;

        registry.remove(session.token()).await;
        assert!(registry.get(session.token()).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_current_room_slot() {
        let registry = SessionRegistry::new();
        let session = registry.create(user("alice"), Duration::from_secs(60)).await;

        assert_eq!(session.current_room().await, None);
        session.set_current_room(Some("General".to_string())).await;
        assert_eq!(session.current_room().await.as_deref(), Some("General"));
        session.set_current_room(None).await;
        assert_eq!(session.current_room().await, None);
    }
}
