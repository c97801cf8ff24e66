//! Registry of live sessions
//!
//! Owned by the server and shared with its connection tasks. Each entry exists
//! exactly as long as its connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::ConnectionHandle;

/// Information about a connected agent
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Session correlation id
    pub session_id: Uuid,
    /// Agent address
    pub addr: SocketAddr,
    /// When the connection opened
    pub connected_at: SystemTime,
    /// Handle for pushing messages to this agent
    pub handle: ConnectionHandle,
}

/// Live sessions keyed by session id
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, ClientInfo>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session; returns false if the id is already present
    pub async fn insert(&self, info: ClientInfo) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&info.session_id) {
            return false;
        }
        sessions.insert(info.session_id, info);
        true
    }

    /// Release a session
    pub async fn remove(&self, session_id: &Uuid) -> Option<ClientInfo> {
        self.sessions.write().await.remove(session_id)
    }

    pub async fn contains(&self, session_id: &Uuid) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Copy of every live entry
    pub async fn clients(&self) -> Vec<ClientInfo> {
        self.sessions.read().await.values().cloned().collect()
    }
}
