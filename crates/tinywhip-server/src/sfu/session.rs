//! Session Registry
//!
//! Tracks every negotiated peer connection by session ID so that later
//! PATCH and DELETE requests can find it.

use crate::error::{AppError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::peer_connection::RTCPeerConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Publisher,
    Subscriber,
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRole::Publisher => f.write_str("publisher"),
            SessionRole::Subscriber => f.write_str("subscriber"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Negotiating,
    Connected,
    Closed,
}

/// A WHIP or WHEP session and the peer connection behind it
pub struct Session {
    pub id: Uuid,
    pub stream_id: String,
    pub role: SessionRole,
    pub peer_connection: Arc<RTCPeerConnection>,
    state: RwLock<SessionState>,
    /// For a subscriber, the publisher session whose tracks it was given
    upstream: Option<Uuid>,
    /// Parent token for every task working on behalf of this session
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        id: Uuid,
        stream_id: String,
        role: SessionRole,
        peer_connection: Arc<RTCPeerConnection>,
    ) -> Self {
        Self {
            id,
            stream_id,
            role,
            peer_connection,
            state: RwLock::new(SessionState::Created),
            upstream: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_upstream(mut self, publisher: Uuid) -> Self {
        self.upstream = Some(publisher);
        self
    }

    pub fn upstream(&self) -> Option<Uuid> {
        self.upstream
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Move to `next`, unless the session is already closed
    pub async fn set_state(&self, next: SessionState) {
        let mut state = self.state.write().await;
        if *state != SessionState::Closed && *state != next {
            tracing::debug!("Session {} {:?} -> {:?}", self.id, *state, next);
            *state = next;
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Close the peer connection and stop every task bound to this session.
    ///
    /// Only the first call does any work.
    pub async fn close(&self) {
        {
            let mut state = self.state.write().await;
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }

        self.cancel.cancel();

        if let Err(e) = self.peer_connection.close().await {
            tracing::warn!("Error closing peer connection for session {}: {}", self.id, e);
        }

        tracing::info!(
            "Closed {} session {} for stream {}",
            self.role,
            self.id,
            self.stream_id
        );
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: Arc<Session>) {
        self.sessions.write().await.insert(session.id, session);
    }

    pub async fn get(&self, id: Uuid) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Session {} not found", id)))
    }

    pub async fn remove(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(&id)
    }

    /// Subscriber sessions fed by the publisher session `publisher`
    pub async fn subscribers_of(&self, publisher: Uuid) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.role == SessionRole::Subscriber && s.upstream == Some(publisher))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
