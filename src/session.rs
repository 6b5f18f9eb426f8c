use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast as tokio_broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::{Channel, ChannelCloser, ChannelKind};
use crate::local::LocalTarget;

/// Opaque session identifier, a random UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifies one client connection (one WebSocket).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Connecting,
    Connected,
    Attached,
    Closing,
    Closed,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Attached)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Remote,
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Target {
    Remote(RemoteTarget),
    Local(LocalTarget),
}

impl Target {
    pub fn host(&self) -> &str {
        match self {
            Target::Remote(remote) => &remote.host,
            Target::Local(local) => &local.hostname,
        }
    }

    pub fn username(&self) -> &str {
        match self {
            Target::Remote(remote) => &remote.username,
            Target::Local(local) => &local.username,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Target::Remote(remote) => Some(remote.port),
            Target::Local(_) => None,
        }
    }

    /// Human-readable label used in banners and logs.
    pub fn label(&self) -> String {
        match self {
            Target::Remote(remote) => format!("{}@{}:{}", remote.username, remote.host, remote.port),
            Target::Local(local) => format!("{} ({})", local.hostname, local.shell.display()),
        }
    }
}

/// Point-in-time view of a session, safe to hand out of the registry.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub kind: SessionKind,
    pub state: SessionState,
    pub connected: bool,
    pub target: Option<Target>,
    pub channel: Option<ChannelKind>,
    pub attached: bool,
    pub created_at: u64,
}

/// Server-level session lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created { id: SessionId },
    Connected { id: SessionId },
    Attached { id: SessionId, connection: ConnectionId },
    Detached { id: SessionId, connection: ConnectionId },
    Destroyed { id: SessionId },
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session already exists: {0}")]
    DuplicateSession(SessionId),
    #[error("session not found: {0}")]
    NotFound(SessionId),
    #[error("maximum number of sessions reached")]
    MaxSessionsReached,
    #[error("session already has an attached client: {0}")]
    AlreadyAttached(SessionId),
    #[error("session is not connected: {0}")]
    NotConnected(SessionId),
}

/// Registry entry. Only reachable through the registry lock.
struct Session {
    id: SessionId,
    kind: SessionKind,
    target: Option<Target>,
    state: SessionState,
    /// Present while no bridge holds the channel.
    channel: Option<Channel>,
    channel_kind: Option<ChannelKind>,
    /// Closes the channel even while a bridge holds it.
    closer: Option<ChannelCloser>,
    attached_client: Option<ConnectionId>,
    created_at: u64,
    /// Insertion order; `created_at` only has second resolution.
    seq: u64,
    cancelled: CancellationToken,
}

impl Session {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            kind: self.kind,
            state: self.state,
            connected: self.state.is_connected(),
            target: self.target.clone(),
            channel: self.channel_kind,
            attached: self.attached_client.is_some(),
            created_at: self.created_at,
        }
    }

    /// Cancel the session and close its channel. Runs outside the registry
    /// lock since closing may signal or kill a process.
    fn release(mut self) -> SessionInfo {
        self.state = SessionState::Closing;
        self.cancelled.cancel();
        let closer = self
            .channel
            .as_ref()
            .map(|c| c.closer())
            .or_else(|| self.closer.clone());
        if let Some(closer) = closer {
            if let Err(e) = closer.close() {
                tracing::warn!(session_id = %self.id, ?e, "failed to close session channel");
            }
        }
        self.state = SessionState::Closed;
        self.info()
    }
}

/// Everything a bridge needs to serve one client.
pub struct Attachment {
    pub session_id: SessionId,
    pub connection: ConnectionId,
    pub channel: Channel,
    pub target: Option<Target>,
    /// Child of the session token; cancelled when the session is removed.
    pub cancelled: CancellationToken,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("session_id", &self.session_id)
            .field("connection", &self.connection)
            .field("channel", &self.channel)
            .finish()
    }
}

struct RegistryInner {
    sessions: HashMap<SessionId, Session>,
    max_sessions: Option<usize>,
    next_seq: u64,
}

/// Concurrency-safe map from session id to session state.
///
/// The lock only guards structural changes and is never held across I/O or
/// channel teardown.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    events_tx: tokio_broadcast::Sender<SessionEvent>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Default maximum number of sessions when no explicit limit is set.
    ///
    /// Each local session holds a child process plus a few blocking threads;
    /// each remote session holds a TCP connection and a driver task.
    const DEFAULT_MAX_SESSIONS: usize = 256;

    pub fn new() -> Self {
        Self::with_max_sessions(Some(Self::DEFAULT_MAX_SESSIONS))
    }

    pub fn with_max_sessions(max_sessions: Option<usize>) -> Self {
        let (events_tx, _) = tokio_broadcast::channel(64);
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                max_sessions,
                next_seq: 0,
            })),
            events_tx,
        }
    }

    /// Register a new session in the `Created` state under a fresh id.
    pub fn create(&self, kind: SessionKind, target: Option<Target>) -> Result<SessionId, RegistryError> {
        self.create_with_id(SessionId::new(), kind, target)
    }

    /// Register a session under a caller-chosen id.
    pub fn create_with_id(
        &self,
        id: SessionId,
        kind: SessionKind,
        target: Option<Target>,
    ) -> Result<SessionId, RegistryError> {
        let mut inner = self.inner.write();
        if let Some(max) = inner.max_sessions {
            if inner.sessions.len() >= max {
                return Err(RegistryError::MaxSessionsReached);
            }
        }
        if inner.sessions.contains_key(&id) {
            return Err(RegistryError::DuplicateSession(id));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.sessions.insert(
            id,
            Session {
                id,
                kind,
                target,
                state: SessionState::Created,
                channel: None,
                channel_kind: None,
                closer: None,
                attached_client: None,
                created_at: unix_now(),
                seq,
                cancelled: CancellationToken::new(),
            },
        );
        drop(inner);

        let _ = self.events_tx.send(SessionEvent::Created { id });
        Ok(id)
    }

    pub fn mark_connecting(&self, id: &SessionId) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or(RegistryError::NotFound(*id))?;
        session.state = SessionState::Connecting;
        Ok(())
    }

    /// Store the established channel and move the session to `Connected`.
    /// Returns the session's token, cancelled when the session is removed.
    ///
    /// If the session was removed while connecting, the channel is handed
    /// back so the caller can close it.
    pub fn mark_connected(
        &self,
        id: &SessionId,
        channel: Channel,
        target: Option<Target>,
    ) -> Result<CancellationToken, Channel> {
        let mut inner = self.inner.write();
        let Some(session) = inner.sessions.get_mut(id) else {
            return Err(channel);
        };
        if target.is_some() {
            session.target = target;
        }
        session.channel_kind = Some(channel.kind());
        session.closer = Some(channel.closer());
        session.channel = Some(channel);
        session.state = SessionState::Connected;
        let token = session.cancelled.clone();
        drop(inner);

        let _ = self.events_tx.send(SessionEvent::Connected { id: *id });
        Ok(token)
    }

    /// Claim the session for `connection` and take its channel.
    ///
    /// Check-and-set under the write lock: of two concurrent attaches, one
    /// wins and the other gets `AlreadyAttached`.
    pub fn attach(&self, id: &SessionId, connection: ConnectionId) -> Result<Attachment, RegistryError> {
        let mut inner = self.inner.write();
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or(RegistryError::NotFound(*id))?;
        if session.attached_client.is_some() {
            return Err(RegistryError::AlreadyAttached(*id));
        }
        let channel = match (session.state, session.channel.take()) {
            (SessionState::Connected, Some(channel)) => channel,
            (_, channel) => {
                session.channel = channel;
                return Err(RegistryError::NotConnected(*id));
            }
        };
        session.attached_client = Some(connection);
        session.state = SessionState::Attached;
        let attachment = Attachment {
            session_id: *id,
            connection,
            channel,
            target: session.target.clone(),
            cancelled: session.cancelled.child_token(),
        };
        drop(inner);

        let _ = self.events_tx.send(SessionEvent::Attached { id: *id, connection });
        Ok(attachment)
    }

    /// Return the channel after a client left, making the session
    /// attachable again. Fails (handing the channel back) when the session
    /// is gone, held by another connection, or its channel has ended.
    pub fn detach(&self, id: &SessionId, connection: ConnectionId, channel: Channel) -> Result<(), Channel> {
        if channel.closer().has_ended() {
            return Err(channel);
        }
        let mut inner = self.inner.write();
        let Some(session) = inner.sessions.get_mut(id) else {
            return Err(channel);
        };
        if session.attached_client != Some(connection) {
            return Err(channel);
        }
        session.attached_client = None;
        session.channel = Some(channel);
        session.state = SessionState::Connected;
        drop(inner);

        let _ = self.events_tx.send(SessionEvent::Detached { id: *id, connection });
        Ok(())
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionInfo> {
        let inner = self.inner.read();
        inner.sessions.get(id).map(Session::info)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.inner.read().sessions.contains_key(id)
    }

    /// Snapshots of all sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let inner = self.inner.read();
        let mut sessions: Vec<&Session> = inner.sessions.values().collect();
        sessions.sort_by_key(|s| s.seq);
        sessions.into_iter().map(Session::info).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a session, cancel it and close its channel.
    ///
    /// Returns the final snapshot, or `None` if the id was unknown (already
    /// removed), which makes repeated removal harmless.
    pub fn remove(&self, id: &SessionId) -> Option<SessionInfo> {
        let removed = self.inner.write().sessions.remove(id)?;
        let info = removed.release();
        tracing::info!(session_id = %id, "session removed");
        let _ = self.events_tx.send(SessionEvent::Destroyed { id: *id });
        Some(info)
    }

    /// Remove a session only while no client is attached. An attached
    /// session is left to its bridge.
    pub fn remove_if_detached(&self, id: &SessionId) -> Option<SessionInfo> {
        let removed = {
            let mut inner = self.inner.write();
            match inner.sessions.get(id) {
                Some(session) if session.attached_client.is_none() => inner.sessions.remove(id),
                _ => None,
            }
        }?;
        let info = removed.release();
        tracing::info!(session_id = %id, "detached session removed");
        let _ = self.events_tx.send(SessionEvent::Destroyed { id: *id });
        Some(info)
    }

    /// Remove every session. Used on server shutdown.
    pub fn drain(&self) -> Vec<SessionInfo> {
        let drained: Vec<Session> = {
            let mut inner = self.inner.write();
            inner.sessions.drain().map(|(_, s)| s).collect()
        };
        drained
            .into_iter()
            .map(|session| {
                let info = session.release();
                let _ = self.events_tx.send(SessionEvent::Destroyed { id: info.id });
                info
            })
            .collect()
    }

    pub fn subscribe_events(&self) -> tokio_broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
