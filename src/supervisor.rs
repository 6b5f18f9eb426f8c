//! Session lifecycle orchestration.
//!
//! ```text
//! Created -> Connecting -> Connected <-> Attached -> Closing -> Closed
//!                 \______________________________________/
//!                           failure / disconnect
//! ```
//!
//! The supervisor owns the registry and the two channel sources. It creates
//! sessions, lends a session's channel to a bridge for each attached client,
//! and guarantees that every exit path (failed connect, disconnect request,
//! channel end, client exit, server shutdown) removes the entry and releases
//! the channel once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, Stream};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::bridge::{self, BridgeError, BridgeOptions, BridgeOutcome};
use crate::channel::{Channel, ChannelCloser};
use crate::config::SessionSettings;
use crate::local::{LocalSpawner, LocalTarget, SpawnError};
use crate::protocol::{ClientFrame, ServerFrame};
use crate::session::{
    Attachment, ConnectionId, RegistryError, RemoteTarget, SessionId, SessionInfo, SessionKind,
    SessionRegistry, Target,
};
use crate::ssh::{ConnectError, Secret, SshConnector};

/// Source of remote channels.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        username: &str,
        secret: &Secret,
    ) -> Result<Channel, ConnectError>;
}

/// Source of local channels.
#[async_trait]
pub trait LocalLauncher: Send + Sync {
    async fn launch(&self) -> Result<(Channel, LocalTarget), SpawnError>;
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        username: &str,
        secret: &Secret,
    ) -> Result<Channel, ConnectError> {
        SshConnector::connect(self, host, port, username, secret).await
    }
}

#[async_trait]
impl LocalLauncher for LocalSpawner {
    async fn launch(&self) -> Result<(Channel, LocalTarget), SpawnError> {
        let spawner = self.clone();
        tokio::task::spawn_blocking(move || spawner.spawn())
            .await
            .map_err(|e| SpawnError::Io(std::io::Error::other(e)))?
    }
}

/// What to connect a new session to.
#[derive(Debug, Clone)]
pub enum SessionRequest {
    Remote {
        host: String,
        port: u16,
        username: String,
        secret: Secret,
    },
    Local,
}

#[derive(Debug, Error)]
pub enum CreateError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("session was disconnected while connecting")]
    Cancelled,

    #[error("connect task failed: {0}")]
    Internal(String),
}

impl CreateError {
    pub fn code(&self) -> &'static str {
        match self {
            CreateError::Registry(RegistryError::MaxSessionsReached) => "max_sessions_reached",
            CreateError::Registry(_) => "registry_error",
            CreateError::Connect(e) => e.code(),
            CreateError::Spawn(SpawnError::NoShellFound(_)) => "no_shell_found",
            CreateError::Spawn(SpawnError::PlatformUnsupported(_)) => "platform_unsupported",
            CreateError::Spawn(SpawnError::ResourceExhausted(_)) => "resource_exhausted",
            CreateError::Spawn(SpawnError::Io(_)) => "spawn_failed",
            CreateError::Cancelled => "cancelled",
            CreateError::Internal(_) => "internal_error",
        }
    }
}

/// A failed create. `session_id` is set when the failure happened after an
/// id was assigned; the entry is already gone from the registry.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct CreateFailure {
    pub session_id: Option<SessionId>,
    #[source]
    pub error: CreateError,
}

impl CreateFailure {
    fn new(session_id: Option<SessionId>, error: impl Into<CreateError>) -> Self {
        Self {
            session_id,
            error: error.into(),
        }
    }
}

/// Registry entry for a create that has not finished. Dropping it armed
/// removes the entry, which covers a create future dropped mid-connect
/// (the HTTP client hung up).
struct PendingSession<'a> {
    registry: &'a SessionRegistry,
    id: SessionId,
    armed: bool,
}

impl PendingSession<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingSession<'_> {
    fn drop(&mut self) {
        if self.armed && self.registry.remove(&self.id).is_some() {
            tracing::info!(session_id = %self.id, "session create abandoned, entry removed");
        }
    }
}

pub struct Supervisor {
    registry: SessionRegistry,
    remote: Arc<dyn RemoteConnector>,
    local: Arc<dyn LocalLauncher>,
    settings: SessionSettings,
    shutdown_grace: Duration,
}

impl Supervisor {
    pub fn new(
        remote: Arc<dyn RemoteConnector>,
        local: Arc<dyn LocalLauncher>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            registry: SessionRegistry::with_max_sessions(settings.max_sessions),
            remote,
            local,
            settings,
            shutdown_grace: BridgeOptions::default().shutdown_grace,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Create a session and establish its channel.
    ///
    /// On failure the registry entry is removed before returning, so a
    /// failed create never leaves a trace. The connect itself runs on its
    /// own task: if this future is dropped, the entry is removed at once and
    /// the late channel is closed when the connect finishes. The same holds
    /// when the session is disconnected while connecting, in which case
    /// `Cancelled` is returned.
    pub async fn create(&self, request: SessionRequest) -> Result<SessionId, CreateFailure> {
        let (kind, target) = match &request {
            SessionRequest::Remote {
                host,
                port,
                username,
                ..
            } => (
                SessionKind::Remote,
                Some(Target::Remote(RemoteTarget {
                    host: host.clone(),
                    port: *port,
                    username: username.clone(),
                })),
            ),
            SessionRequest::Local => (SessionKind::Local, None),
        };
        let id = self
            .registry
            .create(kind, target)
            .map_err(|e| CreateFailure::new(None, e))?;
        let pending = PendingSession {
            registry: &self.registry,
            id,
            armed: true,
        };
        self.registry
            .mark_connecting(&id)
            .map_err(|_| CreateFailure::new(Some(id), CreateError::Cancelled))?;
        tracing::info!(session_id = %id, ?kind, "session connecting");

        let connecting = tokio::spawn(establish(
            self.registry.clone(),
            self.remote.clone(),
            self.local.clone(),
            id,
            request,
        ));
        let result = match connecting.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(session_id = %id, ?e, "connect task failed");
                Err(CreateError::Internal(e.to_string()))
            }
        };
        match result {
            Ok(()) => {
                pending.disarm();
                tracing::info!(session_id = %id, "session connected");
                Ok(id)
            }
            Err(error) => Err(CreateFailure::new(Some(id), error)),
        }
    }

    /// Claim a session for one client connection.
    pub fn attach(&self, id: &SessionId, connection: ConnectionId) -> Result<Attachment, BridgeError> {
        self.registry.attach(id, connection).map_err(|e| match e {
            RegistryError::AlreadyAttached(_) => BridgeError::AlreadyAttached,
            other => {
                tracing::debug!(session_id = %id, %other, "attach refused");
                BridgeError::SessionNotFound
            }
        })
    }

    /// Bridge an attachment to its client until either side ends, then
    /// either return the channel to the session (re-attach enabled and only
    /// the client left) or tear the session down.
    pub async fn run_attachment<Tx, Rx>(&self, attachment: Attachment, tx: Tx, rx: Rx) -> BridgeOutcome
    where
        Tx: Sink<ServerFrame> + Unpin + Send + 'static,
        Rx: Stream<Item = ClientFrame> + Unpin + Send + 'static,
    {
        let Attachment {
            session_id,
            connection,
            channel,
            target,
            cancelled,
        } = attachment;
        let options = BridgeOptions {
            max_cols: self.settings.max_cols,
            max_rows: self.settings.max_rows,
            banner: target
                .as_ref()
                .filter(|_| self.settings.banner)
                .map(bridge::banner_text),
            shutdown_grace: self.shutdown_grace,
        };
        tracing::info!(session_id = %session_id, %connection, "client attached");

        let mut outcome = bridge::run(channel, cancelled, tx, rx, options).await;
        tracing::info!(
            session_id = %session_id,
            %connection,
            reason = outcome.reason.reason(),
            "client detached"
        );

        if self.settings.reattach && outcome.client_left() {
            if let Some(channel) = outcome.channel.take() {
                match self.registry.detach(&session_id, connection, channel) {
                    Ok(()) => return outcome,
                    Err(channel) => {
                        let _ = channel.close();
                    }
                }
            }
        }
        self.registry.remove(&session_id);
        outcome
    }

    /// Tear a session down. Unknown or already-removed ids are fine.
    pub fn disconnect(&self, id: &SessionId) -> bool {
        let removed = self.registry.remove(id).is_some();
        if removed {
            tracing::info!(session_id = %id, "session disconnected");
        }
        removed
    }

    pub fn status(&self, id: &SessionId) -> Option<SessionInfo> {
        self.registry.get(id)
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.registry.list()
    }

    /// Close every session. Returns how many were closed.
    pub fn shutdown_all(&self) -> usize {
        let drained = self.registry.drain();
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "closed all sessions");
        }
        drained.len()
    }
}

/// Connect or spawn the session's channel and hand it to the registry.
async fn establish(
    registry: SessionRegistry,
    remote: Arc<dyn RemoteConnector>,
    local: Arc<dyn LocalLauncher>,
    id: SessionId,
    request: SessionRequest,
) -> Result<(), CreateError> {
    let established = match request {
        SessionRequest::Remote {
            host,
            port,
            username,
            secret,
        } => remote
            .connect(&host, port, &username, &secret)
            .await
            .map(|channel| (channel, None))
            .map_err(CreateError::from),
        SessionRequest::Local => local
            .launch()
            .await
            .map(|(channel, target)| (channel, Some(Target::Local(target))))
            .map_err(CreateError::from),
    };

    let (channel, target) = match established {
        Ok(established) => established,
        Err(error) => {
            tracing::warn!(session_id = %id, %error, "session failed to connect");
            registry.remove(&id);
            return Err(error);
        }
    };

    let closer = channel.closer();
    match registry.mark_connected(&id, channel, target) {
        Ok(session) => {
            tokio::spawn(watch_channel_end(registry, id, closer, session));
            Ok(())
        }
        Err(channel) => {
            tracing::info!(session_id = %id, "session gone while connecting, closing late channel");
            if let Err(e) = channel.close() {
                tracing::warn!(session_id = %id, ?e, "failed to close late channel");
            }
            Err(CreateError::Cancelled)
        }
    }
}

/// Remove a session whose channel ends while no client is attached. An
/// attached session is left to its bridge, which sees the same end.
async fn watch_channel_end(
    registry: SessionRegistry,
    id: SessionId,
    closer: ChannelCloser,
    session: CancellationToken,
) {
    tokio::select! {
        biased;
        _ = session.cancelled() => {}
        _ = closer.ended() => {
            if registry.remove_if_detached(&id).is_some() {
                tracing::info!(session_id = %id, "channel ended while detached");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channel::{ChannelBackend, ChannelCommand, ChannelKind};
    use crate::local::{OsFamily, PtyCapability};
    use crate::protocol::CloseReason;
    use crate::session::{SessionEvent, SessionState};
    use bytes::Bytes;
    use futures::channel::mpsc as fmpsc;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    /// Remote connector that hands out in-memory channels. Password `wrong`
    /// fails authentication; with a gate set, connects wait on it.
    #[derive(Default)]
    pub(crate) struct FakeRemote {
        pub backends: Mutex<Vec<ChannelBackend>>,
        pub gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl RemoteConnector for FakeRemote {
        async fn connect(
            &self,
            _host: &str,
            _port: u16,
            username: &str,
            secret: &Secret,
        ) -> Result<Channel, ConnectError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if secret.expose() == "wrong" {
                return Err(ConnectError::AuthenticationFailed(username.to_string()));
            }
            let (channel, backend) = Channel::new(ChannelKind::SecureRemote);
            self.backends.lock().push(backend);
            Ok(channel)
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeLocal {
        pub backends: Mutex<Vec<ChannelBackend>>,
    }

    #[async_trait]
    impl LocalLauncher for FakeLocal {
        async fn launch(&self) -> Result<(Channel, LocalTarget), SpawnError> {
            let (channel, backend) = Channel::new(ChannelKind::NativePty);
            self.backends.lock().push(backend);
            Ok((
                channel,
                LocalTarget {
                    os: OsFamily::Linux,
                    shell: "/bin/sh".into(),
                    capability: PtyCapability::NativePty,
                    hostname: "testhost".into(),
                    username: "tester".into(),
                },
            ))
        }
    }

    fn remote_request(password: &str) -> SessionRequest {
        SessionRequest::Remote {
            host: "10.0.0.5".into(),
            port: 22,
            username: "ops".into(),
            secret: Secret::new(password),
        }
    }

    fn supervisor_with(remote: Arc<FakeRemote>, settings: SessionSettings) -> Supervisor {
        Supervisor::new(remote, Arc::new(FakeLocal::default()), settings)
    }

    fn supervisor() -> (Supervisor, Arc<FakeRemote>) {
        let remote = Arc::new(FakeRemote::default());
        (supervisor_with(remote.clone(), SessionSettings::default()), remote)
    }

    #[tokio::test]
    async fn create_remote_session_is_connected() {
        let (supervisor, _remote) = supervisor();
        let id = supervisor.create(remote_request("secret")).await.unwrap();
        let info = supervisor.status(&id).unwrap();
        assert!(info.connected);
        assert_eq!(info.state, SessionState::Connected);
        assert_eq!(info.target.unwrap().username(), "ops");
    }

    #[tokio::test]
    async fn create_local_session_records_target() {
        let (supervisor, _remote) = supervisor();
        let id = supervisor.create(SessionRequest::Local).await.unwrap();
        let info = supervisor.status(&id).unwrap();
        assert_eq!(info.kind, SessionKind::Local);
        assert_eq!(info.target.unwrap().host(), "testhost");
    }

    #[tokio::test]
    async fn bad_credentials_leave_no_entry() {
        let (supervisor, _remote) = supervisor();
        let failure = supervisor.create(remote_request("wrong")).await.unwrap_err();
        assert!(matches!(
            failure.error,
            CreateError::Connect(ConnectError::AuthenticationFailed(_))
        ));
        assert_eq!(failure.error.code(), "authentication_failed");
        let id = failure.session_id.unwrap();
        assert!(supervisor.status(&id).is_none());
        assert!(supervisor.list().is_empty());
    }

    #[tokio::test]
    async fn ids_are_unique_across_creates() {
        let (supervisor, _remote) = supervisor();
        let mut ids = std::collections::HashSet::new();
        for _ in 0..50 {
            ids.insert(supervisor.create(SessionRequest::Local).await.unwrap());
        }
        assert_eq!(ids.len(), 50);
    }

    #[tokio::test]
    async fn second_attach_is_rejected() {
        let (supervisor, _remote) = supervisor();
        let id = supervisor.create(remote_request("secret")).await.unwrap();
        let _first = supervisor.attach(&id, ConnectionId::next()).unwrap();
        assert_eq!(
            supervisor.attach(&id, ConnectionId::next()).unwrap_err(),
            BridgeError::AlreadyAttached
        );
    }

    #[tokio::test]
    async fn attach_unknown_session() {
        let (supervisor, _remote) = supervisor();
        assert_eq!(
            supervisor.attach(&SessionId::new(), ConnectionId::next()).unwrap_err(),
            BridgeError::SessionNotFound
        );
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (supervisor, remote) = supervisor();
        let id = supervisor.create(remote_request("secret")).await.unwrap();
        assert!(supervisor.disconnect(&id));
        assert!(!supervisor.disconnect(&id));
        assert!(!supervisor.disconnect(&SessionId::new()));
        assert!(remote.backends.lock()[0].cancelled().is_cancelled());
    }

    #[tokio::test]
    async fn disconnect_closes_attached_stream() {
        let (supervisor, remote) = supervisor();
        let supervisor = Arc::new(supervisor);
        let id = supervisor.create(remote_request("secret")).await.unwrap();
        let attachment = supervisor.attach(&id, ConnectionId::next()).unwrap();

        let (server_tx, mut server_rx) = fmpsc::unbounded();
        let (_client_tx, client_rx) = fmpsc::unbounded::<ClientFrame>();
        let runner = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.run_attachment(attachment, server_tx, client_rx).await })
        };

        // Banner first, then the disconnect.
        assert!(matches!(server_rx.next().await, Some(ServerFrame::Event(_))));
        assert!(supervisor.disconnect(&id));

        let outcome = runner.await.unwrap();
        assert_eq!(outcome.reason, CloseReason::SessionClosed);
        let mut last = None;
        while let Some(frame) = server_rx.next().await {
            last = Some(frame);
        }
        assert_eq!(last, Some(ServerFrame::Close(CloseReason::SessionClosed)));
        assert!(supervisor.status(&id).is_none());
        assert!(remote.backends.lock()[0].cancelled().is_cancelled());
    }

    #[tokio::test]
    async fn channel_end_removes_session() {
        let (supervisor, remote) = supervisor();
        let id = supervisor.create(remote_request("secret")).await.unwrap();
        let attachment = supervisor.attach(&id, ConnectionId::next()).unwrap();
        remote.backends.lock().clear();

        let (server_tx, _server_rx) = fmpsc::unbounded();
        let (_client_tx, client_rx) = fmpsc::unbounded::<ClientFrame>();
        let outcome = supervisor.run_attachment(attachment, server_tx, client_rx).await;
        assert_eq!(outcome.reason, CloseReason::ChannelClosed);
        assert!(supervisor.status(&id).is_none());
    }

    #[tokio::test]
    async fn client_exit_tears_down_by_default() {
        let (supervisor, _remote) = supervisor();
        let id = supervisor.create(remote_request("secret")).await.unwrap();
        let attachment = supervisor.attach(&id, ConnectionId::next()).unwrap();
        let (server_tx, _server_rx) = fmpsc::unbounded();
        let (client_tx, client_rx) = fmpsc::unbounded::<ClientFrame>();
        drop(client_tx);
        let outcome = supervisor.run_attachment(attachment, server_tx, client_rx).await;
        assert_eq!(outcome.reason, CloseReason::ClientClosed);
        assert!(supervisor.status(&id).is_none());
    }

    #[tokio::test]
    async fn reattach_keeps_session_after_client_exit() {
        let remote = Arc::new(FakeRemote::default());
        let supervisor = supervisor_with(
            remote.clone(),
            SessionSettings {
                reattach: true,
                ..SessionSettings::default()
            },
        );
        let id = supervisor.create(remote_request("secret")).await.unwrap();
        let attachment = supervisor.attach(&id, ConnectionId::next()).unwrap();
        let (server_tx, _server_rx) = fmpsc::unbounded();
        let (client_tx, client_rx) = fmpsc::unbounded::<ClientFrame>();
        drop(client_tx);
        supervisor.run_attachment(attachment, server_tx, client_rx).await;

        assert_eq!(supervisor.status(&id).unwrap().state, SessionState::Connected);
        let again = supervisor.attach(&id, ConnectionId::next()).unwrap();
        again.channel.write(Bytes::from("x")).await.unwrap();
        assert_eq!(
            remote.backends.lock()[0].commands.try_recv().ok(),
            Some(ChannelCommand::Input(Bytes::from("x")))
        );
    }

    #[tokio::test]
    async fn disconnect_while_connecting_closes_late_channel() {
        let gate = Arc::new(Notify::new());
        let remote = Arc::new(FakeRemote {
            backends: Mutex::new(Vec::new()),
            gate: Some(gate.clone()),
        });
        let supervisor = Arc::new(supervisor_with(remote.clone(), SessionSettings::default()));

        let create = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.create(remote_request("secret")).await })
        };
        let id = loop {
            if let Some(info) = supervisor.list().first() {
                if info.state == SessionState::Connecting {
                    break info.id;
                }
            }
            tokio::task::yield_now().await;
        };
        assert!(supervisor.disconnect(&id));
        gate.notify_one();

        let failure = create.await.unwrap().unwrap_err();
        assert!(matches!(failure.error, CreateError::Cancelled));
        assert!(supervisor.list().is_empty());
        assert!(remote.backends.lock()[0].cancelled().is_cancelled());
    }

    async fn eventually<F: Fn() -> bool>(cond: F) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn dropped_create_leaves_no_entry() {
        let gate = Arc::new(Notify::new());
        let remote = Arc::new(FakeRemote {
            backends: Mutex::new(Vec::new()),
            gate: Some(gate.clone()),
        });
        let supervisor = Arc::new(supervisor_with(
            remote.clone(),
            SessionSettings {
                max_sessions: Some(1),
                ..SessionSettings::default()
            },
        ));

        let create = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.create(remote_request("secret")).await })
        };
        while !supervisor
            .list()
            .first()
            .is_some_and(|info| info.state == SessionState::Connecting)
        {
            tokio::task::yield_now().await;
        }
        create.abort();
        assert!(create.await.unwrap_err().is_cancelled());
        assert!(supervisor.list().is_empty());

        // The abandoned connect still finishes, and its channel is closed.
        gate.notify_one();
        eventually(|| {
            remote
                .backends
                .lock()
                .first()
                .is_some_and(|b| b.cancelled().is_cancelled())
        })
        .await;
        assert!(supervisor.list().is_empty());

        // The slot is free again.
        gate.notify_one();
        supervisor.create(remote_request("secret")).await.unwrap();
    }

    #[tokio::test]
    async fn unattached_session_is_removed_when_channel_ends() {
        let (supervisor, remote) = supervisor();
        let mut events = supervisor.registry().subscribe_events();
        let id = supervisor.create(remote_request("secret")).await.unwrap();
        assert!(supervisor.status(&id).unwrap().connected);

        // The remote side goes away before any client attached.
        remote.backends.lock().clear();
        eventually(|| supervisor.status(&id).is_none()).await;
        loop {
            if let SessionEvent::Destroyed { id: gone } = events.recv().await.unwrap() {
                assert_eq!(gone, id);
                break;
            }
        }
    }

    #[tokio::test]
    async fn detached_session_is_removed_when_channel_ends() {
        let remote = Arc::new(FakeRemote::default());
        let supervisor = supervisor_with(
            remote.clone(),
            SessionSettings {
                reattach: true,
                ..SessionSettings::default()
            },
        );
        let id = supervisor.create(remote_request("secret")).await.unwrap();
        let attachment = supervisor.attach(&id, ConnectionId::next()).unwrap();
        let (server_tx, _server_rx) = fmpsc::unbounded();
        let (client_tx, client_rx) = fmpsc::unbounded::<ClientFrame>();
        drop(client_tx);
        supervisor.run_attachment(attachment, server_tx, client_rx).await;
        assert_eq!(supervisor.status(&id).unwrap().state, SessionState::Connected);

        remote.backends.lock().clear();
        eventually(|| supervisor.status(&id).is_none()).await;
    }

    #[tokio::test]
    async fn attached_session_is_left_to_its_bridge() {
        let (supervisor, remote) = supervisor();
        let id = supervisor.create(remote_request("secret")).await.unwrap();
        let _attachment = supervisor.attach(&id, ConnectionId::next()).unwrap();

        remote.backends.lock().clear();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(supervisor.status(&id).unwrap().state, SessionState::Attached);
    }

    #[tokio::test]
    async fn max_sessions_reported() {
        let remote = Arc::new(FakeRemote::default());
        let supervisor = supervisor_with(
            remote,
            SessionSettings {
                max_sessions: Some(1),
                ..SessionSettings::default()
            },
        );
        supervisor.create(SessionRequest::Local).await.unwrap();
        let failure = supervisor.create(SessionRequest::Local).await.unwrap_err();
        assert!(failure.session_id.is_none());
        assert_eq!(failure.error.code(), "max_sessions_reached");
    }

    #[tokio::test]
    async fn shutdown_all_closes_sessions() {
        let (supervisor, remote) = supervisor();
        supervisor.create(remote_request("secret")).await.unwrap();
        supervisor.create(remote_request("secret")).await.unwrap();
        assert_eq!(supervisor.shutdown_all(), 2);
        assert!(supervisor.list().is_empty());
        assert!(remote.backends.lock().iter().all(|b| b.cancelled().is_cancelled()));
    }
}
