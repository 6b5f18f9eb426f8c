//! Outbound SSH connector.
//!
//! Opens an interactive shell on a remote host and exposes it as a
//! [`Channel`]. A driver task owns the russh session and moves bytes between
//! the SSH channel and the channel queues until either side ends.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use russh::client::{self, Handle};
use russh::{kex, ChannelMsg, Disconnect, Preferred};
use russh_keys::key::{self, PublicKey};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ChannelBackend, ChannelCommand, ChannelKind};
use crate::config::{HostKeyPolicy, SshSettings};

const TERM: &str = "xterm-256color";
const INITIAL_COLS: u32 = 80;
const INITIAL_ROWS: u32 = 24;

/// Key exchange algorithms offered on the retry after a negotiation
/// failure, for servers that only speak older groups.
const KEX_FALLBACK: &[kex::Name] = &[
    kex::CURVE25519,
    kex::DH_G14_SHA256,
    kex::DH_G14_SHA1,
    kex::DH_G1_SHA1,
];

const HOST_KEYS_FALLBACK: &[key::Name] = &[
    key::ED25519,
    key::RSA_SHA2_256,
    key::RSA_SHA2_512,
    key::SSH_RSA,
];

/// A password that stays out of logs.
#[derive(Clone, Default)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("authentication failed for user {0}")]
    AuthenticationFailed(String),

    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    #[error("connection timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("no common algorithms with server: {0}")]
    ProtocolNegotiationFailed(String),

    #[error("host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("ssh error: {0}")]
    Other(String),
}

impl ConnectError {
    /// Machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            ConnectError::AuthenticationFailed(_) => "authentication_failed",
            ConnectError::HostUnreachable(_) => "host_unreachable",
            ConnectError::Timeout(_) => "timeout",
            ConnectError::ProtocolNegotiationFailed(_) => "protocol_negotiation_failed",
            ConnectError::HostKeyRejected(_) => "host_key_rejected",
            ConnectError::Other(_) => "connect_failed",
        }
    }
}

/// Which algorithm set an attempt offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Algorithms {
    Default,
    Legacy,
}

/// Map a russh failure onto the connector's error kinds.
fn classify(err: russh::Error, host_key_rejection: Option<String>) -> ConnectError {
    match err {
        russh::Error::NoCommonKexAlgo
        | russh::Error::NoCommonKeyAlgo
        | russh::Error::NoCommonCipher
        | russh::Error::NoCommonCompression
        | russh::Error::NoCommonMac => ConnectError::ProtocolNegotiationFailed(err.to_string()),
        russh::Error::UnknownKey => ConnectError::HostKeyRejected(
            host_key_rejection.unwrap_or_else(|| "server key not trusted".to_string()),
        ),
        russh::Error::IO(e) => ConnectError::HostUnreachable(e.to_string()),
        other => ConnectError::Other(other.to_string()),
    }
}

/// Decide whether a presented host key is acceptable.
///
/// `lookup` consults the known_hosts file: `Ok(true)` is a match,
/// `Ok(false)` an unknown host, `Err` a changed key or unreadable file.
fn verify_host_key<F>(policy: HostKeyPolicy, lookup: F) -> Result<(), String>
where
    F: FnOnce() -> Result<bool, russh_keys::Error>,
{
    match policy {
        HostKeyPolicy::AcceptAny => Ok(()),
        HostKeyPolicy::KnownHosts => match lookup() {
            Ok(true) => Ok(()),
            Ok(false) => Err("host is not in known_hosts".to_string()),
            Err(e) => Err(e.to_string()),
        },
    }
}

struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts_path: Option<PathBuf>,
    rejection: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        if self.policy == HostKeyPolicy::AcceptAny {
            tracing::warn!(
                host = %self.host,
                port = self.port,
                fingerprint = %server_public_key.fingerprint(),
                "accepting ssh host key without verification"
            );
        }
        let verdict = verify_host_key(self.policy, || match &self.known_hosts_path {
            Some(path) => {
                russh_keys::check_known_hosts_path(&self.host, self.port, server_public_key, path)
            }
            None => russh_keys::check_known_hosts(&self.host, self.port, server_public_key),
        });
        match verdict {
            Ok(()) => Ok(true),
            Err(reason) => {
                tracing::warn!(host = %self.host, port = self.port, %reason, "ssh host key rejected");
                *self.rejection.lock() = Some(reason);
                Ok(false)
            }
        }
    }
}

/// Opens remote shells over SSH.
#[derive(Debug, Clone)]
pub struct SshConnector {
    settings: SshSettings,
}

impl SshConnector {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    pub fn default_port(&self) -> u16 {
        self.settings.default_port
    }

    /// Connect, authenticate with a password and start an interactive shell.
    ///
    /// The first attempt offers russh's default algorithms. If negotiation
    /// fails it retries once with a legacy-compatible set. The configured
    /// connect timeout bounds both attempts together.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        username: &str,
        secret: &Secret,
    ) -> Result<Channel, ConnectError> {
        connect_with_fallback(self.settings.connect_timeout(), |algorithms| {
            self.establish(host, port, username, secret, algorithms)
        })
        .await
    }

    async fn establish(
        &self,
        host: &str,
        port: u16,
        username: &str,
        secret: &Secret,
        algorithms: Algorithms,
    ) -> Result<Channel, ConnectError> {
        let rejection = Arc::new(Mutex::new(None));
        let handler = ClientHandler {
            host: host.to_string(),
            port,
            policy: self.settings.host_key_policy,
            known_hosts_path: self.settings.known_hosts_path.clone(),
            rejection: rejection.clone(),
        };
        let config = Arc::new(client_config(&self.settings, algorithms));

        let mut handle = client::connect(config, (host, port), handler)
            .await
            .map_err(|e| classify(e, rejection.lock().take()))?;

        let authenticated = handle
            .authenticate_password(username, secret.expose())
            .await
            .map_err(|e| classify(e, None))?;
        if !authenticated {
            return Err(ConnectError::AuthenticationFailed(username.to_string()));
        }

        let mut ssh_channel = handle.channel_open_session().await.map_err(|e| classify(e, None))?;
        ssh_channel
            .request_pty(true, TERM, INITIAL_COLS, INITIAL_ROWS, 0, 0, &[])
            .await
            .map_err(|e| classify(e, None))?;
        ssh_channel
            .request_shell(true)
            .await
            .map_err(|e| classify(e, None))?;

        tracing::info!(host, port, username, ?algorithms, "ssh shell established");

        let (channel, backend) = Channel::new(ChannelKind::SecureRemote);
        let cancelled = backend.cancelled();
        let label = format!("{username}@{host}:{port}");
        tokio::spawn(drive(handle, ssh_channel, backend, cancelled, label));
        Ok(channel)
    }
}

/// Run `attempt` with the default algorithms, then once more with the
/// legacy set if negotiation failed, all within one `timeout`.
async fn connect_with_fallback<T, F, Fut>(timeout: Duration, mut attempt: F) -> Result<T, ConnectError>
where
    F: FnMut(Algorithms) -> Fut,
    Fut: Future<Output = Result<T, ConnectError>>,
{
    let attempts = async {
        match attempt(Algorithms::Default).await {
            Err(ConnectError::ProtocolNegotiationFailed(reason)) => {
                tracing::info!(%reason, "ssh negotiation failed, retrying with legacy algorithms");
                attempt(Algorithms::Legacy).await
            }
            result => result,
        }
    };
    match tokio::time::timeout(timeout, attempts).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::Timeout(timeout)),
    }
}

fn client_config(settings: &SshSettings, algorithms: Algorithms) -> client::Config {
    let preferred = match algorithms {
        Algorithms::Default => Preferred::default(),
        Algorithms::Legacy => Preferred {
            kex: KEX_FALLBACK.into(),
            key: HOST_KEYS_FALLBACK.into(),
            ..Preferred::default()
        },
    };
    client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(settings.keepalive_interval()),
        keepalive_max: settings.keepalive_max,
        preferred,
        ..Default::default()
    }
}

/// Pump bytes between the SSH channel and the channel queues.
///
/// Ends when the remote shell closes, the keep-alive gives up (russh drops
/// the session and `wait` returns `None`), or the consumer closes the
/// channel. The SSH connection is torn down on the way out.
async fn drive(
    handle: Handle<ClientHandler>,
    mut ssh_channel: russh::Channel<client::Msg>,
    backend: ChannelBackend,
    cancelled: CancellationToken,
    label: String,
) {
    let ChannelBackend {
        mut commands,
        output,
        ..
    } = backend;

    loop {
        tokio::select! {
            biased;
            _ = cancelled.cancelled() => {
                tracing::debug!(target = %label, "ssh channel closed locally");
                break;
            }
            msg = ssh_channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    let chunk = Bytes::copy_from_slice(&data);
                    let sent = tokio::select! {
                        _ = cancelled.cancelled() => false,
                        sent = output.send(chunk) => sent.is_ok(),
                    };
                    if !sent {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    tracing::debug!(target = %label, exit_status, "remote shell exited");
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    tracing::debug!(target = %label, "ssh channel ended");
                    break;
                }
                Some(_) => {}
            },
            command = commands.recv() => match command {
                Some(ChannelCommand::Input(data)) => {
                    if let Err(e) = ssh_channel.data(&data[..]).await {
                        tracing::warn!(target = %label, ?e, "ssh write failed");
                        break;
                    }
                }
                Some(ChannelCommand::Resize { cols, rows }) => {
                    if let Err(e) = ssh_channel
                        .window_change(u32::from(cols), u32::from(rows), 0, 0)
                        .await
                    {
                        tracing::warn!(target = %label, ?e, cols, rows, "ssh window change failed");
                    }
                }
                None => break,
            },
        }
    }

    // Dropping `output` here ends the consumer's chunk sequence.
    drop(output);
    let _ = ssh_channel.eof().await;
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "session closed", "en")
        .await
    {
        tracing::debug!(target = %label, ?e, "ssh disconnect");
    }
}
