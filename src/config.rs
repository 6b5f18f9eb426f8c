use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level server config, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSettings,
    pub ssh: SshSettings,
    pub local: LocalSettings,
    pub sessions: SessionSettings,
    /// Saved remote targets, addressable by `host_id` in connect requests.
    pub hosts: Vec<SavedHost>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: Option<SocketAddr>,
    /// Bearer token. Required for non-loopback binds (generated if absent).
    pub token: Option<String>,
    pub cors_origins: Vec<String>,
    /// Requests per second per client IP on the API routes.
    pub rate_limit: Option<u32>,
}

/// How the SSH connector treats the server's host key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Verify against a known_hosts file; unknown or changed keys are rejected.
    #[default]
    KnownHosts,
    /// Trust whatever key the server presents.
    AcceptAny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub host_key_policy: HostKeyPolicy,
    /// Overrides `~/.ssh/known_hosts`.
    pub known_hosts_path: Option<PathBuf>,
    /// Bounds the whole connect, including the legacy-algorithm retry.
    pub connect_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    /// Missed keep-alive replies tolerated before the connection is dropped.
    pub keepalive_max: usize,
    pub default_port: u16,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            host_key_policy: HostKeyPolicy::default(),
            known_hosts_path: None,
            connect_timeout_secs: 10,
            keepalive_interval_secs: 15,
            keepalive_max: 3,
            default_port: 22,
        }
    }
}

impl SshSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }
}

/// Which local terminal backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PtyMode {
    /// Check for a native PTY once, fall back to pipes if unavailable.
    #[default]
    Auto,
    Native,
    Pipe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    pub pty_mode: PtyMode,
    /// Tried before the built-in candidate list.
    pub shell: Option<PathBuf>,
    pub locale: String,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            pty_mode: PtyMode::Auto,
            shell: None,
            locale: "C.UTF-8".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub max_sessions: Option<usize>,
    pub max_cols: u16,
    pub max_rows: u16,
    /// Keep the session alive when its client goes away so it can be
    /// attached again. Off by default: a session is attached once.
    pub reattach: bool,
    /// Send a "Connected to ..." line when a client attaches.
    pub banner: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_sessions: Some(256),
            max_cols: 500,
            max_rows: 200,
            reattach: false,
            banner: true,
        }
    }
}

/// A saved remote target.
#[derive(Clone, Serialize, Deserialize)]
pub struct SavedHost {
    pub id: String,
    pub host: String,
    pub port: Option<u16>,
    pub username: String,
    pub password: Option<String>,
}

impl std::fmt::Debug for SavedHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SavedHost")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Config {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Load from `path` or fall back to defaults when the file is missing.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::load(path)?.unwrap_or_default())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for host in &self.hosts {
            if host.id.is_empty() {
                return Err(ConfigError::Invalid("saved host with empty id".into()));
            }
            if !seen.insert(host.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate saved host id: {}", host.id)));
            }
        }
        if self.sessions.max_cols < crate::protocol::MIN_DIMENSION
            || self.sessions.max_rows < crate::protocol::MIN_DIMENSION
        {
            return Err(ConfigError::Invalid(format!(
                "max_cols/max_rows must be at least {}",
                crate::protocol::MIN_DIMENSION
            )));
        }
        Ok(())
    }
}

/// Default config location: `$XDG_CONFIG_HOME/shellbridge/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shellbridge")
        .join("config.toml")
}

/// Errors that can occur when loading config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {1}", .0.display())]
    ReadFailed(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config {}: {1}", .0.display())]
    ParseFailed(PathBuf, #[source] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Check file permissions on a config file and warn if world-readable.
///
/// Saved hosts may carry passwords, so a world-readable file is worth a
/// warning.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "config file {} is world-readable (mode {:o}); \
             it may contain saved host passwords, consider chmod 600",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
