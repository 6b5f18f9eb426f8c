//! Turning a connect request into a concrete session target.
//!
//! A request names either the local machine, an inline remote target, or a
//! saved host from the config file. Saved-host lookup sits behind
//! [`TargetResolver`] so other stores can be plugged in.

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use thiserror::Error;

use crate::config::SavedHost;
use crate::ssh::Secret;
use crate::supervisor::SessionRequest;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectMode {
    #[default]
    Remote,
    Local,
}

/// Body of `POST /api/connect`.
#[derive(Clone, Default, Deserialize)]
pub struct ConnectRequest {
    #[serde(default)]
    pub mode: ConnectMode,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub host_id: Option<String>,
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("mode", &self.mode)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("host_id", &self.host_id)
            .finish()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("unknown saved host: {0}")]
    UnknownHost(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid port: {0}")]
    InvalidPort(u16),
}

/// Lookup of saved remote targets.
pub trait TargetResolver: Send + Sync {
    fn saved_host(&self, id: &str) -> Option<SavedHost>;
}

/// Saved hosts from the `[[hosts]]` config section.
#[derive(Debug, Default)]
pub struct ConfigTargets {
    hosts: HashMap<String, SavedHost>,
}

impl ConfigTargets {
    pub fn new(hosts: Vec<SavedHost>) -> Self {
        Self {
            hosts: hosts.into_iter().map(|h| (h.id.clone(), h)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl TargetResolver for ConfigTargets {
    fn saved_host(&self, id: &str) -> Option<SavedHost> {
        self.hosts.get(id).cloned()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Validate a connect request and resolve it to a [`SessionRequest`].
///
/// For a saved host, fields given inline in the request take precedence
/// over the saved values, which lets a saved entry omit its password.
pub fn resolve_request(
    resolver: &dyn TargetResolver,
    request: ConnectRequest,
    default_port: u16,
) -> Result<SessionRequest, TargetError> {
    if request.mode == ConnectMode::Local {
        return Ok(SessionRequest::Local);
    }

    let saved = match non_empty(request.host_id) {
        Some(id) => Some(
            resolver
                .saved_host(&id)
                .ok_or(TargetError::UnknownHost(id))?,
        ),
        None => None,
    };

    let host = non_empty(request.host)
        .or_else(|| saved.as_ref().map(|s| s.host.clone()))
        .ok_or(TargetError::MissingField("host"))?;
    let username = non_empty(request.username)
        .or_else(|| saved.as_ref().map(|s| s.username.clone()))
        .ok_or(TargetError::MissingField("username"))?;
    let password = request
        .password
        .or_else(|| saved.as_ref().and_then(|s| s.password.clone()))
        .ok_or(TargetError::MissingField("password"))?;
    let port = request
        .port
        .or_else(|| saved.as_ref().and_then(|s| s.port))
        .unwrap_or(default_port);
    if port == 0 {
        return Err(TargetError::InvalidPort(port));
    }

    Ok(SessionRequest::Remote {
        host,
        port,
        username,
        secret: Secret::new(password),
    })
}
