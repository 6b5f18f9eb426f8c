pub mod auth;
pub mod error;
mod handlers;
pub mod origin;
pub mod ticket;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::Config;
use crate::local::LocalSpawner;
use crate::ssh::SshConnector;
use crate::supervisor::Supervisor;
use crate::targets::{ConfigTargets, TargetResolver};

use handlers::*;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    /// Saved hosts addressable by `host_id`.
    pub targets: Arc<dyn TargetResolver>,
    /// Short-lived ticket store for WebSocket authentication.
    pub tickets: Arc<ticket::TicketStore>,
    /// Port used when a remote connect request names none.
    pub default_port: u16,
}

impl AppState {
    /// State backed by real SSH and local shell channels.
    pub fn from_config(config: &Config) -> Self {
        let supervisor = Supervisor::new(
            Arc::new(SshConnector::new(config.ssh.clone())),
            Arc::new(LocalSpawner::new(config.local.clone())),
            config.sessions.clone(),
        );
        Self {
            supervisor: Arc::new(supervisor),
            targets: Arc::new(ConfigTargets::new(config.hosts.clone())),
            tickets: Arc::new(ticket::TicketStore::new()),
            default_port: config.ssh.default_port,
        }
    }
}

/// Configuration for the HTTP/WS router.
///
/// Controls authentication, CORS, rate limiting, and origin checks.
/// Use `RouterConfig::default()` in tests for a minimal no-auth setup.
pub struct RouterConfig {
    pub token: Option<String>,
    pub bind: SocketAddr,
    pub cors_origins: Vec<String>,
    pub rate_limit: Option<u32>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            token: None,
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            cors_origins: vec![],
            rate_limit: None,
        }
    }
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let tickets = state.tickets.clone();
    let protected = Router::new()
        .route("/api/connect", post(connect))
        .route("/api/disconnect/{session_id}", post(disconnect))
        .route("/api/session/{session_id}", get(session_status))
        .route("/api/sessions", get(sessions_list))
        .route("/ws/terminal/{session_id}", get(ws_terminal))
        .route("/auth/ws-ticket", post(ws_ticket))
        .with_state(state);

    // Per-peer-IP rate limit. Needs the server to be run with
    // `into_make_service_with_connect_info::<SocketAddr>()`.
    let protected = if let Some(rps) = config.rate_limit {
        use tower_governor::{
            governor::GovernorConfigBuilder, key_extractor::PeerIpKeyExtractor, GovernorLayer,
        };
        match GovernorConfigBuilder::default()
            .per_second(u64::from(rps))
            .burst_size(rps)
            .key_extractor(PeerIpKeyExtractor)
            .finish()
        {
            Some(governor_conf) => protected.layer(GovernorLayer::new(Arc::new(governor_conf))),
            None => {
                tracing::warn!(rps, "invalid rate limit, rate limiting disabled");
                protected
            }
        }
    } else {
        protected
    };

    let protected = match config.token {
        Some(token) => {
            let ts = Some(tickets);
            protected.layer(axum::middleware::from_fn(move |req, next| {
                let t = token.clone();
                let ts = ts.clone();
                async move { auth::require_auth(t, ts, req, next).await }
            }))
        }
        None => {
            let mut allowed_origins = origin::loopback_origins(config.bind.port());
            allowed_origins.extend(config.cors_origins.iter().cloned());
            protected.layer(axum::middleware::from_fn(move |req, next| {
                let origins = allowed_origins.clone();
                origin::check_ws_origin(origins, req, next)
            }))
        }
    };

    let router = Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("content-security-policy"),
            HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("permissions-policy"),
            HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
        ))
        .layer(TraceLayer::new_for_http());

    if config.cors_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
        )
    }
}
