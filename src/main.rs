//! shellbridge - terminal sessions over WebSockets
//!
//! **Default** (no subcommand, or `shellbridge serve`): starts the HTTP/WS
//! server.
//!
//! **Detect** (`shellbridge detect`): prints what a local session would run on
//! this machine and exits.

use clap::{Parser as ClapParser, Subcommand};
use shellbridge::{
    api,
    config::{self, Config},
    local::LocalSpawner,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_BIND: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)),
    8080,
);

/// shellbridge - terminal sessions over WebSockets
///
/// Bridges SSH or local shell sessions to browser terminals.
#[derive(ClapParser, Debug)]
#[command(name = "shellbridge", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the TOML config file
    #[arg(long, global = true, env = "SHELLBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind the HTTP/WebSocket server (overrides config)
    #[arg(long, global = true)]
    bind: Option<SocketAddr>,

    /// Authentication token (required for non-localhost bindings)
    #[arg(long, global = true, env = "SHELLBRIDGE_TOKEN")]
    token: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the server (the default)
    Serve,

    /// Print the local shell, PTY capability and platform, then exit
    Detect,
}

#[derive(Debug, Error)]
enum ShellbridgeError {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("local shell error: {0}")]
    Spawn(#[from] shellbridge::local::SpawnError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn is_loopback(addr: &SocketAddr) -> bool {
    addr.ip().is_loopback()
}

fn resolve_token(bind: &SocketAddr, user_token: Option<String>) -> Option<String> {
    if user_token.is_some() {
        return user_token;
    }
    if is_loopback(bind) {
        return None;
    }
    use rand::Rng;
    let token: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    eprintln!("shellbridge: API token (required for non-localhost): {}", token);
    Some(token)
}

#[tokio::main]
async fn main() -> Result<(), ShellbridgeError> {
    let cli = Cli::parse();
    init_tracing();

    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);
    let config = Config::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Detect) => run_detect(&config),
        Some(Commands::Serve) | None => run_server(cli, config).await,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "shellbridge=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn run_detect(config: &Config) -> Result<(), ShellbridgeError> {
    let spawner = LocalSpawner::new(config.local.clone());
    let spec = spawner.shell_spec()?;
    let report = serde_json::json!({
        "os": spawner.os(),
        "capability": spawner.capability(),
        "shell": spec.path,
        "saved_hosts": config.hosts.iter().map(|h| h.id.as_str()).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_server(cli: Cli, config: Config) -> Result<(), ShellbridgeError> {
    tracing::info!("shellbridge starting");

    let bind = cli.bind.or(config.server.bind).unwrap_or(DEFAULT_BIND);
    let token = resolve_token(&bind, cli.token.or_else(|| config.server.token.clone()));
    if token.is_some() {
        tracing::info!("auth token configured");
    }

    let state = api::AppState::from_config(&config);
    let supervisor = state.supervisor.clone();
    let app = api::router(
        state,
        api::RouterConfig {
            token,
            bind,
            cors_origins: config.server.cors_origins.clone(),
            rate_limit: config.server.rate_limit,
        },
    );

    let mut events = supervisor.registry().subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!(?event, "session lifecycle"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "session lifecycle events lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %bind, "HTTP/WS server listening");

    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let http_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            server_shutdown_rx.await.ok();
        })
        .await
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(?e, "failed to listen for Ctrl+C");
    }
    tracing::info!("received Ctrl+C");

    // Closing the sessions makes every bridge send its close frame.
    let closed = supervisor.shutdown_all();
    tracing::debug!(closed, "sessions closed for shutdown");
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let _ = server_shutdown_tx.send(());
    match http_handle.await {
        Ok(result) => result?,
        Err(e) => tracing::warn!(?e, "HTTP server task panicked"),
    }

    tracing::info!("shellbridge exiting");
    Ok(())
}
