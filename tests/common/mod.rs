#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use futures::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use shellbridge::api::{self, ticket::TicketStore, AppState, RouterConfig};
use shellbridge::channel::{Channel, ChannelCommand, ChannelKind};
use shellbridge::config::{LocalSettings, SessionSettings};
use shellbridge::local::LocalSpawner;
use shellbridge::ssh::{ConnectError, Secret};
use shellbridge::supervisor::{RemoteConnector, Supervisor};
use shellbridge::targets::ConfigTargets;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

pub type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Remote connector backed by an in-process echo "shell".
///
/// Input is echoed back as output, `exit\r` ends the channel, and resizes
/// are recorded in order together with the input that preceded them.
/// Password `wrong` fails authentication.
#[derive(Default)]
pub struct EchoRemote {
    pub log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl RemoteConnector for EchoRemote {
    async fn connect(
        &self,
        _host: &str,
        _port: u16,
        username: &str,
        secret: &Secret,
    ) -> Result<Channel, ConnectError> {
        if secret.expose() == "wrong" {
            return Err(ConnectError::AuthenticationFailed(username.to_string()));
        }
        let (channel, mut backend) = Channel::new(ChannelKind::SecureRemote);
        let log = self.log.clone();
        let cancelled = backend.cancelled();
        tokio::spawn(async move {
            loop {
                let command = tokio::select! {
                    _ = cancelled.cancelled() => break,
                    command = backend.commands.recv() => command,
                };
                match command {
                    Some(ChannelCommand::Input(data)) => {
                        log.lock().push(format!("input:{}", String::from_utf8_lossy(&data)));
                        if data.as_ref() == b"exit\r" {
                            break;
                        }
                        if backend.output.send(data).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelCommand::Resize { cols, rows }) => {
                        log.lock().push(format!("resize:{cols}x{rows}"));
                    }
                    None => break,
                }
            }
        });
        Ok(channel)
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub app: axum::Router,
    pub state: AppState,
    pub remote_log: Arc<Mutex<Vec<String>>>,
}

pub fn test_state(
    settings: SessionSettings,
    local: LocalSettings,
) -> (AppState, Arc<Mutex<Vec<String>>>) {
    let remote = EchoRemote::default();
    let log = remote.log.clone();
    let supervisor = Supervisor::new(Arc::new(remote), Arc::new(LocalSpawner::new(local)), settings);
    let state = AppState {
        supervisor: Arc::new(supervisor),
        targets: Arc::new(ConfigTargets::default()),
        tickets: Arc::new(TicketStore::new()),
        default_port: 22,
    };
    (state, log)
}

/// Start a server on an ephemeral loopback port.
pub async fn start_server(settings: SessionSettings, config: RouterConfig) -> TestServer {
    start_server_with_local(settings, LocalSettings::default(), config).await
}

pub async fn start_server_with_local(
    settings: SessionSettings,
    local: LocalSettings,
    config: RouterConfig,
) -> TestServer {
    let (state, remote_log) = test_state(settings, local);
    let app = api::router(state.clone(), config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let served = app.clone();
    tokio::spawn(async move {
        axum::serve(listener, served).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    TestServer {
        addr,
        app,
        state,
        remote_log,
    }
}

impl TestServer {
    /// POST a JSON body through the router and return status + JSON.
    pub async fn post(&self, uri: &str, body: &str) -> (u16, serde_json::Value) {
        let response = self
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status().as_u16();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    pub async fn get(&self, uri: &str) -> (u16, serde_json::Value) {
        let response = self
            .app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status().as_u16();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    /// Create a remote session on the echo connector.
    pub async fn connect_remote(&self) -> String {
        let (status, json) = self
            .post(
                "/api/connect",
                r#"{"host":"echo.test","username":"ops","password":"pw"}"#,
            )
            .await;
        assert_eq!(status, 200, "connect failed: {json}");
        json["session_id"].as_str().unwrap().to_string()
    }

    pub async fn open_terminal(&self, session_id: &str) -> WsClient {
        let url = format!("ws://{}/ws/terminal/{}", self.addr, session_id);
        let (ws, _) = connect_async(url).await.expect("websocket connect failed");
        ws
    }
}

pub async fn send_event(ws: &mut WsClient, json: &str) {
    ws.send(Message::Text(json.into())).await.unwrap();
}

/// Read server events until one matches `pred` or the stream closes.
/// Returns every event read, and the close code if the stream closed.
pub async fn read_until<F>(ws: &mut WsClient, mut pred: F) -> (Vec<serde_json::Value>, Option<u16>)
where
    F: FnMut(&serde_json::Value) -> bool,
{
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let next = tokio::time::timeout_at(deadline, ws.next())
            .await
            .expect("timed out waiting for server events");
        match next {
            Some(Ok(Message::Text(text))) => {
                let event: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                let done = pred(&event);
                events.push(event);
                if done {
                    return (events, None);
                }
            }
            Some(Ok(Message::Close(frame))) => {
                return (events, frame.map(|f| u16::from(f.code)));
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return (events, None),
        }
    }
}

/// Concatenated `data` payloads of the given events.
pub fn output_of(events: &[serde_json::Value]) -> String {
    events
        .iter()
        .filter(|e| e["type"] == "data")
        .filter_map(|e| e["data"].as_str())
        .collect()
}
