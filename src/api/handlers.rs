use std::future::ready;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::bridge::BridgeError;
use crate::channel::ChannelKind;
use crate::protocol::{ClientFrame, CloseReason, ServerEvent, ServerFrame};
use crate::session::{ConnectionId, SessionId, SessionInfo, SessionKind, SessionState};
use crate::targets::{self, ConnectRequest};

use super::error::{ApiError, ConnectFailed};
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Debug, Serialize)]
pub(super) struct ConnectResponse {
    session_id: SessionId,
    status: &'static str,
    message: String,
}

pub(super) async fn connect(
    State(state): State<AppState>,
    Json(request): Json<ConnectRequest>,
) -> Result<Json<ConnectResponse>, Response> {
    tracing::debug!(?request, "connect requested");
    let request = targets::resolve_request(state.targets.as_ref(), request, state.default_port)
        .map_err(|e| ApiError::from(e).into_response())?;

    let session_id = state
        .supervisor
        .create(request)
        .await
        .map_err(|failure| ConnectFailed(failure).into_response())?;

    let label = state
        .supervisor
        .status(&session_id)
        .and_then(|info| info.target)
        .map(|target| target.host().to_string())
        .unwrap_or_else(|| "session".to_string());
    Ok(Json(ConnectResponse {
        session_id,
        status: "connected",
        message: format!("Connected to {label}"),
    }))
}

#[derive(Debug, Serialize)]
pub(super) struct DisconnectResponse {
    status: &'static str,
}

/// Idempotent: unknown and malformed ids are treated as already gone.
pub(super) async fn disconnect(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<DisconnectResponse> {
    if let Ok(id) = session_id.parse::<SessionId>() {
        state.supervisor.disconnect(&id);
    }
    Json(DisconnectResponse {
        status: "disconnected",
    })
}

/// Public view of a session.
#[derive(Debug, Serialize)]
pub(super) struct SessionStatus {
    session_id: SessionId,
    connected: bool,
    #[serde(rename = "type")]
    kind: SessionKind,
    state: SessionState,
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    channel: Option<ChannelKind>,
    attached: bool,
    created_at: u64,
}

impl From<SessionInfo> for SessionStatus {
    fn from(info: SessionInfo) -> Self {
        let target = info.target.as_ref();
        Self {
            session_id: info.id,
            connected: info.connected,
            kind: info.kind,
            state: info.state,
            host: target.map(|t| t.host().to_string()),
            port: target.and_then(|t| t.port()),
            username: target.map(|t| t.username().to_string()),
            channel: info.channel,
            attached: info.attached,
            created_at: info.created_at,
        }
    }
}

pub(super) async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionStatus>, ApiError> {
    session_id
        .parse::<SessionId>()
        .ok()
        .and_then(|id| state.supervisor.status(&id))
        .map(|info| Json(info.into()))
        .ok_or(ApiError::SessionNotFound(session_id))
}

pub(super) async fn sessions_list(State(state): State<AppState>) -> Json<Vec<SessionStatus>> {
    Json(state.supervisor.list().into_iter().map(Into::into).collect())
}

#[derive(Debug, Default, Deserialize)]
struct TicketRequest {
    session_id: Option<SessionId>,
}

#[derive(Debug, Serialize)]
pub(super) struct TicketResponse {
    ticket: String,
}

/// Issue a WebSocket ticket, optionally bound to one session with
/// `{"session_id": "..."}`. An empty body issues an unbound ticket.
pub(super) async fn ws_ticket(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<TicketResponse>, ApiError> {
    let request: TicketRequest = if body.iter().all(u8::is_ascii_whitespace) {
        TicketRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::InvalidRequest(e.to_string()))?
    };
    let ticket = state
        .tickets
        .issue(request.session_id)
        .ok_or(ApiError::TicketLimit)?;
    Ok(Json(TicketResponse { ticket }))
}

pub(super) async fn ws_terminal(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_terminal(socket, state, session_id))
}

async fn handle_terminal(mut socket: WebSocket, state: AppState, session_id: String) {
    let connection = ConnectionId::next();
    let attached = session_id
        .parse::<SessionId>()
        .map_err(|_| BridgeError::SessionNotFound)
        .and_then(|id| state.supervisor.attach(&id, connection));

    let attachment = match attached {
        Ok(attachment) => attachment,
        Err(e) => {
            tracing::debug!(%session_id, %connection, error = %e, "websocket attach refused");
            let notice = ServerEvent::error(e.to_string()).to_json();
            let _ = socket.send(Message::Text(notice.into())).await;
            let _ = socket
                .send(Message::Close(Some(close_frame(e.close_reason()))))
                .await;
            return;
        }
    };

    let (ws_tx, ws_rx) = socket.split();
    let tx = ws_tx.with(|frame: ServerFrame| ready(Ok::<_, axum::Error>(to_message(frame))));
    let rx = ws_rx.filter_map(|msg| ready(from_message(msg)));
    state.supervisor.run_attachment(attachment, tx, rx).await;
}

fn close_frame(reason: CloseReason) -> CloseFrame {
    CloseFrame {
        code: reason.code(),
        reason: reason.reason().into(),
    }
}

fn to_message(frame: ServerFrame) -> Message {
    match frame {
        ServerFrame::Event(event) => Message::Text(event.to_json().into()),
        ServerFrame::Close(reason) => Message::Close(Some(close_frame(reason))),
    }
}

/// Map a WebSocket message to a bridge frame. Ping and pong are answered by
/// axum and skipped here; a transport error ends the stream like a close.
fn from_message(msg: Result<Message, axum::Error>) -> Option<ClientFrame> {
    match msg {
        Ok(Message::Text(text)) => Some(ClientFrame::Text(text.as_str().to_owned())),
        Ok(Message::Binary(data)) => Some(ClientFrame::Binary(Bytes::from(data))),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
        Ok(Message::Close(_)) => Some(ClientFrame::Close),
        Err(e) => {
            tracing::debug!(error = %e, "websocket receive failed");
            Some(ClientFrame::Close)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_frames_carry_reason_codes() {
        let frame = close_frame(CloseReason::AlreadyAttached);
        assert_eq!(frame.code, 4409);
        assert_eq!(frame.reason.as_str(), "already attached");
    }

    #[test]
    fn events_become_text_messages() {
        match to_message(ServerFrame::Event(ServerEvent::data("hi"))) {
            Message::Text(text) => assert_eq!(text.as_str(), r#"{"type":"data","data":"hi"}"#),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            to_message(ServerFrame::Close(CloseReason::SessionClosed)),
            Message::Close(Some(CloseFrame { code: 1001, .. }))
        ));
    }

    #[test]
    fn inbound_messages_map_to_frames() {
        assert_eq!(
            from_message(Ok(Message::Text("x".into()))),
            Some(ClientFrame::Text("x".into()))
        );
        assert_eq!(
            from_message(Ok(Message::Binary(Bytes::from_static(b"\x03").into()))),
            Some(ClientFrame::Binary(Bytes::from_static(b"\x03")))
        );
        assert_eq!(from_message(Ok(Message::Ping(Bytes::new().into()))), None);
        assert_eq!(from_message(Ok(Message::Close(None))), Some(ClientFrame::Close));
    }
}
