use std::sync::Arc;

use axum::{extract::Request, middleware::Next, response::Response};
use subtle::ConstantTimeEq;

use super::error::ApiError;
use super::ticket::TicketStore;
use crate::session::SessionId;

/// Extract a Bearer token from the Authorization header.
fn extract_bearer(req: &Request) -> Option<String> {
    if let Some(auth_header) = req.headers().get("authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    None
}

/// Extract a `?ticket=` value from the query string.
fn extract_ticket(req: &Request) -> Option<String> {
    req.uri().query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("ticket=").map(|v| v.to_string()))
    })
}

/// Session targeted by a `/ws/terminal/{id}` request, if any.
fn terminal_session(req: &Request) -> Option<SessionId> {
    req.uri()
        .path()
        .strip_prefix("/ws/terminal/")
        .and_then(|rest| rest.trim_end_matches('/').parse().ok())
}

/// Check if this request is a WebSocket upgrade.
pub(super) fn is_ws_upgrade(req: &Request) -> bool {
    req.headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Auth middleware function.
///
/// Authentication flow:
/// 1. Try Bearer token from Authorization header
/// 2. If missing AND the request is a WebSocket upgrade, try `?ticket=`
///    against the TicketStore; a session-bound ticket only opens the
///    terminal of that session
/// 3. Otherwise reject
pub async fn require_auth(
    expected_token: String,
    ticket_store: Option<Arc<TicketStore>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(ref token) = extract_bearer(&req) {
        if token.as_bytes().ct_eq(expected_token.as_bytes()).into() {
            return Ok(next.run(req).await);
        }
        return Err(ApiError::AuthInvalid);
    }

    if is_ws_upgrade(&req) {
        if let (Some(store), Some(ticket)) = (ticket_store.as_ref(), extract_ticket(&req)) {
            if store.redeem(&ticket, terminal_session(&req)) {
                return Ok(next.run(req).await);
            }
            tracing::debug!(path = %req.uri().path(), "rejected websocket ticket");
        }
    }

    Err(ApiError::AuthRequired)
}
