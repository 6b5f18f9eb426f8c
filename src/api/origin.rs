use axum::{extract::Request, middleware::Next, response::Response};

use super::auth::is_ws_upgrade;
use super::error::ApiError;

/// Check the Origin header on WebSocket upgrade requests.
///
/// Without a token the terminal endpoints are reachable by any page the
/// local browser opens, so cross-site WebSocket upgrades are refused here.
///
/// - Non-WebSocket requests pass (CORS covers HTTP).
/// - No Origin header passes (non-browser clients).
/// - Otherwise the origin must be in the allowed list.
pub async fn check_ws_origin(
    allowed_origins: Vec<String>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !is_ws_upgrade(&req) {
        return Ok(next.run(req).await);
    }

    let origin = match req.headers().get("origin").and_then(|v| v.to_str().ok()) {
        None => return Ok(next.run(req).await),
        Some(o) => o.to_string(),
    };

    if allowed_origins.iter().any(|allowed| allowed == &origin) {
        return Ok(next.run(req).await);
    }

    tracing::warn!(%origin, "refused cross-origin websocket upgrade");
    Err(ApiError::OriginNotAllowed)
}

/// Origins a browser reports for pages served from the loopback listener.
pub fn loopback_origins(port: u16) -> Vec<String> {
    vec![
        format!("http://127.0.0.1:{port}"),
        format!("http://localhost:{port}"),
        format!("http://[::1]:{port}"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    async fn ok_handler() -> &'static str {
        "ok"
    }

    fn test_app(allowed_origins: Vec<String>) -> Router {
        Router::new()
            .route("/ws/terminal/{id}", get(ok_handler))
            .route("/api/sessions", get(ok_handler))
            .layer(axum::middleware::from_fn(move |req, next| {
                let origins = allowed_origins.clone();
                check_ws_origin(origins, req, next)
            }))
    }

    fn upgrade(origin: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .uri("/ws/terminal/abc")
            .header("upgrade", "websocket");
        if let Some(origin) = origin {
            builder = builder.header("origin", origin);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn loopback_origins_cover_all_spellings() {
        let origins = loopback_origins(8080);
        assert!(origins.contains(&"http://localhost:8080".to_string()));
        assert!(origins.contains(&"http://[::1]:8080".to_string()));
        assert_eq!(origins.len(), 3);
    }

    #[tokio::test]
    async fn foreign_origin_is_rejected() {
        let response = test_app(loopback_origins(8080))
            .oneshot(upgrade(Some("http://evil.com")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn loopback_origin_passes() {
        let response = test_app(loopback_origins(8080))
            .oneshot(upgrade(Some("http://localhost:8080")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_origin_passes() {
        let response = test_app(loopback_origins(8080))
            .oneshot(upgrade(None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn plain_http_ignores_origin() {
        let response = test_app(loopback_origins(8080))
            .oneshot(
                Request::builder()
                    .uri("/api/sessions")
                    .header("origin", "http://evil.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
