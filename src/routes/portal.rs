//! Client-facing portal routes: authentication, splash page and
//! captive-detection probes.
//!
//! None of these require the operator key. The client's network address is
//! taken from the first `X-Forwarded-For` entry when present, otherwise from
//! the TCP peer.

use std::net::{IpAddr, SocketAddr};

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{header, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::captive::{ProbeResponse, ProbeVerdict};
use crate::error::AccessError;
use crate::state::AppState;

/// Body of `POST /auth`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub token: String,
    pub device_id: String,
}

/// Reply to `POST /auth`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuthResponse {
    fn ok(message: &str) -> Self {
        Self {
            success: true,
            message: Some(message.to_string()),
            error: None,
        }
    }

    fn failed(error: &str) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.to_string()),
        }
    }
}

/// Network address of the requesting client.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddress(pub IpAddr);

impl<S: Send + Sync> FromRequestParts<S> for ClientAddress {
    type Rejection = (StatusCode, Json<AuthResponse>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let reject = || {
            (
                StatusCode::BAD_REQUEST,
                Json(AuthResponse::failed("Could not determine client address")),
            )
        };

        if let Some(forwarded) = parts.headers.get("x-forwarded-for") {
            let first = forwarded
                .to_str()
                .ok()
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .unwrap_or_default();
            return parse_address(first).map(Self).ok_or_else(reject);
        }

        parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(peer)| Self(peer.ip().to_canonical()))
            .ok_or_else(reject)
    }
}

/// Parse a bare address or `address:port`.
fn parse_address(raw: &str) -> Option<IpAddr> {
    raw.parse::<IpAddr>()
        .or_else(|_| raw.parse::<SocketAddr>().map(|s| s.ip()))
        .ok()
        .map(|ip| ip.to_canonical())
}

fn status_for(err: &AccessError) -> StatusCode {
    match err {
        AccessError::MissingField(_) => StatusCode::BAD_REQUEST,
        AccessError::ValidationRejected(_) => StatusCode::UNAUTHORIZED,
        AccessError::TokenInUse { .. } | AccessError::Store(_) => StatusCode::CONFLICT,
        AccessError::Enforcement(_) => StatusCode::BAD_GATEWAY,
    }
}

/// `POST /auth`: authenticate a client with its session token.
///
/// The attempt runs on its own task, so a client that disconnects or a
/// request that times out cannot interrupt a grant half way through its
/// rollback.
pub async fn authenticate(
    State(state): State<AppState>,
    ClientAddress(address): ClientAddress,
    body: Result<Json<AuthRequest>, JsonRejection>,
) -> (StatusCode, Json<AuthResponse>) {
    let Json(req) = match body {
        Ok(body) => body,
        Err(e) => {
            debug!(%address, "Malformed auth request: {e}");
            return (
                StatusCode::BAD_REQUEST,
                Json(AuthResponse::failed("Invalid request")),
            );
        }
    };

    let access = state.access.clone();
    let attempt = tokio::spawn(async move {
        access
            .authenticate(&req.token, &req.device_id, address)
            .await
    });

    match attempt.await {
        Ok(Ok(outcome)) => (StatusCode::OK, Json(AuthResponse::ok(outcome.message()))),
        Ok(Err(e)) => (status_for(&e), Json(AuthResponse::failed(e.user_message()))),
        Err(e) => {
            error!("Authentication task failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(AuthResponse::failed("Internal error")),
            )
        }
    }
}

const SPLASH_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Wi-Fi Authentication Required</title>
    <style>
        body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
               display: flex; justify-content: center; align-items: center;
               min-height: 100vh; margin: 0; background: #2d3a8c; color: white; }
        .container { text-align: center; padding: 40px; max-width: 400px;
                     background: rgba(255,255,255,0.1); border-radius: 20px; }
        p { opacity: 0.9; line-height: 1.6; }
    </style>
</head>
<body>
    <div class="container">
        <h1>Wi-Fi Authentication Required</h1>
        <p>Open the companion app, select this hotspot and complete your purchase to get connected.</p>
    </div>
</body>
</html>"#;

/// `GET /`, `GET /splash` and any unrouted path: static splash page.
pub async fn splash() -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "no-store")],
        Html(SPLASH_HTML),
    )
}

/// Captive-detection probe on any of [`crate::captive::PROBE_PATHS`].
pub async fn probe(
    State(state): State<AppState>,
    ClientAddress(address): ClientAddress,
    uri: Uri,
) -> Response {
    let no_store = (header::CACHE_CONTROL, "no-store");
    match state.detector.classify(uri.path(), address).await {
        ProbeVerdict::Connected(ProbeResponse::NoContent) => {
            (StatusCode::NO_CONTENT, [no_store]).into_response()
        }
        ProbeVerdict::Connected(ProbeResponse::Body { content_type, body }) => (
            StatusCode::OK,
            [no_store, (header::CONTENT_TYPE, content_type)],
            body,
        )
            .into_response(),
        ProbeVerdict::Redirect(url) => (
            StatusCode::FOUND,
            [(header::CACHE_CONTROL, "no-store".to_string()), (header::LOCATION, url)],
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_forms() {
        assert_eq!(parse_address("10.0.0.5"), Some("10.0.0.5".parse().unwrap()));
        assert_eq!(parse_address("10.0.0.5:51234"), Some("10.0.0.5".parse().unwrap()));
        assert_eq!(parse_address("::ffff:10.0.0.5"), Some("10.0.0.5".parse().unwrap()));
        assert_eq!(parse_address("fe80::1"), Some("fe80::1".parse().unwrap()));
        assert_eq!(parse_address("not-an-ip"), None);
        assert_eq!(parse_address(""), None);
    }
}
