//! HTTP route handlers.
//!
//! | Method | Path                          | Auth     | Module       |
//! |--------|-------------------------------|----------|--------------|
//! | GET    | `/api/health`                 | No       | [`health`]   |
//! | POST   | `/auth`                       | No, CORS | [`portal`]   |
//! | GET    | `/`, splash path, fallback    | No       | [`portal`]   |
//! | GET    | captive probe paths           | No       | [`portal`]   |
//! | GET    | `/status`                     | Yes      | [`status`]   |
//! | GET    | `/api/sessions`               | Yes      | [`sessions`] |
//! | DELETE | `/api/sessions/{device_id}`   | Yes      | [`sessions`] |
//! | GET    | `/api/activity`               | Yes      | [`activity`] |
//! | GET    | `/api/events`                 | Yes      | [`events`]   |

pub mod activity;
pub mod events;
pub mod health;
pub mod portal;
pub mod sessions;
pub mod status;

use std::time::Duration;

use axum::http::Method;
use axum::routing::{delete, get, post};
use axum::{middleware, Extension, Router};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{self, ApiKey};
use crate::captive::PROBE_PATHS;
use crate::state::AppState;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let mut portal_routes = Router::new()
        .route("/api/health", get(health::health))
        .route("/", get(portal::splash));
    let splash_path = state.config.portal.splash_path.as_str();
    if splash_path != "/" && !PROBE_PATHS.contains(&splash_path) {
        portal_routes = portal_routes.route(splash_path, get(portal::splash));
    }
    for path in PROBE_PATHS {
        portal_routes = portal_routes.route(path, get(portal::probe));
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers(Any);
    let auth_route = Router::new()
        .route("/auth", post(portal::authenticate))
        .layer(cors);

    let operator_routes = Router::new()
        .route("/status", get(status::status))
        .route("/api/sessions", get(sessions::list_sessions))
        .route("/api/sessions/{device_id}", delete(sessions::revoke_session))
        .route("/api/activity", get(activity::get_activity))
        .route("/api/events", get(events::event_stream))
        .route_layer(middleware::from_fn(auth::require_api_key));

    let server = &state.config.server;
    Router::new()
        .merge(portal_routes)
        .merge(auth_route)
        .merge(operator_routes)
        .fallback(portal::splash)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .layer(TimeoutLayer::new(Duration::from_millis(server.request_timeout_ms)))
        .layer(GlobalConcurrencyLimitLayer::new(server.max_connections))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone())
}
