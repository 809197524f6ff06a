//! Session dashboard endpoints.
//!
//! `GET /api/sessions` lists sessions in dashboard form (tokens never appear
//! here); `DELETE /api/sessions/{device_id}` revokes one device.

use std::net::IpAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::state::AppState;
use crate::store::Session;
use crate::util::truncate_token;

/// One row of the dashboard list.
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub device_id: String,
    /// `active` or `expired` (expired but not yet swept).
    pub status: &'static str,
    pub granted_at: u64,
    pub expires_at: u64,
    pub duration_minutes: u32,
    pub time_left_minutes: u64,
    pub active_ips: Vec<IpAddr>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user_id: String,
}

impl SessionSummary {
    fn from_session(session: Session, now: u64) -> Self {
        Self {
            status: if session.is_expired(now) {
                "expired"
            } else {
                "active"
            },
            time_left_minutes: session.minutes_left(now),
            granted_at: session.granted_at,
            expires_at: session.expires_at,
            duration_minutes: session.duration_minutes,
            active_ips: session.active_addresses.into_iter().collect(),
            user_id: session.principal_id,
            device_id: session.device_id,
        }
    }
}

/// `GET /api/sessions`: dashboard list, newest first.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let now = state.clock.now();
    let mut sessions = state.store.snapshot().await;
    sessions.sort_by(|a, b| b.granted_at.cmp(&a.granted_at));
    let rows: Vec<SessionSummary> = sessions
        .into_iter()
        .map(|s| SessionSummary::from_session(s, now))
        .collect();
    Json(json!({ "count": rows.len(), "sessions": rows }))
}

/// `DELETE /api/sessions/{device_id}`: revoke a device's session now.
pub async fn revoke_session(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.access.revoke_device(&device_id).await {
        Some(session) => {
            info!(device = %device_id, "Session revoked by operator");
            (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "device_id": session.device_id,
                    "token": truncate_token(&session.token),
                    "revoked_ips": session.active_addresses,
                })),
            )
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": "No session for device"})),
        ),
    }
}
