//! Access journal endpoint.
//!
//! `GET /api/activity?since_id=N&limit=N&kind=authenticated&device_id=abc`
//! returns recent journal entries with optional filtering.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::activity::ActivityKind;
use crate::state::AppState;

/// Query parameters for `GET /api/activity`.
#[derive(Deserialize)]
pub struct ActivityQuery {
    /// Return entries with `id > since_id`. Defaults to 0 (all entries).
    #[serde(default)]
    pub since_id: u64,
    /// Maximum number of entries to return. Defaults to 50, max 200.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Filter by kind (e.g. `authenticated`, `expired`).
    pub kind: Option<String>,
    /// Filter by device identity.
    pub device_id: Option<String>,
}

fn default_limit() -> usize {
    50
}

/// `GET /api/activity`: read recent journal entries with optional filters.
pub async fn get_activity(
    State(state): State<AppState>,
    Query(query): Query<ActivityQuery>,
) -> Json<Value> {
    let limit = query.limit.min(200);
    let kind = query.kind.as_deref().and_then(ActivityKind::from_str_opt);

    let entries = state
        .activity_log
        .read_since_filtered(query.since_id, limit, kind, query.device_id.as_deref())
        .await;
    Json(json!({ "entries": entries }))
}
