//! Operator status dump.

use std::collections::BTreeMap;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::state::AppState;
use crate::store::Session;

/// Body of `GET /status`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub active_session_count: usize,
    /// Sessions keyed by token.
    pub sessions: BTreeMap<String, Session>,
}

/// `GET /status`: every session in the store, keyed by token.
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let sessions: BTreeMap<String, Session> = state
        .store
        .snapshot()
        .await
        .into_iter()
        .map(|s| (s.token.clone(), s))
        .collect();
    Json(StatusResponse {
        active_session_count: sessions.len(),
        sessions,
    })
}
