use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use crate::core::engine::EngineStats;
use crate::core::history::{CallHistoryRecord, DEFAULT_HISTORY_LIMIT};
use crate::core::model::ContactGroup;
use crate::errors::AppResult;
use crate::state::AppState;

/// Upper bound on `limit` for history queries
const MAX_HISTORY_LIMIT: usize = 1000;

/// Health check, including the manager session state
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    let session = state.service.session_status();
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "manager": {
            "connected": session.connected,
            "alarm": session.alarm,
            "reconnect_attempts": session.reconnect_attempts,
        },
    }))
}

pub async fn engine_stats(State(state): State<Arc<AppState>>) -> AppResult<Json<EngineStats>> {
    Ok(Json(state.service.stats().await?))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// Most recent call records, newest first
pub async fn call_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<CallHistoryRecord>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    Json(state.service.history(limit))
}

pub async fn list_groups(State(state): State<Arc<AppState>>) -> Json<Vec<ContactGroup>> {
    Json(state.service.groups())
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default, alias = "numbers")]
    pub phone_numbers: Vec<String>,
    #[serde(default)]
    pub caller_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateGroupResponse {
    pub name: String,
    pub total_numbers: usize,
}

pub async fn create_group(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateGroupRequest>,
) -> AppResult<(StatusCode, Json<CreateGroupResponse>)> {
    let group = state.service.add_group(ContactGroup {
        name: request.name,
        numbers: request.phone_numbers,
        caller_id: request.caller_id,
    })?;
    info!(group = %group.name, members = group.numbers.len(), "Contact group created");

    Ok((
        StatusCode::CREATED,
        Json(CreateGroupResponse {
            name: group.name,
            total_numbers: group.numbers.len(),
        }),
    ))
}
