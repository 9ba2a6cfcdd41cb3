use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::broadcast::{BroadcastRecord, BroadcastRequest};
use crate::core::model::BroadcastId;
use crate::errors::{AppError, AppResult};
use crate::state::AppState;

use super::MessageFields;

#[derive(Debug, Deserialize)]
pub struct StartBroadcastRequest {
    pub name: String,
    #[serde(default)]
    pub phone_numbers: Vec<String>,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(flatten)]
    pub message: MessageFields,
    #[serde(default)]
    pub caller_id: Option<String>,
    #[serde(default)]
    pub concurrent_calls: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct StartBroadcastResponse {
    pub broadcast_id: BroadcastId,
    pub total_numbers: usize,
}

pub async fn start_broadcast(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartBroadcastRequest>,
) -> AppResult<(StatusCode, Json<StartBroadcastResponse>)> {
    let message = request.message.into_spec()?;
    let record = state.service.dispatch_broadcast(BroadcastRequest {
        name: request.name,
        numbers: request.phone_numbers,
        group: request.group_name,
        message,
        caller_id: request.caller_id,
        concurrency: request.concurrent_calls,
    })?;
    info!(
        broadcast_id = %record.broadcast_id,
        total = record.total,
        "Broadcast accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(StartBroadcastResponse {
            broadcast_id: record.broadcast_id,
            total_numbers: record.total,
        }),
    ))
}

pub async fn list_broadcasts(State(state): State<Arc<AppState>>) -> Json<Vec<BroadcastRecord>> {
    Json(state.service.broadcasts())
}

pub async fn get_broadcast(
    State(state): State<Arc<AppState>>,
    Path(broadcast_id): Path<String>,
) -> AppResult<Json<BroadcastRecord>> {
    let id: BroadcastId = broadcast_id
        .parse()
        .map_err(|_| AppError::BadRequest(format!("invalid broadcast id: {broadcast_id}")))?;
    state
        .service
        .broadcast(id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("broadcast {id}")))
}
