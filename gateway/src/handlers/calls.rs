use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::engine::CallSnapshot;
use crate::core::lifecycle::CancelOutcome;
use crate::core::model::{JobId, Priority};
use crate::core::service::CallRequest;
use crate::errors::{AppError, AppResult};
use crate::state::AppState;

use super::MessageFields;

#[derive(Debug, Deserialize)]
pub struct PlaceCallRequest {
    pub phone_number: String,
    #[serde(flatten)]
    pub message: MessageFields,
    #[serde(default)]
    pub caller_id: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u8>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

#[derive(Debug, Serialize)]
pub struct PlaceCallResponse {
    pub status: &'static str,
    pub call_id: JobId,
}

#[derive(Debug, Serialize)]
pub struct CancelCallResponse {
    pub call_id: JobId,
    pub outcome: CancelOutcome,
}

fn parse_call_id(raw: &str) -> AppResult<JobId> {
    raw.parse()
        .map_err(|_| AppError::BadRequest(format!("invalid call id: {raw}")))
}

/// Accept a call for asynchronous processing
pub async fn place_call(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PlaceCallRequest>,
) -> AppResult<(StatusCode, Json<PlaceCallResponse>)> {
    let message = request.message.into_spec()?;
    let handle = state
        .service
        .place_call(CallRequest {
            destination: request.phone_number,
            message,
            caller_id: request.caller_id,
            extension: request.extension,
            max_retries: request.max_retries,
            priority: request.priority,
        })
        .await?;
    info!(job_id = %handle.ticket(), "Call accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(PlaceCallResponse {
            status: "queued",
            call_id: handle.ticket(),
        }),
    ))
}

pub async fn get_call(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
) -> AppResult<Json<CallSnapshot>> {
    let ticket = parse_call_id(&call_id)?;
    Ok(Json(state.service.status(ticket).await?))
}

pub async fn cancel_call(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
) -> AppResult<Json<CancelCallResponse>> {
    let ticket = parse_call_id(&call_id)?;
    let outcome = state.service.cancel(ticket).await?;
    info!(job_id = %ticket, ?outcome, "Cancellation requested");
    Ok(Json(CancelCallResponse {
        call_id: ticket,
        outcome,
    }))
}
