//! Loop record endpoints.
//!
//! - GET /loops, GET /loops/{id}
//! - GET /loops/{id}/spec|progress|steering|summary
//! - POST /loops/{id}/steering/answer
//! - POST /loops/{id}/cancel

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use ralph_core::{LoopRecord, ProgressSnapshot, SpecRecord, SteeringQuestion, SummaryRecord};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::actions::{self, ActionError};
use crate::server::{api_error, ApiError, AppContext};

#[derive(Debug, Serialize)]
pub struct ListLoopsResponse {
    pub loops: Vec<LoopRecord>,
}

#[derive(Debug, Serialize)]
pub struct GetLoopResponse {
    #[serde(rename = "loop")]
    pub record: LoopRecord,
}

/// Request payload for POST /loops/{id}/steering/answer.
#[derive(Debug, Deserialize)]
pub struct AnswerSteeringRequest {
    pub response: String,
}

fn not_found(what: &str, id: &str) -> ApiError {
    api_error(StatusCode::NOT_FOUND, format!("{what} not found: {id}"))
}

fn action_error(id: &str, e: ActionError) -> ApiError {
    let status = match &e {
        ActionError::NotFound { .. } => StatusCode::NOT_FOUND,
        ActionError::AlreadyAnswered(_) => StatusCode::CONFLICT,
        ActionError::EmptyResponse => StatusCode::BAD_REQUEST,
        ActionError::Parse(_) | ActionError::Frontmatter(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ActionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(task_id = %id, error = %e, "action failed");
    api_error(status, e.to_string())
}

/// GET /loops - every loop visible in the artifact root.
pub async fn list_loops(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    Json(ListLoopsResponse {
        loops: ctx.reconciler.list_loops().await,
    })
}

/// GET /loops/{id}
pub async fn get_loop(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<GetLoopResponse>, ApiError> {
    let record = ctx
        .reconciler
        .get_loop(&id)
        .await
        .ok_or_else(|| not_found("loop", &id))?;
    Ok(Json(GetLoopResponse { record }))
}

pub async fn get_spec(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<SpecRecord>, ApiError> {
    ctx.reconciler
        .get_spec(&id)
        .await
        .map(Json)
        .ok_or_else(|| not_found("spec", &id))
}

pub async fn get_progress(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<ProgressSnapshot>, ApiError> {
    ctx.reconciler
        .get_progress(&id)
        .await
        .map(Json)
        .ok_or_else(|| not_found("progress", &id))
}

pub async fn get_steering(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<SteeringQuestion>, ApiError> {
    ctx.reconciler
        .get_steering(&id)
        .await
        .map(Json)
        .ok_or_else(|| not_found("steering question", &id))
}

pub async fn get_summary(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<SummaryRecord>, ApiError> {
    ctx.reconciler
        .get_summary(&id)
        .await
        .map(Json)
        .ok_or_else(|| not_found("summary", &id))
}

/// POST /loops/{id}/steering/answer
pub async fn answer_steering(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(req): Json<AnswerSteeringRequest>,
) -> Result<StatusCode, ApiError> {
    actions::answer_steering(ctx.store.as_ref(), &id, &req.response)
        .await
        .map_err(|e| action_error(&id, e))?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /loops/{id}/cancel
pub async fn cancel_loop(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    actions::cancel_loop(ctx.store.as_ref(), &id)
        .await
        .map_err(|e| action_error(&id, e))?;
    Ok(StatusCode::NO_CONTENT)
}
