pub mod ofrep;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use super::AppState;
use crate::error::PublishError;
use crate::eval::CacheStats;
use crate::models::*;
use crate::snapshot::SnapshotSummary;

type ApiResult<T> = Result<T, (StatusCode, String)>;

// ============================================================
// Error Handling
// ============================================================

/// Log an error and return a sanitized response to the client.
///
/// Validation failures raised by the store are safe to expose and map to a
/// 4xx status; anything else is logged and reported as a generic 500.
fn internal_error(e: impl std::fmt::Display) -> (StatusCode, String) {
    let msg = e.to_string();

    if msg.contains("UNIQUE constraint") {
        tracing::warn!("Conflict: {}", msg);
        return (StatusCode::CONFLICT, "Resource already exists".to_string());
    }
    if msg.contains("not found") {
        tracing::warn!("Validation error: {}", msg);
        return (StatusCode::NOT_FOUND, msg);
    }
    if msg.contains("depend") || msg.contains("cycle") {
        tracing::warn!("Validation error: {}", msg);
        return (StatusCode::CONFLICT, msg);
    }
    if msg.contains("must") {
        tracing::warn!("Validation error: {}", msg);
        return (StatusCode::BAD_REQUEST, msg);
    }

    tracing::error!("Internal error: {}", msg);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error".to_string(),
    )
}

/// Publish the configuration after a committed mutation.
fn publish(state: &AppState) -> ApiResult<()> {
    state.republish().map_err(|e| match e.downcast_ref::<PublishError>() {
        Some(publish) => (StatusCode::CONFLICT, publish.to_string()),
        None => internal_error(e),
    })
}

fn not_found(what: &str) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("{what} not found"))
}

// ============================================================
// Health and published configuration
// ============================================================

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "ready": state.store.is_ready(),
    }))
}

#[derive(Debug, Serialize)]
pub struct ConfigStatus {
    pub snapshot: Option<SnapshotSummary>,
    pub cache: CacheStats,
}

pub async fn get_config(State(state): State<AppState>) -> Json<ConfigStatus> {
    Json(ConfigStatus {
        snapshot: state.store.current().map(|s| s.summary()),
        cache: state.evaluator.cache().stats(),
    })
}

// ============================================================
// Teams
// ============================================================

pub async fn list_teams(State(state): State<AppState>) -> ApiResult<Json<Vec<Team>>> {
    state.db.get_all_teams().map(Json).map_err(internal_error)
}

pub async fn get_team(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Team>> {
    state
        .db
        .get_team(id)
        .map_err(internal_error)?
        .map(Json)
        .ok_or_else(|| not_found("Team"))
}

pub async fn create_team(
    State(state): State<AppState>,
    Json(input): Json<CreateTeamInput>,
) -> ApiResult<(StatusCode, Json<Team>)> {
    let team = state.db.create_team(input).map_err(internal_error)?;
    publish(&state)?;
    Ok((StatusCode::CREATED, Json(team)))
}

// ============================================================
// Environments
// ============================================================

pub async fn list_environments(
    State(state): State<AppState>,
    Path(team_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Environment>>> {
    state
        .db
        .get_environments(team_id)
        .map(Json)
        .map_err(internal_error)
}

pub async fn create_environment(
    State(state): State<AppState>,
    Path(team_id): Path<Uuid>,
    Json(input): Json<CreateEnvironmentInput>,
) -> ApiResult<(StatusCode, Json<Environment>)> {
    let env = state
        .db
        .create_environment(team_id, input)
        .map_err(internal_error)?;
    publish(&state)?;
    Ok((StatusCode::CREATED, Json(env)))
}

// ============================================================
// Clients
// ============================================================

pub async fn list_clients(
    State(state): State<AppState>,
    Path(team_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Client>>> {
    state.db.get_clients(team_id).map(Json).map_err(internal_error)
}

pub async fn create_client(
    State(state): State<AppState>,
    Path(team_id): Path<Uuid>,
    Json(input): Json<CreateClientInput>,
) -> ApiResult<(StatusCode, Json<Client>)> {
    let client = state
        .db
        .create_client(team_id, input)
        .map_err(internal_error)?;
    publish(&state)?;
    Ok((StatusCode::CREATED, Json(client)))
}

// ============================================================
// Contexts
// ============================================================

pub async fn list_contexts(
    State(state): State<AppState>,
    Path(team_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Context>>> {
    state.db.get_contexts(team_id).map(Json).map_err(internal_error)
}

pub async fn create_context(
    State(state): State<AppState>,
    Path(team_id): Path<Uuid>,
    Json(input): Json<CreateContextInput>,
) -> ApiResult<(StatusCode, Json<Context>)> {
    let context = state
        .db
        .create_context(team_id, input)
        .map_err(internal_error)?;
    publish(&state)?;
    Ok((StatusCode::CREATED, Json(context)))
}

// ============================================================
// Pipelines
// ============================================================

pub async fn list_pipelines(
    State(state): State<AppState>,
    Path(team_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Pipeline>>> {
    state.db.get_pipelines(team_id).map(Json).map_err(internal_error)
}

pub async fn get_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Pipeline>> {
    state
        .db
        .get_pipeline(id)
        .map_err(internal_error)?
        .map(Json)
        .ok_or_else(|| not_found("Pipeline"))
}

pub async fn create_pipeline(
    State(state): State<AppState>,
    Path(team_id): Path<Uuid>,
    Json(input): Json<CreatePipelineInput>,
) -> ApiResult<(StatusCode, Json<Pipeline>)> {
    let pipeline = state
        .db
        .create_pipeline(team_id, input)
        .map_err(internal_error)?;
    publish(&state)?;
    Ok((StatusCode::CREATED, Json(pipeline)))
}

// ============================================================
// Features
// ============================================================

pub async fn list_features(
    State(state): State<AppState>,
    Path(team_id): Path<Uuid>,
) -> ApiResult<Json<Vec<FeatureSummary>>> {
    let features = state.db.get_features(team_id).map_err(internal_error)?;
    Ok(Json(features.into_iter().map(FeatureSummary::from).collect()))
}

pub async fn get_feature(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Feature>> {
    state
        .db
        .get_feature(id)
        .map_err(internal_error)?
        .map(Json)
        .ok_or_else(|| not_found("Feature"))
}

pub async fn create_feature(
    State(state): State<AppState>,
    Path(team_id): Path<Uuid>,
    Json(input): Json<CreateFeatureInput>,
) -> ApiResult<(StatusCode, Json<Feature>)> {
    let feature = state
        .db
        .create_feature(team_id, input)
        .map_err(internal_error)?;
    publish(&state)?;
    Ok((StatusCode::CREATED, Json(feature)))
}

pub async fn update_feature(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateFeatureInput>,
) -> ApiResult<Json<Feature>> {
    let feature = state
        .db
        .update_feature(id, input)
        .map_err(internal_error)?
        .ok_or_else(|| not_found("Feature"))?;
    publish(&state)?;
    Ok(Json(feature))
}

pub async fn delete_feature(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if !state.db.delete_feature(id).map_err(internal_error)? {
        return Err(not_found("Feature"));
    }
    publish(&state)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================
// Stages
// ============================================================

pub async fn get_stage(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Stage>> {
    state
        .db
        .get_stage(id)
        .map_err(internal_error)?
        .map(Json)
        .ok_or_else(|| not_found("Stage"))
}

pub async fn set_stage_contexts(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<SetStageContextsInput>,
) -> ApiResult<Json<Stage>> {
    let stage = state
        .db
        .set_stage_contexts(id, &input.context_ids)
        .map_err(internal_error)?
        .ok_or_else(|| not_found("Stage"))?;
    publish(&state)?;
    Ok(Json(stage))
}

pub async fn set_stage_criteria(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<SetStageCriteriaInput>,
) -> ApiResult<Json<Stage>> {
    let stage = state
        .db
        .set_stage_criteria(id, input.criteria)
        .map_err(internal_error)?
        .ok_or_else(|| not_found("Stage"))?;
    publish(&state)?;
    Ok(Json(stage))
}

pub async fn set_stage_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<SetStageStatusInput>,
) -> ApiResult<Json<Stage>> {
    let stage = state
        .db
        .set_stage_status(id, input.status)
        .map_err(internal_error)?
        .ok_or_else(|| not_found("Stage"))?;
    tracing::info!(stage = %id, status = input.status.as_str(), "stage status recorded");
    publish(&state)?;
    Ok(Json(stage))
}
