//! OpenFeature Remote Evaluation Protocol endpoints.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::api::middleware::{bearer_token, Bearer};
use crate::api::AppState;
use crate::error::{ErrorCode, EvalError};
use crate::eval::{normalize, EvaluationContext, Reason, Resolution, Variant};
use crate::snapshot::Snapshot;

/// Context attribute naming the environment when the caller is not bound to one.
pub const ENVIRONMENT_ATTRIBUTE: &str = "environment_id";

#[derive(Debug, Default, Deserialize)]
pub struct EvaluationRequest {
    #[serde(default)]
    pub context: Option<Map<String, Value>>,
}

#[derive(Debug, Serialize)]
pub struct Metadata {
    pub environment: String,
    pub version: u64,
}

#[derive(Debug, Serialize)]
pub struct EvaluationSuccess {
    pub key: String,
    pub value: bool,
    pub reason: Reason,
    pub variant: Variant,
    pub metadata: Metadata,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationFailure {
    pub key: String,
    pub reason: Reason,
    pub error_code: ErrorCode,
    pub error_details: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum BulkItem {
    Success(EvaluationSuccess),
    Failure(EvaluationFailure),
}

#[derive(Debug, Serialize)]
pub struct BulkResponse {
    pub flags: Vec<BulkItem>,
}

/// Why a request was not evaluated.
#[derive(Debug)]
pub enum Rejection {
    Unauthorized,
    Eval(EvalError),
}

impl From<EvalError> for Rejection {
    fn from(e: EvalError) -> Self {
        Self::Eval(e)
    }
}

impl Rejection {
    fn into_ofrep_response(self, key: &str) -> Response {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED.into_response(),
            Self::Eval(e) => {
                let status = status_for(&e);
                if status.is_server_error() {
                    tracing::error!(flag = key, error = %e, "evaluation failed");
                } else {
                    tracing::debug!(flag = key, error = %e, "evaluation rejected");
                }
                (status, Json(failure(key, &e))).into_response()
            }
        }
    }
}

fn status_for(e: &EvalError) -> StatusCode {
    match e {
        EvalError::FlagNotFound(_) => StatusCode::NOT_FOUND,
        EvalError::InvalidContext(_) => StatusCode::BAD_REQUEST,
        EvalError::ProviderNotReady => StatusCode::SERVICE_UNAVAILABLE,
        EvalError::General(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(key: &str, e: &EvalError) -> EvaluationFailure {
    EvaluationFailure {
        key: key.to_string(),
        reason: Reason::Error,
        error_code: e.code(),
        error_details: e.to_string(),
    }
}

fn success(key: String, resolution: Resolution, metadata: Metadata) -> EvaluationSuccess {
    EvaluationSuccess {
        key,
        value: resolution.value(),
        reason: resolution.reason,
        variant: resolution.variant,
        metadata,
    }
}

/// `POST /ofrep/v1/evaluate/flags/{key}`
pub async fn evaluate_flag(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Result<Json<EvaluationRequest>, JsonRejection>,
) -> Response {
    match evaluate_one(&state, &key, &headers, body) {
        Ok(result) => Json(result).into_response(),
        Err(rejection) => rejection.into_ofrep_response(&key),
    }
}

fn evaluate_one(
    state: &AppState,
    key: &str,
    headers: &HeaderMap,
    body: Result<Json<EvaluationRequest>, JsonRejection>,
) -> Result<EvaluationSuccess, Rejection> {
    let context = parse_context(body)?;
    let snapshot = state.evaluator.snapshot()?;
    let environment = prepare(state, &snapshot, headers, &context)?;
    let evaluation = state
        .evaluator
        .resolve_in(&snapshot, key, environment, &context)?;
    Ok(success(
        key.to_string(),
        evaluation.resolution,
        metadata(&snapshot, environment),
    ))
}

/// `POST /ofrep/v1/evaluate/flags`: every flag of the environment's team.
pub async fn evaluate_all(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<EvaluationRequest>, JsonRejection>,
) -> Response {
    let result = (|| -> Result<BulkResponse, Rejection> {
        let context = parse_context(body)?;
        let snapshot = state.evaluator.snapshot()?;
        let environment = prepare(&state, &snapshot, &headers, &context)?;
        let resolved = state
            .evaluator
            .resolve_all(&snapshot, environment, &context)?;

        let flags = resolved
            .into_iter()
            .map(|(key, result)| match result {
                Ok(resolution) => {
                    BulkItem::Success(success(key, resolution, metadata(&snapshot, environment)))
                }
                Err(e) => BulkItem::Failure(failure(&key, &e)),
            })
            .collect();
        Ok(BulkResponse { flags })
    })();

    match result {
        Ok(bulk) => Json(bulk).into_response(),
        Err(rejection) => rejection.into_ofrep_response(""),
    }
}

/// Normalize the request context. Runs before any snapshot or client lookup.
fn parse_context(
    body: Result<Json<EvaluationRequest>, JsonRejection>,
) -> Result<EvaluationContext, EvalError> {
    let Json(request) = body.map_err(|e| {
        EvalError::InvalidContext(format!("request body is not valid: {}", e.body_text()))
    })?;
    let raw = request
        .context
        .ok_or_else(|| EvalError::InvalidContext("context is required".to_string()))?;
    normalize(&raw)
}

/// Authenticate the caller and pick the environment.
fn prepare(
    state: &AppState,
    snapshot: &Snapshot,
    headers: &HeaderMap,
    context: &EvaluationContext,
) -> Result<Uuid, Rejection> {
    let bound = authenticate(snapshot, headers)?;
    Ok(resolve_environment(state, snapshot, bound, context)?)
}

/// The caller's client binding, if it presented one.
///
/// Returns the client's team and bound environment. Unknown or disabled
/// clients are rejected.
fn authenticate(
    snapshot: &Snapshot,
    headers: &HeaderMap,
) -> Result<Option<(Uuid, Option<Uuid>)>, Rejection> {
    let token = match bearer_token(headers) {
        Bearer::Missing => return Ok(None),
        Bearer::Malformed => {
            tracing::warn!("Invalid Authorization header format");
            return Err(Rejection::Unauthorized);
        }
        Bearer::Token(token) => token,
    };

    let client = Uuid::parse_str(token)
        .ok()
        .and_then(|id| snapshot.client(id))
        .filter(|c| c.enabled);
    match client {
        Some(client) => Ok(Some((client.team_id, client.environment_id))),
        None => {
            tracing::warn!("Unknown or disabled client");
            Err(Rejection::Unauthorized)
        }
    }
}

/// Bound environment, then the `environment_id` attribute, then the server
/// default. A client without a binding may only reach its own team.
fn resolve_environment(
    state: &AppState,
    snapshot: &Snapshot,
    bound: Option<(Uuid, Option<Uuid>)>,
    context: &EvaluationContext,
) -> Result<Uuid, EvalError> {
    if let Some((_, Some(environment))) = bound {
        return Ok(environment);
    }

    let reference = match context.get(ENVIRONMENT_ATTRIBUTE) {
        Some(value) => value.as_str().map(str::to_string).ok_or_else(|| {
            EvalError::InvalidContext(format!("{ENVIRONMENT_ATTRIBUTE} must be a string"))
        })?,
        None => state.config.default_environment.clone().ok_or_else(|| {
            EvalError::InvalidContext(format!(
                "{ENVIRONMENT_ATTRIBUTE} is required when the client is not bound to an environment"
            ))
        })?,
    };

    let environment = snapshot
        .environment_by_ref(&reference)
        .filter(|env| bound.map_or(true, |(team, _)| env.team_id == team))
        .ok_or_else(|| EvalError::FlagNotFound(format!("environment '{reference}' not found")))?;
    Ok(environment.id)
}

fn metadata(snapshot: &Snapshot, environment: Uuid) -> Metadata {
    Metadata {
        environment: snapshot
            .environment(environment)
            .map(|e| e.name.clone())
            .unwrap_or_default(),
        version: snapshot.version(),
    }
}
