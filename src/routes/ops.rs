use axum::{
    Json,
    extract::{Query, State},
    response::IntoResponse,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use serde::{Deserialize, Serialize};

use crate::{
    AppState, admission::Identifier, error::GateError, utils::success_to_api_response,
};

#[derive(Debug, Deserialize)]
pub struct UpdateLoadRequest {
    pub factor: f64,
}

#[derive(Debug, Serialize)]
pub struct LoadResponse {
    pub load_factor: f64,
    pub load_threshold: f64,
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub identifier: String,
}

fn authorize(state: &AppState, bearer: &Bearer) -> Result<(), GateError> {
    match state.config.ops_token.as_deref() {
        Some(token) if token == bearer.token() => Ok(()),
        _ => Err(GateError::Unauthorized),
    }
}

fn load_response(state: &AppState) -> LoadResponse {
    let limiter = state.gate.limiter();
    LoadResponse {
        load_factor: limiter.load_factor(),
        load_threshold: limiter.config().load_threshold,
    }
}

#[axum::debug_handler]
pub async fn get_load(
    State(state): State<AppState>,
    TypedHeader(Authorization(bearer)): TypedHeader<Authorization<Bearer>>,
) -> Result<impl IntoResponse, GateError> {
    authorize(&state, &bearer)?;
    Ok(success_to_api_response(load_response(&state)))
}

/// 由外部监控进程周期性调用
#[axum::debug_handler]
pub async fn update_load(
    State(state): State<AppState>,
    TypedHeader(Authorization(bearer)): TypedHeader<Authorization<Bearer>>,
    Json(req): Json<UpdateLoadRequest>,
) -> Result<impl IntoResponse, GateError> {
    authorize(&state, &bearer)?;
    state.gate.limiter().update_load(req.factor);
    Ok(success_to_api_response(load_response(&state)))
}

#[axum::debug_handler]
pub async fn usage(
    State(state): State<AppState>,
    TypedHeader(Authorization(bearer)): TypedHeader<Authorization<Bearer>>,
    Query(query): Query<UsageQuery>,
) -> Result<impl IntoResponse, GateError> {
    authorize(&state, &bearer)?;

    let identifier = Identifier::parse(&query.identifier).ok_or_else(|| {
        GateError::BadRequest("标识格式应为 user:<id>、session:<id> 或 address:<ip>".to_string())
    })?;

    let stats = state
        .gate
        .limiter()
        .usage_stats(&identifier)
        .await
        .map_err(|e| {
            tracing::error!(%identifier, "Failed to read usage stats: {}", e);
            GateError::Unavailable
        })?;

    Ok(success_to_api_response(stats))
}
