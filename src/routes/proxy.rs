use axum::{
    body::Bytes,
    extract::{OriginalUri, State},
    http::{HeaderMap, Method, header},
    response::{IntoResponse, Response},
};

use crate::{AppState, admission::TokenUsage, error::GateError};

/// 从上游 JSON 响应的 `usage.total_tokens` 读取令牌消耗
fn token_usage(body: &[u8]) -> u64 {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.pointer("/usage/total_tokens").and_then(|t| t.as_u64()))
        .unwrap_or(0)
}

/// 把已放行的请求转发给上游 AI 服务
pub async fn forward(
    State(state): State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GateError> {
    let upstream = state
        .config
        .upstream_url
        .as_deref()
        .ok_or(GateError::NotFound)?;
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let url = format!("{}{}", upstream.trim_end_matches('/'), path_and_query);

    let mut request = state.http.request(method, &url).body(body);
    if let Some(content_type) = headers.get(header::CONTENT_TYPE) {
        request = request.header(header::CONTENT_TYPE, content_type);
    }

    let upstream_response = request.send().await.map_err(|e| {
        tracing::error!(%url, "Upstream request failed: {}", e);
        GateError::BadGateway
    })?;

    let status = upstream_response.status();
    let content_type = upstream_response.headers().get(header::CONTENT_TYPE).cloned();
    let bytes = upstream_response.bytes().await.map_err(|e| {
        tracing::error!(%url, "Failed to read upstream response: {}", e);
        GateError::BadGateway
    })?;

    let tokens = token_usage(&bytes);
    let mut response = (status, bytes).into_response();
    if let Some(content_type) = content_type {
        response.headers_mut().insert(header::CONTENT_TYPE, content_type);
    }
    response.extensions_mut().insert(TokenUsage(tokens));

    Ok(response)
}
