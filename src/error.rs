use axum::Json;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::admission::DEFAULT_RETRY_AFTER_SECS;

/// 网关返回给调用方的错误，内部错误细节不会出现在响应体中
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("rate limit exceeded, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },
    #[error("quota exceeded: {message}")]
    QuotaExceeded {
        message: String,
        quota_reset: Option<DateTime<Utc>>,
    },
    #[error("request body too large")]
    PayloadTooLarge,
    #[error("unsupported content type")]
    UnsupportedMediaType,
    #[error("admission backend unavailable")]
    Unavailable,
    #[error("unauthorized")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("upstream request failed")]
    BadGateway,
    #[error("not found")]
    NotFound,
    #[error("internal server error")]
    InternalServerError,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quota_reset: Option<Option<DateTime<Utc>>>,
}

impl ErrorResponse {
    fn new(error: &'static str, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
            retry_after: None,
            quota_reset: None,
        }
    }
}

impl GateError {
    pub fn status(&self) -> StatusCode {
        match self {
            GateError::RateLimited { .. } | GateError::QuotaExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GateError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GateError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            GateError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            GateError::Unauthorized => StatusCode::UNAUTHORIZED,
            GateError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GateError::BadGateway => StatusCode::BAD_GATEWAY,
            GateError::NotFound => StatusCode::NOT_FOUND,
            GateError::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            GateError::RateLimited { retry_after } => ErrorResponse {
                retry_after: Some(retry_after),
                ..ErrorResponse::new("Rate limit exceeded", "AI 请求过于频繁，请稍后重试")
            },
            GateError::QuotaExceeded {
                message,
                quota_reset,
            } => ErrorResponse {
                quota_reset: Some(quota_reset),
                ..ErrorResponse::new("Quota exceeded", message)
            },
            GateError::PayloadTooLarge => {
                ErrorResponse::new("Request too large", "请求体超过允许的最大长度")
            }
            GateError::UnsupportedMediaType => {
                ErrorResponse::new("Invalid content type", "仅支持 application/json")
            }
            GateError::Unavailable => ErrorResponse {
                retry_after: Some(DEFAULT_RETRY_AFTER_SECS),
                ..ErrorResponse::new("Service unavailable", "服务暂时不可用，请稍后重试")
            },
            GateError::Unauthorized => ErrorResponse::new("Unauthorized", "未授权访问"),
            GateError::BadRequest(message) => ErrorResponse::new("Bad request", message),
            GateError::BadGateway => ErrorResponse::new("Bad gateway", "上游服务请求失败"),
            GateError::NotFound => ErrorResponse::new("Not found", "资源不存在"),
            GateError::InternalServerError => {
                ErrorResponse::new("Internal server error", "内部服务器错误")
            }
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(error: GateError) -> (StatusCode, serde_json::Value) {
        let response = error.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 4096).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn rate_limited_body_carries_retry_after() {
        let (status, body) = body_json(GateError::RateLimited { retry_after: 3600 }).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "Rate limit exceeded");
        assert_eq!(body["retry_after"], 3600);
        assert!(body.get("quota_reset").is_none());
    }

    #[tokio::test]
    async fn quota_body_always_has_reset_field() {
        let (status, body) = body_json(GateError::QuotaExceeded {
            message: "daily token budget exhausted".into(),
            quota_reset: None,
        })
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["message"], "daily token budget exhausted");
        assert!(body["quota_reset"].is_null());
        assert!(body.as_object().unwrap().contains_key("quota_reset"));
    }

    #[tokio::test]
    async fn validation_errors_map_to_http_codes() {
        let (status, _) = body_json(GateError::PayloadTooLarge).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        let (status, _) = body_json(GateError::UnsupportedMediaType).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn unavailable_hides_internal_details() {
        let (status, body) = body_json(GateError::Unavailable).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["retry_after"], 60);
        assert!(!body["message"].as_str().unwrap().contains("redis"));
    }
}
