use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::identifier::IdentityContext;

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("quota service request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("quota service answered {0} without a verdict")]
    Status(reqwest::StatusCode),
}

/// 当前计费周期内的剩余额度
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaRemaining {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaVerdict {
    pub allowed: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub remaining: Option<QuotaRemaining>,
    #[serde(default)]
    pub reset_time: Option<DateTime<Utc>>,
}

impl QuotaVerdict {
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            reason: None,
            message: None,
            remaining: None,
            reset_time: None,
        }
    }
}

/// 外部额度服务：限制累计用量（请求数、令牌数、费用），与请求频率无关
#[async_trait]
pub trait QuotaAuthority: Send + Sync {
    async fn check_quota(&self, context: &IdentityContext) -> Result<QuotaVerdict, QuotaError>;
}

/// 未配置额度服务时使用
pub struct UnlimitedQuota;

#[async_trait]
impl QuotaAuthority for UnlimitedQuota {
    async fn check_quota(&self, _context: &IdentityContext) -> Result<QuotaVerdict, QuotaError> {
        Ok(QuotaVerdict::unlimited())
    }
}

/// 通过 HTTP 调用额度服务 `POST {base}/quota/check`
pub struct HttpQuotaAuthority {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpQuotaAuthority {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, QuotaError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/quota/check", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl QuotaAuthority for HttpQuotaAuthority {
    async fn check_quota(&self, context: &IdentityContext) -> Result<QuotaVerdict, QuotaError> {
        let response = self.client.post(&self.endpoint).json(context).send().await?;
        let status = response.status();

        let verdict = if status.is_client_error() {
            let body = response.bytes().await?;
            verdict_from_client_error(status, &body)?
        } else {
            response.error_for_status()?.json::<QuotaVerdict>().await?
        };

        tracing::debug!(
            identifier = %context.identifier,
            allowed = verdict.allowed,
            "Quota verdict received"
        );
        Ok(verdict)
    }
}

/// 额度服务可能用 4xx（如 429）返回拒绝判定，只有无法解析出判定时才视为故障
fn verdict_from_client_error(
    status: reqwest::StatusCode,
    body: &[u8],
) -> Result<QuotaVerdict, QuotaError> {
    serde_json::from_slice::<QuotaVerdict>(body).map_err(|e| {
        tracing::debug!(%status, "Quota error response carries no verdict: {}", e);
        QuotaError::Status(status)
    })
}
