use std::sync::Arc;
use std::time::Instant;

use axum::http::{Method, StatusCode};
use chrono::{DateTime, Utc};
use serde_json::json;

use super::adaptive::{AdaptiveRateLimiter, AdmissionDecision};
use super::audit::{self, AuditAction, AuditEvent, AuditSink};
use super::identifier::IdentityContext;
use super::quota::{QuotaAuthority, QuotaRemaining, QuotaVerdict};
use crate::config::FailureMode;
use crate::error::GateError;

#[derive(Debug, Clone)]
pub struct GateSettings {
    /// 总开关，关闭后所有请求直接放行
    pub enabled: bool,
    /// 需要准入控制的路径前缀
    pub paths: Vec<String>,
    pub max_body_bytes: usize,
    pub failure_mode: FailureMode,
}

/// 下游处理器通过响应扩展上报本次实际消耗的令牌数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage(pub u64);

/// 放行后挂到请求上的上下文
#[derive(Debug, Clone)]
pub struct AdmissionContext {
    pub identity: IdentityContext,
    pub started_at: DateTime<Utc>,
    pub started: Instant,
    pub quota: Option<QuotaRemaining>,
    /// 故障放行时没有判定结果
    pub decision: Option<AdmissionDecision>,
}

/// 进入有状态检查之前的廉价校验结果
#[derive(Debug)]
pub enum Screening {
    Skip,
    Reject(GateError),
    Proceed,
}

/// 一次准入流程的终止状态
#[derive(Debug)]
pub enum GateOutcome {
    RefusedRate(AdmissionDecision),
    RefusedQuota(QuotaVerdict),
    Unavailable,
    Admitted(AdmissionContext),
}

impl GateOutcome {
    pub fn state(&self) -> &'static str {
        match self {
            GateOutcome::RefusedRate(_) => "refused_rate",
            GateOutcome::RefusedQuota(_) => "refused_quota",
            GateOutcome::Unavailable => "unavailable",
            GateOutcome::Admitted(_) => "admitted",
        }
    }

    /// 放行时返回上下文，否则返回带重试提示的错误
    pub fn into_result(self) -> Result<AdmissionContext, GateError> {
        match self {
            GateOutcome::Admitted(context) => Ok(context),
            GateOutcome::RefusedRate(decision) => Err(GateError::RateLimited {
                retry_after: decision.retry_after_seconds,
            }),
            GateOutcome::RefusedQuota(verdict) => Err(GateError::QuotaExceeded {
                message: verdict
                    .message
                    .unwrap_or_else(|| "AI 使用额度已用完".to_string()),
                quota_reset: verdict.reset_time,
            }),
            GateOutcome::Unavailable => Err(GateError::Unavailable),
        }
    }
}

fn is_mutating(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// 准入编排：限流 → 额度 → 放行，完成后回写用量并发出审计事件
pub struct AdmissionGate {
    limiter: AdaptiveRateLimiter,
    quota: Arc<dyn QuotaAuthority>,
    audit: Arc<dyn AuditSink>,
    settings: GateSettings,
}

impl AdmissionGate {
    pub fn new(
        limiter: AdaptiveRateLimiter,
        quota: Arc<dyn QuotaAuthority>,
        audit: Arc<dyn AuditSink>,
        settings: GateSettings,
    ) -> Self {
        Self {
            limiter,
            quota,
            audit,
            settings,
        }
    }

    pub fn limiter(&self) -> &AdaptiveRateLimiter {
        &self.limiter
    }

    pub fn settings(&self) -> &GateSettings {
        &self.settings
    }

    pub fn is_controlled(&self, path: &str) -> bool {
        self.settings.enabled
            && self
                .settings
                .paths
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// 路径过滤和无状态校验，不访问任何存储
    pub fn screen(
        &self,
        method: &Method,
        path: &str,
        content_type: Option<&str>,
        content_length: Option<u64>,
    ) -> Screening {
        if !self.is_controlled(path) {
            return Screening::Skip;
        }

        if content_length.is_some_and(|len| len > self.settings.max_body_bytes as u64) {
            return Screening::Reject(GateError::PayloadTooLarge);
        }

        if is_mutating(method) {
            if let Some(content_type) = content_type {
                if !content_type
                    .trim_start()
                    .to_ascii_lowercase()
                    .starts_with("application/json")
                {
                    return Screening::Reject(GateError::UnsupportedMediaType);
                }
            }
        }

        Screening::Proceed
    }

    pub async fn admit(&self, identity: IdentityContext) -> GateOutcome {
        let identifier = identity.identifier.clone();

        let decision = match self.limiter.decide(&identifier).await {
            Ok(decision) => Some(decision),
            Err(e) => match self.settings.failure_mode {
                FailureMode::Closed => {
                    tracing::error!(%identifier, "Rate limit check failed, refusing: {}", e);
                    return GateOutcome::Unavailable;
                }
                FailureMode::Open => {
                    tracing::warn!(%identifier, "Rate limit check failed, admitting: {}", e);
                    None
                }
            },
        };

        if let Some(decision) = decision.as_ref().filter(|d| !d.allowed) {
            tracing::info!(
                %identifier,
                retry_after = decision.retry_after_seconds,
                "Request refused by rate limiter"
            );
            self.audit(
                AuditAction::RateLimited,
                format!("Rate limit exceeded for {identifier}"),
                &identity,
                Some(json!({
                    "retry_after": decision.retry_after_seconds,
                    "refusal": decision.refusal,
                })),
            );
            return GateOutcome::RefusedRate(decision.clone());
        }

        let verdict = match self.quota.check_quota(&identity).await {
            Ok(verdict) => Some(verdict),
            Err(e) => match self.settings.failure_mode {
                FailureMode::Closed => {
                    tracing::error!(%identifier, "Quota check failed, refusing: {}", e);
                    return GateOutcome::Unavailable;
                }
                FailureMode::Open => {
                    tracing::warn!(%identifier, "Quota check failed, admitting: {}", e);
                    None
                }
            },
        };

        if let Some(verdict) = verdict.as_ref().filter(|v| !v.allowed) {
            tracing::info!(%identifier, reason = ?verdict.reason, "Request refused by quota");
            self.audit(
                AuditAction::QuotaExceeded,
                format!(
                    "Usage quota exceeded: {}",
                    verdict.reason.as_deref().unwrap_or("unspecified")
                ),
                &identity,
                Some(json!({ "quota_reset": verdict.reset_time })),
            );
            return GateOutcome::RefusedQuota(verdict.clone());
        }

        GateOutcome::Admitted(AdmissionContext {
            identity,
            started_at: Utc::now(),
            started: Instant::now(),
            quota: verdict.and_then(|v| v.remaining),
            decision,
        })
    }

    /// 回写用量与耗时，审计写入在后台进行
    pub async fn complete(&self, context: AdmissionContext, usage: TokenUsage, status: StatusCode) {
        let elapsed = context.started.elapsed().as_secs_f64();
        let identifier = &context.identity.identifier;

        if let Err(e) = self.limiter.record(identifier, usage.0, elapsed).await {
            tracing::error!(%identifier, "Failed to record request usage: {}", e);
        }

        self.audit(
            AuditAction::RequestCompleted,
            format!("AI request completed in {elapsed:.2}s"),
            &context.identity,
            Some(json!({
                "processing_time": elapsed,
                "status_code": status.as_u16(),
                "tokens_used": usage.0,
            })),
        );
    }

    fn audit(
        &self,
        action: AuditAction,
        description: String,
        identity: &IdentityContext,
        metadata: Option<serde_json::Value>,
    ) {
        audit::emit(
            self.audit.clone(),
            AuditEvent::new(action, description, identity, metadata),
        );
    }
}
