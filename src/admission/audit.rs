use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use super::identifier::IdentityContext;

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    RateLimited,
    QuotaExceeded,
    RequestCompleted,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::RateLimited => "rate_limited",
            AuditAction::QuotaExceeded => "quota_exceeded",
            AuditAction::RequestCompleted => "request_completed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub action: AuditAction,
    pub description: String,
    pub identifier: String,
    pub address: String,
    pub user_agent: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        action: AuditAction,
        description: impl Into<String>,
        context: &IdentityContext,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            description: description.into(),
            identifier: context.identifier.to_string(),
            address: context.signals.address.clone(),
            user_agent: context.signals.user_agent.clone(),
            metadata: metadata.unwrap_or_else(|| serde_json::json!({})),
            created_at: Utc::now(),
        }
    }
}

/// 审计记录的写入接口
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// 只写日志，未配置数据库时使用
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        tracing::info!(
            target: "audit",
            id = %event.id,
            action = event.action.as_str(),
            identifier = %event.identifier,
            metadata = %event.metadata,
            "{}",
            event.description
        );
        Ok(())
    }
}

/// 写入 `ai_audit_logs` 表
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        sqlx::query(
            r#"
            INSERT INTO ai_audit_logs
                (id, action, description, identifier, ip_address, user_agent, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.id)
        .bind(event.action.as_str())
        .bind(&event.description)
        .bind(&event.identifier)
        .bind(&event.address)
        .bind(event.user_agent.as_deref().unwrap_or_default())
        .bind(&event.metadata)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// 后台写入审计事件，失败只记日志，不影响请求
pub fn emit(sink: Arc<dyn AuditSink>, event: AuditEvent) {
    tokio::spawn(async move {
        if let Err(e) = sink.record(&event).await {
            tracing::error!(
                action = event.action.as_str(),
                identifier = %event.identifier,
                "Failed to log governance action: {}",
                e
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::IdentitySignals;

    fn context() -> IdentityContext {
        IdentityContext::new(IdentitySignals {
            user_id: Some("7".into()),
            address: "10.0.0.2".into(),
            user_agent: Some("curl/8.5".into()),
            ..Default::default()
        })
    }

    #[test]
    fn event_captures_identity_context() {
        let event = AuditEvent::new(
            AuditAction::RequestCompleted,
            "AI request completed in 0.25s",
            &context(),
            Some(serde_json::json!({ "processing_time": 0.25 })),
        );
        assert_eq!(event.identifier, "user:7");
        assert_eq!(event.address, "10.0.0.2");
        assert_eq!(event.user_agent.as_deref(), Some("curl/8.5"));
        assert_eq!(event.metadata["processing_time"], 0.25);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["action"], "request_completed");
    }

    #[test]
    fn metadata_defaults_to_empty_object() {
        let event = AuditEvent::new(AuditAction::RateLimited, "limited", &context(), None);
        assert_eq!(event.metadata, serde_json::json!({}));
    }

    #[tokio::test]
    async fn tracing_sink_never_fails() {
        let event = AuditEvent::new(AuditAction::QuotaExceeded, "quota", &context(), None);
        assert!(TracingAuditSink.record(&event).await.is_ok());
    }
}
