//! AI 请求准入控制
//!
//! 请求在进入模型调用之前依次经过：标识解析 → 三级限流 → 自适应门 → 额度检查。
//! 完成后把用量写回滑动窗口，形成闭环。

pub mod adaptive;
pub mod audit;
pub mod gate;
pub mod identifier;
pub mod limits;
pub mod quota;
pub mod tiered;

pub use adaptive::{AdaptiveConfig, AdaptiveRateLimiter, AdmissionDecision, Refusal, Remaining};
pub use audit::{AuditAction, AuditError, AuditEvent, AuditSink, PgAuditSink, TracingAuditSink};
pub use gate::{AdmissionContext, AdmissionGate, GateOutcome, GateSettings, Screening, TokenUsage};
pub use identifier::{Identifier, IdentifierKind, IdentityContext, IdentitySignals, resolve};
pub use limits::{LimitConfig, Tier, TierLimit};
pub use quota::{
    HttpQuotaAuthority, QuotaAuthority, QuotaError, QuotaRemaining, QuotaVerdict, UnlimitedQuota,
};
pub use tiered::{
    DEFAULT_RETRY_AFTER_SECS, TierWindows, TieredRateLimiter, UsageStats, WindowStats, now_secs,
};
