use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::identifier::Identifier;
use super::limits::{LimitConfig, Tier};
use super::tiered::{
    DEFAULT_RETRY_AFTER_SECS, TierWindows, TieredRateLimiter, UsageStats, now_secs,
};
use crate::cache::StoreError;
use crate::cache::keys::processing_time_key;

pub const MIN_LOAD_FACTOR: f64 = 0.1;
pub const MAX_LOAD_FACTOR: f64 = 5.0;

/// 自适应阈值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveConfig {
    /// 负载系数超过该值时收紧分钟限额
    pub load_threshold: f64,
    /// 最近两次请求间隔小于该值视为异常
    pub min_request_interval_secs: f64,
    /// 平均处理耗时超过该值视为异常
    pub slow_mean_secs: f64,
    pub slow_min_samples: usize,
    pub sample_capacity: usize,
    pub sample_ttl_secs: u64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            load_threshold: 1.5,
            min_request_interval_secs: 1.0,
            slow_mean_secs: 10.0,
            slow_min_samples: 5,
            sample_capacity: 10,
            sample_ttl_secs: 3_600,
        }
    }
}

/// 拒绝原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "gate", content = "tier")]
pub enum Refusal {
    Tier(Tier),
    Load,
    RapidRequests,
    SlowRequests,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Remaining {
    pub minute: u32,
    pub hour: u32,
    pub day: u32,
}

/// 单次准入判定，不做持久化
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub retry_after_seconds: u64,
    pub remaining: Remaining,
    pub identifier: Identifier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refusal: Option<Refusal>,
}

/// 在三级限流之上叠加负载门和行为门
///
/// 负载系数只保存在当前进程内，多进程部署时各 worker 独立调整。
pub struct AdaptiveRateLimiter {
    base: TieredRateLimiter,
    config: AdaptiveConfig,
    load_factor: AtomicU64,
}

impl AdaptiveRateLimiter {
    pub fn new(base: TieredRateLimiter, config: AdaptiveConfig) -> Self {
        Self {
            base,
            config,
            load_factor: AtomicU64::new(1.0_f64.to_bits()),
        }
    }

    pub fn base(&self) -> &TieredRateLimiter {
        &self.base
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    pub fn load_factor(&self) -> f64 {
        f64::from_bits(self.load_factor.load(Ordering::Relaxed))
    }

    /// 负载系数的唯一写入口，结果限制在 [0.1, 5.0]
    pub fn update_load(&self, factor: f64) -> f64 {
        if factor.is_nan() {
            tracing::warn!("Ignoring NaN load factor");
            return self.load_factor();
        }
        let clamped = factor.clamp(MIN_LOAD_FACTOR, MAX_LOAD_FACTOR);
        self.load_factor.store(clamped.to_bits(), Ordering::Relaxed);
        tracing::info!(load_factor = clamped, "System load factor updated");
        clamped
    }

    /// 高负载时按基准分钟限额收紧后的值，未超过阈值时为 `None`
    pub fn load_minute_limit(&self) -> Option<u32> {
        let load = self.load_factor();
        (load > self.config.load_threshold).then(|| {
            let baseline = self.base.baseline().minute.requests;
            ((baseline as f64 / load).floor() as u32).max(1)
        })
    }

    /// 当前负载下该标识实际可用的分钟限额
    pub fn effective_minute_limit(&self, identifier: &Identifier) -> u32 {
        let class_limit = self.base.limits_for(identifier).minute.requests;
        match self.load_minute_limit() {
            Some(limit) => class_limit.min(limit),
            None => class_limit,
        }
    }

    pub async fn is_allowed(&self, identifier: &Identifier) -> Result<bool, StoreError> {
        self.is_allowed_at(identifier, now_secs()).await
    }

    pub async fn is_allowed_at(
        &self,
        identifier: &Identifier,
        now: f64,
    ) -> Result<bool, StoreError> {
        Ok(self.decide_at(identifier, now).await?.allowed)
    }

    pub async fn decide(&self, identifier: &Identifier) -> Result<AdmissionDecision, StoreError> {
        self.decide_at(identifier, now_secs()).await
    }

    /// 先过三级限额，通过后再依次检查负载门和行为门
    pub async fn decide_at(
        &self,
        identifier: &Identifier,
        now: f64,
    ) -> Result<AdmissionDecision, StoreError> {
        let limits = self.base.limits_for(identifier);
        let windows = self.base.windows_at(identifier, now).await?;

        let refusal = match windows.first_failing(&limits) {
            Some(tier) => Some(Refusal::Tier(tier)),
            None => self.adaptive_refusal(identifier, &windows).await?,
        };

        let retry_after_seconds = match refusal {
            Some(Refusal::Tier(tier)) => tier.window_secs(),
            _ => DEFAULT_RETRY_AFTER_SECS,
        };

        Ok(AdmissionDecision {
            allowed: refusal.is_none(),
            retry_after_seconds,
            remaining: remaining(&windows, &limits, self.effective_minute_limit(identifier)),
            identifier: identifier.clone(),
            refusal,
        })
    }

    async fn adaptive_refusal(
        &self,
        identifier: &Identifier,
        windows: &TierWindows,
    ) -> Result<Option<Refusal>, StoreError> {
        if let Some(limit) = self.load_minute_limit() {
            if windows.minute.len() >= limit as usize {
                tracing::debug!(%identifier, limit, "Refused by load gate");
                return Ok(Some(Refusal::Load));
            }
        }

        if let [.., previous, last] = windows.minute.as_slice() {
            if last.timestamp - previous.timestamp < self.config.min_request_interval_secs {
                tracing::warn!(%identifier, "Suspicious rapid requests detected");
                return Ok(Some(Refusal::RapidRequests));
            }
        }

        let samples = self
            .base
            .store()
            .samples(&processing_time_key(&identifier.to_string()))
            .await?;
        if samples.len() >= self.config.slow_min_samples.max(1) {
            let mean = samples.iter().sum::<f64>() / samples.len() as f64;
            if mean > self.config.slow_mean_secs {
                tracing::warn!(%identifier, mean, "Suspicious slow request pattern detected");
                return Ok(Some(Refusal::SlowRequests));
            }
        }

        Ok(None)
    }

    pub async fn retry_after(&self, identifier: &Identifier) -> Result<u64, StoreError> {
        self.base.retry_after(identifier).await
    }

    pub async fn usage_stats(&self, identifier: &Identifier) -> Result<UsageStats, StoreError> {
        self.base.usage_stats(identifier).await
    }

    /// 记录一次已处理的请求及其耗时
    pub async fn record(
        &self,
        identifier: &Identifier,
        tokens_used: u64,
        processing_secs: f64,
    ) -> Result<(), StoreError> {
        self.base.record(identifier, tokens_used).await?;
        self.record_processing_time(identifier, processing_secs).await
    }

    pub async fn record_processing_time(
        &self,
        identifier: &Identifier,
        processing_secs: f64,
    ) -> Result<(), StoreError> {
        self.base
            .store()
            .push_sample(
                &processing_time_key(&identifier.to_string()),
                processing_secs,
                self.config.sample_capacity.max(1),
                self.config.sample_ttl_secs,
            )
            .await
    }
}

fn remaining(windows: &TierWindows, limits: &LimitConfig, minute_limit: u32) -> Remaining {
    let left = |limit: u32, tier: Tier| limit.saturating_sub(windows.get(tier).len() as u32);
    Remaining {
        minute: left(minute_limit, Tier::Minute),
        hour: left(limits.hour.requests, Tier::Hour),
        day: left(limits.day.requests, Tier::Day),
    }
}
