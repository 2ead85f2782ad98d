use std::sync::Arc;

use futures_util::future::try_join_all;
use serde::Serialize;

use super::identifier::Identifier;
use super::limits::{LimitConfig, Tier};
use crate::cache::keys::{rate_limit_key, tokens_key};
use crate::cache::{StoreError, WindowEntry, WindowStore};

/// 没有窗口超限时的默认等待时间（检查与查询之间状态可能已变化）
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// 当前 Unix 时间，秒（含小数）
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// 某个标识在三个窗口内的请求记录
#[derive(Debug, Clone, Default)]
pub struct TierWindows {
    pub minute: Vec<WindowEntry>,
    pub hour: Vec<WindowEntry>,
    pub day: Vec<WindowEntry>,
}

impl TierWindows {
    /// 按 `Tier::ALL` 的顺序组装读取结果
    fn from_reads(reads: Vec<Vec<WindowEntry>>) -> Self {
        let mut reads = reads.into_iter();
        Self {
            minute: reads.next().unwrap_or_default(),
            hour: reads.next().unwrap_or_default(),
            day: reads.next().unwrap_or_default(),
        }
    }

    pub fn get(&self, tier: Tier) -> &[WindowEntry] {
        match tier {
            Tier::Minute => &self.minute,
            Tier::Hour => &self.hour,
            Tier::Day => &self.day,
        }
    }

    /// 按窗口从小到大找到第一个达到上限的窗口
    pub fn first_failing(&self, limits: &LimitConfig) -> Option<Tier> {
        Tier::ALL
            .into_iter()
            .find(|tier| self.get(*tier).len() >= limits.tier(*tier).requests as usize)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowStats {
    pub requests_made: usize,
    pub requests_limit: u32,
    pub requests_remaining: u32,
    pub tokens_used: u64,
    pub tokens_limit: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub identifier: Identifier,
    pub minute: WindowStats,
    pub hour: WindowStats,
    pub day: WindowStats,
}

/// 分钟/小时/天三级限流
pub struct TieredRateLimiter {
    store: Arc<dyn WindowStore>,
    limits: LimitConfig,
}

impl TieredRateLimiter {
    pub fn new(store: Arc<dyn WindowStore>, limits: LimitConfig) -> Self {
        Self {
            store,
            limits: limits.normalized(),
        }
    }

    pub fn store(&self) -> &Arc<dyn WindowStore> {
        &self.store
    }

    /// 已登录用户的基准限额，未按标识类别折算
    pub fn baseline(&self) -> &LimitConfig {
        &self.limits
    }

    /// 该标识类别折算后的限额
    pub fn limits_for(&self, identifier: &Identifier) -> LimitConfig {
        self.limits.for_kind(identifier.kind())
    }

    pub async fn windows_at(
        &self,
        identifier: &Identifier,
        now: f64,
    ) -> Result<TierWindows, StoreError> {
        let id = identifier.to_string();
        let keys = Tier::ALL.map(|tier| rate_limit_key(&id, tier));
        let reads = Tier::ALL
            .iter()
            .zip(&keys)
            .map(|(tier, key)| self.store.read(key, tier.window_secs(), now));

        Ok(TierWindows::from_reads(try_join_all(reads).await?))
    }

    pub async fn is_allowed(&self, identifier: &Identifier) -> Result<bool, StoreError> {
        self.is_allowed_at(identifier, now_secs()).await
    }

    /// 三个窗口全部未达上限才放行
    pub async fn is_allowed_at(
        &self,
        identifier: &Identifier,
        now: f64,
    ) -> Result<bool, StoreError> {
        let windows = self.windows_at(identifier, now).await?;
        Ok(windows.first_failing(&self.limits_for(identifier)).is_none())
    }

    pub async fn retry_after(&self, identifier: &Identifier) -> Result<u64, StoreError> {
        self.retry_after_at(identifier, now_secs()).await
    }

    pub async fn retry_after_at(
        &self,
        identifier: &Identifier,
        now: f64,
    ) -> Result<u64, StoreError> {
        let windows = self.windows_at(identifier, now).await?;
        Ok(windows
            .first_failing(&self.limits_for(identifier))
            .map(Tier::window_secs)
            .unwrap_or(DEFAULT_RETRY_AFTER_SECS))
    }

    /// 无条件写入三个窗口，只应对实际处理或计费的请求调用
    pub async fn record(&self, identifier: &Identifier, tokens_used: u64) -> Result<(), StoreError> {
        self.record_at(identifier, tokens_used, now_secs()).await
    }

    pub async fn record_at(
        &self,
        identifier: &Identifier,
        tokens_used: u64,
        now: f64,
    ) -> Result<(), StoreError> {
        let id = identifier.to_string();
        let request_keys = Tier::ALL.map(|tier| rate_limit_key(&id, tier));
        let appends = Tier::ALL.iter().zip(&request_keys).map(|(tier, key)| {
            self.store
                .append(key, tier.window_secs(), WindowEntry::request(now))
        });
        try_join_all(appends).await?;

        if tokens_used > 0 {
            let token_keys = Tier::ALL.map(|tier| tokens_key(&id, tier));
            let appends = Tier::ALL.iter().zip(&token_keys).map(|(tier, key)| {
                self.store.append(
                    key,
                    tier.window_secs(),
                    WindowEntry::with_tokens(now, tokens_used),
                )
            });
            try_join_all(appends).await?;
        }

        Ok(())
    }

    pub async fn usage_stats(&self, identifier: &Identifier) -> Result<UsageStats, StoreError> {
        self.usage_stats_at(identifier, now_secs()).await
    }

    pub async fn usage_stats_at(
        &self,
        identifier: &Identifier,
        now: f64,
    ) -> Result<UsageStats, StoreError> {
        let limits = self.limits_for(identifier);
        let id = identifier.to_string();
        let windows = self.windows_at(identifier, now).await?;

        let token_keys = Tier::ALL.map(|tier| tokens_key(&id, tier));
        let reads = Tier::ALL
            .iter()
            .zip(&token_keys)
            .map(|(tier, key)| self.store.read(key, tier.window_secs(), now));
        let tokens = TierWindows::from_reads(try_join_all(reads).await?);

        let stats_for = |tier: Tier| {
            let limit = limits.tier(tier);
            let made = windows.get(tier).len();
            WindowStats {
                requests_made: made,
                requests_limit: limit.requests,
                requests_remaining: limit.requests.saturating_sub(made as u32),
                tokens_used: tokens.get(tier).iter().map(|entry| entry.tokens).sum(),
                tokens_limit: limit.tokens,
            }
        };

        Ok(UsageStats {
            identifier: identifier.clone(),
            minute: stats_for(Tier::Minute),
            hour: stats_for(Tier::Hour),
            day: stats_for(Tier::Day),
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::Barrier;

    use super::*;
    use crate::cache::MemoryWindowStore;

    /// 分钟窗口的读取在屏障处汇合，让同一批请求都在任何写入之前完成检查
    struct LockstepStore {
        inner: MemoryWindowStore,
        barrier: Barrier,
    }

    #[async_trait]
    impl WindowStore for LockstepStore {
        async fn read(
            &self,
            key: &str,
            window_secs: u64,
            now: f64,
        ) -> Result<Vec<WindowEntry>, StoreError> {
            let entries = self.inner.read(key, window_secs, now).await?;
            if key.ends_with(":minute") {
                self.barrier.wait().await;
            }
            tokio::task::yield_now().await;
            Ok(entries)
        }

        async fn append(
            &self,
            key: &str,
            window_secs: u64,
            entry: WindowEntry,
        ) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.inner.append(key, window_secs, entry).await
        }

        async fn samples(&self, key: &str) -> Result<Vec<f64>, StoreError> {
            self.inner.samples(key).await
        }

        async fn push_sample(
            &self,
            key: &str,
            sample: f64,
            capacity: usize,
            ttl_secs: u64,
        ) -> Result<(), StoreError> {
            self.inner.push_sample(key, sample, capacity, ttl_secs).await
        }
    }

    const NOW: f64 = 1_700_000_000.0;

    fn limiter() -> (TieredRateLimiter, Arc<MemoryWindowStore>) {
        let store = Arc::new(MemoryWindowStore::new());
        (
            TieredRateLimiter::new(store.clone(), LimitConfig::default()),
            store,
        )
    }

    fn user() -> Identifier {
        Identifier::User("alice".into())
    }

    #[tokio::test]
    async fn cold_start_is_allowed() {
        let (limiter, _) = limiter();
        for id in [
            user(),
            Identifier::Session("s".into()),
            Identifier::Address("10.1.1.1".into()),
        ] {
            assert!(limiter.is_allowed_at(&id, NOW).await.unwrap());
        }
    }

    #[tokio::test]
    async fn full_minute_window_refuses_with_minute_retry() {
        // 10 条记录分布在 t-50s .. t-5s
        let (limiter, _) = limiter();
        for i in 1..=10 {
            limiter
                .record_at(&user(), 0, NOW - 5.0 * i as f64)
                .await
                .unwrap();
        }
        assert!(!limiter.is_allowed_at(&user(), NOW).await.unwrap());
        assert_eq!(limiter.retry_after_at(&user(), NOW).await.unwrap(), 60);
    }

    #[tokio::test]
    async fn below_limit_is_allowed() {
        let (limiter, _) = limiter();
        for i in 1..=9 {
            limiter.record_at(&user(), 0, NOW - i as f64).await.unwrap();
        }
        assert!(limiter.is_allowed_at(&user(), NOW).await.unwrap());
        assert_eq!(
            limiter.retry_after_at(&user(), NOW).await.unwrap(),
            DEFAULT_RETRY_AFTER_SECS
        );
    }

    #[tokio::test]
    async fn entries_age_out_of_minute_window() {
        let (limiter, _) = limiter();
        for i in 0..10 {
            limiter
                .record_at(&user(), 0, NOW + i as f64)
                .await
                .unwrap();
        }
        assert!(!limiter.is_allowed_at(&user(), NOW + 10.0).await.unwrap());
        // 第一条记录在 NOW+60 到期
        assert!(limiter.is_allowed_at(&user(), NOW + 60.5).await.unwrap());
    }

    #[tokio::test]
    async fn hour_tier_refuses_after_minute_clears() {
        let (limiter, _) = limiter();
        // 100 条记录分散在过去一小时内，每分钟内不超过 2 条
        for i in 0..100 {
            limiter
                .record_at(&user(), 0, NOW - 3_500.0 + 35.0 * i as f64)
                .await
                .unwrap();
        }
        let at = NOW + 30.0;
        assert!(!limiter.is_allowed_at(&user(), at).await.unwrap());
        assert_eq!(limiter.retry_after_at(&user(), at).await.unwrap(), 3_600);
    }

    #[tokio::test]
    async fn day_tier_reports_day_retry() {
        let store = Arc::new(MemoryWindowStore::new());
        let limits = LimitConfig {
            day: crate::admission::limits::TierLimit {
                requests: 3,
                tokens: 100,
            },
            ..LimitConfig::default()
        };
        let limiter = TieredRateLimiter::new(store, limits);
        for offset in [40_000.0, 20_000.0, 10_000.0] {
            limiter.record_at(&user(), 0, NOW - offset).await.unwrap();
        }
        assert!(!limiter.is_allowed_at(&user(), NOW).await.unwrap());
        assert_eq!(limiter.retry_after_at(&user(), NOW).await.unwrap(), 86_400);
    }

    #[tokio::test]
    async fn address_identity_hits_stricter_limit() {
        let (limiter, _) = limiter();
        let addr = Identifier::Address("203.0.113.7".into());
        limiter.record_at(&addr, 0, NOW - 2.0).await.unwrap();
        assert!(limiter.is_allowed_at(&addr, NOW).await.unwrap());
        limiter.record_at(&addr, 0, NOW - 1.0).await.unwrap();
        // 地址类限额为 10 / 4 = 2
        assert!(!limiter.is_allowed_at(&addr, NOW).await.unwrap());
        // 同样的记录数对用户不构成限制
        assert!(limiter.is_allowed_at(&user(), NOW).await.unwrap());
    }

    #[tokio::test]
    async fn usage_stats_count_requests_and_tokens() {
        let (limiter, _) = limiter();
        for i in 0..3 {
            limiter
                .record_at(&user(), 100, NOW - i as f64)
                .await
                .unwrap();
        }
        let stats = limiter.usage_stats_at(&user(), NOW).await.unwrap();
        assert_eq!(stats.minute.requests_made, 3);
        assert_eq!(stats.minute.requests_remaining, 7);
        assert_eq!(stats.minute.tokens_used, 300);
        assert_eq!(stats.minute.tokens_limit, 10_000);
        assert_eq!(stats.day.requests_remaining, 997);
    }

    #[tokio::test]
    async fn smallest_failing_window_wins() {
        let store = Arc::new(MemoryWindowStore::new());
        let limits = LimitConfig {
            day: crate::admission::limits::TierLimit {
                requests: 50,
                tokens: 100,
            },
            ..LimitConfig::default()
        };
        let limiter = TieredRateLimiter::new(store, limits);
        // 100 条记录都在最近一分钟内，三个窗口同时超限
        for i in 0..100 {
            limiter
                .record_at(&user(), 0, NOW - 50.0 + 0.5 * i as f64)
                .await
                .unwrap();
        }
        let windows = limiter.windows_at(&user(), NOW).await.unwrap();
        assert_eq!(windows.minute.len(), 100);
        assert!(!limiter.is_allowed_at(&user(), NOW).await.unwrap());
        assert_eq!(limiter.retry_after_at(&user(), NOW).await.unwrap(), 60);

        // 分钟窗口清空后由小时窗口决定
        let later = NOW + 61.0;
        assert_eq!(limiter.retry_after_at(&user(), later).await.unwrap(), 3_600);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_check_then_record_overshoots_within_bound() {
        let concurrency = 4;
        let store = Arc::new(LockstepStore {
            inner: MemoryWindowStore::new(),
            barrier: Barrier::new(concurrency),
        });
        let limiter = Arc::new(TieredRateLimiter::new(store, LimitConfig::default()));
        let mut admitted = 0;

        for _ in 0..10 {
            let batch = (0..concurrency).map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    let id = Identifier::User("hot".into());
                    if limiter.is_allowed(&id).await.unwrap() {
                        limiter.record(&id, 0).await.unwrap();
                        true
                    } else {
                        false
                    }
                })
            });
            for handle in futures_util::future::join_all(batch).await {
                if handle.unwrap() {
                    admitted += 1;
                }
            }
        }

        // 每批都在写入前完成检查：0 → 4 → 8 → 12，之后全部拒绝
        assert_eq!(admitted, 12);
        assert!(admitted > 10, "admitted {admitted}");
        assert!(admitted <= 10 + concurrency - 1, "admitted {admitted}");
    }
}
