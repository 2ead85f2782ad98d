use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use redis::{AsyncCommands, Client as RedisClient};
use serde::{Serialize, de::DeserializeOwned};

use crate::cache::models::window::WindowEntry;

/// 单个键最多保留的时间跨度（最大窗口：一天）
pub const MAX_RETENTION_SECS: u64 = 86_400;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// 丢弃早于 `now - window` 的记录，窗口不超过 [`MAX_RETENTION_SECS`]
pub fn prune(entries: &mut Vec<WindowEntry>, now: f64, window_secs: u64) {
    let cutoff = now - window_secs.min(MAX_RETENTION_SECS) as f64;
    entries.retain(|entry| entry.timestamp > cutoff);
}

/// 带时间戳记录的共享键值存储
///
/// `append` 是读-改-写，不保证同一个键的并发追加是原子的。
/// 同一标识的并发请求可能让实际放行数短暂超过限额，超出量不超过并发数。
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// 读取窗口内的记录，键不存在时返回空列表
    async fn read(
        &self,
        key: &str,
        window_secs: u64,
        now: f64,
    ) -> Result<Vec<WindowEntry>, StoreError>;

    /// 追加一条记录，以该记录的时间为准重新裁剪后写回
    async fn append(
        &self,
        key: &str,
        window_secs: u64,
        entry: WindowEntry,
    ) -> Result<(), StoreError>;

    /// 读取耗时采样（按写入顺序）
    async fn samples(&self, key: &str) -> Result<Vec<f64>, StoreError>;

    /// 追加耗时采样，只保留最近 `capacity` 个
    async fn push_sample(
        &self,
        key: &str,
        sample: f64,
        capacity: usize,
        ttl_secs: u64,
    ) -> Result<(), StoreError>;
}

fn keep_last<T>(items: &mut Vec<T>, capacity: usize) {
    if items.len() > capacity {
        items.drain(..items.len() - capacity);
    }
}

/// Redis 实现，所有 worker 进程共享
#[derive(Clone)]
pub struct RedisWindowStore {
    redis: Arc<RedisClient>,
}

impl RedisWindowStore {
    pub fn new(redis: Arc<RedisClient>) -> Self {
        Self { redis }
    }

    async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, StoreError> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let result: Option<String> = conn.get(key).await?;

        match result {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save<T: Serialize>(&self, key: &str, items: &[T], ttl: u64) -> Result<(), StoreError> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let json = serde_json::to_string(items)?;

        let _: () = conn.set_ex(key, json, ttl.max(1)).await?;

        Ok(())
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn read(
        &self,
        key: &str,
        window_secs: u64,
        now: f64,
    ) -> Result<Vec<WindowEntry>, StoreError> {
        let mut entries = self.load(key).await?;
        prune(&mut entries, now, window_secs);
        Ok(entries)
    }

    async fn append(
        &self,
        key: &str,
        window_secs: u64,
        entry: WindowEntry,
    ) -> Result<(), StoreError> {
        let mut entries: Vec<WindowEntry> = self.load(key).await?;
        entries.push(entry);
        prune(&mut entries, entry.timestamp, window_secs);

        // 键的过期时间与窗口一致，过期后记录已无意义
        self.save(key, &entries, window_secs.min(MAX_RETENTION_SECS))
            .await
    }

    async fn samples(&self, key: &str) -> Result<Vec<f64>, StoreError> {
        self.load(key).await
    }

    async fn push_sample(
        &self,
        key: &str,
        sample: f64,
        capacity: usize,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        let mut samples: Vec<f64> = self.load(key).await?;
        samples.push(sample);
        keep_last(&mut samples, capacity);

        self.save(key, &samples, ttl_secs).await
    }
}

/// 进程内实现，用于单进程部署和测试
#[derive(Clone, Default)]
pub struct MemoryWindowStore {
    windows: Arc<Mutex<HashMap<String, Vec<WindowEntry>>>>,
    samples: Arc<Mutex<HashMap<String, Vec<f64>>>>,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn read(
        &self,
        key: &str,
        window_secs: u64,
        now: f64,
    ) -> Result<Vec<WindowEntry>, StoreError> {
        let windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = windows.get(key).cloned().unwrap_or_default();
        prune(&mut entries, now, window_secs);
        Ok(entries)
    }

    async fn append(
        &self,
        key: &str,
        window_secs: u64,
        entry: WindowEntry,
    ) -> Result<(), StoreError> {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let entries = windows.entry(key.to_string()).or_default();
        entries.push(entry);
        prune(entries, entry.timestamp, window_secs);
        if entries.is_empty() {
            windows.remove(key);
        }
        Ok(())
    }

    async fn samples(&self, key: &str) -> Result<Vec<f64>, StoreError> {
        let samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(samples.get(key).cloned().unwrap_or_default())
    }

    async fn push_sample(
        &self,
        key: &str,
        sample: f64,
        capacity: usize,
        _ttl_secs: u64,
    ) -> Result<(), StoreError> {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        let ring = samples.entry(key.to_string()).or_default();
        ring.push(sample);
        keep_last(ring, capacity);
        Ok(())
    }
}
