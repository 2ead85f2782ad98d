use crate::admission::Tier;

/// 请求时间戳窗口键前缀
const RATE_LIMIT_PREFIX: &str = "rate_limit:";

/// 令牌用量窗口键前缀
const TOKENS_PREFIX: &str = "tokens:";

/// 处理耗时采样键前缀
const PROCESSING_TIME_PREFIX: &str = "processing_time:";

/// 生成请求时间戳窗口键，如 `rate_limit:user:42:minute`
pub fn rate_limit_key(identifier: &str, tier: Tier) -> String {
    format!("{}{}:{}", RATE_LIMIT_PREFIX, identifier, tier.as_str())
}

/// 生成令牌用量窗口键
pub fn tokens_key(identifier: &str, tier: Tier) -> String {
    format!("{}{}:{}", TOKENS_PREFIX, identifier, tier.as_str())
}

/// 生成处理耗时采样键
pub fn processing_time_key(identifier: &str) -> String {
    format!("{}{}", PROCESSING_TIME_PREFIX, identifier)
}
