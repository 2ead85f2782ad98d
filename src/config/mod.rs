use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::admission::{AdaptiveConfig, GateSettings, LimitConfig, TierLimit};

/// 基础设施故障（缓存或额度服务不可达）时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// 放行并记录告警
    Open,
    /// 拒绝请求
    Closed,
}

impl FromStr for FailureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(FailureMode::Open),
            "closed" => Ok(FailureMode::Closed),
            other => Err(format!("unknown failure mode: {other}")),
        }
    }
}

pub const DEFAULT_ADMISSION_PATHS: [&str; 4] = [
    "/api/v1/ai-governance/",
    "/api/v1/chat/",
    "/api/v1/generate/",
    "/api/v1/analyze/",
];

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub redis_url: String,
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub server_host: String,
    pub server_port: u16,
    pub admission_enabled: bool,
    pub admission_paths: Vec<String>,
    pub max_body_bytes: usize,
    pub rate_limit_per_minute: u32,
    pub rate_limit_per_hour: u32,
    pub rate_limit_per_day: u32,
    pub token_limit_per_minute: u64,
    pub token_limit_per_hour: u64,
    pub token_limit_per_day: u64,
    pub load_threshold: f64,
    pub min_request_interval_secs: f64,
    pub slow_request_mean_secs: f64,
    pub slow_request_min_samples: usize,
    pub processing_sample_capacity: usize,
    pub sample_ttl_secs: u64,
    pub failure_mode: FailureMode,
    pub quota_service_url: Option<String>,
    pub quota_timeout_ms: u64,
    pub upstream_url: Option<String>,
    pub ops_token: Option<String>,
    pub session_cookie: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1/".to_string(),
            database_url: None,
            jwt_secret: String::new(),
            server_host: "::".to_string(),
            server_port: 3000,
            admission_enabled: true,
            admission_paths: DEFAULT_ADMISSION_PATHS.map(String::from).to_vec(),
            max_body_bytes: 1024 * 1024,
            rate_limit_per_minute: 10,
            rate_limit_per_hour: 100,
            rate_limit_per_day: 1_000,
            token_limit_per_minute: 10_000,
            token_limit_per_hour: 100_000,
            token_limit_per_day: 1_000_000,
            load_threshold: 1.5,
            min_request_interval_secs: 1.0,
            slow_request_mean_secs: 10.0,
            slow_request_min_samples: 5,
            processing_sample_capacity: 10,
            sample_ttl_secs: 3_600,
            failure_mode: FailureMode::Closed,
            quota_service_url: None,
            quota_timeout_ms: 500,
            upstream_url: None,
            ops_token: None,
            session_cookie: "sessionid".to_string(),
        }
    }
}

/// 读取可选环境变量，缺失或解析失败时使用默认值
fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid value for {}, using default", key);
            default
        }),
        Err(_) => default,
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        dotenv::dotenv().ok();

        let defaults = Config::default();
        let admission_paths = env_optional("ADMISSION_PATHS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or(defaults.admission_paths);

        Ok(Config {
            redis_url: env::var("REDIS_URL")?,
            database_url: env_optional("DATABASE_URL"),
            jwt_secret: env::var("JWT_SECRET")?,
            server_host: env::var("SERVER_HOST").unwrap_or(defaults.server_host),
            server_port: env_parse("SERVER_PORT", defaults.server_port),
            admission_enabled: env_parse("ADMISSION_ENABLED", defaults.admission_enabled),
            admission_paths,
            max_body_bytes: env_parse("MAX_BODY_BYTES", defaults.max_body_bytes),
            rate_limit_per_minute: env_parse("RATE_LIMIT_PER_MINUTE", defaults.rate_limit_per_minute),
            rate_limit_per_hour: env_parse("RATE_LIMIT_PER_HOUR", defaults.rate_limit_per_hour),
            rate_limit_per_day: env_parse("RATE_LIMIT_PER_DAY", defaults.rate_limit_per_day),
            token_limit_per_minute: env_parse("TOKEN_LIMIT_PER_MINUTE", defaults.token_limit_per_minute),
            token_limit_per_hour: env_parse("TOKEN_LIMIT_PER_HOUR", defaults.token_limit_per_hour),
            token_limit_per_day: env_parse("TOKEN_LIMIT_PER_DAY", defaults.token_limit_per_day),
            load_threshold: env_parse("LOAD_THRESHOLD", defaults.load_threshold),
            min_request_interval_secs: env_parse(
                "MIN_REQUEST_INTERVAL_SECS",
                defaults.min_request_interval_secs,
            ),
            slow_request_mean_secs: env_parse("SLOW_REQUEST_MEAN_SECS", defaults.slow_request_mean_secs),
            slow_request_min_samples: env_parse(
                "SLOW_REQUEST_MIN_SAMPLES",
                defaults.slow_request_min_samples,
            ),
            processing_sample_capacity: env_parse(
                "PROCESSING_SAMPLE_CAPACITY",
                defaults.processing_sample_capacity,
            ),
            sample_ttl_secs: env_parse("SAMPLE_TTL_SECS", defaults.sample_ttl_secs),
            failure_mode: env_parse("FAILURE_MODE", defaults.failure_mode),
            quota_service_url: env_optional("QUOTA_SERVICE_URL"),
            quota_timeout_ms: env_parse("QUOTA_TIMEOUT_MS", defaults.quota_timeout_ms),
            upstream_url: env_optional("UPSTREAM_URL"),
            ops_token: env_optional("OPS_TOKEN"),
            session_cookie: env::var("SESSION_COOKIE").unwrap_or(defaults.session_cookie),
        })
    }

    pub fn quota_timeout(&self) -> Duration {
        Duration::from_millis(self.quota_timeout_ms)
    }

    pub fn limit_config(&self) -> LimitConfig {
        LimitConfig {
            minute: TierLimit {
                requests: self.rate_limit_per_minute,
                tokens: self.token_limit_per_minute,
            },
            hour: TierLimit {
                requests: self.rate_limit_per_hour,
                tokens: self.token_limit_per_hour,
            },
            day: TierLimit {
                requests: self.rate_limit_per_day,
                tokens: self.token_limit_per_day,
            },
        }
        .normalized()
    }

    pub fn adaptive_config(&self) -> AdaptiveConfig {
        AdaptiveConfig {
            load_threshold: self.load_threshold,
            min_request_interval_secs: self.min_request_interval_secs,
            slow_mean_secs: self.slow_request_mean_secs,
            slow_min_samples: self.slow_request_min_samples,
            sample_capacity: self.processing_sample_capacity,
            sample_ttl_secs: self.sample_ttl_secs,
        }
    }

    pub fn gate_settings(&self) -> GateSettings {
        GateSettings {
            enabled: self.admission_enabled,
            paths: self.admission_paths.clone(),
            max_body_bytes: self.max_body_bytes,
            failure_mode: self.failure_mode,
        }
    }
}
