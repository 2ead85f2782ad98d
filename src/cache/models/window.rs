use serde::{Deserialize, Serialize};

/// 滑动窗口中的一条记录
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct WindowEntry {
    pub timestamp: f64, // Unix timestamp，秒（含小数）
    #[serde(default, skip_serializing_if = "is_zero")]
    pub tokens: u64,
}

impl WindowEntry {
    pub fn request(timestamp: f64) -> Self {
        Self {
            timestamp,
            tokens: 0,
        }
    }

    pub fn with_tokens(timestamp: f64, tokens: u64) -> Self {
        Self { timestamp, tokens }
    }
}

fn is_zero(tokens: &u64) -> bool {
    *tokens == 0
}
