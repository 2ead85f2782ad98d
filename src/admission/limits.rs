use serde::Serialize;

use super::identifier::IdentifierKind;

/// 三个固定的计数窗口
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Minute,
    Hour,
    Day,
}

impl Tier {
    /// 按窗口从小到大排列
    pub const ALL: [Tier; 3] = [Tier::Minute, Tier::Hour, Tier::Day];

    pub fn window_secs(self) -> u64 {
        match self {
            Tier::Minute => 60,
            Tier::Hour => 3_600,
            Tier::Day => 86_400,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Minute => "minute",
            Tier::Hour => "hour",
            Tier::Day => "day",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierLimit {
    pub requests: u32,
    pub tokens: u64,
}

/// 各窗口的请求数与令牌数上限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimitConfig {
    pub minute: TierLimit,
    pub hour: TierLimit,
    pub day: TierLimit,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            minute: TierLimit {
                requests: 10,
                tokens: 10_000,
            },
            hour: TierLimit {
                requests: 100,
                tokens: 100_000,
            },
            day: TierLimit {
                requests: 1_000,
                tokens: 1_000_000,
            },
        }
    }
}

impl LimitConfig {
    pub fn tier(&self, tier: Tier) -> TierLimit {
        match tier {
            Tier::Minute => self.minute,
            Tier::Hour => self.hour,
            Tier::Day => self.day,
        }
    }

    /// 所有上限至少为 1
    pub fn normalized(mut self) -> Self {
        for limit in [&mut self.minute, &mut self.hour, &mut self.day] {
            limit.requests = limit.requests.max(1);
            limit.tokens = limit.tokens.max(1);
        }
        self
    }

    /// 按标识类别折算：会话取分钟限额的 1/2，地址取 1/4
    pub fn for_kind(&self, kind: IdentifierKind) -> Self {
        let mut limits = self.normalized();
        let base = limits.minute.requests;
        limits.minute.requests = match kind {
            IdentifierKind::User => base,
            IdentifierKind::Session => (base / 2).max(1),
            IdentifierKind::Address => (base / 4).max(1),
        };
        limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_are_ordered_by_window() {
        let windows: Vec<u64> = Tier::ALL.iter().map(|t| t.window_secs()).collect();
        assert_eq!(windows, vec![60, 3_600, 86_400]);
    }

    #[test]
    fn anonymous_classes_get_stricter_minute_limits() {
        let base = LimitConfig::default();
        assert_eq!(base.for_kind(IdentifierKind::User).minute.requests, 10);
        assert_eq!(base.for_kind(IdentifierKind::Session).minute.requests, 5);
        assert_eq!(base.for_kind(IdentifierKind::Address).minute.requests, 2);
        // 小时和天的限额不折算
        assert_eq!(base.for_kind(IdentifierKind::Address).hour.requests, 100);
    }

    #[test]
    fn adjusted_limits_never_drop_below_one() {
        for requests in [0, 1, 2, 3, 7] {
            let mut base = LimitConfig::default();
            base.minute.requests = requests;
            for kind in [
                IdentifierKind::User,
                IdentifierKind::Session,
                IdentifierKind::Address,
            ] {
                let adjusted = base.for_kind(kind).minute.requests;
                assert!(adjusted >= 1);
                assert!(adjusted <= base.normalized().minute.requests);
            }
        }
    }

    #[test]
    fn normalized_floors_zero_limits() {
        let config = LimitConfig {
            minute: TierLimit {
                requests: 0,
                tokens: 0,
            },
            ..LimitConfig::default()
        }
        .normalized();
        assert_eq!(config.minute.requests, 1);
        assert_eq!(config.minute.tokens, 1);
    }
}
