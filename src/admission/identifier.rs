use std::fmt;

use serde::{Serialize, Serializer};

/// 标识类别，决定基准限额的折算比例
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifierKind {
    User,
    Session,
    Address,
}

/// 准入控制的唯一计数键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    User(String),
    Session(String),
    Address(String),
}

impl Identifier {
    pub fn kind(&self) -> IdentifierKind {
        match self {
            Identifier::User(_) => IdentifierKind::User,
            Identifier::Session(_) => IdentifierKind::Session,
            Identifier::Address(_) => IdentifierKind::Address,
        }
    }

    /// 解析 `user:<id>` / `session:<id>` / `address:<ip>` 形式的字符串
    pub fn parse(raw: &str) -> Option<Self> {
        let (kind, value) = raw.split_once(':')?;
        if value.is_empty() {
            return None;
        }
        match kind {
            "user" => Some(Identifier::User(value.to_string())),
            "session" => Some(Identifier::Session(value.to_string())),
            "address" => Some(Identifier::Address(value.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::User(id) => write!(f, "user:{id}"),
            Identifier::Session(id) => write!(f, "session:{id}"),
            Identifier::Address(ip) => write!(f, "address:{ip}"),
        }
    }
}

impl Serialize for Identifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// 请求携带的身份信号
#[derive(Debug, Clone, Default, Serialize)]
pub struct IdentitySignals {
    /// 已认证用户 ID，只有认证通过时才有值
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// 身份信号与解析出的标识，贯穿整个请求生命周期
#[derive(Debug, Clone, Serialize)]
pub struct IdentityContext {
    pub identifier: Identifier,
    #[serde(flatten)]
    pub signals: IdentitySignals,
}

impl IdentityContext {
    pub fn new(signals: IdentitySignals) -> Self {
        let identifier = resolve(
            signals.user_id.as_deref(),
            signals.session_id.as_deref(),
            &signals.address,
        );
        Self {
            identifier,
            signals,
        }
    }
}

/// 优先级：已认证用户 > 会话 > 网络地址
pub fn resolve(user_id: Option<&str>, session_id: Option<&str>, address: &str) -> Identifier {
    if let Some(id) = user_id.filter(|id| !id.is_empty()) {
        Identifier::User(id.to_string())
    } else if let Some(session) = session_id.filter(|s| !s.is_empty()) {
        Identifier::Session(session.to_string())
    } else {
        Identifier::Address(address.to_string())
    }
}
