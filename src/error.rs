use crate::investigation::Phase;
use std::fmt;

/// 调查状态管理的统一错误类型
#[derive(Debug)]
pub enum InvestigationError {
    /// 存储后端错误
    Store(StoreError),
    /// 状态 / 会话错误
    State(StateError),
    /// 配置错误
    Config(ConfigError),
    /// IO 错误
    Io(std::io::Error),
    /// 其他错误
    Other(String),
}

/// 存储后端错误
#[derive(Debug)]
pub enum StoreError {
    /// 后端不可达，或单次操作超出存储超时
    Unavailable { op: String, reason: String },
    /// 调用方给出的 deadline 已耗尽
    Timeout { op: String },
}

/// 状态 / 会话错误
#[derive(Debug)]
pub enum StateError {
    /// 会话状态不存在或已过期（正常结果，不按错误记录）
    NotFound(String),
    /// 持久化内容损坏，无法反序列化或校验失败
    Serialization(String),
    /// 持久化记录的 schema 版本不受支持
    UnsupportedSchema { found: u32, supported: u32 },
    /// 阶段迁移被拒绝
    InvalidTransition {
        from: Phase,
        to: Phase,
        reason: String,
    },
    /// 客户端索引指向的会话已不存在（由生命周期管理器自愈，不暴露给终端用户）
    IndexInconsistency {
        user_id: String,
        client_id: String,
        session_id: String,
    },
    /// persistent 层剩余预算不足
    PersistentBudgetExceeded { needed: usize, available: usize },
    /// 元数据超出上限
    MetadataLimit(String),
    /// 标识符非法（会破坏 key 结构）
    InvalidIdentifier(String),
    /// 假设不存在
    UnknownHypothesis(String),
    /// 证据请求不存在
    UnknownEvidence(String),
}

/// 配置错误
#[derive(Debug)]
pub enum ConfigError {
    /// 配置文件未找到
    FileNotFound(String),
    /// 配置解析失败
    ParseFailed(String),
    /// 配置值无效
    InvalidValue { field: String, message: String },
}

impl InvestigationError {
    /// 是否为“状态不存在”
    pub fn is_not_found(&self) -> bool {
        matches!(self, InvestigationError::State(StateError::NotFound(_)))
    }

    /// 是否为存储不可用（含超时）
    pub fn is_unavailable(&self) -> bool {
        matches!(self, InvestigationError::Store(_))
    }

    /// 可按“没有已有会话”处理的状态错误：不存在、损坏、版本不支持
    pub fn is_recoverable_state(&self) -> bool {
        matches!(
            self,
            InvestigationError::State(
                StateError::NotFound(_)
                    | StateError::Serialization(_)
                    | StateError::UnsupportedSchema { .. }
            )
        )
    }
}

// 实现 Display trait
impl fmt::Display for InvestigationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvestigationError::Store(e) => write!(f, "Store Error: {}", e),
            InvestigationError::State(e) => write!(f, "State Error: {}", e),
            InvestigationError::Config(e) => write!(f, "Config Error: {}", e),
            InvestigationError::Io(e) => write!(f, "IO Error: {}", e),
            InvestigationError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable { op, reason } => {
                write!(f, "service temporarily unavailable ({}): {}", op, reason)
            }
            StoreError::Timeout { op } => write!(f, "deadline exceeded during {}", op),
        }
    }
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::NotFound(id) => write!(f, "Session '{}' not found", id),
            StateError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            StateError::UnsupportedSchema { found, supported } => write!(
                f,
                "Unsupported schema version {} (supported: {})",
                found, supported
            ),
            StateError::InvalidTransition { from, to, reason } => {
                write!(f, "Invalid transition {} -> {}: {}", from, to, reason)
            }
            StateError::IndexInconsistency {
                user_id,
                client_id,
                session_id,
            } => write!(
                f,
                "Client index ({}, {}) points at missing session '{}'",
                user_id, client_id, session_id
            ),
            StateError::PersistentBudgetExceeded { needed, available } => write!(
                f,
                "Persistent tier budget exceeded: need {} tokens, {} available",
                needed, available
            ),
            StateError::MetadataLimit(msg) => write!(f, "Metadata limit: {}", msg),
            StateError::InvalidIdentifier(msg) => write!(f, "Invalid identifier: {}", msg),
            StateError::UnknownHypothesis(id) => write!(f, "Hypothesis '{}' not found", id),
            StateError::UnknownEvidence(id) => write!(f, "Evidence request '{}' not found", id),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {}", path),
            ConfigError::ParseFailed(msg) => write!(f, "Failed to parse config: {}", msg),
            ConfigError::InvalidValue { field, message } => {
                write!(f, "Invalid config value for '{}': {}", field, message)
            }
        }
    }
}

// 实现 std::error::Error trait
impl std::error::Error for InvestigationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InvestigationError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for StoreError {}
impl std::error::Error for StateError {}
impl std::error::Error for ConfigError {}

// From 转换实现
impl From<std::io::Error> for InvestigationError {
    fn from(err: std::io::Error) -> Self {
        InvestigationError::Io(err)
    }
}

impl From<serde_json::Error> for InvestigationError {
    fn from(err: serde_json::Error) -> Self {
        InvestigationError::State(StateError::Serialization(err.to_string()))
    }
}

impl From<serde_yaml::Error> for InvestigationError {
    fn from(err: serde_yaml::Error) -> Self {
        InvestigationError::Config(ConfigError::ParseFailed(err.to_string()))
    }
}

impl From<StoreError> for InvestigationError {
    fn from(err: StoreError) -> Self {
        InvestigationError::Store(err)
    }
}

impl From<StateError> for InvestigationError {
    fn from(err: StateError) -> Self {
        InvestigationError::State(err)
    }
}

impl From<ConfigError> for InvestigationError {
    fn from(err: ConfigError) -> Self {
        InvestigationError::Config(err)
    }
}

// 便捷的 Result 类型别名
pub type Result<T> = std::result::Result<T, InvestigationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_state_classification() {
        let not_found: InvestigationError = StateError::NotFound("s1".into()).into();
        let corrupt: InvestigationError = StateError::Serialization("bad".into()).into();
        let outage: InvestigationError = StoreError::Unavailable {
            op: "get".into(),
            reason: "connection refused".into(),
        }
        .into();

        assert!(not_found.is_not_found());
        assert!(not_found.is_recoverable_state());
        assert!(corrupt.is_recoverable_state());
        assert!(!corrupt.is_not_found());
        assert!(outage.is_unavailable());
        assert!(!outage.is_recoverable_state());
    }

    #[test]
    fn test_unavailable_message_is_user_facing() {
        let err: InvestigationError = StoreError::Unavailable {
            op: "set".into(),
            reason: "timed out after 3000ms".into(),
        }
        .into();
        assert!(err.to_string().contains("service temporarily unavailable"));
    }
}
