//! 会话记录与持久化信封

use crate::error::{Result, StateError};
use crate::investigation::now_secs;
use crate::investigation::state::InvestigationState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// 当前写入的记录版本
pub const SCHEMA_VERSION: u32 = 1;

/// 连接级会话记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    /// 设备 / 浏览器级的稳定标识，用于断线后恢复会话
    pub client_id: Option<String>,
    pub created_at: u64,
    pub last_activity: u64,
    pub ttl_seconds: u64,
}

impl Session {
    pub fn new(user_id: &str, client_id: Option<&str>, ttl: Duration) -> Self {
        let now = now_secs();
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            client_id: client_id.map(String::from),
            created_at: now,
            last_activity: now,
            ttl_seconds: ttl.as_secs(),
        }
    }

    /// 记录一次活动并更新 TTL
    pub fn touch(&mut self, ttl: Duration) {
        self.last_activity = now_secs();
        self.ttl_seconds = ttl.as_secs();
    }

    /// 超过 `max_age` 未刷新
    pub fn is_stale(&self, now: u64, max_age: Duration) -> bool {
        now.saturating_sub(self.last_activity) > max_age.as_secs()
    }
}

/// 会话及其调查状态的独立副本
///
/// 仓储每次 `load` 都返回新副本，修改后必须显式 `save`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Investigation {
    pub session: Session,
    pub state: InvestigationState,
}

impl Investigation {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            state: InvestigationState::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }
}

#[derive(Serialize)]
struct StateRecordRef<'a> {
    schema_version: u32,
    session: &'a Session,
    state: &'a InvestigationState,
}

#[derive(Deserialize)]
struct StateRecordV1 {
    session: Session,
    state: InvestigationState,
}

/// 编码为 `inv:state:*` 下的带版本记录
pub fn encode_record(investigation: &Investigation) -> Result<Vec<u8>> {
    let record = StateRecordRef {
        schema_version: SCHEMA_VERSION,
        session: &investigation.session,
        state: &investigation.state,
    };
    Ok(serde_json::to_vec(&record)?)
}

/// 解码记录并校验；任何失败都不会返回部分填充的对象
pub fn decode_record(bytes: &[u8]) -> Result<Investigation> {
    let value: Value = serde_json::from_slice(bytes)?;
    let version = value
        .get("schema_version")
        .and_then(Value::as_u64)
        .ok_or_else(|| StateError::Serialization("missing schema_version".to_string()))?;

    let investigation = match version {
        1 => {
            let record: StateRecordV1 = serde_json::from_value(value)?;
            Investigation {
                session: record.session,
                state: record.state,
            }
        }
        other => {
            return Err(StateError::UnsupportedSchema {
                found: other.min(u32::MAX as u64) as u32,
                supported: SCHEMA_VERSION,
            }
            .into());
        }
    };
    investigation.state.validate()?;
    Ok(investigation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InvestigationError;
    use crate::investigation::Phase;

    fn sample() -> Investigation {
        let mut inv = Investigation::new(Session::new(
            "alice",
            Some("laptop-1"),
            Duration::from_secs(3600),
        ));
        inv.state.transition_to(Phase::BlastRadius).unwrap();
        let hid = inv.state.add_hypothesis("bad deploy", 0.6);
        inv.state.request_evidence("deploy log", Some(&hid)).unwrap();
        inv.state.metadata.service = Some("checkout".into());
        inv.state.metadata.set_extra("ticket", "INC-42").unwrap();
        inv
    }

    #[test]
    fn test_record_round_trip() {
        let inv = sample();
        let bytes = encode_record(&inv).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["schema_version"], 1);

        let decoded = decode_record(&bytes).unwrap();
        assert_eq!(decoded, inv);
    }

    #[test]
    fn test_unknown_schema_version() {
        let mut value: Value = serde_json::from_slice(&encode_record(&sample()).unwrap()).unwrap();
        value["schema_version"] = serde_json::json!(7);
        let err = decode_record(&serde_json::to_vec(&value).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            InvestigationError::State(StateError::UnsupportedSchema {
                found: 7,
                supported: 1
            })
        ));
    }

    #[test]
    fn test_corrupt_payload() {
        for bytes in [
            b"not json".as_slice(),
            b"{\"session\": {}}".as_slice(),
            b"{\"schema_version\": 1, \"session\": 3}".as_slice(),
        ] {
            let err = decode_record(bytes).unwrap_err();
            assert!(matches!(
                err,
                InvestigationError::State(StateError::Serialization(_))
            ));
        }
    }

    #[test]
    fn test_session_staleness() {
        let mut session = Session::new("bob", None, Duration::from_secs(60));
        session.last_activity = 1_000;
        assert!(!session.is_stale(1_000 + 3600, Duration::from_secs(3600)));
        assert!(session.is_stale(1_000 + 3601, Duration::from_secs(3600)));
    }
}
