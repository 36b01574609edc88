//! 调查领域模型
//!
//! | 类型 | 作用 |
//! |------|------|
//! | [`Phase`] | 固定有序的调查阶段及迁移规则 |
//! | [`InvestigationState`] | 阶段、假设、证据请求、分层记忆、元数据 |
//! | [`Session`] | 用户 / 客户端 / 活跃时间 / TTL |
//! | [`Investigation`] | 会话 + 状态，仓储读写的单位 |

pub mod phase;
pub mod record;
pub mod state;

pub use phase::Phase;
pub use record::{Investigation, SCHEMA_VERSION, Session, decode_record, encode_record};
pub use state::{
    EvidenceRequest, EvidenceStatus, Hypothesis, HypothesisStatus, InvestigationMetadata,
    InvestigationState, Urgency,
};

use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
