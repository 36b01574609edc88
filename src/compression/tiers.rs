//! 四层记忆的记录类型
//!
//! | 层 | 记录 | 内容 |
//! |----|------|------|
//! | hot | [`TurnRecord`] | 完整的单轮交互 |
//! | warm | [`TurnSummary`] | 阶段 + 结论 + 一行理由 |
//! | cold | [`FactTuple`] | `{claim, evidence_ref, confidence}` |
//! | persistent | [`PersistentFact`] | 由编排方显式写入，永不压缩 |

use crate::investigation::Phase;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    Hot,
    Warm,
    Cold,
    Persistent,
}

impl fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MemoryTier::Hot => "hot",
            MemoryTier::Warm => "warm",
            MemoryTier::Cold => "cold",
            MemoryTier::Persistent => "persistent",
        };
        f.write_str(label)
    }
}

/// 单轮交互（hot 层）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    /// 写入记忆时分配的轮次号（从 1 开始）
    #[serde(default)]
    pub turn: u64,
    pub phase: Phase,
    pub user_input: String,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence_refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypothesis_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl TurnRecord {
    pub fn new(phase: Phase, user_input: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            turn: 0,
            phase,
            user_input: user_input.into(),
            response: response.into(),
            outcome: None,
            rationale: None,
            evidence_refs: Vec::new(),
            hypothesis_id: None,
            confidence: None,
        }
    }

    pub fn outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    pub fn rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    pub fn evidence_ref(mut self, evidence_ref: impl Into<String>) -> Self {
        self.evidence_refs.push(evidence_ref.into());
        self
    }

    pub fn hypothesis(mut self, hypothesis_id: impl Into<String>) -> Self {
        self.hypothesis_id = Some(hypothesis_id.into());
        self
    }

    pub fn confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// 摘要后的单轮（warm 层）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnSummary {
    pub turn: u64,
    pub phase: Phase,
    pub outcome: String,
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypothesis_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// 事实元组（cold 层）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactTuple {
    pub turn: u64,
    pub claim: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_ref: Option<String>,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypothesis_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistentKind {
    RootCause,
    UserConstraint,
    ConfirmedFact,
}

/// 永久事实（persistent 层）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentFact {
    pub id: String,
    pub kind: PersistentKind,
    pub content: String,
    /// cold 层中引用这些证据的事实不会因老化被丢弃
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence_refs: Vec<String>,
    pub recorded_turn: u64,
}
