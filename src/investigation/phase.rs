//! 调查阶段
//!
//! 阶段集合固定且有序：
//! `Intake → BlastRadius → Timeline → Hypothesis → Validation → Solution → Document`。
//!
//! 迁移不要求严格按顺序（高紧急度时可跳过 Timeline/Hypothesis/Validation，
//! 复盘已缓解的历史事件时可直接进入 Validation），只强制两条规则：
//!
//! 1. 新会话必须从 `Intake` 开始
//! 2. 进入 `Document` 之前至少访问过 `BlastRadius`、`Validation`、`Solution` 之一
//!
//! `Document` 为终态。

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Intake,
    BlastRadius,
    Timeline,
    Hypothesis,
    Validation,
    Solution,
    Document,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::Intake,
        Phase::BlastRadius,
        Phase::Timeline,
        Phase::Hypothesis,
        Phase::Validation,
        Phase::Solution,
        Phase::Document,
    ];

    /// 进入 `Document` 之前必须至少访问过其中之一
    pub const INVESTIGATIVE: [Phase; 3] = [Phase::BlastRadius, Phase::Validation, Phase::Solution];

    pub fn is_terminal(self) -> bool {
        self == Phase::Document
    }

    /// 该阶段内部是否执行 OODA 战术循环
    pub fn runs_tactical_cycles(self) -> bool {
        !matches!(self, Phase::Intake | Phase::Document)
    }

    pub fn label(self) -> &'static str {
        match self {
            Phase::Intake => "intake",
            Phase::BlastRadius => "blast_radius",
            Phase::Timeline => "timeline",
            Phase::Hypothesis => "hypothesis",
            Phase::Validation => "validation",
            Phase::Solution => "solution",
            Phase::Document => "document",
        }
    }

    pub fn parse(s: &str) -> Option<Phase> {
        Phase::ALL.into_iter().find(|p| p.label() == s)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
