//! 调查状态实体

use crate::compression::InvestigationMemory;
use crate::error::{Result, StateError};
use crate::investigation::now_secs;
use crate::investigation::phase::Phase;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

pub const MAX_EXTRA_METADATA: usize = 16;
pub const MAX_EXTRA_KEY_LEN: usize = 64;
pub const MAX_EXTRA_VALUE_LEN: usize = 256;

// ── Hypothesis ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypothesisStatus {
    Active,
    Confirmed,
    Refuted,
    Retired,
}

/// 候选根因假设
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub id: String,
    pub statement: String,
    /// 置信度，取值 [0, 1]
    pub confidence: f32,
    pub status: HypothesisStatus,
    pub created_at: u64,
    /// 置信度衰减起点（Unix 秒），每次有新证据时刷新
    pub decay_from: u64,
}

impl Hypothesis {
    pub fn new(statement: impl Into<String>, confidence: f32) -> Self {
        let now = now_secs();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            statement: statement.into(),
            confidence: clamp_confidence(confidence),
            status: HypothesisStatus::Active,
            created_at: now,
            decay_from: now,
        }
    }

    pub fn is_unresolved(&self) -> bool {
        self.status == HypothesisStatus::Active
    }

    /// 按半衰期计算 `now` 时刻的有效置信度
    pub fn effective_confidence(&self, now: u64, half_life: Duration) -> f32 {
        if half_life.is_zero() {
            return self.confidence;
        }
        let elapsed = now.saturating_sub(self.decay_from) as f64;
        let factor = 0.5f64.powf(elapsed / half_life.as_secs_f64());
        (self.confidence as f64 * factor) as f32
    }
}

// ── EvidenceRequest ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EvidenceStatus {
    Pending,
    Fulfilled { evidence_ref: String },
    Blocked { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRequest {
    pub id: String,
    pub description: String,
    /// 该证据用于验证的假设
    pub hypothesis_id: Option<String>,
    pub status: EvidenceStatus,
    pub requested_at: u64,
    pub updated_at: u64,
}

// ── Metadata ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

/// 调查上下文元数据：已知类别用具名字段，其余放入有上限的 `extra`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvestigationMetadata {
    pub urgency: Option<Urgency>,
    pub service: Option<String>,
    pub environment: Option<String>,
    /// 事件开始时间（Unix 秒）
    pub incident_started_at: Option<u64>,
    /// 是否已有可用的缓解手段
    pub mitigation_known: Option<bool>,
    extra: BTreeMap<String, String>,
}

impl InvestigationMetadata {
    pub fn extra(&self) -> &BTreeMap<String, String> {
        &self.extra
    }

    /// 写入扩展字段；超过条数或长度上限时拒绝
    pub fn set_extra(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        check_extra_entry(&key, &value)?;
        if !self.extra.contains_key(&key) && self.extra.len() >= MAX_EXTRA_METADATA {
            return Err(StateError::MetadataLimit(format!(
                "at most {MAX_EXTRA_METADATA} extra entries"
            ))
            .into());
        }
        self.extra.insert(key, value);
        Ok(())
    }

    pub fn remove_extra(&mut self, key: &str) -> Option<String> {
        self.extra.remove(key)
    }

    fn validate(&self) -> Result<()> {
        if self.extra.len() > MAX_EXTRA_METADATA {
            return Err(StateError::MetadataLimit(format!(
                "{} extra entries (max {MAX_EXTRA_METADATA})",
                self.extra.len()
            ))
            .into());
        }
        for (k, v) in &self.extra {
            check_extra_entry(k, v)?;
        }
        Ok(())
    }
}

fn check_extra_entry(key: &str, value: &str) -> Result<()> {
    if key.is_empty() || key.chars().count() > MAX_EXTRA_KEY_LEN {
        return Err(StateError::MetadataLimit(format!(
            "extra key must be 1..={MAX_EXTRA_KEY_LEN} characters"
        ))
        .into());
    }
    if value.chars().count() > MAX_EXTRA_VALUE_LEN {
        return Err(StateError::MetadataLimit(format!(
            "extra value for '{key}' exceeds {MAX_EXTRA_VALUE_LEN} characters"
        ))
        .into());
    }
    Ok(())
}

// ── InvestigationState ───────────────────────────────────────────────────────

/// 单个会话的调查状态
///
/// 调用方拿到的是独立副本，修改后需显式交给仓储保存。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationState {
    phase: Phase,
    /// 当前阶段内的 OODA 迭代计数
    ooda_iteration: u32,
    /// 按首次进入顺序记录访问过的阶段
    visited_phases: Vec<Phase>,
    phase_entered_at: u64,
    hypotheses: Vec<Hypothesis>,
    evidence_requests: Vec<EvidenceRequest>,
    pub memory: InvestigationMemory,
    pub metadata: InvestigationMetadata,
}

impl Default for InvestigationState {
    fn default() -> Self {
        Self::new()
    }
}

impl InvestigationState {
    /// 新调查总是从 `Intake` 开始
    pub fn new() -> Self {
        Self {
            phase: Phase::Intake,
            ooda_iteration: 0,
            visited_phases: vec![Phase::Intake],
            phase_entered_at: now_secs(),
            hypotheses: Vec::new(),
            evidence_requests: Vec::new(),
            memory: InvestigationMemory::default(),
            metadata: InvestigationMetadata::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn ooda_iteration(&self) -> u32 {
        self.ooda_iteration
    }

    pub fn visited_phases(&self) -> &[Phase] {
        &self.visited_phases
    }

    pub fn has_visited(&self, phase: Phase) -> bool {
        self.visited_phases.contains(&phase)
    }

    pub fn phase_entered_at(&self) -> u64 {
        self.phase_entered_at
    }

    /// 迁移到 `next` 阶段
    ///
    /// 换阶段时 `ooda_iteration` 归零；重复进入当前阶段视为新一轮战术循环，
    /// 仅在该阶段执行战术循环时递增。
    pub fn transition_to(&mut self, next: Phase) -> Result<()> {
        if self.phase.is_terminal() && next != self.phase {
            return Err(self.rejected(next, "document is terminal"));
        }
        if next == Phase::Document && !Phase::INVESTIGATIVE.iter().any(|p| self.has_visited(*p)) {
            return Err(self.rejected(
                next,
                "requires a prior visit to blast_radius, validation or solution",
            ));
        }

        if next == self.phase {
            self.next_iteration();
            return Ok(());
        }

        self.phase = next;
        self.ooda_iteration = 0;
        self.phase_entered_at = now_secs();
        if !self.has_visited(next) {
            self.visited_phases.push(next);
        }
        Ok(())
    }

    /// 开始当前阶段的下一轮 OODA 循环，返回是否递增
    pub fn next_iteration(&mut self) -> bool {
        if self.phase.runs_tactical_cycles() {
            self.ooda_iteration = self.ooda_iteration.saturating_add(1);
            true
        } else {
            false
        }
    }

    fn rejected(&self, to: Phase, reason: &str) -> crate::error::InvestigationError {
        StateError::InvalidTransition {
            from: self.phase,
            to,
            reason: reason.to_string(),
        }
        .into()
    }

    // ── 假设 ──

    pub fn hypotheses(&self) -> &[Hypothesis] {
        &self.hypotheses
    }

    /// 添加假设，返回其 ID
    pub fn add_hypothesis(&mut self, statement: impl Into<String>, confidence: f32) -> String {
        let hypothesis = Hypothesis::new(statement, confidence);
        let id = hypothesis.id.clone();
        self.hypotheses.push(hypothesis);
        id
    }

    /// 更新置信度并刷新衰减起点
    pub fn update_confidence(&mut self, id: &str, confidence: f32) -> Result<()> {
        let hypothesis = self.hypothesis_mut(id)?;
        hypothesis.confidence = clamp_confidence(confidence);
        hypothesis.decay_from = now_secs();
        Ok(())
    }

    pub fn set_hypothesis_status(&mut self, id: &str, status: HypothesisStatus) -> Result<()> {
        self.hypothesis_mut(id)?.status = status;
        Ok(())
    }

    pub fn unresolved_hypothesis_ids(&self) -> HashSet<String> {
        self.hypotheses
            .iter()
            .filter(|h| h.is_unresolved())
            .map(|h| h.id.clone())
            .collect()
    }

    fn hypothesis_mut(&mut self, id: &str) -> Result<&mut Hypothesis> {
        self.hypotheses
            .iter_mut()
            .find(|h| h.id == id)
            .ok_or_else(|| StateError::UnknownHypothesis(id.to_string()).into())
    }

    // ── 证据请求 ──

    pub fn evidence_requests(&self) -> &[EvidenceRequest] {
        &self.evidence_requests
    }

    pub fn request_evidence(
        &mut self,
        description: impl Into<String>,
        hypothesis_id: Option<&str>,
    ) -> Result<String> {
        if let Some(hid) = hypothesis_id
            && !self.hypotheses.iter().any(|h| h.id == hid)
        {
            return Err(StateError::UnknownHypothesis(hid.to_string()).into());
        }
        let now = now_secs();
        let id = uuid::Uuid::new_v4().to_string();
        self.evidence_requests.push(EvidenceRequest {
            id: id.clone(),
            description: description.into(),
            hypothesis_id: hypothesis_id.map(String::from),
            status: EvidenceStatus::Pending,
            requested_at: now,
            updated_at: now,
        });
        Ok(id)
    }

    pub fn fulfill_evidence(&mut self, id: &str, evidence_ref: impl Into<String>) -> Result<()> {
        self.set_evidence_status(
            id,
            EvidenceStatus::Fulfilled {
                evidence_ref: evidence_ref.into(),
            },
        )
    }

    pub fn block_evidence(&mut self, id: &str, reason: impl Into<String>) -> Result<()> {
        self.set_evidence_status(
            id,
            EvidenceStatus::Blocked {
                reason: reason.into(),
            },
        )
    }

    pub fn pending_evidence(&self) -> impl Iterator<Item = &EvidenceRequest> {
        self.evidence_requests
            .iter()
            .filter(|e| e.status == EvidenceStatus::Pending)
    }

    fn set_evidence_status(&mut self, id: &str, status: EvidenceStatus) -> Result<()> {
        let request = self
            .evidence_requests
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StateError::UnknownEvidence(id.to_string()))?;
        request.status = status;
        request.updated_at = now_secs();
        Ok(())
    }

    /// 反序列化后的完整性校验，失败时整份状态视为损坏
    pub fn validate(&self) -> Result<()> {
        let corrupt = |msg: String| -> crate::error::InvestigationError {
            StateError::Serialization(msg).into()
        };

        if self.visited_phases.first() != Some(&Phase::Intake) {
            return Err(corrupt("investigation did not start at intake".into()));
        }
        if !self.has_visited(self.phase) {
            return Err(corrupt(format!(
                "current phase {} missing from visited phases",
                self.phase
            )));
        }
        let unique: HashSet<Phase> = self.visited_phases.iter().copied().collect();
        if unique.len() != self.visited_phases.len() {
            return Err(corrupt("duplicate visited phases".into()));
        }
        if self.phase == Phase::Document
            && !Phase::INVESTIGATIVE.iter().any(|p| self.has_visited(*p))
        {
            return Err(corrupt("document reached without investigation".into()));
        }
        if let Some(h) = self
            .hypotheses
            .iter()
            .find(|h| !(0.0..=1.0).contains(&h.confidence))
        {
            return Err(corrupt(format!(
                "hypothesis {} confidence {} outside [0, 1]",
                h.id, h.confidence
            )));
        }
        self.metadata
            .validate()
            .map_err(|e| corrupt(format!("metadata: {e}")))?;
        Ok(())
    }
}

fn clamp_confidence(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
