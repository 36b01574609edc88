//! 分层调查记忆
//!
//! 每轮交互先进入 hot 层，超出预算后依次降级：
//!
//! ```text
//! hot (完整轮次) ──摘要──▶ warm (结论 + 理由) ──提取──▶ cold (事实元组) ──老化──▶ 丢弃
//!                                                  persistent (显式写入，永不压缩)
//! ```
//!
//! 各层以序列化后数组的 token 估算值计预算。容器本身（字段名、`turn_counter`）
//! 占用的 [`MEMORY_ENVELOPE_TOKENS`] 从 hot 层预算中预留，
//! 因此整个 `memory` 序列化后的估算值始终不超过 [`TierBudgets::total`]。
//! cold 层中被未决假设或 persistent 证据引用的事实不会因老化被丢弃。
//!
//! # 典型用法
//!
//! ```rust
//! use investigation_state::compression::{MemoryCompressor, TierBudgets, TurnRecord};
//! use investigation_state::investigation::{InvestigationState, Phase};
//!
//! let compressor = MemoryCompressor::new(TierBudgets::default(), 20);
//! let mut state = InvestigationState::new();
//!
//! let report = compressor.record_turn(
//!     &mut state,
//!     TurnRecord::new(Phase::Intake, "checkout is timing out", "Which region?"),
//! );
//! assert_eq!(report.turn, 1);
//! assert!(state.memory.token_estimate() <= compressor.budgets().total());
//! ```

pub mod summarizer;
pub mod tiers;

pub use summarizer::{DefaultSummarizer, FnSummarizer, TurnSummarizer};
pub use tiers::{FactTuple, MemoryTier, PersistentFact, PersistentKind, TurnRecord, TurnSummary};

use crate::error::{Result, StateError};
use crate::investigation::InvestigationState;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

// ──────────────────────────────────────────────
// 预算与 token 估算
// ──────────────────────────────────────────────

/// 各层 token 预算
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierBudgets {
    pub hot: usize,
    pub warm: usize,
    pub cold: usize,
    pub persistent: usize,
}

impl Default for TierBudgets {
    fn default() -> Self {
        Self {
            hot: 500,
            warm: 300,
            cold: 100,
            persistent: 100,
        }
    }
}

impl TierBudgets {
    pub fn total(&self) -> usize {
        self.hot + self.warm + self.cold + self.persistent
    }

    pub fn get(&self, tier: MemoryTier) -> usize {
        match tier {
            MemoryTier::Hot => self.hot,
            MemoryTier::Warm => self.warm,
            MemoryTier::Cold => self.cold,
            MemoryTier::Persistent => self.persistent,
        }
    }
}

/// 粗略估算：序列化后的 JSON 字节数 / 4，向上取整
pub fn estimate_tokens<T: Serialize>(record: &T) -> usize {
    serde_json::to_vec(record).map_or(0, |bytes| bytes.len().div_ceil(4))
}

/// 记忆容器在四个数组之外的开销上限
///
/// `{"hot":,"warm":,"cold":,"persistent":,"turn_counter":}` 加 20 位的轮次号共 74 字节。
pub const MEMORY_ENVELOPE_TOKENS: usize = 19;

// ──────────────────────────────────────────────
// 记忆容器
// ──────────────────────────────────────────────

/// 随调查状态一起持久化的四层记忆
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvestigationMemory {
    hot: VecDeque<TurnRecord>,
    warm: VecDeque<TurnSummary>,
    cold: VecDeque<FactTuple>,
    persistent: Vec<PersistentFact>,
    turn_counter: u64,
}

impl InvestigationMemory {
    pub fn hot(&self) -> &VecDeque<TurnRecord> {
        &self.hot
    }

    pub fn warm(&self) -> &VecDeque<TurnSummary> {
        &self.warm
    }

    pub fn cold(&self) -> &VecDeque<FactTuple> {
        &self.cold
    }

    pub fn persistent(&self) -> &[PersistentFact] {
        &self.persistent
    }

    /// 已记录的轮次总数
    pub fn turn_counter(&self) -> u64 {
        self.turn_counter
    }

    pub fn is_empty(&self) -> bool {
        self.hot.is_empty()
            && self.warm.is_empty()
            && self.cold.is_empty()
            && self.persistent.is_empty()
    }

    /// 单层序列化为 JSON 数组后的 token 估算
    pub fn tokens(&self, tier: MemoryTier) -> usize {
        match tier {
            MemoryTier::Hot => estimate_tokens(&self.hot),
            MemoryTier::Warm => estimate_tokens(&self.warm),
            MemoryTier::Cold => estimate_tokens(&self.cold),
            MemoryTier::Persistent => estimate_tokens(&self.persistent),
        }
    }

    /// 整个容器序列化后的 token 估算
    pub fn token_estimate(&self) -> usize {
        estimate_tokens(self)
    }

    fn persistent_evidence(&self) -> HashSet<&str> {
        self.persistent
            .iter()
            .flat_map(|f| f.evidence_refs.iter().map(String::as_str))
            .collect()
    }
}

// ──────────────────────────────────────────────
// 压缩器
// ──────────────────────────────────────────────

/// 单次压缩的统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompressionReport {
    /// 本次写入的轮次号，纯压缩时为当前轮次
    pub turn: u64,
    /// hot → warm
    pub summarized: usize,
    /// warm → cold
    pub reduced: usize,
    /// 超过老化窗口被丢弃的 cold 事实
    pub aged_out: usize,
    /// 因 cold 预算被丢弃的事实
    pub evicted: usize,
    /// 其中仍被引用的事实
    pub evicted_pinned: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

impl CompressionReport {
    pub fn is_noop(&self) -> bool {
        self.summarized == 0 && self.reduced == 0 && self.aged_out == 0 && self.evicted == 0
    }
}

/// 按预算在各层之间搬移记录
///
/// 压缩是同步的纯内存操作，调用方负责在之后 `save`。
pub struct MemoryCompressor {
    budgets: TierBudgets,
    cold_horizon_turns: u64,
    summarizer: Box<dyn TurnSummarizer>,
}

impl MemoryCompressor {
    pub fn new(budgets: TierBudgets, cold_horizon_turns: u64) -> Self {
        Self {
            budgets,
            cold_horizon_turns,
            summarizer: Box::new(DefaultSummarizer),
        }
    }

    pub fn from_config(config: &crate::config::StateConfig) -> Self {
        Self::new(config.memory, config.cold_horizon_turns)
    }

    /// 替换摘要策略
    pub fn with_summarizer(mut self, summarizer: impl TurnSummarizer + 'static) -> Self {
        self.summarizer = Box::new(summarizer);
        self
    }

    pub fn budgets(&self) -> TierBudgets {
        self.budgets
    }

    /// hot 层实际可用预算，扣除容器开销
    fn hot_budget(&self) -> usize {
        self.budgets.hot.saturating_sub(MEMORY_ENVELOPE_TOKENS)
    }

    /// 记录一轮交互并立即压缩
    ///
    /// 未决假设从 `state` 中读取，用于保护 cold 层的相关事实。
    pub fn record_turn(
        &self,
        state: &mut InvestigationState,
        mut turn: TurnRecord,
    ) -> CompressionReport {
        let unresolved = state.unresolved_hypothesis_ids();
        let memory = &mut state.memory;
        memory.turn_counter += 1;
        turn.turn = memory.turn_counter;
        memory.hot.push_back(turn);
        self.compact(memory, &unresolved)
    }

    /// 将各层压回预算之内
    pub fn compact(
        &self,
        memory: &mut InvestigationMemory,
        unresolved_hypotheses: &HashSet<String>,
    ) -> CompressionReport {
        let mut report = CompressionReport {
            turn: memory.turn_counter,
            tokens_before: memory.token_estimate(),
            ..Default::default()
        };

        // hot → warm
        while memory.tokens(MemoryTier::Hot) > self.hot_budget() {
            let Some(turn) = memory.hot.pop_front() else {
                break;
            };
            memory.warm.push_back(self.summarizer.summarize(&turn));
            report.summarized += 1;
        }

        // warm → cold
        while memory.tokens(MemoryTier::Warm) > self.budgets.warm {
            let Some(summary) = memory.warm.pop_front() else {
                break;
            };
            memory.cold.push_back(self.summarizer.reduce(&summary));
            report.reduced += 1;
        }

        self.trim_cold(memory, unresolved_hypotheses, &mut report);

        report.tokens_after = memory.token_estimate();
        if !report.is_noop() {
            debug!(
                "🗜️ 记忆压缩 turn={} summarized={} reduced={} aged_out={} evicted={} tokens {} → {}",
                report.turn,
                report.summarized,
                report.reduced,
                report.aged_out,
                report.evicted,
                report.tokens_before,
                report.tokens_after
            );
        }
        report
    }

    fn trim_cold(
        &self,
        memory: &mut InvestigationMemory,
        unresolved_hypotheses: &HashSet<String>,
        report: &mut CompressionReport,
    ) {
        let current_turn = memory.turn_counter;
        let horizon = self.cold_horizon_turns;
        let persistent_refs: HashSet<String> = memory
            .persistent_evidence()
            .into_iter()
            .map(String::from)
            .collect();
        let is_pinned = |fact: &FactTuple| {
            fact.hypothesis_id
                .as_ref()
                .is_some_and(|id| unresolved_hypotheses.contains(id))
                || fact
                    .evidence_ref
                    .as_ref()
                    .is_some_and(|r| persistent_refs.contains(r))
        };

        let before = memory.cold.len();
        memory
            .cold
            .retain(|fact| current_turn.saturating_sub(fact.turn) <= horizon || is_pinned(fact));
        report.aged_out = before - memory.cold.len();

        while memory.tokens(MemoryTier::Cold) > self.budgets.cold {
            let index = memory.cold.iter().position(|f| !is_pinned(f)).unwrap_or(0);
            let Some(fact) = memory.cold.remove(index) else {
                break;
            };
            report.evicted += 1;
            if is_pinned(&fact) {
                report.evicted_pinned += 1;
                warn!(
                    "⚠️ cold 层预算耗尽，丢弃仍被引用的事实 turn={} claim={:?}",
                    fact.turn, fact.claim
                );
            }
        }
    }

    /// 写入一条永久事实，返回其 id
    ///
    /// 超出 persistent 预算时拒绝写入，已有内容不会被压缩。
    pub fn pin_fact(
        &self,
        memory: &mut InvestigationMemory,
        kind: PersistentKind,
        content: impl Into<String>,
        evidence_refs: Vec<String>,
    ) -> Result<String> {
        let fact = PersistentFact {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            content: content.into(),
            evidence_refs,
            recorded_turn: memory.turn_counter,
        };
        let needed = estimate_tokens(&fact);
        let available = self
            .budgets
            .persistent
            .saturating_sub(memory.tokens(MemoryTier::Persistent));
        let id = fact.id.clone();
        memory.persistent.push(fact);
        // 按写入后的整层数组计量，逗号也算在内
        if memory.tokens(MemoryTier::Persistent) > self.budgets.persistent {
            memory.persistent.pop();
            return Err(StateError::PersistentBudgetExceeded { needed, available }.into());
        }
        debug!("📌 写入永久事实 id={} kind={:?} tokens={}", id, kind, needed);
        Ok(id)
    }

    /// 移除一条永久事实，不存在时返回 false
    pub fn unpin_fact(&self, memory: &mut InvestigationMemory, id: &str) -> bool {
        let before = memory.persistent.len();
        memory.persistent.retain(|f| f.id != id);
        before != memory.persistent.len()
    }
}
