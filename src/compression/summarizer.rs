use crate::compression::tiers::{FactTuple, TurnRecord, TurnSummary};

const OUTCOME_MAX_CHARS: usize = 60;
const RATIONALE_MAX_CHARS: usize = 100;
const CLAIM_MAX_CHARS: usize = 48;
const EVIDENCE_REF_MAX_CHARS: usize = 24;
const DEFAULT_CONFIDENCE: f32 = 0.5;

/// 记忆降级策略：hot → warm 的摘要，warm → cold 的事实提取
///
/// 必须是确定性的纯函数，压缩发生在请求路径上，不做 IO。
pub trait TurnSummarizer: Send + Sync {
    fn summarize(&self, turn: &TurnRecord) -> TurnSummary;

    fn reduce(&self, summary: &TurnSummary) -> FactTuple {
        default_reduce(summary)
    }
}

/// 默认策略：截取首行并限制长度
pub struct DefaultSummarizer;

impl TurnSummarizer for DefaultSummarizer {
    fn summarize(&self, turn: &TurnRecord) -> TurnSummary {
        let outcome = turn.outcome.as_deref().unwrap_or(&turn.response);
        let rationale = turn.rationale.as_deref().unwrap_or(&turn.user_input);
        TurnSummary {
            turn: turn.turn,
            phase: turn.phase,
            outcome: one_line(outcome, OUTCOME_MAX_CHARS),
            rationale: one_line(rationale, RATIONALE_MAX_CHARS),
            evidence_ref: turn
                .evidence_refs
                .first()
                .map(|r| one_line(r, EVIDENCE_REF_MAX_CHARS)),
            hypothesis_id: turn.hypothesis_id.clone(),
            confidence: turn.confidence,
        }
    }
}

/// 用闭包自定义摘要逻辑，事实提取沿用默认实现
///
/// ```rust
/// use investigation_state::compression::{FnSummarizer, TurnSummary};
///
/// let summarizer = FnSummarizer(|turn: &investigation_state::compression::TurnRecord| TurnSummary {
///     turn: turn.turn,
///     phase: turn.phase,
///     outcome: turn.outcome.clone().unwrap_or_default(),
///     rationale: String::new(),
///     evidence_ref: None,
///     hypothesis_id: turn.hypothesis_id.clone(),
///     confidence: turn.confidence,
/// });
/// # let _ = summarizer;
/// ```
pub struct FnSummarizer<F>(pub F)
where
    F: Fn(&TurnRecord) -> TurnSummary + Send + Sync;

impl<F> TurnSummarizer for FnSummarizer<F>
where
    F: Fn(&TurnRecord) -> TurnSummary + Send + Sync,
{
    fn summarize(&self, turn: &TurnRecord) -> TurnSummary {
        (self.0)(turn)
    }
}

fn default_reduce(summary: &TurnSummary) -> FactTuple {
    FactTuple {
        turn: summary.turn,
        claim: one_line(&summary.outcome, CLAIM_MAX_CHARS),
        evidence_ref: summary
            .evidence_ref
            .as_deref()
            .map(|r| one_line(r, EVIDENCE_REF_MAX_CHARS)),
        confidence: summary
            .confidence
            .filter(|c| c.is_finite())
            .map(|c| c.clamp(0.0, 1.0))
            .unwrap_or(DEFAULT_CONFIDENCE),
        hypothesis_id: summary.hypothesis_id.clone(),
    }
}

/// 取首个非空行，超长时截断并以 `…` 结尾
fn one_line(text: &str, max_chars: usize) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    if line.chars().count() <= max_chars {
        return line.to_string();
    }
    let mut out: String = line.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}
