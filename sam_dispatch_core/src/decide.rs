//sam_dispatch_core/decide.rs

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::automaton::{BoundedAutomaton, StateId, Token, ROOT};
use crate::cfg::DispatchCfg;
use crate::cursor::BranchOption;

/// Escalation tier, cheapest first.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TierMode {
    /// A single sufficiently-observed continuation: trust the automaton.
    SamDeterministic,
    /// Several continuations, one dominates.
    SamDominated,
    /// Bounded ambiguity: let the draft predictor pick among the candidates.
    DraftArbitrate,
    /// Memory unreliable: no speculation, decode with the target model.
    TargetOnly,
}

/// Snapshot of the branching at the match cursor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SamDecision {
    pub mode: TierMode,
    /// Continuations passing `min_occ`, before truncation to `max_branch_options`.
    pub degree: u32,
    pub h_norm: f32,
    pub best_prob: f32,
    /// Matched suffix length at decision time.
    pub matched_len: u64,
    pub options: Vec<BranchOption>,
}

impl SamDecision {
    pub fn candidates(&self) -> Vec<Token> {
        self.options.iter().map(|o| o.token).collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub mode: TierMode,
    pub confidence: f32,
    pub tokens: Vec<Token>,
}

impl Proposal {
    /// The "fall back to full decoding" signal.
    pub fn target_only() -> Self {
        Self {
            mode: TierMode::TargetOnly,
            confidence: 0.0,
            tokens: Vec::new(),
        }
    }

    #[inline]
    pub fn is_speculative(&self) -> bool {
        !self.tokens.is_empty()
    }
}

/// Shannon entropy (bits) of the weight distribution divided by `log2(degree)`.
///
/// 0 for fewer than two positive weights.
pub fn normalized_entropy<I>(weights: I) -> f32
where
    I: IntoIterator<Item = u32>,
{
    let weights: Vec<f64> = weights.into_iter().filter(|&w| w > 0).map(f64::from).collect();
    if weights.len() <= 1 {
        return 0.0;
    }
    let total: f64 = weights.iter().sum();
    let h: f64 = weights
        .iter()
        .map(|&w| {
            let p = w / total;
            -p * p.log2()
        })
        .sum();
    let h_norm = h / (weights.len() as f64).log2();
    (h_norm as f32).clamp(0.0, 1.0)
}

/// Tier gate over already-computed statistics. Each threshold is a monotone gate.
pub fn classify(degree: u32, best_prob: f32, h_norm: f32, cfg: &DispatchCfg) -> TierMode {
    if degree == 0 || degree > cfg.k_max() {
        TierMode::TargetOnly
    } else if degree == 1 {
        TierMode::SamDeterministic
    } else if best_prob >= cfg.p_dom() {
        TierMode::SamDominated
    } else if h_norm <= cfg.h_max() {
        TierMode::DraftArbitrate
    } else {
        TierMode::TargetOnly
    }
}

/// Read the cursor's branching and classify it. Pure: no mutation, no logging.
pub fn sam_branch_decision(sam: &BoundedAutomaton, cfg: &DispatchCfg) -> SamDecision {
    let branching = sam.branching(cfg.min_occ());

    let degree = branching.degree;
    let best_prob = branching.options.first().map_or(0.0, |o| o.prob);
    let h_norm = normalized_entropy(branching.options.iter().map(|o| o.weight));
    let mode = classify(degree, best_prob, h_norm, cfg);

    let mut options = branching.options;
    options.truncate(cfg.max_branch_options() as usize);

    SamDecision {
        mode,
        degree,
        h_norm,
        best_prob,
        matched_len: sam.cursor().len,
        options,
    }
}

/// Turn the current branching into a proposal. Never consults the draft model;
/// a `DraftArbitrate` proposal carries no tokens and waits for
/// [`crate::draft_arbitrate_next`].
pub fn dispatch_propose(sam: &BoundedAutomaton, cfg: &DispatchCfg) -> Proposal {
    let decision = sam_branch_decision(sam, cfg);
    let proposal = proposal_from_decision(sam, cfg, &decision);
    debug!(
        mode = ?proposal.mode,
        degree = decision.degree,
        h_norm = decision.h_norm,
        best_prob = decision.best_prob,
        matched = decision.matched_len,
        emitted = proposal.tokens.len(),
        "dispatch decision"
    );
    proposal
}

/// Proposal for an already-computed decision, e.g. one kept for telemetry.
///
/// `decision` must come from `sam` with the same `cfg`; lookahead reads `sam` again.
pub fn proposal_from_decision(sam: &BoundedAutomaton, cfg: &DispatchCfg, decision: &SamDecision) -> Proposal {
    let Some(best) = decision.options.first() else {
        return Proposal::target_only();
    };
    match decision.mode {
        TierMode::SamDeterministic => Proposal {
            mode: TierMode::SamDeterministic,
            confidence: decision.best_prob,
            tokens: deterministic_run(sam, cfg, best),
        },
        TierMode::SamDominated => Proposal {
            mode: TierMode::SamDominated,
            confidence: decision.best_prob,
            tokens: vec![best.token],
        },
        TierMode::DraftArbitrate => Proposal {
            mode: TierMode::DraftArbitrate,
            confidence: decision.best_prob,
            tokens: Vec::new(),
        },
        TierMode::TargetOnly => Proposal::target_only(),
    }
}

/// Follow single-continuation states from `first` for up to `cfg.lookahead()` tokens.
fn deterministic_run(sam: &BoundedAutomaton, cfg: &DispatchCfg, first: &BranchOption) -> Vec<Token> {
    let limit = cfg.lookahead() as usize;
    let mut tokens = vec![first.token];
    let mut state: StateId = first.to_state;

    while tokens.len() < limit && state != ROOT {
        let next = sam.branching_at(state, cfg.min_occ());
        if next.degree != 1 {
            break;
        }
        let Some(only) = next.options.first() else { break };
        tokens.push(only.token);
        state = only.to_state;
    }
    tokens
}
