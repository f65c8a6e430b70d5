use tracing::{debug, warn};

use crate::automaton::{BoundedAutomaton, Token};
use crate::cfg::DispatchCfg;
use crate::decide::{proposal_from_decision, sam_branch_decision, Proposal, TierMode};
use crate::error::{DraftFailure, Result, SamError};

/// External lightweight predictor consulted in the arbitration tier.
///
/// Any model fits (small network, n-gram table, heuristic) as long as it
/// picks one of the offered candidates.
pub trait DraftModel {
    fn choose_next(&mut self, ctx: &[Token], candidates: &[Token]) -> std::result::Result<Token, DraftFailure>;
}

impl<D: DraftModel + ?Sized> DraftModel for &mut D {
    fn choose_next(&mut self, ctx: &[Token], candidates: &[Token]) -> std::result::Result<Token, DraftFailure> {
        (**self).choose_next(ctx, candidates)
    }
}

impl<D: DraftModel + ?Sized> DraftModel for Box<D> {
    fn choose_next(&mut self, ctx: &[Token], candidates: &[Token]) -> std::result::Result<Token, DraftFailure> {
        (**self).choose_next(ctx, candidates)
    }
}

/// Resolve an arbitration-tier decision with the draft predictor.
///
/// The predictor is called at most once, and only when the current branching
/// actually lands in `DraftArbitrate`; any other tier returns the dispatcher's
/// own proposal. The returned confidence is the automaton's best probability,
/// a lower bound since the predictor's certainty is not observable here.
pub fn draft_arbitrate_next<D>(
    sam: &BoundedAutomaton,
    cfg: &DispatchCfg,
    draft: &mut D,
    ctx: &[Token],
) -> Result<Proposal>
where
    D: DraftModel + ?Sized,
{
    let decision = sam_branch_decision(sam, cfg);
    if decision.mode != TierMode::DraftArbitrate {
        debug!(mode = ?decision.mode, "arbitration not needed");
        return Ok(proposal_from_decision(sam, cfg, &decision));
    }

    let candidates = decision.candidates();
    debug!(candidates = candidates.len(), ctx_len = ctx.len(), "consulting draft predictor");

    let chosen = draft.choose_next(ctx, &candidates).map_err(SamError::Draft)?;
    if !candidates.contains(&chosen) {
        warn!(token = chosen, ?candidates, "draft predictor left the candidate set");
        return Err(SamError::ContractViolation {
            token: chosen,
            candidates,
        });
    }

    Ok(Proposal {
        mode: TierMode::DraftArbitrate,
        confidence: decision.best_prob,
        tokens: vec![chosen],
    })
}
