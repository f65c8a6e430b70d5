//! Property tests for the bounded automaton and the tier gates.

use std::collections::HashMap;

use proptest::prelude::*;
use sam_dispatch_core::*;

fn build(alphabet: u32, capacity: usize, tokens: &[Token]) -> BoundedAutomaton {
    let mut sam = BoundedAutomaton::new(alphabet, capacity).unwrap();
    for &t in tokens {
        sam.extend_verified(t).unwrap();
    }
    sam
}

fn weights(sam: &BoundedAutomaton, alphabet: u32) -> HashMap<(StateId, Token), u32> {
    let mut out = HashMap::new();
    for s in sam.live_states() {
        for t in 0..alphabet {
            if let Some(tr) = sam.transition(s, t) {
                out.insert((s, t), tr.weight);
            }
        }
    }
    out
}

/// Occurrences of every `context` followed by `token`, keyed by `(context, token)`.
fn continuation_counts(tokens: &[Token]) -> HashMap<(Vec<Token>, Token), u32> {
    let mut out = HashMap::new();
    for end in 0..tokens.len() {
        for start in 0..=end {
            *out.entry((tokens[start..end].to_vec(), tokens[end])).or_insert(0) += 1;
        }
    }
    out
}

fn state_of(sam: &BoundedAutomaton, context: &[Token]) -> Option<StateId> {
    let mut at = ROOT;
    for &t in context {
        let tr = sam.transition(at, t)?;
        if tr.is_forgotten() {
            return None;
        }
        at = tr.target;
    }
    Some(at)
}

struct FirstOrForeign {
    foreign: bool,
}

impl DraftModel for FirstOrForeign {
    fn choose_next(&mut self, _ctx: &[Token], candidates: &[Token]) -> Result<Token, DraftFailure> {
        if self.foreign {
            Ok(candidates.iter().max().copied().unwrap_or(0) + 1)
        } else {
            Ok(candidates[0])
        }
    }
}

proptest! {
    /// State count never exceeds capacity and the structure stays well-formed
    /// after every single extension, evictions included.
    #[test]
    fn capacity_and_wellformedness(
        alphabet in 1u32..6,
        capacity in 5usize..40,
        raw in prop::collection::vec(any::<u32>(), 0..200),
    ) {
        let mut sam = BoundedAutomaton::new(alphabet, capacity).unwrap();
        for r in raw {
            sam.extend_verified(r % alphabet).unwrap();
            prop_assert!(sam.state_count() <= capacity);
            prop_assert!(sam.check_invariants().is_ok(), "{:?}", sam.check_invariants());

            for s in sam.live_states() {
                for t in 0..alphabet {
                    if let Some(tr) = sam.transition(s, t) {
                        prop_assert!(sam.is_live(tr.target));
                    }
                }
            }
            prop_assert!(sam.is_live(sam.cursor().state));
        }
    }

    /// Without eviction, no transition weight ever goes down.
    #[test]
    fn weights_never_decrease(
        alphabet in 1u32..5,
        prefix in prop::collection::vec(0u32..5, 1..60),
        suffix in prop::collection::vec(0u32..5, 1..60),
    ) {
        let prefix: Vec<Token> = prefix.into_iter().map(|t| t % alphabet).collect();
        let suffix: Vec<Token> = suffix.into_iter().map(|t| t % alphabet).collect();

        let mut sam = build(alphabet, 1024, &prefix);
        let before = weights(&sam, alphabet);
        for &t in &suffix {
            sam.extend_verified(t).unwrap();
        }
        prop_assert_eq!(sam.evictions(), 0);
        let after = weights(&sam, alphabet);

        for (key, w) in before {
            let now = after.get(&key).copied();
            prop_assert!(now.is_some_and(|n| n >= w), "{:?}: {} -> {:?}", key, w, now);
        }
    }

    /// Without eviction every weight is the exact number of times the
    /// state's context was followed by the token.
    #[test]
    fn weights_match_occurrence_counts(
        alphabet in 1u32..5,
        raw in prop::collection::vec(0u32..5, 0..50),
    ) {
        let tokens: Vec<Token> = raw.into_iter().map(|t| t % alphabet).collect();
        let sam = build(alphabet, 4096, &tokens);
        prop_assert_eq!(sam.evictions(), 0);

        let counts = continuation_counts(&tokens);
        let mut totals: HashMap<Vec<Token>, u32> = HashMap::new();
        for ((context, token), &n) in &counts {
            *totals.entry(context.clone()).or_insert(0) += n;
            let state = state_of(&sam, context);
            prop_assert!(state.is_some(), "context {:?} not recognized", context);
            let w = state.and_then(|s| sam.transition(s, *token)).map(|tr| tr.weight);
            prop_assert_eq!(w, Some(n), "{:?} then {}", context, token);
        }
        for (context, total) in totals {
            let state = state_of(&sam, &context).unwrap();
            let out: u32 = (0..alphabet).filter_map(|t| sam.transition(state, t)).map(|tr| tr.weight).sum();
            prop_assert_eq!(out, total, "context {:?}", context);
        }
    }

    /// A finite `weight_depth` only ever undercounts.
    #[test]
    fn capped_weight_depth_never_overcounts(
        alphabet in 1u32..5,
        depth in 0u32..4,
        raw in prop::collection::vec(0u32..5, 0..50),
    ) {
        let tokens: Vec<Token> = raw.into_iter().map(|t| t % alphabet).collect();
        let params = AutomatonParams::new(alphabet, 4096).weight_depth(depth);
        let mut sam = BoundedAutomaton::with_params(params).unwrap();
        for &t in &tokens {
            sam.extend_verified(t).unwrap();
        }

        for ((context, token), n) in continuation_counts(&tokens) {
            let state = state_of(&sam, &context).unwrap();
            let w = sam.transition(state, token).map_or(0, |tr| tr.weight);
            prop_assert!(w >= 1 && w <= n, "{:?} then {}: {} of {}", context, token, w, n);
        }
    }

    /// `propose` respects both the option cap and the degree bound.
    #[test]
    fn propose_respects_bounds(
        alphabet in 1u32..8,
        tokens in prop::collection::vec(0u32..8, 0..120),
        max_options in 0u32..5,
        min_occ in 1u32..4,
        max_deg in 0u32..5,
    ) {
        let tokens: Vec<Token> = tokens.into_iter().map(|t| t % alphabet).collect();
        let sam = build(alphabet, 64, &tokens);

        let opts = sam.propose(max_options, min_occ, max_deg);
        prop_assert!(opts.len() <= max_options as usize);
        prop_assert!(opts.len() <= max_deg as usize);
        for w in opts.windows(2) {
            prop_assert!(w[0].weight > w[1].weight || (w[0].weight == w[1].weight && w[0].token < w[1].token));
        }
        for o in &opts {
            prop_assert!(o.weight >= min_occ);
        }
    }

    /// Raising p_dom only moves decisions out of SamDominated; raising h_max
    /// only moves them out of TargetOnly.
    #[test]
    fn tier_thresholds_are_monotone(
        degree in 0u32..10,
        best_prob in 0.0f32..=1.0,
        h_norm in 0.0f32..=1.0,
        p_lo in 0.01f32..=1.0,
        p_step in 0.0f32..=1.0,
        h_lo in 0.0f32..=1.0,
        h_step in 0.0f32..=1.0,
    ) {
        let p_hi = (p_lo + p_step).min(1.0);
        let h_hi = h_lo + h_step;
        let at = |p_dom: f32, h_max: f32| {
            let cfg = DispatchCfg::new(DispatchParams { p_dom, h_max, ..Default::default() }).unwrap();
            classify(degree, best_prob, h_norm, &cfg)
        };

        let lo = at(p_lo, h_lo);
        let p_raised = at(p_hi, h_lo);
        if lo != p_raised {
            prop_assert_eq!(lo, TierMode::SamDominated);
            prop_assert!(matches!(p_raised, TierMode::DraftArbitrate | TierMode::TargetOnly));
        }

        let h_raised = at(p_lo, h_hi);
        if lo != h_raised {
            prop_assert_eq!(lo, TierMode::TargetOnly);
            prop_assert_eq!(h_raised, TierMode::DraftArbitrate);
        }
    }

    /// Arbitration output is always one of the offered candidates, or an error.
    #[test]
    fn arbitration_stays_in_candidate_set(
        tokens in prop::collection::vec(0u32..6, 0..150),
        foreign in any::<bool>(),
    ) {
        let sam = build(6, 256, &tokens);
        let cfg = DispatchCfg::new(DispatchParams { min_occ: 1, p_dom: 1.0, h_max: 1.0, ..Default::default() }).unwrap();
        let decision = sam_branch_decision(&sam, &cfg);

        let mut draft = FirstOrForeign { foreign };
        match draft_arbitrate_next(&sam, &cfg, &mut draft, &tokens) {
            Ok(p) if p.mode == TierMode::DraftArbitrate => {
                prop_assert_eq!(p.tokens.len(), 1);
                prop_assert!(decision.candidates().contains(&p.tokens[0]));
            }
            Ok(p) => prop_assert_ne!(decision.mode, TierMode::DraftArbitrate, "{:?}", p),
            Err(SamError::ContractViolation { token, candidates }) => {
                prop_assert!(foreign);
                prop_assert!(!candidates.contains(&token));
            }
            Err(e) => prop_assert!(false, "unexpected error {}", e),
        }
    }

    /// Reading twice without extending gives bit-identical decisions.
    #[test]
    fn decision_is_idempotent(tokens in prop::collection::vec(0u32..4, 0..80)) {
        let sam = build(4, 32, &tokens);
        let cfg = DispatchCfg::default();
        let a = sam_branch_decision(&sam, &cfg);
        let b = sam_branch_decision(&sam, &cfg);
        prop_assert_eq!(a.h_norm.to_bits(), b.h_norm.to_bits());
        prop_assert_eq!(a.best_prob.to_bits(), b.best_prob.to_bits());
        prop_assert_eq!(a, b);
    }
}
