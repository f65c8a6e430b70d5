use serde::{Deserialize, Serialize};

use crate::automaton::{BoundedAutomaton, StateId, Token, ROOT};

/// Longest suffix of the verified stream that the automaton has seen before.
///
/// Owned by the automaton and refreshed by every `extend_verified`; callers
/// only ever get a copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchCursor {
    pub state: StateId,
    /// Length of the matched suffix.
    pub len: u64,
}

impl MatchCursor {
    #[inline]
    pub fn new(state: StateId, len: u64) -> Self {
        Self { state, len }
    }

    #[inline]
    pub fn root() -> Self {
        Self { state: ROOT, len: 0 }
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.state == ROOT
    }
}

/// One viable continuation out of a state.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BranchOption {
    pub token: Token,
    pub to_state: StateId,
    pub weight: u32,
    /// `weight` over the total weight of the filtered candidates.
    pub prob: f32,
}

/// Every continuation of a state meeting the occurrence filter, best first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Branching {
    pub degree: u32,
    pub options: Vec<BranchOption>,
}

impl BoundedAutomaton {
    /// Branching of an arbitrary live state; empty for dead ids.
    ///
    /// Ordered by weight descending, then token ascending.
    pub fn branching_at(&self, state: StateId, min_occ: u32) -> Branching {
        let Some(edges) = self.edges(state) else {
            return Branching::default();
        };

        let mut options: Vec<BranchOption> = edges
            .iter()
            .filter(|(_, tr)| tr.weight >= min_occ)
            .map(|(&token, tr)| BranchOption {
                token,
                to_state: tr.target,
                weight: tr.weight,
                prob: 0.0,
            })
            .collect();
        options.sort_unstable_by(|a, b| b.weight.cmp(&a.weight).then(a.token.cmp(&b.token)));

        let total_weight: u64 = options.iter().map(|o| o.weight as u64).sum();
        if total_weight > 0 {
            for o in &mut options {
                o.prob = (o.weight as f64 / total_weight as f64) as f32;
            }
        }

        Branching {
            degree: options.len() as u32,
            options,
        }
    }

    /// Branching at the match cursor.
    pub fn branching(&self, min_occ: u32) -> Branching {
        self.branching_at(self.cursor().state, min_occ)
    }

    /// Filtered continuations at the cursor, at most `max_options` of them.
    ///
    /// Returns nothing when more than `max_deg` continuations pass the filter:
    /// past that point the memory is too ambiguous to trust on its own.
    pub fn propose(&self, max_options: u32, min_occ: u32, max_deg: u32) -> Vec<BranchOption> {
        let mut branching = self.branching(min_occ);
        if branching.degree > max_deg {
            return Vec::new();
        }
        branching.options.truncate(max_options as usize);
        branching.options
    }
}
