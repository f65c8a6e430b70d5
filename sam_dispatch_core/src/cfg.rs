use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SamError};

/// Smallest capacity for which eviction can always free two slots while
/// keeping root, the last state and the cursor state resident.
pub const MIN_CAPACITY: usize = 5;

/// Raw dispatch thresholds, as loaded from wherever the caller keeps config.
///
/// Nothing here is trusted until it has been turned into a [`DispatchCfg`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchParams {
    /// Branching degree above which memory is considered unreliable.
    pub k_max: u32,
    /// Minimum transition weight to count a continuation as viable.
    pub min_occ: u32,
    /// Dominance threshold on the best candidate's probability.
    pub p_dom: f32,
    /// Maximum normalized entropy that still admits draft arbitration.
    pub h_max: f32,
    /// Options reported per decision and forwarded to arbitration.
    pub max_branch_options: u32,
    /// Tokens emitted by deterministic lookahead.
    pub lookahead: u32,
}

impl Default for DispatchParams {
    fn default() -> Self {
        Self {
            k_max: 6,
            min_occ: 2,
            p_dom: 0.95,
            h_max: 0.20,
            max_branch_options: 6,
            lookahead: 4,
        }
    }
}

/// Validated, immutable dispatch configuration.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DispatchCfg {
    params: DispatchParams,
}

impl Default for DispatchCfg {
    fn default() -> Self {
        Self { params: DispatchParams::default() }
    }
}

impl DispatchCfg {
    pub fn new(params: DispatchParams) -> Result<Self> {
        let fail = |msg: String| -> Result<Self> {
            warn!(reason = %msg, "rejecting dispatch configuration");
            Err(SamError::InvalidConfig(msg))
        };

        if params.k_max < 1 {
            return fail("k_max must be >= 1".to_string());
        }
        if params.min_occ < 1 {
            return fail("min_occ must be >= 1".to_string());
        }
        if !(params.p_dom.is_finite() && params.p_dom > 0.0 && params.p_dom <= 1.0) {
            return fail(format!("p_dom must be in (0, 1], got {}", params.p_dom));
        }
        if !(params.h_max.is_finite() && params.h_max >= 0.0) {
            return fail(format!("h_max must be finite and >= 0, got {}", params.h_max));
        }
        if params.max_branch_options < 1 {
            return fail("max_branch_options must be >= 1".to_string());
        }
        if params.lookahead < 1 {
            return fail("lookahead must be >= 1".to_string());
        }
        Ok(Self { params })
    }

    #[inline]
    pub fn k_max(&self) -> u32 {
        self.params.k_max
    }

    #[inline]
    pub fn min_occ(&self) -> u32 {
        self.params.min_occ
    }

    #[inline]
    pub fn p_dom(&self) -> f32 {
        self.params.p_dom
    }

    #[inline]
    pub fn h_max(&self) -> f32 {
        self.params.h_max
    }

    #[inline]
    pub fn max_branch_options(&self) -> u32 {
        self.params.max_branch_options
    }

    #[inline]
    pub fn lookahead(&self) -> u32 {
        self.params.lookahead
    }

    pub fn params(&self) -> &DispatchParams {
        &self.params
    }
}

impl TryFrom<DispatchParams> for DispatchCfg {
    type Error = SamError;

    fn try_from(params: DispatchParams) -> Result<Self> {
        Self::new(params)
    }
}

impl<'de> Deserialize<'de> for DispatchCfg {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let params = DispatchParams::deserialize(deserializer)?;
        DispatchCfg::new(params).map_err(serde::de::Error::custom)
    }
}

/// Bump every context on the suffix-link chain. The chain never outgrows `capacity`.
pub const UNBOUNDED_WEIGHT_DEPTH: u32 = u32::MAX;

/// Construction parameters for a [`crate::BoundedAutomaton`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomatonParams {
    /// Vocabulary size; valid tokens are `0..alphabet_size`.
    pub alphabet_size: u32,
    /// Maximum number of live states, root included.
    pub capacity: usize,
    /// How many shallower suffix contexts also get their weight bumped per token.
    ///
    /// [`UNBOUNDED_WEIGHT_DEPTH`] keeps every weight an exact occurrence count.
    /// Smaller values cap the per-token walk and undercount shallow contexts.
    pub weight_depth: u32,
}

impl Default for AutomatonParams {
    fn default() -> Self {
        Self {
            alphabet_size: 128_000,
            capacity: 1 << 16,
            weight_depth: UNBOUNDED_WEIGHT_DEPTH,
        }
    }
}

impl AutomatonParams {
    pub fn new(alphabet_size: u32, capacity: usize) -> Self {
        Self {
            alphabet_size,
            capacity,
            ..Default::default()
        }
    }

    pub fn weight_depth(mut self, depth: u32) -> Self {
        self.weight_depth = depth;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.alphabet_size == 0 {
            warn!("rejecting automaton params: empty alphabet");
            return Err(SamError::InvalidConfig("alphabet_size must be >= 1".to_string()));
        }
        if self.capacity < MIN_CAPACITY {
            warn!(capacity = self.capacity, "rejecting automaton params: capacity too small");
            return Err(SamError::InvalidConfig(format!(
                "capacity must be >= {MIN_CAPACITY}, got {}",
                self.capacity
            )));
        }
        Ok(())
    }
}
