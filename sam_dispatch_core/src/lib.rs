pub mod automaton;
pub mod cursor;

pub mod error;
pub mod cfg;
pub mod decide;
pub mod arbitrate;

pub use automaton::{BoundedAutomaton, StateId, Token, Transition, NIL, ROOT};
pub use cursor::{BranchOption, Branching, MatchCursor};

pub use error::{DraftFailure, Result, SamError};
pub use cfg::{AutomatonParams, DispatchCfg, DispatchParams, MIN_CAPACITY, UNBOUNDED_WEIGHT_DEPTH};
pub use decide::{
    classify, dispatch_propose, normalized_entropy, proposal_from_decision, sam_branch_decision, Proposal,
    SamDecision, TierMode,
};
pub use arbitrate::{draft_arbitrate_next, DraftModel};
