//! Error taxonomy for the automaton and dispatch core.

use thiserror::Error;

use crate::automaton::Token;

/// Failure reported by an external draft predictor.
pub type DraftFailure = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias for core operations.
pub type Result<T, E = SamError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum SamError {
    /// Token id is not below the configured vocabulary size. The automaton is unchanged.
    #[error("token {token} outside alphabet of size {alphabet_size}")]
    AlphabetOverflow { token: Token, alphabet_size: u32 },

    /// Configuration rejected at construction.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The draft predictor answered with a token it was not offered.
    #[error("draft predictor returned token {token} outside candidate set {candidates:?}")]
    ContractViolation { token: Token, candidates: Vec<Token> },

    /// The draft predictor itself failed; propagated unchanged.
    #[error("draft predictor failed: {0}")]
    Draft(#[source] DraftFailure),

    /// An automaton failed its well-formedness audit (e.g. a tampered snapshot).
    #[error("corrupt automaton state: {0}")]
    CorruptState(String),
}
