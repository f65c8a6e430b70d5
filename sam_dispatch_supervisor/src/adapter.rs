//! Domain adapter layer: turn verification outcomes from the serving loop into
//! verified-token events.
//!
//! This module is intentionally small and policy-light:
//! - No IO
//! - No async
//! - No dispatch rules (those live in core)

use std::borrow::Cow;
use std::collections::HashMap;

use sam_dispatch_core::Token;

/// Tokens the target model has confirmed for one decoding sequence, in stream order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedEvent<'a> {
    /// Sequence (request) key.
    pub seq_id: Cow<'a, str>,
    pub tokens: Cow<'a, [Token]>,
}

impl<'a> VerifiedEvent<'a> {
    pub fn new(seq_id: impl Into<Cow<'a, str>>, tokens: impl Into<Cow<'a, [Token]>>) -> Self {
        Self {
            seq_id: seq_id.into(),
            tokens: tokens.into(),
        }
    }

    /// Event for a speculation round: the accepted prefix of `proposed`
    /// followed by the target model's own token, if it produced one.
    ///
    /// `accepted` larger than the proposal is treated as "all accepted".
    pub fn from_verification(
        seq_id: impl Into<Cow<'a, str>>,
        proposed: &[Token],
        accepted: usize,
        correction: Option<Token>,
    ) -> Self {
        let accepted = accepted.min(proposed.len());
        let mut tokens = Vec::with_capacity(accepted + 1);
        tokens.extend_from_slice(&proposed[..accepted]);
        tokens.extend(correction);
        Self {
            seq_id: seq_id.into(),
            tokens: Cow::Owned(tokens),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Concatenate events per sequence, keeping each sequence's arrival order.
///
/// This is intentionally dumb; sharding is handled by the supervisor.
pub fn group_by_sequence(events: &[VerifiedEvent<'_>]) -> HashMap<String, Vec<Token>> {
    let mut out: HashMap<String, Vec<Token>> = HashMap::new();
    for ev in events {
        out.entry(ev.seq_id.to_string())
            .or_default()
            .extend_from_slice(&ev.tokens);
    }
    out
}
