//! Sharded sequence supervisor.
//!
//! Owns the per-sequence state around `sam_dispatch_core`:
//! - one `BoundedAutomaton` per decoding sequence
//! - groups verified tokens by `seq_id`
//! - keeps a bounded context window per sequence for the draft predictor
//! - runs the core dispatch functions
//!
//! No IO. No async. Concurrency is achieved by sharding sequences by `seq_id`;
//! automata are never shared between sequences.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use sam_dispatch_core::{
    draft_arbitrate_next, proposal_from_decision, sam_branch_decision, AutomatonParams, BoundedAutomaton,
    DispatchCfg, DraftModel, Proposal, Result, SamDecision, SamError, Token,
};
use tracing::{debug, warn};

use crate::adapter::{group_by_sequence, VerifiedEvent};

/// Default number of trailing verified tokens handed to the draft predictor.
pub const DEFAULT_CONTEXT_WINDOW: usize = 64;

/// Output of one ingest for one sequence.
#[derive(Debug)]
pub struct ProposalEvent {
    pub seq_id: String,
    pub proposal: Proposal,
    /// Tokens actually applied to the automaton in this ingest.
    pub extended: usize,
    /// Why the sequence stopped early, if it did. Tokens before the rejected one stay applied.
    pub rejected: Option<SamError>,
    /// Telemetry; useful for logging/monitoring without re-reading the automaton.
    pub decision: SamDecision,
}

/// Everything the supervisor keeps for one sequence.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct SequenceSlot {
    pub automaton: BoundedAutomaton,
    pub context: VecDeque<Token>,
}

impl SequenceSlot {
    pub fn new(params: &AutomatonParams) -> Result<Self> {
        Ok(Self {
            automaton: BoundedAutomaton::with_params(params.clone())?,
            context: VecDeque::new(),
        })
    }

    fn push_context(&mut self, token: Token, window: usize) {
        if window == 0 {
            return;
        }
        while self.context.len() >= window {
            self.context.pop_front();
        }
        self.context.push_back(token);
    }
}

/// Snapshot of supervisor state for storage-agnostic persistence.
///
/// This is intentionally pure data: callers decide how/where to store it.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct SupervisorSnapshot {
    /// Per-sequence state, sorted by `seq_id`.
    pub sequences: Vec<(String, SequenceSlot)>,
}

/// Simple observability counters returned by restore operations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RestoreStats {
    /// Number of sequences applied from the snapshot.
    pub applied: usize,
    /// Number of existing sequences that were overwritten.
    pub overwritten: usize,
}

#[derive(Default, Debug)]
struct Shard {
    seqs: HashMap<String, SequenceSlot>,
}

/// Deterministic FNV-1a hash (stable across runs).
fn fnv1a_u64(s: &str) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in s.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

fn shard_index(seq_id: &str, shard_count: usize) -> usize {
    if shard_count <= 1 {
        return 0;
    }
    (fnv1a_u64(seq_id) as usize) % shard_count
}

/// A sharded supervisor. One "instance" is one `(seq_id -> SequenceSlot)` entry.
///
/// - `shards == 1` behaves like a single-threaded supervisor.
/// - More shards reduce contention when callers drive it from several threads;
///   each sequence still has exactly one writer at a time.
#[derive(Debug)]
pub struct SequenceSupervisor {
    params: AutomatonParams,
    cfg: DispatchCfg,
    /// Optional per-sequence cfg overrides.
    cfg_overrides: HashMap<String, DispatchCfg>,
    context_window: usize,
    shards: usize,
    // NOTE: State is behind a Mutex for interior mutability. This crate does not spawn threads.
    state_shards: Vec<Mutex<Shard>>,
}

impl SequenceSupervisor {
    /// Create a supervisor with `shards` (concurrency count). Fails on bad automaton params.
    pub fn new(shards: usize, params: AutomatonParams, cfg: DispatchCfg) -> Result<Self> {
        params.validate()?;
        let shards = shards.max(1);
        let mut state_shards = Vec::with_capacity(shards);
        for _ in 0..shards {
            state_shards.push(Mutex::new(Shard::default()));
        }

        Ok(Self {
            params,
            cfg,
            cfg_overrides: HashMap::new(),
            context_window: DEFAULT_CONTEXT_WINDOW,
            shards,
            state_shards,
        })
    }

    /// Bound the per-sequence context window. Existing windows shrink on their next push.
    pub fn set_context_window(&mut self, window: usize) {
        self.context_window = window;
    }

    /// Override cfg for a specific `seq_id`.
    pub fn set_cfg_override(&mut self, seq_id: impl Into<String>, cfg: DispatchCfg) {
        self.cfg_overrides.insert(seq_id.into(), cfg);
    }

    /// Remove cfg override for a specific `seq_id`.
    pub fn clear_cfg_override(&mut self, seq_id: &str) {
        self.cfg_overrides.remove(seq_id);
    }

    fn cfg_for(&self, seq_id: &str) -> &DispatchCfg {
        self.cfg_overrides.get(seq_id).unwrap_or(&self.cfg)
    }

    fn lock(&self, idx: usize) -> MutexGuard<'_, Shard> {
        self.state_shards[idx]
            .lock()
            .expect("sequence supervisor shard mutex poisoned")
    }

    fn shard_for(&self, seq_id: &str) -> MutexGuard<'_, Shard> {
        self.lock(shard_index(seq_id, self.shards))
    }

    pub fn sequence_count(&self) -> usize {
        (0..self.shards).map(|i| self.lock(i).seqs.len()).sum()
    }

    /// Ingest a batch of verified-token events and return one proposal per touched sequence.
    ///
    /// Deterministic for a given input ordering + shard count. Output is sorted by `seq_id`.
    pub fn ingest(&self, events: &[VerifiedEvent<'_>]) -> Vec<ProposalEvent> {
        // 1) Concatenate per sequence.
        let mut batches = group_by_sequence(events);

        // 2) Group sequences by shard to avoid lock-per-sequence.
        let mut shard_seqs: Vec<Vec<String>> = vec![Vec::new(); self.shards];
        for seq_id in batches.keys() {
            shard_seqs[shard_index(seq_id, self.shards)].push(seq_id.clone());
        }
        for v in &mut shard_seqs {
            v.sort();
        }

        // 3) Extend + dispatch per shard (lock each shard once).
        let mut out: Vec<ProposalEvent> = Vec::with_capacity(batches.len());
        for (shard_idx, seqs) in shard_seqs.into_iter().enumerate() {
            if seqs.is_empty() {
                continue;
            }
            let mut guard = self.lock(shard_idx);

            for seq_id in seqs {
                let tokens = batches.remove(&seq_id).unwrap_or_default();
                let slot = match guard.seqs.entry(seq_id.clone()) {
                    Entry::Occupied(e) => e.into_mut(),
                    Entry::Vacant(e) => match SequenceSlot::new(&self.params) {
                        Ok(slot) => e.insert(slot),
                        Err(err) => {
                            warn!(seq_id = %seq_id, error = %err, "cannot open sequence");
                            continue;
                        }
                    },
                };

                let mut extended = 0usize;
                let mut rejected = None;
                for t in tokens {
                    match slot.automaton.extend_verified(t) {
                        Ok(_) => {
                            slot.push_context(t, self.context_window);
                            extended += 1;
                        }
                        Err(err) => {
                            warn!(seq_id = %seq_id, token = t, error = %err, "rejected verified token");
                            rejected = Some(err);
                            break;
                        }
                    }
                }

                let cfg = self.cfg_for(&seq_id);
                let decision = sam_branch_decision(&slot.automaton, cfg);
                let proposal = proposal_from_decision(&slot.automaton, cfg, &decision);
                debug!(
                    seq_id = %seq_id,
                    extended,
                    mode = ?proposal.mode,
                    emitted = proposal.tokens.len(),
                    states = slot.automaton.state_count(),
                    "sequence ingested"
                );

                out.push(ProposalEvent {
                    seq_id,
                    proposal,
                    extended,
                    rejected,
                    decision,
                });
            }
        }

        out.sort_by(|a, b| a.seq_id.cmp(&b.seq_id));
        out
    }

    /// Current decision for a sequence, `None` if the supervisor has never seen it.
    pub fn decision(&self, seq_id: &str) -> Option<SamDecision> {
        let guard = self.shard_for(seq_id);
        let slot = guard.seqs.get(seq_id)?;
        Some(sam_branch_decision(&slot.automaton, self.cfg_for(seq_id)))
    }

    /// Trailing verified tokens kept for the sequence.
    pub fn context(&self, seq_id: &str) -> Option<Vec<Token>> {
        let guard = self.shard_for(seq_id);
        guard.seqs.get(seq_id).map(|s| s.context.iter().copied().collect())
    }

    /// Run arbitration for one sequence using its stored context window.
    ///
    /// Holds the sequence's shard lock across the predictor call. Unknown
    /// sequences get the target-only fallback.
    pub fn arbitrate<D>(&self, seq_id: &str, draft: &mut D) -> Result<Proposal>
    where
        D: DraftModel + ?Sized,
    {
        let guard = self.shard_for(seq_id);
        let Some(slot) = guard.seqs.get(seq_id) else {
            return Ok(Proposal::target_only());
        };
        let ctx: Vec<Token> = slot.context.iter().copied().collect();
        draft_arbitrate_next(&slot.automaton, self.cfg_for(seq_id), draft, &ctx)
    }

    /// Drop a finished sequence.
    pub fn clear_sequence(&self, seq_id: &str) -> bool {
        self.shard_for(seq_id).seqs.remove(seq_id).is_some()
    }

    /// Export every sequence. Deterministic ordering: sorted by `seq_id`.
    pub fn snapshot(&self) -> SupervisorSnapshot {
        self.snapshot_filtered(|_, _| true)
    }

    /// Export a snapshot filtered by a caller-provided predicate.
    ///
    /// Deterministic ordering: sequences are returned sorted by `seq_id`.
    pub fn snapshot_filtered<F>(&self, mut predicate: F) -> SupervisorSnapshot
    where
        F: FnMut(&str, &SequenceSlot) -> bool,
    {
        let mut out: Vec<(String, SequenceSlot)> = Vec::new();

        // Lock shards in a stable order.
        for idx in 0..self.shards {
            let guard = self.lock(idx);
            for (k, v) in guard.seqs.iter() {
                if predicate(k.as_str(), v) {
                    out.push((k.clone(), v.clone()));
                }
            }
        }

        out.sort_by(|a, b| a.0.cmp(&b.0));
        SupervisorSnapshot { sequences: out }
    }

    /// Export a snapshot containing only the provided `seq_id`s.
    pub fn snapshot_sequences(&self, seq_ids: &[&str]) -> SupervisorSnapshot {
        let want: HashSet<&str> = seq_ids.iter().copied().collect();
        self.snapshot_filtered(|id, _| want.contains(id))
    }

    /// Replace all state with the snapshot.
    ///
    /// Automata in a snapshot already passed the audit when they were
    /// deserialized, so a corrupt snapshot never gets this far.
    pub fn restore(&self, snap: SupervisorSnapshot) -> RestoreStats {
        self.import(snap, false)
    }

    /// Merge the snapshot into the current state; snapshot entries win on collision.
    pub fn restore_merge(&self, snap: SupervisorSnapshot) -> RestoreStats {
        self.import(snap, true)
    }

    fn import(&self, snap: SupervisorSnapshot, merge: bool) -> RestoreStats {
        if !merge {
            for idx in 0..self.shards {
                self.lock(idx).seqs.clear();
            }
        }

        let mut stats = RestoreStats::default();
        for (seq_id, mut slot) in snap.sequences {
            while slot.context.len() > self.context_window {
                slot.context.pop_front();
            }
            let mut guard = self.shard_for(&seq_id);
            if guard.seqs.insert(seq_id, slot).is_some() {
                stats.overwritten += 1;
            }
            stats.applied += 1;
        }

        debug!(merge, applied = stats.applied, overwritten = stats.overwritten, "restored sequences");
        stats
    }
}
