//! sam_dispatch_supervisor
//!
//! Outside-world facing orchestration layer for `sam_dispatch_core`.
//!
//! Responsibilities:
//! - own one `BoundedAutomaton` per decoding sequence
//! - shard sequences by `seq_id` (deterministic)
//! - turn verification outcomes into verified-token events via adapters
//! - invoke core dispatch and arbitration
//!
//! Non-goals:
//! - no IO
//! - no async
//! - no dispatch policy (lives in core)

pub mod adapter;
pub mod supervisor;

pub use adapter::{group_by_sequence, VerifiedEvent};

pub use supervisor::{
    ProposalEvent,
    RestoreStats,
    SequenceSlot,
    SequenceSupervisor,
    SupervisorSnapshot,
    DEFAULT_CONTEXT_WINDOW,
};
