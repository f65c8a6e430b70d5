use sam_dispatch_core::{AutomatonParams, DispatchCfg, DispatchParams, DraftFailure, DraftModel, SamError, TierMode, Token};
use sam_dispatch_supervisor::{SequenceSupervisor, SupervisorSnapshot, VerifiedEvent};

fn supervisor(shards: usize) -> SequenceSupervisor {
    SequenceSupervisor::new(shards, AutomatonParams::new(1000, 4096), DispatchCfg::default()).unwrap()
}

fn repeated(pattern: &[Token], times: usize) -> Vec<Token> {
    pattern.iter().copied().cycle().take(pattern.len() * times).collect()
}

fn split_context(major: u32, minor: u32) -> Vec<Token> {
    let mut seq = Vec::new();
    for i in 0..major {
        seq.extend([100 + i, 5, 6]);
    }
    for i in 0..minor {
        seq.extend([200 + i, 5, 7]);
    }
    seq.extend([300, 5]);
    seq
}

#[derive(Default)]
struct Recording {
    calls: Vec<(Vec<Token>, Vec<Token>)>,
}

impl DraftModel for Recording {
    fn choose_next(&mut self, ctx: &[Token], candidates: &[Token]) -> Result<Token, DraftFailure> {
        self.calls.push((ctx.to_vec(), candidates.to_vec()));
        Ok(*candidates.last().unwrap())
    }
}

#[test]
fn rejects_bad_automaton_params() {
    let err = SequenceSupervisor::new(2, AutomatonParams::new(0, 4096), DispatchCfg::default()).unwrap_err();
    assert!(matches!(err, SamError::InvalidConfig(_)));
}

#[test]
fn output_is_sorted_and_per_sequence() {
    let sup = supervisor(4);
    let events = [
        VerifiedEvent::new("b", vec![1, 2]),
        VerifiedEvent::new("a", vec![7]),
        VerifiedEvent::new("b", vec![3]),
    ];
    let out = sup.ingest(&events);
    let ids: Vec<&str> = out.iter().map(|e| e.seq_id.as_str()).collect();
    assert_eq!(ids, ["a", "b"]);
    assert_eq!(out[0].extended, 1);
    assert_eq!(out[1].extended, 3);
    assert_eq!(sup.sequence_count(), 2);
    assert_eq!(sup.context("b").unwrap(), vec![1, 2, 3]);
}

#[test]
fn shard_count_does_not_change_results() {
    let stream = repeated(&[10, 20, 30, 40], 3);
    let events: Vec<VerifiedEvent<'_>> = ["x", "y", "z", "w"]
        .iter()
        .map(|id| VerifiedEvent::new(*id, &stream[..]))
        .collect();

    let one = supervisor(1).ingest(&events);
    let many = supervisor(7).ingest(&events);
    assert_eq!(one.len(), many.len());
    for (a, b) in one.iter().zip(&many) {
        assert_eq!(a.seq_id, b.seq_id);
        assert_eq!(a.proposal, b.proposal);
        assert_eq!(a.decision, b.decision);
    }
}

#[test]
fn rejected_token_stops_only_that_sequence() {
    let sup = supervisor(2);
    let events = [
        VerifiedEvent::new("bad", vec![1, 2, 5000, 3]),
        VerifiedEvent::new("good", vec![1, 2, 3]),
    ];
    let out = sup.ingest(&events);

    let bad = &out[0];
    assert_eq!(bad.seq_id, "bad");
    assert_eq!(bad.extended, 2);
    assert!(matches!(
        bad.rejected,
        Some(SamError::AlphabetOverflow { token: 5000, alphabet_size: 1000 })
    ));
    assert_eq!(sup.context("bad").unwrap(), vec![1, 2]);

    let good = &out[1];
    assert_eq!(good.extended, 3);
    assert!(good.rejected.is_none());
}

#[test]
fn context_window_keeps_the_tail() {
    let mut sup = supervisor(1);
    sup.set_context_window(3);
    sup.ingest(&[VerifiedEvent::new("s", vec![1, 2, 3, 4, 5, 6])]);
    assert_eq!(sup.context("s").unwrap(), vec![4, 5, 6]);
    assert!(sup.context("missing").is_none());
}

#[test]
fn cfg_override_applies_to_one_sequence() {
    let mut sup = supervisor(2);
    let loose = DispatchCfg::new(DispatchParams {
        min_occ: 1,
        ..DispatchParams::default()
    })
    .unwrap();
    sup.set_cfg_override("loose", loose);

    let stream = repeated(&[10, 20, 30, 40], 2);
    let out = sup.ingest(&[
        VerifiedEvent::new("loose", &stream[..]),
        VerifiedEvent::new("strict", &stream[..]),
    ]);

    assert_eq!(out[0].proposal.mode, TierMode::SamDeterministic);
    assert_eq!(out[0].proposal.tokens, vec![10, 20, 30, 40]);
    assert_eq!(out[1].proposal.mode, TierMode::TargetOnly);
    assert!(!out[1].proposal.is_speculative());

    sup.clear_cfg_override("loose");
    assert_eq!(sup.decision("loose").unwrap().mode, TierMode::TargetOnly);
}

#[test]
fn arbitration_uses_stored_context() {
    let sup = SequenceSupervisor::new(
        3,
        AutomatonParams::new(1000, 4096),
        DispatchCfg::new(DispatchParams {
            h_max: 0.7,
            ..DispatchParams::default()
        })
        .unwrap(),
    )
    .unwrap();

    let stream = split_context(12, 2);
    let out = sup.ingest(&[VerifiedEvent::new("s", &stream[..])]);
    assert_eq!(out[0].proposal.mode, TierMode::DraftArbitrate);
    assert!(out[0].proposal.tokens.is_empty());

    let mut draft = Recording::default();
    let proposal = sup.arbitrate("s", &mut draft).unwrap();
    assert_eq!(proposal.tokens, vec![7]);
    assert_eq!(draft.calls.len(), 1);
    assert_eq!(draft.calls[0].0, stream);
    assert_eq!(draft.calls[0].1, vec![6, 7]);

    let unknown = sup.arbitrate("nobody", &mut draft).unwrap();
    assert_eq!(unknown.mode, TierMode::TargetOnly);
    assert_eq!(draft.calls.len(), 1);
}

#[test]
fn snapshot_restore_roundtrip_through_json() {
    let sup = supervisor(3);
    let stream = repeated(&[10, 20, 30, 40], 3);
    sup.ingest(&[
        VerifiedEvent::new("a", &stream[..]),
        VerifiedEvent::new("b", vec![1, 2, 1, 2, 1]),
    ]);

    let snap = sup.snapshot();
    let ids: Vec<&str> = snap.sequences.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, ["a", "b"]);

    let json = serde_json::to_string(&snap).unwrap();
    let back: SupervisorSnapshot = serde_json::from_str(&json).unwrap();

    let fresh = supervisor(5);
    let stats = fresh.restore(back);
    assert_eq!(stats.applied, 2);
    assert_eq!(stats.overwritten, 0);
    assert_eq!(fresh.decision("a"), sup.decision("a"));
    assert_eq!(fresh.decision("b"), sup.decision("b"));
    assert_eq!(fresh.context("a"), sup.context("a"));

    // Both continue identically.
    let more = [VerifiedEvent::new("a", vec![10, 20])];
    let x = sup.ingest(&more);
    let y = fresh.ingest(&more);
    assert_eq!(x[0].proposal, y[0].proposal);
}

#[test]
fn restore_replaces_and_merge_overwrites() {
    let sup = supervisor(2);
    sup.ingest(&[VerifiedEvent::new("a", vec![1, 2]), VerifiedEvent::new("b", vec![3])]);
    let only_a = sup.snapshot_sequences(&["a"]);
    assert_eq!(only_a.sequences.len(), 1);

    sup.ingest(&[VerifiedEvent::new("c", vec![4])]);
    let stats = sup.restore_merge(only_a.clone());
    assert_eq!(stats.applied, 1);
    assert_eq!(stats.overwritten, 1);
    assert_eq!(sup.sequence_count(), 3);

    sup.restore(only_a);
    assert_eq!(sup.sequence_count(), 1);
    assert!(sup.decision("b").is_none());
}

#[test]
fn restore_truncates_context_to_window() {
    let sup = supervisor(1);
    sup.ingest(&[VerifiedEvent::new("s", vec![1, 2, 3, 4, 5])]);
    let snap = sup.snapshot();

    let mut narrow = supervisor(1);
    narrow.set_context_window(2);
    narrow.restore(snap);
    assert_eq!(narrow.context("s").unwrap(), vec![4, 5]);
}

#[test]
fn corrupt_snapshot_is_rejected_on_load() {
    let sup = supervisor(2);
    sup.ingest(&[VerifiedEvent::new("keep", vec![1, 2, 3])]);
    let value = serde_json::to_value(sup.snapshot()).unwrap();

    let mut shrunk = value.clone();
    shrunk["sequences"][0][1]["automaton"]["capacity"] = serde_json::json!(2);
    let err = serde_json::from_value::<SupervisorSnapshot>(shrunk).unwrap_err();
    assert!(err.to_string().contains("capacity 2 below minimum"), "{err}");

    let mut rewound = value;
    rewound["sequences"][0][1]["automaton"]["tick"] = serde_json::json!(0);
    assert!(serde_json::from_value::<SupervisorSnapshot>(rewound).is_err());

    assert_eq!(sup.sequence_count(), 1);
    assert_eq!(sup.context("keep").unwrap(), vec![1, 2, 3]);
}

#[test]
fn clear_sequence_drops_state() {
    let sup = supervisor(2);
    sup.ingest(&[VerifiedEvent::from_verification("s", &[4, 5, 6], 1, Some(8))]);
    assert_eq!(sup.context("s").unwrap(), vec![4, 8]);
    assert!(sup.clear_sequence("s"));
    assert!(!sup.clear_sequence("s"));
    assert_eq!(sup.sequence_count(), 0);
}
