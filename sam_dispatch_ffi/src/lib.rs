#![allow(clippy::missing_safety_doc)]

use std::ffi::c_void;
use std::ptr;

use sam_dispatch_core::{
    dispatch_propose, draft_arbitrate_next, AutomatonParams, BoundedAutomaton, DispatchCfg, DispatchParams,
    DraftFailure, DraftModel, Proposal, SamError, TierMode, Token,
};
use tracing::warn;

/// FFI ABI version for sam_dispatch_ffi.
///
/// Bump this when any `#[repr(C)]` struct layout or exported function signature changes.
pub const SAM_DISPATCH_FFI_VERSION: u32 = 1;

pub const SAM_OK: i32 = 0;
pub const SAM_ERR_BAD_ARGS: i32 = -1;
pub const SAM_ERR_ALPHABET_OVERFLOW: i32 = -2;
pub const SAM_ERR_INVALID_CONFIG: i32 = -3;
pub const SAM_ERR_CONTRACT_VIOLATION: i32 = -4;
pub const SAM_ERR_DRAFT_FAILURE: i32 = -5;
pub const SAM_ERR_CORRUPT_STATE: i32 = -6;

#[no_mangle]
pub extern "C" fn sam_dispatch_ffi_version() -> u32 {
    SAM_DISPATCH_FFI_VERSION
}

fn rc_for(err: &SamError) -> i32 {
    match err {
        SamError::AlphabetOverflow { .. } => SAM_ERR_ALPHABET_OVERFLOW,
        SamError::InvalidConfig(_) => SAM_ERR_INVALID_CONFIG,
        SamError::ContractViolation { .. } => SAM_ERR_CONTRACT_VIOLATION,
        SamError::Draft(_) => SAM_ERR_DRAFT_FAILURE,
        SamError::CorruptState(_) => SAM_ERR_CORRUPT_STATE,
    }
}

/// Opaque handle exposed over FFI: one automaton plus its dispatch cfg.
pub struct SamAutomaton {
    inner: BoundedAutomaton,
    cfg: DispatchCfg,
}

/// Dispatch cfg for FFI. Validated on use; never clamped.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SamCfg {
    pub k_max: u32,
    pub min_occ: u32,
    pub p_dom: f32,
    pub h_max: f32,
    pub max_branch_options: u32,
    pub lookahead: u32,
}

#[no_mangle]
pub extern "C" fn sam_cfg_default() -> SamCfg {
    let d = DispatchParams::default();
    SamCfg {
        k_max: d.k_max,
        min_occ: d.min_occ,
        p_dom: d.p_dom,
        h_max: d.h_max,
        max_branch_options: d.max_branch_options,
        lookahead: d.lookahead,
    }
}

fn cfg_from_ffi(c: SamCfg) -> Result<DispatchCfg, SamError> {
    DispatchCfg::new(DispatchParams {
        k_max: c.k_max,
        min_occ: c.min_occ,
        p_dom: c.p_dom,
        h_max: c.h_max,
        max_branch_options: c.max_branch_options,
        lookahead: c.lookahead,
    })
}

/// Automaton construction parameters for FFI.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SamAutomatonParams {
    pub alphabet_size: u32,
    pub capacity: usize,
    pub weight_depth: u32,
}

#[no_mangle]
pub extern "C" fn sam_automaton_params_default() -> SamAutomatonParams {
    let d = AutomatonParams::default();
    SamAutomatonParams {
        alphabet_size: d.alphabet_size,
        capacity: d.capacity,
        weight_depth: d.weight_depth,
    }
}

/// Check a cfg without building anything. Returns 0 or `SAM_ERR_INVALID_CONFIG`.
#[no_mangle]
pub extern "C" fn sam_cfg_validate(cfg: SamCfg) -> i32 {
    match cfg_from_ffi(cfg) {
        Ok(_) => SAM_OK,
        Err(e) => rc_for(&e),
    }
}

/// Tier as a C-friendly enum.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamTier {
    SamDeterministic = 0,
    SamDominated = 1,
    DraftArbitrate = 2,
    TargetOnly = 3,
}

fn tier_to_ffi(m: TierMode) -> SamTier {
    match m {
        TierMode::SamDeterministic => SamTier::SamDeterministic,
        TierMode::SamDominated => SamTier::SamDominated,
        TierMode::DraftArbitrate => SamTier::DraftArbitrate,
        TierMode::TargetOnly => SamTier::TargetOnly,
    }
}

/// Create a new automaton handle. Returns null if params or cfg are invalid.
///
/// The handle is single-writer: do not call into the same handle from several threads at once.
#[no_mangle]
pub extern "C" fn sam_automaton_new(params: SamAutomatonParams, cfg: SamCfg) -> *mut SamAutomaton {
    let params = AutomatonParams::new(params.alphabet_size, params.capacity).weight_depth(params.weight_depth);
    let built = BoundedAutomaton::with_params(params).and_then(|inner| Ok((inner, cfg_from_ffi(cfg)?)));
    match built {
        Ok((inner, cfg)) => Box::into_raw(Box::new(SamAutomaton { inner, cfg })),
        Err(e) => {
            warn!(error = %e, "sam_automaton_new rejected arguments");
            ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn sam_automaton_free(h: *mut SamAutomaton) {
    if !h.is_null() {
        drop(Box::from_raw(h));
    }
}

/// Replace the handle's dispatch cfg. On error the old cfg stays.
#[no_mangle]
pub unsafe extern "C" fn sam_set_cfg(h: *mut SamAutomaton, cfg: SamCfg) -> i32 {
    let Some(handle) = h.as_mut() else {
        return SAM_ERR_BAD_ARGS;
    };
    match cfg_from_ffi(cfg) {
        Ok(cfg) => {
            handle.cfg = cfg;
            SAM_OK
        }
        Err(e) => rc_for(&e),
    }
}

/// Feed one verified token.
#[no_mangle]
pub unsafe extern "C" fn sam_extend_verified(h: *mut SamAutomaton, token: u32) -> i32 {
    let Some(handle) = h.as_mut() else {
        return SAM_ERR_BAD_ARGS;
    };
    match handle.inner.extend_verified(token) {
        Ok(_) => SAM_OK,
        Err(e) => rc_for(&e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn sam_state_count(h: *const SamAutomaton) -> usize {
    h.as_ref().map_or(0, |handle| handle.inner.state_count())
}

/// Matched suffix length at the cursor (0 for a null handle).
#[no_mangle]
pub unsafe extern "C" fn sam_matched_len(h: *const SamAutomaton) -> u64 {
    h.as_ref().map_or(0, |handle| handle.inner.cursor().len)
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SamBranchOption {
    pub token: u32,
    pub to_state: u32,
    pub weight: u32,
    pub prob: f32,
}

/// Owned array returned over FFI (free with `sam_options_free`).
#[repr(C)]
pub struct SamOptionArray {
    pub ptr: *mut SamBranchOption,
    pub len: usize,
}

impl SamOptionArray {
    fn empty() -> Self {
        Self { ptr: ptr::null_mut(), len: 0 }
    }
}

/// Bounded continuation list at the cursor; empty when over `max_deg` or for a null handle.
#[no_mangle]
pub unsafe extern "C" fn sam_propose(
    h: *const SamAutomaton,
    max_options: u32,
    min_occ: u32,
    max_deg: u32,
) -> SamOptionArray {
    let Some(handle) = h.as_ref() else {
        return SamOptionArray::empty();
    };
    let opts: Vec<SamBranchOption> = handle
        .inner
        .propose(max_options, min_occ, max_deg)
        .into_iter()
        .map(|o| SamBranchOption {
            token: o.token,
            to_state: o.to_state,
            weight: o.weight,
            prob: o.prob,
        })
        .collect();
    if opts.is_empty() {
        return SamOptionArray::empty();
    }

    let mut boxed = opts.into_boxed_slice();
    let arr = SamOptionArray {
        ptr: boxed.as_mut_ptr(),
        len: boxed.len(),
    };
    // Freed by sam_options_free
    std::mem::forget(boxed);
    arr
}

#[no_mangle]
pub unsafe extern "C" fn sam_options_free(arr: SamOptionArray) {
    if !arr.ptr.is_null() {
        let slice_ptr = std::ptr::slice_from_raw_parts_mut(arr.ptr, arr.len);
        drop(Box::from_raw(slice_ptr));
    }
}

/// Owned proposal returned over FFI (free with `sam_proposal_free`).
///
/// When `rc != 0` the proposal is the target-only fallback and `tokens_ptr` is null.
#[repr(C)]
pub struct SamProposal {
    pub mode: SamTier,
    pub confidence: f32,
    pub tokens_ptr: *mut u32,
    pub tokens_len: usize,
    pub rc: i32,
}

fn proposal_to_ffi(p: Proposal, rc: i32) -> SamProposal {
    let (tokens_ptr, tokens_len) = if p.tokens.is_empty() {
        (ptr::null_mut(), 0)
    } else {
        let mut boxed = p.tokens.into_boxed_slice();
        let out = (boxed.as_mut_ptr(), boxed.len());
        std::mem::forget(boxed);
        out
    };
    SamProposal {
        mode: tier_to_ffi(p.mode),
        confidence: p.confidence,
        tokens_ptr,
        tokens_len,
        rc,
    }
}

fn failed(rc: i32) -> SamProposal {
    proposal_to_ffi(Proposal::target_only(), rc)
}

#[no_mangle]
pub unsafe extern "C" fn sam_dispatch_propose(h: *const SamAutomaton) -> SamProposal {
    let Some(handle) = h.as_ref() else {
        return failed(SAM_ERR_BAD_ARGS);
    };
    proposal_to_ffi(dispatch_propose(&handle.inner, &handle.cfg), SAM_OK)
}

/// Draft predictor callback.
///
/// Must write one of the `candidates` to `*out_token` and return 0; any other
/// return value is reported as a draft failure.
pub type SamDraftFn = unsafe extern "C" fn(
    user_data: *mut c_void,
    ctx_ptr: *const u32,
    ctx_len: usize,
    candidates_ptr: *const u32,
    candidates_len: usize,
    out_token: *mut u32,
) -> i32;

struct CallbackDraft {
    callback: SamDraftFn,
    user_data: *mut c_void,
}

impl DraftModel for CallbackDraft {
    fn choose_next(&mut self, ctx: &[Token], candidates: &[Token]) -> Result<Token, DraftFailure> {
        let mut out: u32 = 0;
        let rc = unsafe {
            (self.callback)(
                self.user_data,
                ctx.as_ptr(),
                ctx.len(),
                candidates.as_ptr(),
                candidates.len(),
                &mut out,
            )
        };
        if rc != 0 {
            return Err(format!("draft callback returned {rc}").into());
        }
        Ok(out)
    }
}

/// Dispatch, consulting `callback` only in the arbitration tier.
///
/// `ctx_ptr` may be null when `ctx_len == 0`.
#[no_mangle]
pub unsafe extern "C" fn sam_draft_arbitrate_next(
    h: *const SamAutomaton,
    callback: Option<SamDraftFn>,
    user_data: *mut c_void,
    ctx_ptr: *const u32,
    ctx_len: usize,
) -> SamProposal {
    let (Some(handle), Some(callback)) = (h.as_ref(), callback) else {
        return failed(SAM_ERR_BAD_ARGS);
    };
    let ctx: &[Token] = if ctx_len == 0 {
        &[]
    } else if ctx_ptr.is_null() {
        return failed(SAM_ERR_BAD_ARGS);
    } else {
        std::slice::from_raw_parts(ctx_ptr, ctx_len)
    };

    let mut draft = CallbackDraft { callback, user_data };
    match draft_arbitrate_next(&handle.inner, &handle.cfg, &mut draft, ctx) {
        Ok(p) => proposal_to_ffi(p, SAM_OK),
        Err(e) => failed(rc_for(&e)),
    }
}

#[no_mangle]
pub unsafe extern "C" fn sam_proposal_free(p: SamProposal) {
    if !p.tokens_ptr.is_null() {
        let slice_ptr = std::ptr::slice_from_raw_parts_mut(p.tokens_ptr, p.tokens_len);
        drop(Box::from_raw(slice_ptr));
    }
}
