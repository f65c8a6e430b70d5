//! Bounded online suffix automaton over verified tokens.
//!
//! States live in a dense arena addressed by `StateId`. Suffix links, the
//! reverse indexes used by eviction and the LRU list are all arena ids, never
//! references.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::trace;

use crate::cfg::{AutomatonParams, MIN_CAPACITY};
use crate::cursor::MatchCursor;
use crate::error::{Result, SamError};

pub type Token = u32;
pub type StateId = u32;

/// Root sentinel. Never evicted; also the redirect target for forgotten edges.
pub const ROOT: StateId = 0;

/// "No state": root's suffix link and the ends of the LRU list.
pub const NIL: StateId = u32::MAX;

/// Outgoing edge of a state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub target: StateId,
    /// Number of times the source context was observed followed by this token.
    pub weight: u32,
}

impl Transition {
    /// Every genuine target has `len >= 1`, so an edge into root is one whose
    /// target was evicted.
    #[inline]
    pub fn is_forgotten(&self) -> bool {
        self.target == ROOT
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct State {
    alive: bool,
    len: u64,
    link: StateId,
    next: FxHashMap<Token, Transition>,

    // reverse indexes, only read by eviction
    in_edges: FxHashSet<(StateId, Token)>,
    link_in: FxHashSet<StateId>,

    // LRU list (root is never on it)
    newer: StateId,
    older: StateId,
    last_seen: u64,
}

impl State {
    fn fresh(len: u64, tick: u64) -> Self {
        Self {
            alive: true,
            len,
            link: NIL,
            next: FxHashMap::default(),
            in_edges: FxHashSet::default(),
            link_in: FxHashSet::default(),
            newer: NIL,
            older: NIL,
            last_seen: tick,
        }
    }
}

/// Online suffix automaton capped at `capacity` live states.
///
/// Single writer: `extend_verified` takes `&mut self`, every query takes `&self`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(remote = "Self")]
pub struct BoundedAutomaton {
    alphabet_size: u32,
    capacity: usize,
    weight_depth: u32,

    states: Vec<State>,
    free: Vec<StateId>,
    live: usize,

    last: StateId,
    cursor: MatchCursor,

    lru_head: StateId,
    /// Eviction cursor: least recently visited non-root state.
    lru_tail: StateId,

    tick: u64,
    evictions: u64,
}

impl BoundedAutomaton {
    pub fn new(alphabet_size: u32, capacity: usize) -> Result<Self> {
        Self::with_params(AutomatonParams::new(alphabet_size, capacity))
    }

    pub fn with_params(params: AutomatonParams) -> Result<Self> {
        params.validate()?;
        let mut root = State::fresh(0, 0);
        root.link = NIL;

        let mut states = Vec::with_capacity(params.capacity.min(4096));
        states.push(root);

        Ok(Self {
            alphabet_size: params.alphabet_size,
            capacity: params.capacity,
            weight_depth: params.weight_depth,
            states,
            free: Vec::new(),
            live: 1,
            last: ROOT,
            cursor: MatchCursor::root(),
            lru_head: NIL,
            lru_tail: NIL,
            tick: 0,
            evictions: 0,
        })
    }

    #[inline]
    pub fn alphabet_size(&self) -> u32 {
        self.alphabet_size
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live states, root included.
    #[inline]
    pub fn state_count(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn tokens_seen(&self) -> u64 {
        self.tick
    }

    #[inline]
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    #[inline]
    pub fn cursor(&self) -> MatchCursor {
        self.cursor
    }

    /// State recognizing the whole stream seen so far.
    #[inline]
    pub fn last_state(&self) -> StateId {
        self.last
    }

    #[inline]
    pub fn is_live(&self, id: StateId) -> bool {
        self.states.get(id as usize).is_some_and(|s| s.alive)
    }

    pub fn state_len(&self, id: StateId) -> Option<u64> {
        self.live_state(id).map(|s| s.len)
    }

    pub fn suffix_link(&self, id: StateId) -> Option<StateId> {
        self.live_state(id).map(|s| s.link)
    }

    pub fn transition(&self, id: StateId, token: Token) -> Option<Transition> {
        self.live_state(id).and_then(|s| s.next.get(&token).copied())
    }

    /// Tokens since the state was last visited.
    pub fn age(&self, id: StateId) -> Option<u64> {
        self.live_state(id).map(|s| self.tick.saturating_sub(s.last_seen))
    }

    pub fn live_states(&self) -> impl Iterator<Item = StateId> + '_ {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.alive)
            .map(|(i, _)| i as StateId)
    }

    pub(crate) fn edges(&self, id: StateId) -> Option<&FxHashMap<Token, Transition>> {
        self.live_state(id).map(|s| &s.next)
    }

    fn live_state(&self, id: StateId) -> Option<&State> {
        self.states.get(id as usize).filter(|s| s.alive)
    }

    /// Append one verified token to the modeled stream and advance the cursor.
    ///
    /// Atomic: a rejected token leaves the automaton untouched.
    pub fn extend_verified(&mut self, token: Token) -> Result<MatchCursor> {
        if token >= self.alphabet_size {
            return Err(SamError::AlphabetOverflow {
                token,
                alphabet_size: self.alphabet_size,
            });
        }

        self.tick += 1;
        // at most two states are created below: the new last state and a clone
        self.make_room(2);

        let last = self.last;
        let cur = self.alloc(self.st(last).len + 1);

        let mut p = last;
        while p != NIL {
            let existing = self.st(p).next.get(&token).copied();
            match existing {
                Some(t) if !t.is_forgotten() => break,
                _ => {
                    let weight = existing.map_or(0, |t| t.weight).saturating_add(1);
                    self.set_edge(p, token, cur, weight);
                    self.touch(p);
                    p = self.st(p).link;
                }
            }
        }

        let link = if p == NIL {
            ROOT
        } else {
            let q = self.st(p).next.get(&token).map_or(ROOT, |t| t.target);
            self.bump(p, token);
            self.touch(p);
            let link = if self.st(p).len + 1 == self.st(q).len {
                q
            } else {
                self.split(p, q, token)
            };
            let shallower = self.st(p).link;
            self.bump_shallower(shallower, token);
            link
        };

        self.set_link(cur, link);
        self.last = cur;
        self.cursor = MatchCursor::new(link, self.st(link).len);
        self.touch(link);

        trace!(
            token,
            state = cur,
            cursor = link,
            matched = self.cursor.len,
            live = self.live,
            "extended automaton"
        );
        Ok(self.cursor)
    }

    /// Clone `q` so that the context reached via `p --token-->` gets its own state.
    fn split(&mut self, p: StateId, q: StateId, token: Token) -> StateId {
        let clone = self.alloc(self.st(p).len + 1);

        let edges: Vec<(Token, Transition)> =
            self.st(q).next.iter().map(|(&t, &tr)| (t, tr)).collect();
        for (t, tr) in edges {
            self.set_edge(clone, t, tr.target, tr.weight);
        }

        // links must shorten; eviction may have left q with a stale long link
        let q_link = self.st(q).link;
        let clone_link = if self.st(q_link).len < self.st(clone).len { q_link } else { ROOT };
        self.set_link(clone, clone_link);
        self.set_link(q, clone);

        let mut r = p;
        while r != NIL {
            match self.st(r).next.get(&token).copied() {
                Some(t) if t.target == q => {
                    self.set_edge(r, token, clone, t.weight);
                    r = self.st(r).link;
                }
                _ => break,
            }
        }

        self.touch(q);
        clone
    }

    /// Shorter contexts were followed by `token` too; count it for up to
    /// `weight_depth` of them (all of them by default).
    fn bump_shallower(&mut self, mut r: StateId, token: Token) {
        let mut depth = 0;
        while r != NIL && depth < self.weight_depth {
            self.bump(r, token);
            r = self.st(r).link;
            depth += 1;
        }
    }

    // -----------------------------------------------------------------
    // eviction
    // -----------------------------------------------------------------

    fn make_room(&mut self, needed: usize) {
        while self.live + needed > self.capacity {
            match self.eviction_victim() {
                Some(v) => self.evict(v),
                None => break,
            }
        }
    }

    fn eviction_victim(&self) -> Option<StateId> {
        let mut v = self.lru_tail;
        while v != NIL {
            if v != self.last && v != self.cursor.state {
                return Some(v);
            }
            v = self.st(v).newer;
        }
        None
    }

    fn evict(&mut self, v: StateId) {
        self.lru_unlink(v);
        let gone = std::mem::take(&mut self.states[v as usize]);

        for &(src, t) in &gone.in_edges {
            if let Some(tr) = self.states[src as usize].next.get_mut(&t) {
                if tr.target == v {
                    tr.target = ROOT;
                }
            }
        }
        for &child in &gone.link_in {
            self.states[child as usize].link = ROOT;
        }
        for (&t, tr) in &gone.next {
            if !tr.is_forgotten() {
                self.states[tr.target as usize].in_edges.remove(&(v, t));
            }
        }
        if gone.link != ROOT && gone.link != NIL {
            self.states[gone.link as usize].link_in.remove(&v);
        }

        self.free.push(v);
        self.live -= 1;
        self.evictions += 1;

        trace!(
            state = v,
            len = gone.len,
            idle = self.tick.saturating_sub(gone.last_seen),
            redirected = gone.in_edges.len(),
            "evicted state"
        );
    }

    // -----------------------------------------------------------------
    // arena bookkeeping
    // -----------------------------------------------------------------

    #[inline]
    fn st(&self, id: StateId) -> &State {
        &self.states[id as usize]
    }

    #[inline]
    fn st_mut(&mut self, id: StateId) -> &mut State {
        &mut self.states[id as usize]
    }

    fn alloc(&mut self, len: u64) -> StateId {
        let state = State::fresh(len, self.tick);
        let id = match self.free.pop() {
            Some(id) => {
                self.states[id as usize] = state;
                id
            }
            None => {
                self.states.push(state);
                (self.states.len() - 1) as StateId
            }
        };
        self.live += 1;
        self.lru_push_front(id);
        id
    }

    fn set_edge(&mut self, src: StateId, token: Token, target: StateId, weight: u32) {
        let old = self
            .st_mut(src)
            .next
            .insert(token, Transition { target, weight });
        if let Some(old) = old {
            if !old.is_forgotten() && old.target != target {
                self.st_mut(old.target).in_edges.remove(&(src, token));
            }
        }
        if target != ROOT {
            self.st_mut(target).in_edges.insert((src, token));
        }
    }

    fn set_link(&mut self, id: StateId, link: StateId) {
        let old = self.st(id).link;
        if old != ROOT && old != NIL {
            self.st_mut(old).link_in.remove(&id);
        }
        self.st_mut(id).link = link;
        if link != ROOT && link != NIL {
            self.st_mut(link).link_in.insert(id);
        }
    }

    fn bump(&mut self, src: StateId, token: Token) {
        if let Some(tr) = self.st_mut(src).next.get_mut(&token) {
            tr.weight = tr.weight.saturating_add(1);
        }
    }

    fn touch(&mut self, id: StateId) {
        if id == ROOT {
            return;
        }
        if self.lru_head != id {
            self.lru_unlink(id);
            self.lru_push_front(id);
        }
        let tick = self.tick;
        self.st_mut(id).last_seen = tick;
    }

    fn lru_unlink(&mut self, id: StateId) {
        let (newer, older) = {
            let s = self.st(id);
            (s.newer, s.older)
        };
        if newer != NIL {
            self.st_mut(newer).older = older;
        } else {
            self.lru_head = older;
        }
        if older != NIL {
            self.st_mut(older).newer = newer;
        } else {
            self.lru_tail = newer;
        }
        let s = self.st_mut(id);
        s.newer = NIL;
        s.older = NIL;
    }

    fn lru_push_front(&mut self, id: StateId) {
        let head = self.lru_head;
        let tick = self.tick;
        {
            let s = self.st_mut(id);
            s.older = head;
            s.newer = NIL;
            s.last_seen = tick;
        }
        if head != NIL {
            self.st_mut(head).newer = id;
        } else {
            self.lru_tail = id;
        }
        self.lru_head = id;
    }

    // -----------------------------------------------------------------
    // audit
    // -----------------------------------------------------------------

    /// Full well-formedness audit. O(states + transitions).
    pub fn check_invariants(&self) -> Result<()> {
        let corrupt = |msg: String| -> Result<()> { Err(SamError::CorruptState(msg)) };

        if self.alphabet_size == 0 {
            return corrupt("empty alphabet".to_string());
        }
        if self.capacity < MIN_CAPACITY {
            return corrupt(format!("capacity {} below minimum {MIN_CAPACITY}", self.capacity));
        }
        if self.states.len() > NIL as usize {
            return corrupt("arena exceeds id space".to_string());
        }
        if !self.states.first().is_some_and(|r| r.alive && r.len == 0) {
            return corrupt("root missing".to_string());
        }
        let alive = self.states.iter().filter(|s| s.alive).count();
        if alive != self.live {
            return corrupt(format!("live count {} but {} alive states", self.live, alive));
        }
        if self.live > self.capacity {
            return corrupt(format!("{} states exceed capacity {}", self.live, self.capacity));
        }

        let mut free_seen = FxHashSet::default();
        for &f in &self.free {
            if f == ROOT || self.is_live(f) || f as usize >= self.states.len() || !free_seen.insert(f) {
                return corrupt(format!("bad free slot {f}"));
            }
        }
        if free_seen.len() + self.live != self.states.len() {
            return corrupt("free list does not cover dead slots".to_string());
        }

        for (i, s) in self.states.iter().enumerate() {
            if !s.alive {
                continue;
            }
            let id = i as StateId;
            if s.last_seen > self.tick {
                return corrupt(format!("state {id} last seen at {} after tick {}", s.last_seen, self.tick));
            }

            for (&t, tr) in &s.next {
                if t >= self.alphabet_size {
                    return corrupt(format!("state {id} has token {t} outside alphabet"));
                }
                if tr.weight == 0 {
                    return corrupt(format!("state {id} token {t} has zero weight"));
                }
                if tr.is_forgotten() {
                    continue;
                }
                let Some(target) = self.live_state(tr.target) else {
                    return corrupt(format!("state {id} token {t} dangles to {}", tr.target));
                };
                if target.len <= s.len {
                    return corrupt(format!("state {id} token {t} does not lengthen"));
                }
                if !target.in_edges.contains(&(id, t)) {
                    return corrupt(format!("state {} misses in-edge ({id}, {t})", tr.target));
                }
            }

            for &(src, t) in &s.in_edges {
                let ok = self
                    .live_state(src)
                    .and_then(|src_state| src_state.next.get(&t))
                    .is_some_and(|tr| tr.target == id);
                if !ok {
                    return corrupt(format!("state {id} has stale in-edge ({src}, {t})"));
                }
            }

            if id == ROOT {
                if s.link != NIL {
                    return corrupt("root has a suffix link".to_string());
                }
            } else {
                let Some(link) = self.live_state(s.link) else {
                    return corrupt(format!("state {id} suffix link dangles to {}", s.link));
                };
                if link.len >= s.len {
                    return corrupt(format!("state {id} suffix link does not shorten"));
                }
                if s.link != ROOT && !link.link_in.contains(&id) {
                    return corrupt(format!("state {} misses link child {id}", s.link));
                }
            }
            for &child in &s.link_in {
                if self.suffix_link(child) != Some(id) {
                    return corrupt(format!("state {id} has stale link child {child}"));
                }
            }
        }

        let mut listed = 0usize;
        let mut prev = NIL;
        let mut v = self.lru_head;
        while v != NIL {
            let Some(s) = self.live_state(v) else {
                return corrupt(format!("LRU list holds dead state {v}"));
            };
            if v == ROOT || s.newer != prev {
                return corrupt(format!("LRU list broken at {v}"));
            }
            listed += 1;
            if listed > self.live {
                return corrupt("LRU list has a cycle".to_string());
            }
            prev = v;
            v = s.older;
        }
        if listed + 1 != self.live || self.lru_tail != prev {
            return corrupt(format!("LRU list covers {listed} of {} states", self.live - 1));
        }

        let (Some(last), Some(at)) = (self.live_state(self.last), self.live_state(self.cursor.state)) else {
            return corrupt("last or cursor state is not live".to_string());
        };
        // every extension appends exactly one position to the last state
        if last.len != self.tick {
            return corrupt(format!("last state has len {} after {} tokens", last.len, self.tick));
        }
        let expected = if self.last == ROOT { ROOT } else { last.link };
        if self.cursor.state != expected || self.cursor.len != at.len {
            return corrupt(format!(
                "cursor ({}, {}) is not the suffix link of the last state",
                self.cursor.state, self.cursor.len
            ));
        }
        Ok(())
    }
}

// Snapshots are only accepted if they pass the audit.
impl Serialize for BoundedAutomaton {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        BoundedAutomaton::serialize(self, serializer)
    }
}

impl<'de> Deserialize<'de> for BoundedAutomaton {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let sam = BoundedAutomaton::deserialize(deserializer)?;
        sam.check_invariants().map_err(serde::de::Error::custom)?;
        Ok(sam)
    }
}
