//! Abstract states: the per-program-point symbolic machine description.
//!
//! A state maps registers and temporaries to terms, tracks the memory cells
//! whose symbolic content is known, carries the predicates accumulated along
//! its path, and records that path. States fork on conditionals, join at
//! meet points, widen at loop headers and compose across calls.

use crate::path::DetailedPath;
use crate::predicate::LabelledPredicate;
use crate::program::{BlockId, EdgeId, InitialState, PlatformContext, VarId};
use crate::term::{self, Constant, TermRef, TermRewriter, VarMaker, dag};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

mod compose;
mod locals;

use compose::Compositor;
pub use locals::LocalVariables;

/// The platform facts a state needs to size itself.
#[derive(Debug, Clone, Copy)]
pub struct MachineSpec {
    pub sp: VarId,
    pub registers: u32,
    pub temps: u32,
}

impl From<&PlatformContext> for MachineSpec {
    fn from(c: &PlatformContext) -> Self {
        Self {
            sp: c.sp,
            registers: c.register_count,
            temps: c.max_temps,
        }
    }
}

#[derive(Debug, Clone)]
pub struct State {
    spec: MachineSpec,
    pub(crate) lvars: LocalVariables,
    pub(crate) mem: BTreeMap<Constant, TermRef>,
    pub(crate) labelled_preds: Vec<LabelledPredicate>,
    pub(crate) generated_preds: Vec<LabelledPredicate>,
    pub(crate) generated_preds_taken: Vec<LabelledPredicate>,
    /// Set while the current block saw an `If`, making the taken buffer live.
    pub(crate) has_fork: bool,
    at_fixpoint: bool,
    path: DetailedPath,
    bottom: bool,
}

impl State {
    /// The ⊤ state seeded on a CFG's entry edges: every register holds its
    /// entry value and the stack pointer is pinned to `sp + 0`.
    pub fn top(spec: MachineSpec) -> Self {
        let mut lvars = LocalVariables::new(spec.registers, spec.temps);
        lvars.set(spec.sp, dag::sp_rel(0));
        Self {
            spec,
            lvars,
            mem: BTreeMap::new(),
            labelled_preds: Vec::new(),
            generated_preds: Vec::new(),
            generated_preds_taken: Vec::new(),
            has_fork: false,
            at_fixpoint: false,
            path: DetailedPath::new(),
            bottom: false,
        }
    }

    /// Absorbing element for joins.
    pub fn bottom(spec: MachineSpec) -> Self {
        let mut s = Self::top(spec);
        s.bottom = true;
        s
    }

    pub fn is_bottom(&self) -> bool {
        self.bottom
    }

    pub fn spec(&self) -> MachineSpec {
        self.spec
    }

    pub fn path(&self) -> &DetailedPath {
        &self.path
    }

    pub fn last_edge(&self) -> Option<EdgeId> {
        self.path.last_edge()
    }

    pub fn labelled_preds(&self) -> &[LabelledPredicate] {
        &self.labelled_preds
    }

    /// Every predicate the state currently knows: block-local ones first,
    /// then the ones carried from previous blocks.
    pub fn all_preds(&self) -> impl Iterator<Item = &LabelledPredicate> {
        self.generated_preds
            .iter()
            .chain(self.generated_preds_taken.iter())
            .chain(self.labelled_preds.iter())
    }

    /// Seeds the memory table with the read-only cells of the initial
    /// data-flow state.
    pub fn initialize_with_dfa(&mut self, initial: &InitialState) {
        for (addr, val) in &initial.readonly {
            self.mem.insert(Constant::abs(*addr), dag::abs(*val));
        }
    }

    pub fn value_or_identity(&self, id: VarId) -> TermRef {
        self.lvars.value(id).unwrap_or_else(|| dag::var(id))
    }

    pub fn mem_cell(&self, addr: Constant) -> Option<TermRef> {
        self.mem.get(&addr).copied()
    }

    /// The stack pointer as a known offset from its entry value, if it still
    /// is one.
    pub fn sp_value(&self) -> Option<Constant> {
        self.lvars
            .value(self.spec.sp)
            .and_then(|t| t.as_const())
            .filter(Constant::is_sp_relative)
    }

    /// True iff SP still resolves to a known entry-relative offset.
    pub fn sp_is_local(&self) -> bool {
        self.sp_value().is_some()
    }

    /// Forces SP back to `sp + 0` (the `ASSUME_IDENTICAL_SP` flag).
    pub fn reset_sp(&mut self) {
        self.lvars.set(self.spec.sp, dag::sp_rel(0));
    }

    pub fn on_loop_entry(&mut self, h: BlockId) {
        self.path.on_loop_entry(h);
    }

    pub fn on_loop_exit(&mut self, h: BlockId) {
        self.path.on_loop_exit(h);
    }

    pub fn on_call(&mut self, call_block: BlockId) {
        self.path.on_call(call_block);
    }

    pub fn on_return(&mut self, call_block: BlockId) {
        self.path.on_return(call_block);
    }

    pub fn prepare_fixpoint(&mut self) {
        self.at_fixpoint = true;
    }

    pub fn at_fixpoint(&self) -> bool {
        self.at_fixpoint
    }

    /// Crossing edge `e`: the predicates generated in the source block are
    /// stamped with `e` and promoted into the carried set, and the path grows
    /// by `e`. For a conditional source, `taken` selects which of the two
    /// fork buffers applies to this edge.
    pub fn append_edge(&mut self, e: EdgeId, taken: bool) {
        let picked = if taken && self.has_fork {
            std::mem::take(&mut self.generated_preds_taken)
        } else {
            std::mem::take(&mut self.generated_preds)
        };
        self.generated_preds.clear();
        self.generated_preds_taken.clear();
        self.has_fork = false;
        for mut lp in picked {
            if lp.pred.is_ident() {
                continue;
            }
            lp.label(e);
            self.labelled_preds.push(lp);
        }
        self.path.append_edge(e);
    }

    /// Join. Slots on which the inputs disagree become fresh opaque tops;
    /// memory keeps only cells every input agrees on; the carried predicates
    /// are intersected as multisets with their label sets unioned. The path
    /// restarts at the join point.
    pub fn merge(all: &[State], vm: &mut VarMaker) -> State {
        let inputs: Vec<&State> = all.iter().filter(|s| !s.is_bottom()).collect();
        let Some(first) = inputs.first().copied() else {
            let Some(any) = all.first() else {
                unreachable!("merge of zero states");
            };
            return State::bottom(any.spec);
        };
        if inputs.len() == 1 {
            let mut s = first.clone();
            s.path = DetailedPath::new();
            s.at_fixpoint = false;
            return s;
        }
        let mut out = State::top(first.spec);
        // lvars: identity where all agree, top where they differ.
        for id in first
            .lvars
            .reg_ids()
            .chain(first.lvars.temp_ids())
        {
            let v0 = first.lvars.value(id);
            if inputs[1..].iter().all(|s| s.lvars.value(id) == v0) {
                if let Some(t) = v0 {
                    out.lvars.set(id, t);
                }
            } else {
                out.lvars.set(id, vm.fresh());
            }
        }
        // memory: agreement only.
        out.mem.clear();
        for (addr, t) in &first.mem {
            if inputs[1..]
                .iter()
                .all(|s| s.mem.get(addr) == Some(t))
            {
                out.mem.insert(*addr, *t);
            }
        }
        // predicates: multiset intersection, labels unioned.
        let mut consumed: Vec<Vec<bool>> = inputs[1..]
            .iter()
            .map(|s| vec![false; s.labelled_preds.len()])
            .collect();
        for lp in &first.labelled_preds {
            let mut labels = lp.labels.clone();
            let mut everywhere = true;
            let mut picks = Vec::with_capacity(consumed.len());
            for (s, used) in inputs[1..].iter().zip(consumed.iter()) {
                match s
                    .labelled_preds
                    .iter()
                    .enumerate()
                    .find(|(i, other)| !used[*i] && other.pred == lp.pred)
                {
                    Some((i, other)) => {
                        labels.extend(other.labels.iter().copied());
                        picks.push(i);
                    }
                    None => {
                        everywhere = false;
                        break;
                    }
                }
            }
            if everywhere {
                for (used, i) in consumed.iter_mut().zip(picks) {
                    used[i] = true;
                }
                out.labelled_preds
                    .push(LabelledPredicate::with_labels(lp.pred, labels));
            }
        }
        out
    }

    /// Structural equivalence modulo renaming of opaque tops. Joins mint
    /// fresh tops on every round, so the FIX → ACCEL test must compare
    /// shapes, not uids.
    pub fn equiv(&self, other: &State) -> bool {
        self.fingerprint() == other.fingerprint()
    }

    fn fingerprint(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let mut names: HashMap<u64, usize> = HashMap::new();
        let mut w = |out: &mut String, t: TermRef| {
            write_canon(t, out, &mut names);
        };
        for id in self.lvars.reg_ids().chain(self.lvars.temp_ids()) {
            let _ = write!(out, "{id}:");
            match self.lvars.value(id) {
                Some(t) => w(&mut out, t),
                None => out.push('_'),
            }
            out.push(';');
        }
        for (addr, t) in &self.mem {
            let _ = write!(out, "[{addr}]=");
            w(&mut out, *t);
            out.push(';');
        }
        for lp in &self.labelled_preds {
            w(&mut out, lp.pred.lhs);
            let _ = write!(out, "{}", lp.pred.op);
            w(&mut out, lp.pred.rhs);
            let _ = write!(out, "{:?};", lp.labels);
        }
        out
    }

    /// Widening at the ACCEL → LEAVE transition: every slot whose value
    /// changed between the loop's first-arrival state `s0` and this
    /// candidate becomes the loop's symbolic iterator; memory cells and
    /// predicates that tracked a changed value are dropped unless they hold
    /// trivially.
    pub fn widen(&mut self, h: BlockId, s0: &State) {
        let iter_term = dag::iter(h);
        let mut changed: Vec<TermRef> = Vec::new();
        for id in self.lvars.reg_ids() {
            let mine = self.lvars.value(id);
            if mine != s0.lvars.value(id) {
                if let Some(t) = mine {
                    changed.push(t);
                }
                self.lvars.set(id, iter_term);
            }
        }
        self.lvars.clear_temps();
        self.mem.retain(|addr, t| s0.mem.get(addr) == Some(t));
        self.labelled_preds.retain(|lp| {
            if changed.iter().any(|t| lp.pred.involves_term(*t)) {
                lp.pred.constant_truth() == Some(true)
            } else {
                true
            }
        });
        self.path.on_loop_entry(h);
    }

    /// Leaving loop `h`: its iterator has no meaning outside the loop, so
    /// every occurrence is replaced by one fresh opaque unknown ("the value
    /// after however many iterations ran"). Runs after the oracle has seen
    /// the exit-edge state, so exit conditions over the iterator still reach
    /// the solver.
    pub fn close_loop(&mut self, h: BlockId, vm: &mut VarMaker) {
        struct Close {
            h: BlockId,
            replacement: TermRef,
        }
        impl TermRewriter for Close {
            fn rewrite_iter(&mut self, h: BlockId) -> TermRef {
                if h == self.h {
                    self.replacement
                } else {
                    dag::iter(h)
                }
            }
        }
        let mut close = Close {
            h,
            replacement: vm.fresh(),
        };
        self.rewrite_terms(&mut close);
    }

    fn rewrite_terms<R: TermRewriter>(&mut self, r: &mut R) {
        for id in self.lvars.reg_ids().chain(self.lvars.temp_ids()) {
            if let Some(t) = self.lvars.raw(id) {
                self.lvars.set(id, term::rewrite(t, r));
            }
        }
        for t in self.mem.values_mut() {
            *t = term::rewrite(*t, r);
        }
        for preds in [
            &mut self.labelled_preds,
            &mut self.generated_preds,
            &mut self.generated_preds_taken,
        ] {
            for lp in preds.iter_mut() {
                lp.pred = lp.pred.rewrite(r);
            }
        }
    }

    /// Applies a callee summary: caller-side terms are substituted for every
    /// callee-visible symbol, the callee's predicates join the carried set,
    /// and the callee's register/memory effects land in this state. The
    /// caller is responsible for the surrounding `on_call`/`on_return` path
    /// markers and the post-return stack invalidation.
    pub fn apply(&mut self, summary: &State, tops: &HashMap<u64, TermRef>) {
        let mut reg_updates: Vec<(VarId, TermRef)> = Vec::new();
        let mut cell_updates: Vec<(Constant, TermRef)> = Vec::new();
        let mut new_preds: Vec<LabelledPredicate> = Vec::new();
        {
            let mut comp = Compositor::new(self, tops);
            for (id, t) in summary.lvars.updated_regs() {
                reg_updates.push((id, term::rewrite(t, &mut comp)));
            }
            for (addr, t) in &summary.mem {
                let addr = comp.translate_addr(*addr);
                cell_updates.push((addr, term::rewrite(*t, &mut comp)));
            }
            for lp in summary.all_preds() {
                let pred = lp.pred.rewrite(&mut comp);
                if pred.is_ident() || pred.constant_truth() == Some(true) {
                    continue;
                }
                new_preds.push(LabelledPredicate::with_labels(pred, lp.labels.clone()));
            }
        }
        for (id, t) in reg_updates {
            self.lvars.set(id, t);
        }
        for (addr, t) in cell_updates {
            self.mem.insert(addr, t);
        }
        self.labelled_preds.extend(new_preds);
        // The callee's traversal becomes part of this path, so infeasible
        // paths can name the callee edges responsible for a contradiction.
        for item in summary.path.iter() {
            self.path.add_last(*item);
        }
    }

    /// Drops every memory cell of the (now dead) frame below `limit`
    /// (an SP-relative offset). Called after a function returns.
    pub fn invalidate_stack_below(&mut self, limit: i32) {
        self.mem.retain(|addr, _| {
            !(addr.kind == crate::term::ConstKind::SpRel && addr.val < limit)
        });
    }

    /// Once SP is no longer a known offset, SP-relative cell addresses have
    /// lost their meaning; the cells go with them.
    pub fn drop_sp_relative_cells(&mut self) {
        self.mem.retain(|addr, _| addr.is_absolute());
    }

    /// All opaque-top uids referenced by this state.
    pub fn collect_tops(&self, out: &mut BTreeSet<u64>) {
        for id in self.lvars.reg_ids().chain(self.lvars.temp_ids()) {
            if let Some(t) = self.lvars.raw(id) {
                term::collect_tops(t, out);
            }
        }
        for t in self.mem.values() {
            term::collect_tops(*t, out);
        }
        for lp in self.all_preds() {
            term::collect_tops(lp.pred.lhs, out);
            term::collect_tops(lp.pred.rhs, out);
        }
    }
}

fn write_canon(t: TermRef, out: &mut String, names: &mut HashMap<u64, usize>) {
    use crate::term::Term;
    use std::fmt::Write;
    match &*t {
        Term::Top(uid) => {
            let next = names.len();
            let idx = *names.entry(*uid).or_insert(next);
            let _ = write!(out, "T#{idx}");
        }
        Term::Arith(op, a, b) => {
            let _ = write!(out, "({op:?} ");
            write_canon(*a, out, names);
            if let Some(b) = b {
                out.push(' ');
                write_canon(*b, out, names);
            }
            out.push(')');
        }
        other => {
            let _ = write!(out, "{other}");
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bottom {
            return write!(f, "⊥");
        }
        write!(f, "{{")?;
        let mut first = true;
        for (id, t) in self.lvars.updated_regs() {
            if !std::mem::take(&mut first) {
                write!(f, ", ")?;
            }
            write!(f, "?{id}={t}")?;
        }
        for (addr, t) in &self.mem {
            if !std::mem::take(&mut first) {
                write!(f, ", ")?;
            }
            write!(f, "[{addr}]={t}")?;
        }
        for lp in self.all_preds() {
            if !std::mem::take(&mut first) {
                write!(f, ", ")?;
            }
            write!(f, "{}", lp.pred)?;
        }
        write!(f, "}}")
    }
}

/// The collection of states living on one edge (or collected at a CFG exit).
#[derive(Debug, Clone, Default)]
pub struct States(Vec<State>);

impl States {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of(states: Vec<State>) -> Self {
        Self(states)
    }

    pub fn push(&mut self, s: State) {
        self.0.push(s);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn states(&self) -> &[State] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &State> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut State> {
        self.0.iter_mut()
    }

    pub fn on_loop_exit(&mut self, h: BlockId) {
        self.0.iter_mut().for_each(|s| s.on_loop_exit(h));
    }

    pub fn close_loop(&mut self, h: BlockId, vm: &mut VarMaker) {
        self.0.iter_mut().for_each(|s| s.close_loop(h, vm));
    }

    /// The single state of a loop-header join; joins at headers merge down
    /// to one state before the status automaton looks at it.
    pub fn one(&self) -> Option<&State> {
        debug_assert!(self.0.len() <= 1, "multiple states where one expected");
        self.0.first()
    }
}

impl IntoIterator for States {
    type Item = State;
    type IntoIter = std::vec::IntoIter<State>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
