//! The fixpoint driver: a deterministic worklist over each CFG's blocks,
//! the loop-header status automaton (ENTER → FIX → ACCEL → LEAVE), and
//! inter-procedural composition through memoized callee summaries.
//!
//! All annotations live in driver-owned side tables keyed by stable
//! block/edge/CFG ids; blocks themselves stay immutable input data.

use crate::config::AnalysisConfig;
use crate::dominance::GlobalDominance;
use crate::error::CuldesacError;
use crate::interp::process_block;
use crate::oracle::{IpStats, Oracle, post_process};
use crate::path::DetailedPath;
use crate::program::{BlockId, BlockKind, Cfg, CfgId, EdgeId, Program};
use crate::state::{MachineSpec, State, States};
use crate::term::{Constant, VarMaker};
use crate::smt::SolverFactory;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Fixpoint status of a loop header. Absence of an annotation is `Enter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopStatus {
    Enter,
    Fix,
    Accel,
    Leave,
}

/// Deterministic worklist: among the queued blocks, the ready one with the
/// smallest id goes first; when none is ready the smallest id is popped and
/// skipped (it returns when one of its edges is annotated).
#[derive(Debug, Default)]
struct Worklist(BTreeSet<BlockId>);

impl Worklist {
    fn push(&mut self, b: BlockId) {
        self.0.insert(b);
    }

    fn pop(&mut self, ready: impl Fn(BlockId) -> bool) -> Option<BlockId> {
        let pick = self
            .0
            .iter()
            .copied()
            .find(|b| ready(*b))
            .or_else(|| self.0.first().copied())?;
        self.0.remove(&pick);
        Some(pick)
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub infeasible_paths: Vec<DetailedPath>,
    pub stats: IpStats,
}

/// Runs the whole analysis on `program.main()` and returns the infeasible
/// paths found. The program must be sealed (builders and `from_json` do it).
pub fn analyze<F: SolverFactory>(
    program: &Program,
    config: &AnalysisConfig,
    factory: &F,
) -> Result<AnalysisResult, CuldesacError> {
    config.validate()?;
    debug!("interpreter variant v{}", config.version);
    if config.virtualize_cfg {
        debug!("expecting a virtualized (call-inlined) CFG set");
    }
    if config.slice_cfg {
        debug!("expecting a conditional-sliced CFG set");
    }
    if config.reduce_loops {
        debug!("expecting irregular loops to be pre-reduced");
    }
    let mut analysis = Analysis {
        program,
        config,
        factory,
        spec: MachineSpec::from(&program.context),
        edge_states: HashMap::new(),
        lh_status: HashMap::new(),
        lh_state: HashMap::new(),
        lh_s0: HashMap::new(),
        cfg_summary: HashMap::new(),
        cfg_vars: HashMap::new(),
        in_progress: BTreeSet::new(),
        infeasible_paths: Vec::new(),
        stats: IpStats::default(),
    };
    let main = program.main().id;
    analysis.process_cfg(main, config.use_initial_data)?;
    let mut infeasible_paths = analysis.infeasible_paths;
    if config.post_processing {
        let gdom = GlobalDominance::new(program);
        post_process(&mut infeasible_paths, &gdom);
    }
    Ok(AnalysisResult {
        infeasible_paths,
        stats: analysis.stats,
    })
}

struct Analysis<'a, F: SolverFactory> {
    program: &'a Program,
    config: &'a AnalysisConfig,
    factory: &'a F,
    spec: MachineSpec,
    /// Per-edge state annotations, cleared once consumed by the sink block.
    edge_states: HashMap<EdgeId, States>,
    lh_status: HashMap<BlockId, LoopStatus>,
    /// Current fixpoint candidate per loop header.
    lh_state: HashMap<BlockId, State>,
    /// First-arrival state per loop header.
    lh_s0: HashMap<BlockId, State>,
    /// Collected exit state per CFG.
    cfg_summary: HashMap<CfgId, States>,
    /// Opaque-top maker per CFG, imported into callers.
    cfg_vars: HashMap<CfgId, VarMaker>,
    in_progress: BTreeSet<CfgId>,
    infeasible_paths: Vec<DetailedPath>,
    stats: IpStats,
}

impl<F: SolverFactory> Analysis<'_, F> {
    fn status(&self, b: BlockId) -> LoopStatus {
        self.lh_status.get(&b).copied().unwrap_or(LoopStatus::Enter)
    }

    /// The predecessors a block consumes this round: a loop header waits on
    /// its entry edges before the loop runs and on its back edges while it
    /// does; everything else takes all incoming edges.
    fn selected_preds(&self, f: &Cfg, b: BlockId) -> Vec<EdgeId> {
        if !f.block(b).loop_header {
            f.all_ins(b)
        } else if self.status(b) == LoopStatus::Enter {
            f.non_back_ins(b)
        } else {
            f.back_ins(b)
        }
    }

    fn ready(&self, f: &Cfg, b: BlockId) -> bool {
        let pred = self.selected_preds(f, b);
        !pred.is_empty() && pred.iter().all(|e| self.edge_states.contains_key(e))
    }

    /// An exit edge may only be taken once every loop it leaves has reached
    /// LEAVE.
    fn is_allowed_exit(&self, f: &Cfg, e: EdgeId) -> bool {
        let Some(outer) = f.edge(e).loop_exit else {
            return true;
        };
        for h in f.loop_headers(f.source(e)) {
            if self.status(h) != LoopStatus::Leave {
                return false;
            }
            if h.index == outer {
                break;
            }
        }
        true
    }

    fn allowed_outs(&self, f: &Cfg, b: BlockId) -> Vec<EdgeId> {
        f.outs(b).filter(|e| self.is_allowed_exit(f, *e)).collect()
    }

    /// In-D: the oracle looks for infeasibility on edges whose source is
    /// conditional and whose enclosing loops are all past their fixpoints.
    fn in_d(&self, f: &Cfg, e: EdgeId) -> bool {
        let src = f.source(e);
        f.is_conditional(src)
            && f.loop_headers(src).all(|h| self.status(h) == LoopStatus::Leave)
    }

    fn process_cfg(&mut self, id: CfgId, use_initial_data: bool) -> Result<(), CuldesacError> {
        if !self.in_progress.insert(id) {
            return Err(CuldesacError::MalformedInput(format!(
                "call cycle through \"{}\"",
                self.program.cfg(id).name
            )));
        }
        let f = self.program.cfg(id);
        debug!("==> \"{}\"", f.name);
        let mut vm = VarMaker::new();
        let mut wl = Worklist::default();

        for e in f.outs(f.entry_block()) {
            let mut s = State::top(self.spec);
            if use_initial_data {
                s.initialize_with_dfa(&self.program.initial);
            }
            self.edge_states.insert(e, States::of(vec![s]));
            wl.push(f.sink(e));
        }

        while let Some(b) = wl.pop(|b| self.ready(f, b)) {
            let pred = self.selected_preds(f, b);
            if pred.is_empty() || !pred.iter().all(|e| self.edge_states.contains_key(e)) {
                // Not ready; it comes back when one of its edges fills.
                continue;
            }
            if self.config.show_progress {
                info!("block {}:{} {}", f.name, b.index, self.fixpoint_status(f, b));
            }

            let mut gathered: Vec<State> = Vec::new();
            for e in &pred {
                if let Some(ss) = self.edge_states.remove(e) {
                    gathered.extend(ss);
                }
            }

            let is_header = f.block(b).loop_header;
            let capped = self.config.merge && gathered.len() > self.config.merge_threshold;
            let mut s: States = if is_header || capped {
                if is_header {
                    if let Some(lh) = self.lh_state.get(&b) {
                        gathered.push(lh.clone());
                    }
                }
                gathered.retain(|st| !st.is_bottom());
                if gathered.is_empty() {
                    States::new()
                } else {
                    if capped {
                        debug!("{} states merged into 1", gathered.len());
                    }
                    States::of(vec![State::merge(&gathered, &mut vm)])
                }
            } else {
                States::of(gathered)
            };

            let mut propagate = true;
            if is_header && !s.is_empty() {
                propagate = self.update_loop_status(f, b, &mut s, &mut wl);
            }
            if !propagate {
                continue;
            }

            self.transfer(f, b, &mut s, &mut vm)?;

            if b == f.exit_block() {
                self.cfg_summary.insert(id, s);
                continue;
            }

            for e in self.allowed_outs(f, b) {
                let mut out = s.clone();
                let taken = f.edge(e).taken;
                for state in out.iter_mut() {
                    state.append_edge(e, taken);
                }
                let exited = f.exited_headers(e);
                for h in &exited {
                    out.on_loop_exit(*h);
                }
                if self.in_d(f, e) {
                    let oracle = Oracle::new(self.factory, self.config);
                    let found = oracle.ipcheck(&mut out, &mut self.infeasible_paths)?;
                    self.stats += found;
                }
                // Exited iterators have no meaning past this point; close
                // them off after the oracle has seen the exit conditions.
                for h in &exited {
                    out.close_loop(*h, &mut vm);
                }
                self.edge_states.insert(e, out);
                wl.push(f.sink(e));
            }
        }

        if !self.cfg_summary.contains_key(&id) {
            warn!("\"{}\" never reached its exit block", f.name);
            self.cfg_summary.insert(id, States::new());
        }
        self.finish_cfg(id, vm)?;
        debug!("<== \"{}\"", f.name);
        self.in_progress.remove(&id);
        Ok(())
    }

    /// Drives the header status automaton; returns whether this round's
    /// state propagates into the loop body.
    fn update_loop_status(
        &mut self,
        f: &Cfg,
        b: BlockId,
        s: &mut States,
        wl: &mut Worklist,
    ) -> bool {
        let Some(one) = s.one().cloned() else {
            return true;
        };
        match self.status(b) {
            LoopStatus::Enter => {
                self.lh_status.insert(b, LoopStatus::Fix);
                self.lh_s0.insert(b, one.clone());
                self.lh_state.insert(b, one);
                true
            }
            LoopStatus::Fix => {
                let converged = self
                    .lh_state
                    .get(&b)
                    .is_some_and(|prev| one.equiv(prev));
                if converged {
                    debug!("{}:{} reached its fixpoint", f.name, b.index);
                    self.lh_status.insert(b, LoopStatus::Accel);
                    s.iter_mut().for_each(State::prepare_fixpoint);
                } else {
                    self.lh_state.insert(b, one);
                }
                true
            }
            LoopStatus::Accel => {
                self.lh_status.insert(b, LoopStatus::Leave);
                if let Some(s0) = self.lh_s0.get(&b).cloned() {
                    s.iter_mut().for_each(|st| st.widen(b, &s0));
                }
                true
            }
            LoopStatus::Leave => {
                // Loop done: drop the annotations; if entry edges already
                // carry a new outer iteration, come back for it.
                if f.ins(b).any(|e| self.edge_states.contains_key(&e)) {
                    wl.push(b);
                }
                self.lh_state.remove(&b);
                self.lh_s0.remove(&b);
                self.lh_status.remove(&b);
                false
            }
        }
    }

    fn transfer(
        &mut self,
        f: &Cfg,
        b: BlockId,
        s: &mut States,
        vm: &mut VarMaker,
    ) -> Result<(), CuldesacError> {
        match &f.block(b).kind {
            BlockKind::Entry | BlockKind::Exit => Ok(()),
            BlockKind::Basic(insts) => {
                let fixed = if s.iter().any(State::at_fixpoint) {
                    " (at fixpoint)"
                } else {
                    ""
                };
                debug!("-\tI(b={}:{}) x{}{fixed}", f.name, b.index, s.len());
                for state in s.iter_mut() {
                    process_block(state, insts, vm, &self.program.initial);
                }
                Ok(())
            }
            BlockKind::Call(callee) => {
                let callee = *callee;
                if !self.cfg_summary.contains_key(&callee) {
                    self.process_cfg(callee, false)?;
                }
                let callee_vars = self.cfg_vars.get(&callee).cloned().unwrap_or_default();
                debug!(
                    "importing {} tops from \"{}\"",
                    callee_vars.len(),
                    self.program.cfg(callee).name
                );
                let tops = vm.import(&callee_vars);
                let summary = self.cfg_summary.get(&callee).cloned().unwrap_or_default();
                let mut applied = States::new();
                for caller_state in s.states() {
                    // A callee that never returns makes the calling path
                    // infeasible to continue; its states just vanish.
                    for callee_state in summary.states() {
                        let mut cs = caller_state.clone();
                        cs.on_call(b);
                        cs.apply(callee_state, &tops);
                        cs.on_return(b);
                        match cs.sp_value() {
                            Some(c) => cs.invalidate_stack_below(c.val),
                            None => cs.drop_sp_relative_cells(),
                        }
                        applied.push(cs);
                    }
                }
                *s = applied;
                Ok(())
            }
        }
    }

    /// Exit bookkeeping for one CFG: the stack pointer must still be able to
    /// equal its entry value, summaries may assume it does, and the var
    /// maker forgets tops no live state references.
    fn finish_cfg(&mut self, id: CfgId, mut vm: VarMaker) -> Result<(), CuldesacError> {
        let name = self.program.cfg(id).name.clone();
        let summary = self
            .cfg_summary
            .get_mut(&id)
            .unwrap_or_else(|| unreachable!("summary inserted above"));
        let mut used = BTreeSet::new();
        for state in summary.iter_mut() {
            if let Some(c) = state.sp_value() {
                if c != Constant::sp_rel(0) {
                    return Err(CuldesacError::SpLost(name));
                }
            }
            if self.config.assume_identical_sp {
                state.reset_sp();
            }
            state.collect_tops(&mut used);
        }
        vm.minimize(&used, self.config.clean_tops);
        self.cfg_vars.insert(id, vm);
        Ok(())
    }

    fn fixpoint_status(&self, f: &Cfg, b: BlockId) -> String {
        let mut out = String::from("[");
        for h in f.loop_headers(b) {
            out.push(match self.status(h) {
                LoopStatus::Enter => 'E',
                LoopStatus::Fix => 'F',
                LoopStatus::Accel => 'A',
                LoopStatus::Leave => 'L',
            });
        }
        out.push(']');
        out
    }
}
