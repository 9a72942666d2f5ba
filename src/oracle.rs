//! The infeasibility oracle: SMT checks on edge states, minimization of
//! contradictions into edge sets, validity checking against sibling paths,
//! and result post-processing.

use crate::config::AnalysisConfig;
use crate::dominance::GlobalDominance;
use crate::error::CuldesacError;
use crate::path::{DetailedPath, FlowItem};
use crate::predicate::LabelledPredicate;
use crate::program::EdgeId;
use crate::smt::{SatResult, Solver, SolverFactory, solvable};
use crate::state::{State, States};
use rayon::prelude::*;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Infeasible-path counters: everything found, and how many could not be
/// minimized (reported in full or dropped, depending on configuration).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpStats {
    pub ip_count: usize,
    pub unminimized_count: usize,
}

impl IpStats {
    pub fn minimized_count(&self) -> usize {
        self.ip_count - self.unminimized_count
    }
}

impl std::ops::AddAssign for IpStats {
    fn add_assign(&mut self, rhs: Self) {
        self.ip_count += rhs.ip_count;
        self.unminimized_count += rhs.unminimized_count;
    }
}

pub struct Oracle<'a, F: SolverFactory> {
    factory: &'a F,
    config: &'a AnalysisConfig,
}

impl<'a, F: SolverFactory> Oracle<'a, F> {
    pub fn new(factory: &'a F, config: &'a AnalysisConfig) -> Self {
        Self { factory, config }
    }

    /// Checks every state on an edge, registers the infeasible paths found,
    /// and removes the contradictory states from the edge.
    pub fn ipcheck(
        &self,
        states: &mut States,
        infeasible_paths: &mut Vec<DetailedPath>,
    ) -> Result<IpStats, CuldesacError> {
        let mut stats = IpStats::default();
        if self.config.dry_run || states.is_empty() {
            return Ok(stats);
        }

        // Per-state satisfiability; the checks are independent, so they may
        // run on the rayon pool when more than one core is requested.
        let verdicts: Vec<Option<BTreeSet<EdgeId>>> = if self.config.nb_cores > 1 {
            states
                .states()
                .par_iter()
                .map(|s| self.seek_infeasible(s))
                .collect::<Result<_, _>>()?
        } else {
            states
                .states()
                .iter()
                .map(|s| self.seek_infeasible(s))
                .collect::<Result<_, _>>()?
        };

        let mut kept: Vec<State> = Vec::with_capacity(states.len());
        for (i, state) in states.states().iter().enumerate() {
            let Some(ip) = &verdicts[i] else {
                kept.push(state.clone());
                continue;
            };
            stats.ip_count += 1;
            debug!(
                "path {} minimized to {} edge(s)",
                state.path(),
                ip.len()
            );
            if let Some(last) = state.last_edge() {
                if !ip.contains(&last) {
                    debug!("minimized path does not involve the state's last edge");
                }
            }

            // A SAT sibling on the same edge whose trace covers the
            // minimized edge set is a counter-example: that edge set is
            // reachable after all.
            let counterexample = states.states().iter().zip(&verdicts).find(|(other, v)| {
                v.is_none() && is_subpath(&other.path().to_ordered_path(), ip)
            });

            match counterexample {
                None => {
                    let mut reordered = reorder_infeasible_path(ip, state.path());
                    reordered.optimize();
                    if reordered.has_an_edge() {
                        add_detailed_infeasible_path(reordered, infeasible_paths);
                    } else {
                        warn!("minimized infeasible path has no edge, dropped");
                    }
                }
                Some((witness, _)) => {
                    debug!("minimization rejected, counterexample: {}", witness.path());
                    stats.unminimized_count += 1;
                    if self.config.unminimized_paths {
                        let mut full = state.path().clone();
                        full.optimize();
                        if full.has_an_edge() {
                            add_detailed_infeasible_path(full, infeasible_paths);
                        }
                    } else {
                        debug!("ignored infeasible path that could not be minimized");
                    }
                }
            }
        }
        *states = States::of(kept);
        Ok(stats)
    }

    /// SMT check of one state's predicate conjunction. `None` when
    /// satisfiable (or unknown); otherwise the minimized set of edge labels
    /// responsible for the contradiction.
    fn seek_infeasible(
        &self,
        state: &State,
    ) -> Result<Option<BTreeSet<EdgeId>>, CuldesacError> {
        let preds: Vec<&LabelledPredicate> = state
            .labelled_preds()
            .iter()
            .filter(|lp| solvable(&lp.pred))
            .collect();
        if preds.is_empty() {
            return Ok(None);
        }

        let mut solver = self.factory.solver()?;
        solver.push();
        for lp in &preds {
            solver.assert_pred(&lp.pred);
            if self.config.smt_check_linear && solver.check_sat() == SatResult::Unsat {
                debug!("conjunction turns UNSAT at {}", lp.pred);
            }
        }
        let verdict = solver.check_sat();
        solver.pop();

        match verdict {
            SatResult::Sat => Ok(None),
            SatResult::Unknown => {
                warn!("solver answered UNKNOWN, assuming satisfiable");
                Ok(None)
            }
            SatResult::Unsat => {
                let kept = minimize_unsat(&mut solver, &preds);
                let labels = kept
                    .iter()
                    .flat_map(|i| preds[*i].labels.iter().copied())
                    .collect();
                Ok(Some(labels))
            }
        }
    }
}

/// Minimal unsat subset by the drop-and-recheck recursion: remove a
/// candidate; if the rest is still contradictory the candidate was
/// redundant, otherwise it is kept. An inconclusive recheck keeps the
/// candidate (conservative).
fn minimize_unsat<S: Solver>(solver: &mut S, preds: &[&LabelledPredicate]) -> Vec<usize> {
    let mut kept: Vec<usize> = (0..preds.len()).collect();
    let mut i = 0;
    while i < kept.len() {
        solver.push();
        for (k, idx) in kept.iter().enumerate() {
            if k != i {
                solver.assert_pred(&preds[*idx].pred);
            }
        }
        let verdict = solver.check_sat();
        solver.pop();
        if verdict == SatResult::Unsat {
            kept.remove(i);
        } else {
            i += 1;
        }
    }
    kept
}

/// Is every edge of `set` present in the ordered path?
pub fn is_subpath(ordered: &[EdgeId], set: &BTreeSet<EdgeId>) -> bool {
    set.iter().all(|e| ordered.contains(e))
}

/// Rebuilds the minimized edge set in the order of the full path it came
/// from, keeping the loop/call structure.
pub fn reorder_infeasible_path(ip: &BTreeSet<EdgeId>, full: &DetailedPath) -> DetailedPath {
    let mut out = DetailedPath::new();
    for item in full.iter() {
        match item {
            FlowItem::Edge(e) => {
                if ip.contains(e) {
                    out.add_last(*item);
                }
            }
            other => out.add_last(*other),
        }
    }
    out
}

/// Registers a path unless an equal one is already present.
pub fn add_detailed_infeasible_path(path: DetailedPath, paths: &mut Vec<DetailedPath>) {
    if paths.contains(&path) {
        debug!("not adding redundant infeasible path: {path}");
    } else {
        paths.push(path);
    }
}

/// Result post-processing: iterated dominance/post-dominance pruning over
/// successive edge pairs, trailing call-marker removal, duplicate removal.
pub fn post_process(paths: &mut Vec<DetailedPath>, gdom: &GlobalDominance) {
    simplify_using_dominance(paths, |e1, e2| gdom.dom(e1, e2).then_some(e1));
    simplify_using_dominance(paths, |e1, e2| gdom.postdom(e2, e1).then_some(e2));
    remove_duplicates(paths);
}

fn simplify_using_dominance(
    paths: &mut Vec<DetailedPath>,
    removable: impl Fn(EdgeId, EdgeId) -> Option<EdgeId>,
) {
    for path in paths.iter_mut() {
        let mut pruned = false;
        loop {
            let mut prev: Option<EdgeId> = None;
            let mut to_remove = None;
            for item in path.iter() {
                let Some(e) = item.edge() else { continue };
                if let Some(pe) = prev {
                    if let Some(r) = removable(pe, e) {
                        to_remove = Some(r);
                        break;
                    }
                }
                prev = Some(e);
            }
            match to_remove {
                Some(e) => {
                    path.remove(e);
                    pruned = true;
                }
                None => break,
            }
        }
        if pruned {
            path.remove_calls_at_end();
        }
    }
}

fn remove_duplicates(paths: &mut Vec<DetailedPath>) {
    let mut seen: Vec<DetailedPath> = Vec::with_capacity(paths.len());
    paths.retain(|p| {
        if seen.contains(p) {
            false
        } else {
            seen.push(p.clone());
            true
        }
    });
}
