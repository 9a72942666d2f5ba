//! A minimal built-in decider over ground conjunctions.
//!
//! It propagates constants through equality predicates and refutes a
//! conjunction only when some predicate evaluates to a false ground fact;
//! everything else is `Sat`. This is deliberately incomplete but sound in
//! the direction the oracle needs (it never claims `Unsat` wrongly), making
//! it a deterministic stand-in for the external solver in tests and
//! solver-less environments.

use super::{SatResult, Solver, SolverFactory, solvable};
use crate::error::CuldesacError;
use crate::predicate::{CondOp, Predicate};
use crate::term::{self, TermRef, TermRewriter, dag};

#[derive(Debug, Clone, Copy, Default)]
pub struct GroundFactory;

impl SolverFactory for GroundFactory {
    type Solver = GroundSolver;

    fn solver(&self) -> Result<Self::Solver, CuldesacError> {
        Ok(GroundSolver::new())
    }
}

#[derive(Debug, Clone, Default)]
pub struct GroundSolver {
    frames: Vec<usize>,
    asserted: Vec<Predicate>,
}

impl GroundSolver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Solver for GroundSolver {
    fn push(&mut self) {
        self.frames.push(self.asserted.len());
    }

    fn pop(&mut self) {
        if let Some(len) = self.frames.pop() {
            self.asserted.truncate(len);
        }
    }

    fn assert_pred(&mut self, p: &Predicate) {
        if solvable(p) {
            self.asserted.push(*p);
        }
    }

    fn check_sat(&mut self) -> SatResult {
        // Propagate `t = const` bindings to fixpoint, then look for a ground
        // falsehood.
        let mut preds = self.asserted.clone();
        for _ in 0..preds.len() {
            let mut bindings: Vec<(TermRef, TermRef)> = Vec::new();
            for p in &preds {
                if p.op != CondOp::Eq {
                    continue;
                }
                if p.rhs.as_const().is_some() && p.lhs.as_const().is_none() {
                    bindings.push((p.lhs, p.rhs));
                } else if p.lhs.as_const().is_some() && p.rhs.as_const().is_none() {
                    bindings.push((p.rhs, p.lhs));
                }
            }
            if bindings.is_empty() {
                break;
            }
            let mut changed = false;
            preds = preds
                .iter()
                .map(|p| {
                    let mut rw = Bind(&bindings);
                    let q = p.rewrite(&mut rw);
                    changed |= q != *p;
                    q
                })
                .collect();
            if !changed {
                break;
            }
        }
        let refuted = |p: &Predicate| {
            p.constant_truth() == Some(false)
                || (p.lhs == p.rhs && matches!(p.op, CondOp::Ne | CondOp::Lt))
        };
        if preds.iter().any(refuted) {
            SatResult::Unsat
        } else {
            SatResult::Sat
        }
    }
}

/// Replaces whole bound subterms by their constants.
struct Bind<'a>(&'a [(TermRef, TermRef)]);

impl Bind<'_> {
    fn lookup(&self, t: TermRef) -> Option<TermRef> {
        self.0.iter().find(|(k, _)| *k == t).map(|(_, v)| *v)
    }
}

impl TermRewriter for Bind<'_> {
    fn rewrite_var(&mut self, id: i32) -> TermRef {
        self.lookup(dag::var(id)).unwrap_or_else(|| dag::var(id))
    }

    fn rewrite_mem(&mut self, addr: term::Constant) -> TermRef {
        self.lookup(dag::mem(addr)).unwrap_or_else(|| dag::mem(addr))
    }

    fn rewrite_iter(&mut self, h: crate::program::BlockId) -> TermRef {
        self.lookup(dag::iter(h)).unwrap_or_else(|| dag::iter(h))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::dag;

    #[test]
    fn ground_falsehood_is_unsat() {
        let mut s = GroundSolver::new();
        s.assert_pred(&Predicate::new(CondOp::Ne, dag::abs(0), dag::abs(0)));
        assert_eq!(s.check_sat(), SatResult::Unsat);
    }

    #[test]
    fn symbolic_conjunctions_stay_sat() {
        let mut s = GroundSolver::new();
        s.assert_pred(&Predicate::new(CondOp::Lt, dag::var(0), dag::var(1)));
        s.assert_pred(&Predicate::new(CondOp::Le, dag::var(1), dag::var(2)));
        assert_eq!(s.check_sat(), SatResult::Sat);
    }

    #[test]
    fn equalities_propagate_before_deciding() {
        let mut s = GroundSolver::new();
        s.assert_pred(&Predicate::new(CondOp::Eq, dag::var(0), dag::abs(7)));
        s.assert_pred(&Predicate::new(CondOp::Le, dag::var(0), dag::abs(3)));
        assert_eq!(s.check_sat(), SatResult::Unsat);
    }

    #[test]
    fn push_pop_restores_assertions() {
        let mut s = GroundSolver::new();
        s.assert_pred(&Predicate::new(CondOp::Eq, dag::var(0), dag::abs(7)));
        s.push();
        s.assert_pred(&Predicate::new(CondOp::Lt, dag::var(0), dag::abs(3)));
        assert_eq!(s.check_sat(), SatResult::Unsat);
        s.pop();
        assert_eq!(s.check_sat(), SatResult::Sat);
    }

    #[test]
    fn chained_bindings_reach_fixpoint() {
        let mut s = GroundSolver::new();
        // r0 = r1, r1 = 2, r0 != 2 — needs two propagation rounds.
        s.assert_pred(&Predicate::new(CondOp::Eq, dag::var(0), dag::var(1)));
        s.assert_pred(&Predicate::new(CondOp::Eq, dag::var(1), dag::abs(2)));
        s.assert_pred(&Predicate::new(CondOp::Ne, dag::var(0), dag::abs(2)));
        assert_eq!(s.check_sat(), SatResult::Unsat);
    }
}
