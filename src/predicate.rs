//! Predicates over symbolic terms, labelled with the CFG edges that
//! justify them.

use crate::program::EdgeId;
use crate::term::{self, Term, TermRef, TermRewriter, dag};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CondOp {
    Lt,
    Le,
    Eq,
    Ne,
}

impl fmt::Display for CondOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CondOp::Lt => "<",
            CondOp::Le => "<=",
            CondOp::Eq => "=",
            CondOp::Ne => "!=",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Predicate {
    pub op: CondOp,
    pub lhs: TermRef,
    pub rhs: TermRef,
}

impl Predicate {
    pub fn new(op: CondOp, lhs: TermRef, rhs: TermRef) -> Self {
        Self { op, lhs, rhs }
    }

    /// `x = x` carries no information and is dropped at creation sites.
    pub fn is_ident(&self) -> bool {
        self.op == CondOp::Eq && self.lhs == self.rhs
    }

    /// Truth value when both sides are constants of comparable tags.
    pub fn constant_truth(&self) -> Option<bool> {
        let a = self.lhs.as_const()?;
        let b = self.rhs.as_const()?;
        match self.op {
            CondOp::Eq => Some(a == b),
            CondOp::Ne => Some(a != b),
            CondOp::Lt if a.kind == b.kind => Some(a.val < b.val),
            CondOp::Le if a.kind == b.kind => Some(a.val <= b.val),
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        term::is_complete(self.lhs) && term::is_complete(self.rhs)
    }

    /// Whether the solver adapter can express this predicate in QF_LIA.
    pub fn is_linear(&self) -> bool {
        term::is_linear(self.lhs) && term::is_linear(self.rhs)
    }

    pub fn involves_var(&self, id: i32) -> bool {
        term::uses_var(self.lhs, id) || term::uses_var(self.rhs, id)
    }

    pub fn involves_term(&self, t: TermRef) -> bool {
        let mut hit = |n: &Term| *n == *t;
        term::any_node(self.lhs, &mut hit) || term::any_node(self.rhs, &mut hit)
    }

    pub fn involves_temp(&self) -> bool {
        term::uses_temp(self.lhs) || term::uses_temp(self.rhs)
    }

    /// If the predicate is `t = expr` (or `expr = t`) for a temporary `t`
    /// that does not occur in `expr`, returns `(t, expr)`.
    pub fn isolated_temp_var(&self) -> Option<(i32, TermRef)> {
        if self.op != CondOp::Eq {
            return None;
        }
        let as_temp = |t: TermRef| match &*t {
            Term::Var(id) if *id < 0 => Some(*id),
            _ => None,
        };
        if let Some(id) = as_temp(self.lhs) {
            if !term::uses_var(self.rhs, id) {
                return Some((id, self.rhs));
            }
        }
        if let Some(id) = as_temp(self.rhs) {
            if !term::uses_var(self.lhs, id) {
                return Some((id, self.lhs));
            }
        }
        None
    }

    /// Replaces every occurrence of `Var(id)` by `expr`, re-canonicalizing.
    pub fn substitute_var(&self, id: i32, expr: TermRef) -> Predicate {
        struct Subst {
            id: i32,
            expr: TermRef,
        }
        impl TermRewriter for Subst {
            fn rewrite_var(&mut self, id: i32) -> TermRef {
                if id == self.id {
                    self.expr
                } else {
                    dag::var(id)
                }
            }
        }
        let mut s = Subst { id, expr };
        Predicate::new(
            self.op,
            term::rewrite(self.lhs, &mut s),
            term::rewrite(self.rhs, &mut s),
        )
    }

    pub fn rewrite<R: TermRewriter>(&self, r: &mut R) -> Predicate {
        Predicate::new(
            self.op,
            term::rewrite(self.lhs, r),
            term::rewrite(self.rhs, r),
        )
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.lhs, self.op, self.rhs)
    }
}

/// A predicate plus the set of control decisions (CFG edges) that made it
/// hold. When the solver finds a contradiction, the union of the labels of
/// the contradicting predicates is the raw infeasible path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelledPredicate {
    pub pred: Predicate,
    pub labels: BTreeSet<EdgeId>,
}

impl LabelledPredicate {
    pub fn new(pred: Predicate) -> Self {
        Self {
            pred,
            labels: BTreeSet::new(),
        }
    }

    pub fn with_labels(pred: Predicate, labels: BTreeSet<EdgeId>) -> Self {
        Self { pred, labels }
    }

    pub fn label(&mut self, e: EdgeId) {
        self.labels.insert(e);
    }
}

impl fmt::Display for LabelledPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} |{}|", self.pred, self.labels.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::dag;

    #[test]
    fn identity_predicates_are_trivial() {
        let x = dag::var(1);
        assert!(Predicate::new(CondOp::Eq, x, x).is_ident());
        assert!(!Predicate::new(CondOp::Ne, x, x).is_ident());
    }

    #[test]
    fn constant_truth() {
        let p = Predicate::new(CondOp::Ne, dag::abs(0), dag::abs(0));
        assert_eq!(p.constant_truth(), Some(false));
        let q = Predicate::new(CondOp::Le, dag::abs(1), dag::abs(4));
        assert_eq!(q.constant_truth(), Some(true));
        // sp+4 vs 4: tags differ, incomparable under <=.
        let r = Predicate::new(CondOp::Le, dag::sp_rel(4), dag::abs(4));
        assert_eq!(r.constant_truth(), None);
        assert_eq!(
            Predicate::new(CondOp::Eq, dag::sp_rel(4), dag::abs(4)).constant_truth(),
            Some(false)
        );
    }

    #[test]
    fn isolated_temp_var_solves() {
        let t1 = dag::var(-1);
        let expr = dag::add(dag::var(2), dag::abs(4));
        let p = Predicate::new(CondOp::Eq, t1, expr);
        assert_eq!(p.isolated_temp_var(), Some((-1, expr)));
        // t = t + 1 cannot be solved.
        let q = Predicate::new(CondOp::Eq, t1, dag::add(t1, dag::abs(1)));
        assert_eq!(q.isolated_temp_var(), None);
    }

    #[test]
    fn substitution_recanonicalizes() {
        let t1 = dag::var(-1);
        let p = Predicate::new(CondOp::Lt, dag::add(t1, dag::abs(2)), dag::abs(10));
        let s = p.substitute_var(-1, dag::abs(3));
        assert_eq!(s.lhs, dag::abs(5));
        assert_eq!(s.constant_truth(), Some(true));
    }

    #[test]
    fn completeness_tracks_tops() {
        let mut vm = crate::term::VarMaker::new();
        let p = Predicate::new(CondOp::Eq, dag::var(1), vm.fresh());
        assert!(!p.is_complete());
        assert!(Predicate::new(CondOp::Eq, dag::var(1), dag::abs(0)).is_complete());
    }
}
