//! z3 adapter: lowers predicates to integer terms under QF_LIA.
//!
//! Registers and temporaries become integer constants named `r<n>`/`t<n>`,
//! memory cells are named by their address constant, the stack pointer is the
//! distinguished `sp` variable, and loop iterators become per-header
//! unknowns. The range semantics of machine words is not modeled; this is
//! the same precision choice the predicates themselves make.

use super::{SatResult, Solver, SolverFactory, solvable};
use crate::error::CuldesacError;
use crate::predicate::{CondOp, Predicate};
use crate::term::{ArithOp, ConstKind, Constant, Term, TermRef};
use z3::ast::{Ast, Bool, Int};

#[derive(Debug, Clone, Default)]
pub struct Z3Factory {
    timeout_ms: Option<u32>,
}

impl Z3Factory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout_ms: u32) -> Self {
        Self {
            timeout_ms: Some(timeout_ms),
        }
    }
}

impl SolverFactory for Z3Factory {
    type Solver = Z3Solver;

    fn solver(&self) -> Result<Self::Solver, CuldesacError> {
        if let Some(ms) = self.timeout_ms {
            z3::set_global_param("timeout", &ms.to_string());
        }
        let solver = z3::Solver::new_for_logic("QF_LIA")
            .ok_or_else(|| CuldesacError::Solver("unsupported logic QF_LIA".to_string()))?;
        Ok(Z3Solver { solver })
    }
}

pub struct Z3Solver {
    solver: z3::Solver,
}

impl Solver for Z3Solver {
    fn push(&mut self) {
        self.solver.push();
    }

    fn pop(&mut self) {
        self.solver.pop(1);
    }

    fn assert_pred(&mut self, p: &Predicate) {
        if let Some(formula) = lower_pred(p) {
            self.solver.assert(&formula);
        }
    }

    fn check_sat(&mut self) -> SatResult {
        match self.solver.check() {
            z3::SatResult::Sat => SatResult::Sat,
            z3::SatResult::Unsat => SatResult::Unsat,
            z3::SatResult::Unknown => SatResult::Unknown,
        }
    }
}

fn lower_pred(p: &Predicate) -> Option<Bool> {
    if !solvable(p) {
        return None;
    }
    let lhs = lower_term(p.lhs)?;
    let rhs = lower_term(p.rhs)?;
    Some(match p.op {
        CondOp::Lt => lhs.lt(&rhs),
        CondOp::Le => lhs.le(&rhs),
        CondOp::Eq => lhs._eq(&rhs),
        CondOp::Ne => lhs._eq(&rhs).not(),
    })
}

fn sp() -> Int {
    Int::new_const("sp")
}

fn lower_const(c: Constant) -> Int {
    let k = Int::from_i64(c.val as i64);
    match c.kind {
        ConstKind::Absolute => k,
        ConstKind::SpRel => sp() + k,
        ConstKind::SpRelNeg => k - sp(),
    }
}

fn lower_term(t: TermRef) -> Option<Int> {
    match &*t {
        Term::Const(c) => Some(lower_const(*c)),
        Term::Var(id) if *id < 0 => Some(Int::new_const(format!("t{}", -id))),
        Term::Var(id) => Some(Int::new_const(format!("r{id}"))),
        Term::Mem(addr) => Some(Int::new_const(mem_name(*addr))),
        Term::Iter(h) => Some(Int::new_const(format!("iter_{}_{}", h.cfg.0, h.index))),
        Term::Top(_) => None,
        Term::Arith(op, a, b) => {
            let a = lower_term(*a)?;
            match op {
                ArithOp::Neg => Some(a.unary_minus()),
                _ => {
                    let b = lower_term((*b)?)?;
                    match op {
                        ArithOp::Add => Some(a + b),
                        ArithOp::Sub => Some(a - b),
                        ArithOp::Mul => Some(a * b),
                        ArithOp::Div => Some(a.div(&b)),
                        ArithOp::Mod => Some(a.rem(&b)),
                        ArithOp::Neg | ArithOp::Mulh | ArithOp::DivMod | ArithOp::Cmp => None,
                    }
                }
            }
        }
    }
}

fn mem_name(addr: Constant) -> String {
    match addr.kind {
        ConstKind::Absolute => format!("mem_{}", addr.val),
        ConstKind::SpRel => format!("mem_sp_{}", addr.val),
        ConstKind::SpRelNeg => format!("mem_nsp_{}", addr.val),
    }
}
