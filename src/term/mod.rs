//! Hash-consed symbolic terms.
//!
//! Every term is built through the smart constructors in [`dag`] and interned,
//! so two structurally equal terms after canonicalization share an address and
//! equality is a pointer comparison. States, predicates and the oracle only
//! ever hold [`TermRef`]s.

use crate::program::BlockId;
use internment::Intern;
use std::fmt;

pub mod dag;
mod var_maker;

pub use var_maker::VarMaker;

pub type TermRef = Intern<Term>;

/// Tag of a 32-bit constant: plain integer, `sp + k`, or `k - sp`.
///
/// Folding stack-pointer displacement into the constant lets `SP + 8` live in
/// a single leaf, which is what makes SP-relative memory cells addressable by
/// a `Constant` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConstKind {
    Absolute,
    SpRel,
    SpRelNeg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Constant {
    pub kind: ConstKind,
    pub val: i32,
}

impl Constant {
    pub const fn abs(val: i32) -> Self {
        Self {
            kind: ConstKind::Absolute,
            val,
        }
    }

    /// `sp + val`. The stack pointer itself is `sp_rel(0)`.
    pub const fn sp_rel(val: i32) -> Self {
        Self {
            kind: ConstKind::SpRel,
            val,
        }
    }

    pub const fn sp_rel_neg(val: i32) -> Self {
        Self {
            kind: ConstKind::SpRelNeg,
            val,
        }
    }

    pub fn is_absolute(&self) -> bool {
        self.kind == ConstKind::Absolute
    }

    pub fn is_sp_relative(&self) -> bool {
        !self.is_absolute()
    }

    pub fn is_zero(&self) -> bool {
        self.kind == ConstKind::Absolute && self.val == 0
    }

    pub fn is_one(&self) -> bool {
        self.kind == ConstKind::Absolute && self.val == 1
    }

    /// Negation is total: `-(sp + k) = (-k) - sp` and vice versa.
    pub fn neg(self) -> Self {
        let val = self.val.wrapping_neg();
        match self.kind {
            ConstKind::Absolute => Self::abs(val),
            ConstKind::SpRel => Self::sp_rel_neg(val),
            ConstKind::SpRelNeg => Self::sp_rel(val),
        }
    }

    /// Tag-aware addition; `None` when the sum is not representable with a
    /// single stack-pointer occurrence (e.g. `sp + sp`).
    pub fn add(self, other: Self) -> Option<Self> {
        use ConstKind::*;
        let val = self.val.wrapping_add(other.val);
        let kind = match (self.kind, other.kind) {
            (Absolute, Absolute) => Absolute,
            (SpRel, Absolute) | (Absolute, SpRel) => SpRel,
            (SpRelNeg, Absolute) | (Absolute, SpRelNeg) => SpRelNeg,
            (SpRel, SpRelNeg) | (SpRelNeg, SpRel) => Absolute,
            (SpRel, SpRel) | (SpRelNeg, SpRelNeg) => return None,
        };
        Some(Self { kind, val })
    }

    pub fn sub(self, other: Self) -> Option<Self> {
        self.add(other.neg())
    }

    /// Multiplication only folds absolute constants; a scaled stack pointer
    /// has no single-constant representation.
    pub fn mul(self, other: Self) -> Option<Self> {
        if self.is_absolute() && other.is_absolute() {
            Some(Self::abs(self.val.wrapping_mul(other.val)))
        } else {
            None
        }
    }

    pub fn div(self, other: Self) -> Option<Self> {
        if self.is_absolute() && other.is_absolute() && other.val != 0 {
            Some(Self::abs(self.val.wrapping_div(other.val)))
        } else {
            None
        }
    }

    pub fn rem(self, other: Self) -> Option<Self> {
        if self.is_absolute() && other.is_absolute() && other.val != 0 {
            Some(Self::abs(self.val.wrapping_rem(other.val)))
        } else {
            None
        }
    }

    pub fn mulh(self, other: Self) -> Option<Self> {
        if self.is_absolute() && other.is_absolute() {
            let wide = (self.val as i64).wrapping_mul(other.val as i64);
            Some(Self::abs((wide >> 32) as i32))
        } else {
            None
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ConstKind::Absolute => write!(f, "{}", self.val),
            ConstKind::SpRel if self.val >= 0 => write!(f, "sp+{}", self.val),
            ConstKind::SpRel => write!(f, "sp{}", self.val),
            ConstKind::SpRelNeg => write!(f, "{}-sp", self.val),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArithOp {
    Neg,
    Add,
    Sub,
    Mul,
    Mulh,
    Div,
    DivMod,
    Mod,
    Cmp,
}

impl ArithOp {
    pub fn is_unary(&self) -> bool {
        matches!(self, ArithOp::Neg)
    }
}

impl fmt::Display for ArithOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArithOp::Neg => "-",
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Mulh => "*H",
            ArithOp::Div => "/",
            ArithOp::DivMod => "/%",
            ArithOp::Mod => "%",
            ArithOp::Cmp => "~",
        };
        f.write_str(s)
    }
}

/// A node of the term DAG. `Var` ids are positive for machine registers and
/// negative for temporaries. `Top` uids are globally unique (see [`VarMaker`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Term {
    Const(Constant),
    Var(i32),
    Mem(Constant),
    Arith(ArithOp, TermRef, Option<TermRef>),
    Iter(BlockId),
    Top(u64),
}

impl Term {
    pub fn as_const(&self) -> Option<Constant> {
        match self {
            Term::Const(c) => Some(*c),
            _ => None,
        }
    }

    pub fn is_top(&self) -> bool {
        matches!(self, Term::Top(_))
    }
}

/// Rewrites the leaves of a term; interior arithmetic is rebuilt through the
/// smart constructors so the result is canonical again. This is the visitor
/// seam used by state composition, widening and iterator closing.
pub trait TermRewriter {
    fn rewrite_const(&mut self, c: Constant) -> TermRef {
        dag::cst(c)
    }
    fn rewrite_var(&mut self, id: i32) -> TermRef {
        dag::var(id)
    }
    fn rewrite_mem(&mut self, addr: Constant) -> TermRef {
        dag::mem(addr)
    }
    fn rewrite_iter(&mut self, h: BlockId) -> TermRef {
        dag::iter(h)
    }
    fn rewrite_top(&mut self, uid: u64) -> TermRef {
        dag::top(uid)
    }
}

pub fn rewrite<R: TermRewriter>(t: TermRef, r: &mut R) -> TermRef {
    match &*t {
        Term::Const(c) => r.rewrite_const(*c),
        Term::Var(id) => r.rewrite_var(*id),
        Term::Mem(addr) => r.rewrite_mem(*addr),
        Term::Iter(h) => r.rewrite_iter(*h),
        Term::Top(uid) => r.rewrite_top(*uid),
        Term::Arith(op, a, b) => {
            let a = rewrite(*a, r);
            let b = b.map(|b| rewrite(b, r));
            dag::arith(*op, a, b)
        }
    }
}

/// Walks a term depth-first, applying `f` to every node. Stops early when `f`
/// returns `true`; the return value says whether any node matched.
pub fn any_node(t: TermRef, f: &mut impl FnMut(&Term) -> bool) -> bool {
    if f(&t) {
        return true;
    }
    if let Term::Arith(_, a, b) = &*t {
        if any_node(*a, f) {
            return true;
        }
        if let Some(b) = b {
            return any_node(*b, f);
        }
    }
    false
}

pub fn contains_top(t: TermRef) -> bool {
    any_node(t, &mut |n| n.is_top())
}

pub fn uses_var(t: TermRef, id: i32) -> bool {
    any_node(t, &mut |n| matches!(n, Term::Var(v) if *v == id))
}

pub fn uses_temp(t: TermRef) -> bool {
    any_node(t, &mut |n| matches!(n, Term::Var(v) if *v < 0))
}

/// Collects every opaque-top uid reachable from `t`.
pub fn collect_tops(t: TermRef, out: &mut std::collections::BTreeSet<u64>) {
    any_node(t, &mut |n| {
        if let Term::Top(uid) = n {
            out.insert(*uid);
        }
        false
    });
}

/// A term is complete when no opaque top occurs in it. Incomplete terms are
/// kept in states (they still pin memory cells and register slots) but never
/// reach the solver.
pub fn is_complete(t: TermRef) -> bool {
    !contains_top(t)
}

/// Whether the term can be lowered to a QF_LIA integer expression:
/// no tops, no raw comparison values, no high-multiplies or div-mod pairs,
/// multiplication only by a constant, division/modulo only by a constant.
pub fn is_linear(t: TermRef) -> bool {
    match &*t {
        Term::Const(_) | Term::Var(_) | Term::Mem(_) | Term::Iter(_) => true,
        Term::Top(_) => false,
        Term::Arith(op, a, b) => match op {
            ArithOp::Cmp | ArithOp::Mulh | ArithOp::DivMod => false,
            ArithOp::Neg => is_linear(*a),
            ArithOp::Add | ArithOp::Sub => {
                is_linear(*a) && b.map(is_linear).unwrap_or(false)
            }
            ArithOp::Mul => {
                let b = match b {
                    Some(b) => *b,
                    None => return false,
                };
                (a.as_const().is_some() || b.as_const().is_some())
                    && is_linear(*a)
                    && is_linear(b)
            }
            ArithOp::Div | ArithOp::Mod => {
                let b = match b {
                    Some(b) => *b,
                    None => return false,
                };
                b.as_const().is_some() && is_linear(*a)
            }
        },
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Const(c) => write!(f, "{c}"),
            Term::Var(id) if *id < 0 => write!(f, "t{}", -id),
            Term::Var(id) => write!(f, "?{id}"),
            Term::Mem(addr) => write!(f, "[{addr}]"),
            Term::Iter(h) => write!(f, "I{}", h.index),
            Term::Top(uid) => write!(f, "T{uid}"),
            Term::Arith(op, a, None) => write!(f, "{op}({a})"),
            Term::Arith(op, a, Some(b)) => write!(f, "({a} {op} {b})"),
        }
    }
}
