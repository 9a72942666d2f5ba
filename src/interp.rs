//! Block transfer: symbolic interpretation of one basic block's machine
//! instructions.
//!
//! Registers, temporaries and memory are tracked symbolically in the state's
//! local-variable and memory tables; predicates are emitted only at
//! conditionals (`If`/`Cont`), where the comparison value held by the status
//! register is decomposed into a relation on its operands. Anything the model
//! cannot express scratches its destination to a fresh opaque top.

use crate::predicate::{CondOp, LabelledPredicate, Predicate};
use crate::program::{CompareCond, InitialState, MachineInst, Sem, VarId};
use crate::state::State;
use crate::term::{ArithOp, Term, TermRef, VarMaker, dag};
use tracing::{debug, warn};

/// Interprets every machine instruction of a block, mutating `state` in
/// place. After an `If`/`Cont` pair the state carries both fork buffers; the
/// driver distributes them onto the outgoing edges.
pub fn process_block(
    state: &mut State,
    insts: &[MachineInst],
    vm: &mut VarMaker,
    initial: &InitialState,
) {
    let mut last_condition: Option<(CompareCond, TermRef, TermRef)> = None;
    let mut before_cond: Vec<LabelledPredicate> = Vec::new();

    state.lvars.clear_updated();
    for inst in insts {
        for sem in inst.sems() {
            step(state, sem, vm, initial, &mut last_condition, &mut before_cond);
        }
        invalidate_temp_vars(state);
    }
}

fn step(
    state: &mut State,
    sem: &Sem,
    vm: &mut VarMaker,
    initial: &InitialState,
    last_condition: &mut Option<(CompareCond, TermRef, TermRef)>,
    before_cond: &mut Vec<LabelledPredicate>,
) {
    match *sem {
        Sem::Nop | Sem::Branch => {}

        Sem::If { cond, sr } => {
            // Taken path starts here: remember the fall-through predicate
            // context, capture the comparison before the status register can
            // die with its instruction, and push the taken-branch condition.
            *before_cond = state.generated_preds.clone();
            match comparison_operands(state, sr) {
                Some((lhs, rhs)) => {
                    *last_condition = Some((cond, lhs, rhs));
                    push_pred(state, branch_predicate(cond, lhs, rhs, true));
                }
                None => {
                    debug!("condition on ?{sr} has no tracked comparison value");
                    *last_condition = None;
                }
            }
        }

        Sem::Cont => {
            // Taken path ends: its temporaries die now, then its predicates
            // move to the taken buffer and the fall-through context resumes.
            invalidate_temp_vars(state);
            state.generated_preds_taken = std::mem::take(&mut state.generated_preds);
            state.generated_preds = std::mem::take(before_cond);
            state.has_fork = true;
            if let Some((cond, lhs, rhs)) = last_condition.take() {
                push_pred(state, branch_predicate(cond, lhs, rhs, false));
            }
        }

        Sem::Set { dst, src } => {
            let v = read(state, src, vm);
            state.lvars.set(dst, v);
        }
        Sem::SetI { dst, val } => state.lvars.set(dst, dag::abs(val)),
        Sem::Scratch { dst } => scratch(state, dst, vm),

        Sem::SetP { dst } | Sem::Spec { dst } => {
            warn!("unmodeled microinstruction {sem:?}, scratching ?{dst}");
            scratch(state, dst, vm);
        }
        Sem::Not { dst, .. }
        | Sem::And { dst, .. }
        | Sem::Or { dst, .. }
        | Sem::Xor { dst, .. } => {
            warn!("unmodeled bitwise microinstruction {sem:?}, scratching ?{dst}");
            scratch(state, dst, vm);
        }

        Sem::Cmp { dst, a, b } | Sem::CmpU { dst, a, b } => {
            let va = read(state, a, vm);
            let vb = read(state, b, vm);
            state.lvars.set(dst, dag::cmp(va, vb));
        }

        Sem::Add { dst, a, b } => binop(state, vm, dst, a, b, ArithOp::Add),
        Sem::Sub { dst, a, b } => binop(state, vm, dst, a, b, ArithOp::Sub),
        Sem::Mul { dst, a, b } | Sem::MulU { dst, a, b } => {
            binop(state, vm, dst, a, b, ArithOp::Mul)
        }
        Sem::Div { dst, a, b } | Sem::DivU { dst, a, b } => {
            binop(state, vm, dst, a, b, ArithOp::Div)
        }
        Sem::Mod { dst, a, b } | Sem::ModU { dst, a, b } => {
            binop(state, vm, dst, a, b, ArithOp::Mod)
        }

        Sem::Neg { dst, a } => {
            let va = read(state, a, vm);
            state.lvars.set(dst, dag::neg(va));
        }

        // Shifts only stay precise for a concrete shift count; both right
        // shifts lower to division by a power of two (the logical/arithmetic
        // distinction is not modeled).
        Sem::Shl { dst, a, b } => shift(state, vm, dst, a, b, ArithOp::Mul),
        Sem::Shr { dst, a, b } | Sem::Asr { dst, a, b } => {
            shift(state, vm, dst, a, b, ArithOp::Div)
        }

        Sem::Load { dst, addr } => {
            let resolved = read(state, addr, vm).as_const();
            match resolved {
                Some(c) => {
                    if let Some(val) = c.is_absolute().then(|| initial.lookup(c.val)).flatten()
                    {
                        // Read-only data known from the binary image.
                        state.lvars.set(dst, dag::abs(val));
                    } else if let Some(t) = state.mem_cell(c) {
                        state.lvars.set(dst, t);
                    } else {
                        // Unknown cell: the loaded value is opaque, but later
                        // loads of the same cell must agree with it.
                        let t = vm.fresh();
                        state.lvars.set(dst, t);
                        state.mem.insert(c, t);
                    }
                }
                None => {
                    debug!("could not resolve load address ?{addr}");
                    scratch(state, dst, vm);
                }
            }
        }

        Sem::Store { src, addr } => {
            let resolved = read(state, addr, vm).as_const();
            match resolved {
                Some(c) => {
                    let v = read(state, src, vm);
                    state.mem.insert(c, v);
                }
                None => {
                    warn!("could not resolve store address ?{addr}, scratching memory");
                    state.mem.clear();
                }
            }
        }
    }
}

fn read(state: &mut State, id: VarId, vm: &mut VarMaker) -> TermRef {
    match state.lvars.value(id) {
        Some(t) => t,
        None => {
            warn!("read of unset temporary t{}", -id);
            let t = vm.fresh();
            state.lvars.set(id, t);
            t
        }
    }
}

fn scratch(state: &mut State, dst: VarId, vm: &mut VarMaker) {
    let t = vm.fresh();
    state.lvars.set(dst, t);
}

fn binop(state: &mut State, vm: &mut VarMaker, dst: VarId, a: VarId, b: VarId, op: ArithOp) {
    let va = read(state, a, vm);
    let vb = read(state, b, vm);
    state.lvars.set(dst, dag::arith(op, va, Some(vb)));
}

fn shift(state: &mut State, vm: &mut VarMaker, dst: VarId, a: VarId, b: VarId, op: ArithOp) {
    let count = read(state, b, vm)
        .as_const()
        .filter(|c| c.is_absolute() && (0..32).contains(&c.val));
    match count {
        Some(c) => {
            let va = read(state, a, vm);
            let factor = dag::abs(1i32.wrapping_shl(c.val as u32));
            state.lvars.set(dst, dag::arith(op, va, Some(factor)));
        }
        None => {
            debug!("shift count ?{b} is not a known constant");
            scratch(state, dst, vm);
        }
    }
}

fn push_pred(state: &mut State, p: Predicate) {
    if p.is_ident() {
        return;
    }
    debug!("+ {p}");
    state.generated_preds.push(LabelledPredicate::new(p));
}

/// The comparison value held by the status register, if one is tracked.
fn comparison_operands(state: &State, sr: VarId) -> Option<(TermRef, TermRef)> {
    match state.lvars.value(sr).as_deref() {
        Some(Term::Arith(ArithOp::Cmp, l, Some(r))) => Some((*l, *r)),
        _ => None,
    }
}

/// The predicate a conditional implies on one of its branches. Unsigned
/// conditions yield the same structural predicate as their signed
/// counterparts.
fn branch_predicate(cond: CompareCond, lhs: TermRef, rhs: TermRef, taken: bool) -> Predicate {
    let cond = if taken { cond } else { cond.invert() };
    use CompareCond::*;
    let (op, reverse) = match cond {
        Eq => (CondOp::Eq, false),
        Ne => (CondOp::Ne, false),
        Lt | ULt => (CondOp::Lt, false),
        Le | ULe => (CondOp::Le, false),
        Ge | UGe => (CondOp::Le, true),
        Gt | UGt => (CondOp::Lt, true),
    };
    if reverse {
        Predicate::new(op, rhs, lhs)
    } else {
        Predicate::new(op, lhs, rhs)
    }
}

/// End-of-instruction temporary invalidation. Before the temporaries die,
/// any predicate of the shape `t = expr` with a lone temporary is used to
/// substitute `expr` for `t` elsewhere, keeping the information; predicates
/// still mentioning a temporary afterwards are dropped.
fn invalidate_temp_vars(state: &mut State) {
    loop {
        let solved = state
            .generated_preds
            .iter()
            .enumerate()
            .find_map(|(i, lp)| lp.pred.isolated_temp_var().map(|(t, e)| (i, t, e)));
        let Some((i, t, expr)) = solved else {
            break;
        };
        state.generated_preds.remove(i);
        for lp in &mut state.generated_preds {
            if lp.pred.involves_var(t) {
                lp.pred = lp.pred.substitute_var(t, expr);
            }
        }
        state.generated_preds.retain(|lp| !lp.pred.is_ident());
    }
    state
        .generated_preds
        .retain(|lp| !lp.pred.involves_temp());
    state.lvars.clear_temps();
}
