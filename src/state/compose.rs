//! Substitution of caller facts into a callee summary.
//!
//! When a call block imports a callee's exit state, every callee-visible
//! symbol is rewritten in the caller's basis: registers through the caller's
//! local variables, SP-relative constants through the caller's current stack
//! pointer, memory cells through the caller's store, and imported opaque
//! tops through the renumbering produced by `VarMaker::import`.

use super::State;
use crate::term::{Constant, TermRef, TermRewriter, dag};
use std::collections::HashMap;

pub(crate) struct Compositor<'a> {
    caller: &'a State,
    sp_base: Option<Constant>,
    tops: &'a HashMap<u64, TermRef>,
}

impl<'a> Compositor<'a> {
    pub(crate) fn new(caller: &'a State, tops: &'a HashMap<u64, TermRef>) -> Self {
        Self {
            caller,
            sp_base: caller.sp_value(),
            tops,
        }
    }

    /// A callee frame address in the caller's basis. When the caller's stack
    /// pointer is no longer a known offset the address passes through
    /// unchanged; the caller drops its relative cells separately in that
    /// case.
    pub(crate) fn translate_addr(&self, addr: Constant) -> Constant {
        let Some(base) = self.sp_base else {
            return addr;
        };
        if addr.is_absolute() {
            return addr;
        }
        let abs = Constant::abs(addr.val);
        let translated = match addr.kind {
            crate::term::ConstKind::SpRel => base.add(abs),
            crate::term::ConstKind::SpRelNeg => abs.sub(base),
            crate::term::ConstKind::Absolute => unreachable!(),
        };
        translated.unwrap_or(addr)
    }
}

impl TermRewriter for Compositor<'_> {
    fn rewrite_const(&mut self, c: Constant) -> TermRef {
        dag::cst(self.translate_addr(c))
    }

    fn rewrite_var(&mut self, id: i32) -> TermRef {
        self.caller.value_or_identity(id)
    }

    fn rewrite_mem(&mut self, addr: Constant) -> TermRef {
        let translated = self.translate_addr(addr);
        self.caller
            .mem_cell(translated)
            .unwrap_or_else(|| dag::mem(translated))
    }

    fn rewrite_top(&mut self, uid: u64) -> TermRef {
        // Tops internal to the callee were renumbered at import; anything
        // else already lives in the caller's maker and passes through.
        self.tops
            .get(&uid)
            .copied()
            .unwrap_or_else(|| dag::top(uid))
    }
}
