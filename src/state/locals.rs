use crate::term::{TermRef, dag};

/// Total map from register/temporary ids to their symbolic values.
///
/// A register slot that was never written reads as its own `Var(id)`
/// (identity), so a fresh state denotes "every register holds its entry
/// value". A temporary slot that was never written is unset: temporaries are
/// instruction-local and reading one before writing it is an upstream
/// modeling gap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariables {
    regs: Vec<Option<TermRef>>,
    temps: Vec<Option<TermRef>>,
    updated: Vec<bool>,
}

impl LocalVariables {
    pub fn new(registers: u32, temps: u32) -> Self {
        Self {
            regs: vec![None; registers as usize],
            temps: vec![None; temps as usize],
            updated: vec![false; (registers + temps) as usize],
        }
    }

    pub fn register_count(&self) -> u32 {
        self.regs.len() as u32
    }

    fn updated_slot(&self, id: i32) -> usize {
        if id >= 0 {
            id as usize
        } else {
            self.regs.len() + (-id - 1) as usize
        }
    }

    /// The stored term, without the identity default.
    pub fn raw(&self, id: i32) -> Option<TermRef> {
        if id >= 0 {
            self.regs.get(id as usize).copied().flatten()
        } else {
            self.temps.get((-id - 1) as usize).copied().flatten()
        }
    }

    /// The value a read of `id` observes. `None` only for unset temporaries.
    pub fn value(&self, id: i32) -> Option<TermRef> {
        match self.raw(id) {
            Some(t) => Some(t),
            None if id >= 0 => Some(dag::var(id)),
            None => None,
        }
    }

    pub fn set(&mut self, id: i32, term: TermRef) {
        if id >= 0 {
            self.regs[id as usize] = Some(term);
        } else {
            self.temps[(-id - 1) as usize] = Some(term);
        }
        let slot = self.updated_slot(id);
        self.updated[slot] = true;
    }

    pub fn is_updated(&self, id: i32) -> bool {
        self.updated[self.updated_slot(id)]
    }

    pub fn clear_updated(&mut self) {
        self.updated.fill(false);
    }

    /// Resets every temporary to unset.
    pub fn clear_temps(&mut self) {
        self.temps.fill(None);
    }

    pub fn reg_ids(&self) -> impl Iterator<Item = i32> + use<> {
        0..self.regs.len() as i32
    }

    pub fn temp_ids(&self) -> impl Iterator<Item = i32> + use<> {
        (1..=self.temps.len() as i32).map(|i| -i)
    }

    /// Registers whose slot differs from identity, with their values.
    pub fn updated_regs(&self) -> impl Iterator<Item = (i32, TermRef)> + '_ {
        self.regs
            .iter()
            .enumerate()
            .filter_map(|(id, t)| t.map(|t| (id as i32, t)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::dag;

    #[test]
    fn registers_default_to_identity() {
        let lv = LocalVariables::new(4, 2);
        assert_eq!(lv.value(2), Some(dag::var(2)));
        assert_eq!(lv.raw(2), None);
        assert_eq!(lv.value(-1), None);
    }

    #[test]
    fn set_marks_updated() {
        let mut lv = LocalVariables::new(4, 2);
        assert!(!lv.is_updated(1));
        lv.set(1, dag::abs(7));
        assert!(lv.is_updated(1));
        assert_eq!(lv.value(1), Some(dag::abs(7)));
        lv.set(-2, dag::abs(9));
        assert!(lv.is_updated(-2));
        lv.clear_temps();
        assert_eq!(lv.value(-2), None);
    }
}
