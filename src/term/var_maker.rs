use super::{TermRef, dag};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

// Uids come from a process-wide counter so tops from different makers can
// never alias under interning.
static NEXT_UID: AtomicU64 = AtomicU64::new(0);

/// Allocator for opaque unknowns, one per analyzed CFG.
///
/// Whenever the interpreter loses information (scratch, unknown memory,
/// widening) it asks the maker for a fresh `Top`. The maker remembers its
/// allocations so a caller can import a callee's unknowns — each import mints
/// fresh uids, giving every call instance distinct unknowns — and so unused
/// tops can be forgotten once no live state mentions them.
#[derive(Debug, Clone, Default)]
pub struct VarMaker {
    allocated: Vec<u64>,
}

impl VarMaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self) -> TermRef {
        let uid = NEXT_UID.fetch_add(1, Ordering::Relaxed);
        self.allocated.push(uid);
        dag::top(uid)
    }

    /// Re-allocates every top of `other` in this maker and returns the
    /// renumbering, for substitution into an imported summary.
    pub fn import(&mut self, other: &VarMaker) -> HashMap<u64, TermRef> {
        other
            .allocated
            .iter()
            .map(|uid| (*uid, self.fresh()))
            .collect()
    }

    /// Forgets tops not in `used`. Only performed when `clean` is set
    /// (the `CLEAN_TOPS` flag); otherwise the record is kept as-is.
    pub fn minimize(&mut self, used: &BTreeSet<u64>, clean: bool) {
        if clean {
            self.allocated.retain(|uid| used.contains(uid));
        }
    }

    pub fn len(&self) -> usize {
        self.allocated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocated.is_empty()
    }
}
