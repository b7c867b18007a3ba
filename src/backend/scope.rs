use std::collections::HashSet;

use crate::backend::SymbolTable;
use crate::ir::{BaseId, View};

/// Per-loop-level emitter state. Lookups chain to the parent level; the
/// scalar-replaced set is mutated (and drained by write-back) only at the
/// level that declared the replacement.
///
/// Naming rule: arrays `a{baseID}`, temp scalars `t{arena id}`, scalar
/// replacements `s{idxID}`, index locals `idx{idxID}`, axis variables
/// `i{rank}`, constants `c{constID}`.
pub struct Scope<'a> {
    parent: Option<&'a Scope<'a>>,
    tmps: HashSet<BaseId>,
    declared: HashSet<View>,
    idx_declared: HashSet<View>,
    scalar_replaced: HashSet<View>,
}

impl<'a> Scope<'a> {
    pub fn new(parent: Option<&'a Scope<'a>>) -> Self {
        Scope {
            parent,
            tmps: HashSet::new(),
            declared: HashSet::new(),
            idx_declared: HashSet::new(),
            scalar_replaced: HashSet::new(),
        }
    }

    pub fn insert_tmp(&mut self, base: BaseId, view: &View) {
        self.tmps.insert(base);
        self.declared.insert(view.clone());
    }

    pub fn insert_scalar_replaced(&mut self, view: &View) {
        self.scalar_replaced.insert(view.clone());
        self.declared.insert(view.clone());
    }

    pub fn insert_idx(&mut self, view: &View) {
        self.idx_declared.insert(view.clone());
    }

    /// Drop a scalar replacement after its write-back. Only the declaring
    /// level holds it.
    pub fn erase_scalar_replaced(&mut self, view: &View) {
        self.scalar_replaced.remove(view);
    }

    pub fn is_tmp(&self, base: BaseId) -> bool {
        self.tmps.contains(&base) || self.parent.is_some_and(|p| p.is_tmp(base))
    }

    /// Declared in any enclosing scope, as a temp or a scalar replacement.
    pub fn is_declared(&self, view: &View) -> bool {
        self.declared.contains(view) || self.parent.is_some_and(|p| p.is_declared(view))
    }

    pub fn is_idx_declared(&self, view: &View) -> bool {
        self.idx_declared.contains(view) || self.parent.is_some_and(|p| p.is_idx_declared(view))
    }

    pub fn is_scalar_replaced(&self, view: &View) -> bool {
        self.scalar_replaced.contains(view)
            || self.parent.is_some_and(|p| p.is_scalar_replaced(view))
    }

    /// Scalar replacement held by this level (eligible for write-back
    /// here).
    pub fn is_scalar_replaced_here(&self, view: &View) -> bool {
        self.scalar_replaced.contains(view)
    }

    /// The view still reads and writes memory: neither a temp scalar nor
    /// scalar-replaced.
    pub fn is_array(&self, view: &View) -> bool {
        !self.is_tmp(view.base) && !self.is_declared(view)
    }

    /// Spelling of the view inside expressions, without a subscript.
    pub fn name(&self, view: &View, symbols: &SymbolTable) -> String {
        if self.is_tmp(view.base) {
            format!("t{}", view.base.0)
        } else if self.is_scalar_replaced(view) {
            format!("s{}", symbols.idx_id(view).expect("scalar-replaced view has an idx id"))
        } else {
            format!("a{}", symbols.base_id(view.base).expect("array view is a parameter"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(base: usize, start: i64) -> View {
        View { base: BaseId(base), start, shape: vec![4], stride: vec![1] }
    }

    #[test]
    fn lookups_chain_to_parent() {
        let mut outer = Scope::new(None);
        let v = view(0, 0);
        outer.insert_scalar_replaced(&v);
        outer.insert_tmp(BaseId(1), &view(1, 0));
        let inner = Scope::new(Some(&outer));
        assert!(inner.is_scalar_replaced(&v));
        assert!(inner.is_declared(&v));
        assert!(inner.is_tmp(BaseId(1)));
        assert!(!inner.is_scalar_replaced_here(&v));
        assert!(!inner.is_array(&v));
        assert!(inner.is_array(&view(2, 0)));
    }

    #[test]
    fn distinct_views_of_one_base_are_tracked_separately() {
        let mut scope = Scope::new(None);
        scope.insert_scalar_replaced(&view(0, 0));
        assert!(scope.is_scalar_replaced(&view(0, 0)));
        assert!(!scope.is_scalar_replaced(&view(0, 2)));
    }
}
