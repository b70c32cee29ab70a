//! Local slot allocation for one function being compiled.

/// Slots addressable by a `u8` operand.
pub const MAX_LOCALS: usize = 256;

#[derive(Debug, Clone)]
pub struct Local {
    pub name: String,
    /// Block depth the local was declared at (parameters live at depth 1).
    pub depth: usize,
    /// Set when a closure or pointer refers to the slot, so leaving its
    /// block must close the upvalue instead of just popping.
    pub captured: bool,
    /// Parameter count while the slot still holds the `fn` declared into it.
    pub arity: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclareError {
    Duplicate,
    TooMany,
}

#[derive(Debug, Default)]
pub struct Scope {
    pub locals: Vec<Local>,
    pub depth: usize,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_scope(&mut self) {
        self.depth += 1;
    }

    /// Drop the locals of the innermost block. Returns their `captured`
    /// flags innermost first, which is the order their slots are popped in.
    pub fn end_scope(&mut self) -> Vec<bool> {
        let mut popped = Vec::new();
        while let Some(local) = self.locals.last() {
            if local.depth < self.depth {
                break;
            }
            popped.push(local.captured);
            self.locals.pop();
        }
        self.depth -= 1;
        popped
    }

    /// `captured` flags of the locals deeper than `depth`, innermost first,
    /// without removing them. Used when a jump leaves several blocks at once.
    pub fn locals_above(&self, depth: usize) -> Vec<bool> {
        self.locals.iter().rev().take_while(|l| l.depth > depth).map(|l| l.captured).collect()
    }

    pub fn declare(&mut self, name: &str) -> Result<u8, DeclareError> {
        let duplicate = self
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth == self.depth)
            .any(|l| l.name == name);
        if duplicate {
            return Err(DeclareError::Duplicate);
        }
        if self.locals.len() >= MAX_LOCALS {
            return Err(DeclareError::TooMany);
        }
        self.locals.push(Local { name: name.to_string(), depth: self.depth, captured: false, arity: None });
        Ok((self.locals.len() - 1) as u8)
    }

    pub fn resolve(&self, name: &str) -> Option<u8> {
        self.locals.iter().rposition(|l| l.name == name).map(|i| i as u8)
    }

    pub fn set_arity(&mut self, slot: u8, arity: Option<u8>) {
        if let Some(local) = self.locals.get_mut(slot as usize) {
            local.arity = arity;
        }
    }

    pub fn mark_captured(&mut self, slot: u8) {
        if let Some(local) = self.locals.get_mut(slot as usize) {
            local.captured = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_begin_end() {
        let mut scope = Scope::new();
        scope.begin_scope();
        scope.declare("a").unwrap();
        scope.declare("b").unwrap();
        scope.begin_scope();
        scope.declare("c").unwrap();
        assert_eq!(scope.end_scope(), vec![false]);
        assert_eq!(scope.end_scope(), vec![false, false]);
        assert_eq!(scope.depth, 0);
        assert!(scope.locals.is_empty());
    }

    #[test]
    fn test_scope_resolve_innermost_shadow() {
        let mut scope = Scope::new();
        scope.begin_scope();
        scope.declare("x").unwrap();
        scope.begin_scope();
        scope.declare("x").unwrap();
        assert_eq!(scope.resolve("x"), Some(1));
        scope.end_scope();
        assert_eq!(scope.resolve("x"), Some(0));
        assert_eq!(scope.resolve("y"), None);
    }

    #[test]
    fn test_scope_duplicate_error() {
        let mut scope = Scope::new();
        scope.begin_scope();
        scope.declare("x").unwrap();
        assert_eq!(scope.declare("x"), Err(DeclareError::Duplicate));
    }

    #[test]
    fn test_scope_captured_flags() {
        let mut scope = Scope::new();
        scope.begin_scope();
        let a = scope.declare("a").unwrap();
        scope.declare("b").unwrap();
        scope.mark_captured(a);
        assert_eq!(scope.end_scope(), vec![false, true]);
    }

    #[test]
    fn test_scope_locals_above() {
        let mut scope = Scope::new();
        scope.begin_scope();
        scope.declare("outer").unwrap();
        scope.begin_scope();
        let i = scope.declare("i").unwrap();
        scope.mark_captured(i);
        scope.begin_scope();
        scope.declare("tmp").unwrap();
        assert_eq!(scope.locals_above(1), vec![false, true]);
        assert_eq!(scope.locals.len(), 3);
    }

    #[test]
    fn test_scope_limit() {
        let mut scope = Scope::new();
        scope.begin_scope();
        for i in 0..MAX_LOCALS {
            scope.declare(&format!("v{i}")).unwrap();
        }
        assert_eq!(scope.declare("overflow"), Err(DeclareError::TooMany));
    }
}
