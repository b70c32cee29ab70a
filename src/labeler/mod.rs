//! Loop labeling: gives every `while`/`for` a unique label and points each
//! `break`/`continue` at its innermost enclosing loop.

use crate::ast::*;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct LabelError {
    pub span: Span,
    pub message: String,
}

#[derive(Default)]
pub struct LoopLabeler {
    counter: usize,
    active: Vec<String>,
}

impl LoopLabeler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label_program(&mut self, program: &mut Program) -> Result<(), LabelError> {
        self.label_block(&mut program.statements)
    }

    fn label_block(&mut self, stmts: &mut [Stmt]) -> Result<(), LabelError> {
        stmts.iter_mut().try_for_each(|stmt| self.label_stmt(stmt))
    }

    fn fresh(&mut self, kind: &str) -> String {
        let label = format!("{}_{}", kind, self.counter);
        self.counter += 1;
        label
    }

    fn label_stmt(&mut self, stmt: &mut Stmt) -> Result<(), LabelError> {
        let span = stmt.span;
        match &mut stmt.node {
            StmtKind::While { label, body, .. } => {
                let fresh = self.fresh("while");
                *label = Some(fresh.clone());
                self.in_loop(fresh, body)
            }
            StmtKind::For { label, body, .. } => {
                let fresh = self.fresh("for");
                *label = Some(fresh.clone());
                self.in_loop(fresh, body)
            }
            StmtKind::Break { label } => {
                *label = Some(self.innermost("break", span)?);
                Ok(())
            }
            StmtKind::Continue { label } => {
                *label = Some(self.innermost("continue", span)?);
                Ok(())
            }
            StmtKind::Block(body) => self.label_block(body),
            StmtKind::If { then_branch, else_branch, .. } => {
                self.label_block(then_branch)?;
                match else_branch {
                    Some(branch) => self.label_block(branch),
                    None => Ok(()),
                }
            }
            StmtKind::Fn(func) | StmtKind::Decorated { func, .. } => self.in_function(func),
            StmtKind::Impl { methods, .. } => methods.iter_mut().try_for_each(|m| self.in_function(m)),
            StmtKind::Let { .. }
            | StmtKind::Expr(_)
            | StmtKind::Print(_)
            | StmtKind::Assert(_)
            | StmtKind::Return(_)
            | StmtKind::Struct { .. }
            | StmtKind::Use { .. } => Ok(()),
        }
    }

    fn in_loop(&mut self, label: String, body: &mut [Stmt]) -> Result<(), LabelError> {
        self.active.push(label);
        let result = self.label_block(body);
        self.active.pop();
        result
    }

    /// Loops never reach across a function boundary.
    fn in_function(&mut self, func: &mut FnDecl) -> Result<(), LabelError> {
        let outer = std::mem::take(&mut self.active);
        let result = self.label_block(&mut func.body);
        self.active = outer;
        result
    }

    fn innermost(&self, keyword: &str, span: Span) -> Result<String, LabelError> {
        self.active.last().cloned().ok_or_else(|| LabelError {
            span,
            message: format!("'{}' statement outside the loop", keyword),
        })
    }
}
