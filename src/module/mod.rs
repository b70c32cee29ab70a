//! Module loading: resolves `use` paths, compiles each file once per session
//! and rejects import cycles.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::Error;
use crate::ast::{Span, StmtKind};
use crate::bytecode::{CompiledUnit, Origin};
use crate::labeler::LoopLabeler;
use crate::{compiler, lexer, parser};

/// Cache key used for a root module read from standard input.
pub const STDIN_KEY: &str = "<stdin>";

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("Cycle.")]
    Cycle { path: PathBuf, span: Span },
    #[error("cannot read module '{}': {source}", .path.display())]
    Read { path: PathBuf, span: Span, source: std::io::Error },
}

impl ModuleError {
    /// Span of the `use` statement that triggered the failure.
    pub fn span(&self) -> Span {
        match self {
            ModuleError::Cycle { span, .. } | ModuleError::Read { span, .. } => *span,
        }
    }
}

#[derive(Debug)]
enum Entry {
    InProgress,
    Done(Rc<CompiledUnit>),
}

/// Path to compiled unit cache for one compilation session.
#[derive(Debug, Default)]
pub struct ModuleCache {
    entries: HashMap<PathBuf, Entry>,
    compiled: usize,
    hits: usize,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of modules compiled so far, the root included.
    pub fn compiled_count(&self) -> usize {
        self.compiled
    }

    /// Number of `use` statements served from the cache.
    pub fn hit_count(&self) -> usize {
        self.hits
    }

    /// Compiles a root module whose text is already in memory. `path` locates
    /// the file for relative imports; a path that does not exist (such as
    /// `<stdin>`) resolves imports against the working directory.
    pub fn load_root(&mut self, path: &Path, source: &str) -> Result<Rc<CompiledUnit>, Error> {
        let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if let Some(Entry::Done(unit)) = self.entries.get(&key) {
            return Ok(unit.clone());
        }
        self.compile_module(key, source.to_string(), false)
    }

    /// Loads the module a `use` statement at `span` refers to.
    fn load(&mut self, path: &Path, span: Span) -> Result<Rc<CompiledUnit>, Error> {
        let key = path
            .canonicalize()
            .map_err(|source| ModuleError::Read { path: path.to_path_buf(), span, source })?;
        match self.entries.get(&key) {
            Some(Entry::InProgress) => return Err(ModuleError::Cycle { path: key, span }.into()),
            Some(Entry::Done(unit)) => {
                self.hits += 1;
                tracing::info!("using cached import for: {}", key.display());
                return Ok(unit.clone());
            }
            None => {}
        }
        let source = fs::read_to_string(&key)
            .map_err(|source| ModuleError::Read { path: key.clone(), span, source })?;
        self.compile_module(key, source, true)
    }

    fn compile_module(&mut self, key: PathBuf, source: String, nested: bool) -> Result<Rc<CompiledUnit>, Error> {
        tracing::debug!(path = %key.display(), "compiling module");
        self.entries.insert(key.clone(), Entry::InProgress);
        match self.build(&key, &source) {
            Ok(unit) => {
                self.compiled += 1;
                self.entries.insert(key, Entry::Done(unit.clone()));
                Ok(unit)
            }
            Err(err) => {
                self.entries.remove(&key);
                Err(match err {
                    Error::Imported { .. } => err,
                    err if nested => Error::Imported { path: key, text: source, error: Box::new(err) },
                    err => err,
                })
            }
        }
    }

    fn build(&mut self, key: &Path, source: &str) -> Result<Rc<CompiledUnit>, Error> {
        let tokens = lexer::lex(source)?;
        let mut program = parser::parse(tokens).map_err(Error::Parse)?;
        LoopLabeler::new().label_program(&mut program)?;

        let dir = key.parent().map(Path::to_path_buf).unwrap_or_default();
        let mut modules = HashMap::new();
        for stmt in &program.statements {
            let StmtKind::Use { path } = &stmt.node else { continue };
            if modules.contains_key(path) {
                continue;
            }
            let unit = self.load(&dir.join(path), stmt.span)?;
            modules.insert(path.clone(), unit);
        }

        let origin = Rc::new(Origin { path: key.to_path_buf(), source: source.to_string() });
        Ok(Rc::new(compiler::compile_program(&program, origin, &modules)?))
    }
}
