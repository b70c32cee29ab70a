//! fang: a small scripting language compiled to bytecode and run on a stack VM.
//!
//! The pipeline is lexer, parser, loop labeler, compiler and VM. Imports are
//! resolved by [`module::ModuleCache`], which compiles each file once per session.

pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod diagnostic;
pub mod labeler;
pub mod lexer;
pub mod module;
pub mod parser;
pub mod value;
pub mod vm;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use ast::Span;
use bytecode::CompiledUnit;
use compiler::CompileError;
use labeler::LabelError;
use lexer::LexError;
use module::{ModuleCache, ModuleError};
use parser::ParseError;
use vm::{RunResult, RuntimeError};

/// Exit status for lex, parse, label, compile and module errors.
pub const EXIT_STATIC: i32 = 1;
/// Exit status for errors raised while the VM runs.
pub const EXIT_RUNTIME: i32 = 255;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error("{}", first_message(.0))]
    Parse(Vec<ParseError>),
    #[error(transparent)]
    Label(#[from] LabelError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Module(#[from] ModuleError),
    /// A static error raised while compiling an imported file.
    #[error("{error}")]
    Imported { path: PathBuf, text: String, error: Box<Error> },
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("cannot read '{}': {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
}

fn first_message(errors: &[ParseError]) -> &str {
    errors.first().map_or("parse error", |e| e.message.as_str())
}

impl Error {
    /// Prefix naming the pipeline stage that failed.
    pub fn component(&self) -> &'static str {
        match self {
            Error::Lex(_) | Error::Parse(_) => "parser",
            Error::Label(_) => "loop_labeler",
            Error::Compile(_) | Error::Module(ModuleError::Cycle { .. }) => "compiler",
            Error::Module(ModuleError::Read { .. }) | Error::Io { .. } => "io",
            Error::Imported { error, .. } => error.component(),
            Error::Runtime(_) => "vm",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Runtime(_) => EXIT_RUNTIME,
            Error::Imported { error, .. } => error.exit_code(),
            _ => EXIT_STATIC,
        }
    }

    pub fn span(&self) -> Option<Span> {
        match self {
            Error::Lex(e) => Some(e.span),
            Error::Parse(errors) => errors.first().map(|e| e.span),
            Error::Label(e) => Some(e.span),
            Error::Compile(e) => Some(e.span),
            Error::Module(e) => Some(e.span()),
            Error::Imported { error, .. } => error.span(),
            Error::Runtime(e) => Some(e.span),
            Error::Io { .. } => None,
        }
    }
}

/// Compiles `source` as the root module at `module_path`, with a fresh module cache.
pub fn compile(source: &str, module_path: &Path) -> Result<Rc<CompiledUnit>, Error> {
    compile_with(&mut ModuleCache::new(), source, module_path)
}

pub fn compile_with(cache: &mut ModuleCache, source: &str, module_path: &Path) -> Result<Rc<CompiledUnit>, Error> {
    cache.load_root(module_path, source)
}

/// Runs a compiled root module, printing to stdout.
pub fn run(unit: &CompiledUnit) -> Result<RunResult, Error> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    run_with_output(unit, &mut out)
}

pub fn run_with_output(unit: &CompiledUnit, out: &mut dyn Write) -> Result<RunResult, Error> {
    Ok(vm::run(unit, out)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_source(source: &str) -> Result<String, Error> {
        let unit = compile(source, Path::new("test.fang"))?;
        let mut out = Vec::new();
        run_with_output(&unit, &mut out)?;
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn pipeline_prints() {
        assert_eq!(run_source("print 2 + 2;").unwrap(), "dbg print :: 4\n");
    }

    #[test]
    fn lex_errors_are_parser_errors() {
        let err = run_source("print \"open;").unwrap_err();
        assert_eq!(err.component(), "parser");
        assert_eq!(err.exit_code(), EXIT_STATIC);
    }

    #[test]
    fn parse_error_reports_first_message() {
        let err = run_source("print 1").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
        assert_eq!(err.to_string(), "Expected ';' after 'print' statement.");
    }

    #[test]
    fn label_error_component() {
        let err = run_source("break;").unwrap_err();
        assert_eq!(err.component(), "loop_labeler");
        assert_eq!(err.exit_code(), EXIT_STATIC);
    }

    #[test]
    fn compile_error_component() {
        let err = run_source("print nope;").unwrap_err();
        assert_eq!(err.component(), "compiler");
        assert_eq!(err.to_string(), "Variable 'nope' is not defined.");
    }

    #[test]
    fn runtime_error_exit_code() {
        let err = run_source("print 1 + true;").unwrap_err();
        assert_eq!(err.component(), "vm");
        assert_eq!(err.exit_code(), EXIT_RUNTIME);
        assert!(err.span().is_some());
    }

    #[test]
    fn static_error_prevents_any_output() {
        let unit = compile("print 1; print missing;", Path::new("test.fang"));
        assert!(unit.is_err());
    }

    #[test]
    fn shared_cache_reuses_units() {
        let mut cache = ModuleCache::new();
        let a = compile_with(&mut cache, "let a = 1;", Path::new("<stdin>")).unwrap();
        let b = compile_with(&mut cache, "let a = 1;", Path::new("<stdin>")).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(cache.compiled_count(), 1);
    }
}
