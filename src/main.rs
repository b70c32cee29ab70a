use std::collections::HashSet;
use std::io::{self, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use fang::bytecode::CompiledUnit;
use fang::diagnostic::{Diagnostic, ansi::AnsiRenderer, json};
use fang::labeler::LoopLabeler;
use fang::module::STDIN_KEY;
use fang::{Error, lexer, parser};

#[derive(Parser)]
#[command(name = "fang", version, about = "Compile and run fang scripts")]
struct Cli {
    /// Script to run; reads standard input when omitted or `-`
    file: Option<PathBuf>,

    /// Print the token stream and exit
    #[arg(long)]
    tokens: bool,

    /// Print the labeled syntax tree as JSON and exit
    #[arg(long)]
    ast: bool,

    /// Print the bytecode of every module before running
    #[arg(long)]
    disassemble: bool,

    /// Print the operand stack at halt, which statements always leave empty
    #[arg(long)]
    dump_stack: bool,

    /// Report errors as JSON lines
    #[arg(long)]
    json: bool,

    /// Disable colored diagnostics
    #[arg(long)]
    no_color: bool,
}

struct Input {
    source: String,
    path: PathBuf,
}

fn main() {
    let stderr_tty = io::stderr().is_terminal();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(stderr_tty)
                .without_time()
                .with_target(false),
        )
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let use_color = stderr_tty && !cli.no_color;

    let input = match read_input(cli.file.as_deref()) {
        Ok(input) => input,
        Err(e) => fail(&cli, use_color, &e, None),
    };

    if let Err(e) = execute(&cli, &input) {
        fail(&cli, use_color, &e, Some(&input));
    }
}

fn read_input(file: Option<&Path>) -> Result<Input, Error> {
    match file {
        Some(path) if path != Path::new("-") => {
            let source = std::fs::read_to_string(path)
                .map_err(|source| Error::Io { path: path.to_path_buf(), source })?;
            Ok(Input { source, path: path.to_path_buf() })
        }
        _ => {
            let mut source = String::new();
            io::stdin()
                .read_to_string(&mut source)
                .map_err(|source| Error::Io { path: PathBuf::from(STDIN_KEY), source })?;
            Ok(Input { source, path: PathBuf::from(STDIN_KEY) })
        }
    }
}

fn execute(cli: &Cli, input: &Input) -> Result<(), Error> {
    if cli.tokens {
        for (token, span) in lexer::lex(&input.source)? {
            println!("{:>5}..{:<5} {:?}", span.start, span.end, token);
        }
        return Ok(());
    }

    if cli.ast {
        let tokens = lexer::lex(&input.source)?;
        let mut program = parser::parse(tokens).map_err(Error::Parse)?;
        LoopLabeler::new().label_program(&mut program)?;
        match serde_json::to_string_pretty(&program) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("cannot serialize syntax tree: {e}"),
        }
        return Ok(());
    }

    let unit = fang::compile(&input.source, &input.path)?;
    if cli.disassemble {
        print_disassembly(&unit, &mut HashSet::new());
    }

    let result = fang::run(&unit)?;
    if cli.dump_stack {
        let items: Vec<String> = result.final_stack.iter().map(ToString::to_string).collect();
        println!("final stack: [{}]", items.join(", "));
    }
    Ok(())
}

/// Imports first, each module once.
fn print_disassembly(unit: &CompiledUnit, seen: &mut HashSet<PathBuf>) {
    if !seen.insert(unit.path.clone()) {
        return;
    }
    for import in &unit.imports {
        print_disassembly(import, seen);
    }
    println!("{}", unit.disassemble());
}

fn fail(cli: &Cli, use_color: bool, e: &Error, input: Option<&Input>) -> ! {
    let mut d = Diagnostic::from(e);
    if let Some(input) = input {
        d = d.or_source(&input.source, &input.path.display().to_string());
    }
    let _ = io::stdout().flush();
    if cli.json {
        eprintln!("{}", json::render(&d));
    } else {
        eprint!("{}", AnsiRenderer { use_color }.render(&d));
    }
    std::process::exit(e.exit_code());
}
