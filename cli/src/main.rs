//! The `tarn` binary: `run`, `fmt`, the debug subcommands (debug builds
//! only) and the interactive REPL when invoked with no subcommand on a TTY.
//!
//! Exit codes for `run`: the script's integer result when it is one in
//! 0..=255, otherwise 0; 1 when the script fails to parse, compile or run;
//! 2 on I/O errors.

mod builtins;
mod repl;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;

use clap::{Parser, Subcommand};
use tarn_core::bytecode::{is_module_image, read_module};
use tarn_core::errors::line_col;
use tarn_core::value::HeapValue;
use tarn_core::{Engine, EngineOptions, Error};

/// Tarn - a small embeddable scripting language
#[derive(Parser, Debug)]
#[command(name = "tarn")]
#[command(about = "Run Tarn scripts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a script or compiled module
    Run { file: PathBuf },
    /// Reformat a script to canonical style
    Fmt { file: PathBuf },
    /// Compile a script and print its bytecode
    #[cfg(debug_assertions)]
    #[command(name = "debug:dump")]
    DebugDump { file: PathBuf },
    /// Print a script's token stream
    #[cfg(debug_assertions)]
    #[command(name = "debug:tokens")]
    DebugTokens { file: PathBuf },
    /// Compile a script to a module file
    #[cfg(debug_assertions)]
    #[command(name = "debug:write")]
    DebugWrite { file: PathBuf, out: PathBuf },
    /// Validate a module file and print its bytecode
    #[cfg(debug_assertions)]
    #[command(name = "debug:read")]
    DebugRead { file: PathBuf },
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Run { file }) => run_file(&file),
        Some(Command::Fmt { file }) => fmt_file(&file),
        #[cfg(debug_assertions)]
        Some(Command::DebugDump { file }) => debug_dump(&file),
        #[cfg(debug_assertions)]
        Some(Command::DebugTokens { file }) => debug_tokens(&file),
        #[cfg(debug_assertions)]
        Some(Command::DebugWrite { file, out }) => debug_write(&file, &out),
        #[cfg(debug_assertions)]
        Some(Command::DebugRead { file }) => debug_read(&file),
        None => {
            if atty::is(atty::Stream::Stdin) {
                repl::run()
            } else {
                run_stdin()
            }
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    // TARN_LOG or RUST_LOG controls verbosity; default to warnings.
    let filter = EnvFilter::try_from_env("TARN_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn engine() -> Engine {
    let mut options = EngineOptions::default();
    options.vm.import_files = true;
    let mut engine = Engine::new(options);
    builtins::register(&mut engine);
    engine
}

fn io_error(path: &Path, err: std::io::Error) -> ExitCode {
    eprintln!("error: cannot read {}: {err}", path.display());
    ExitCode::from(2)
}

fn run_file(path: &Path) -> ExitCode {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => return io_error(path, err),
    };
    let path_text = path.display().to_string();
    let mut engine = engine();

    let (result, source) = if is_module_image(&bytes) {
        (load_module(&bytes).and_then(|module| engine.run(module)), None)
    } else {
        match String::from_utf8(bytes) {
            Ok(source) => {
                let result = engine.run_source(&path_text, &source);
                (result, Some(source))
            }
            Err(_) => {
                eprintln!("error: {} is neither UTF-8 source nor a module", path.display());
                return ExitCode::from(2);
            }
        }
    };

    match result {
        Ok(value) => match engine.vm().heap().get(value) {
            HeapValue::Int(code) if (0..=255).contains(code) => ExitCode::from(*code as u8),
            _ => ExitCode::SUCCESS,
        },
        Err(err) => {
            report_with_source(&path_text, source.as_deref(), &err);
            ExitCode::from(1)
        }
    }
}

fn load_module(bytes: &[u8]) -> Result<Rc<tarn_core::Bytecode>, Error> {
    let module = read_module(bytes)?;
    module.validate()?;
    Ok(Rc::new(module))
}

fn run_stdin() -> ExitCode {
    use std::io::Read;

    let mut source = String::new();
    if let Err(err) = std::io::stdin().read_to_string(&mut source) {
        eprintln!("error: cannot read stdin: {err}");
        return ExitCode::from(2);
    }
    let mut engine = engine();
    match engine.run_source("<stdin>", &source) {
        Ok(value) => {
            if !matches!(engine.vm().heap().get(value), HeapValue::Null) {
                println!("{}", engine.display(value));
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            report_with_source("<stdin>", Some(&source), &err);
            ExitCode::from(1)
        }
    }
}

fn fmt_file(path: &Path) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => return io_error(path, err),
    };
    let arena = bumpalo::Bump::new();
    match tarn_core::syntax::parse(&arena, &source) {
        Ok(stmts) => {
            print!("{}", tarn_core::syntax::render(stmts));
            ExitCode::SUCCESS
        }
        Err(err) => {
            report_anchored(&path.display().to_string(), &source, err.offset, &err.message);
            ExitCode::from(1)
        }
    }
}

#[cfg(debug_assertions)]
fn report_error(err: &Error) {
    report_with_source("<input>", None, err);
}

/// Render an error, anchoring diagnostics in the source when we have it.
fn report_with_source(path: &str, source: Option<&str>, err: &Error) {
    match (err, source) {
        (Error::Parse(e), Some(source)) => {
            report_anchored(path, source, e.offset, &e.message);
        }
        (Error::Compile(e), Some(source)) => {
            for diagnostic in &e.diagnostics {
                report_anchored(path, source, diagnostic.offset, &diagnostic.message);
            }
        }
        (Error::Runtime(e), source) => {
            eprintln!("runtime error: {}", e.message);
            for entry in &e.traceback {
                match source {
                    // Offsets for the entry module resolve to line:column.
                    Some(source) if entry.path == path => {
                        let (line, col) = line_col(source, entry.offset);
                        eprintln!("  at {}:{line}:{col}", entry.path);
                    }
                    _ => eprintln!("  at {}:+{}", entry.path, entry.offset),
                }
            }
        }
        (other, _) => eprintln!("error: {other}"),
    }
}

/// Caret diagnostic: the offending line with a marker under the offset.
fn report_anchored(path: &str, source: &str, offset: u32, message: &str) {
    let (line, col) = line_col(source, offset);
    eprintln!("error: {message}");
    eprintln!("  --> {path}:{line}:{col}");
    if let Some(text) = source.lines().nth(line as usize - 1) {
        eprintln!("   | {text}");
        eprintln!("   | {:>width$}", "^", width = col as usize);
    }
}

#[cfg(debug_assertions)]
fn debug_dump(path: &Path) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => return io_error(path, err),
    };
    match engine().compile(&path.display().to_string(), &source) {
        Ok(module) => {
            print!("{module}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            report_with_source(&path.display().to_string(), Some(&source), &err);
            ExitCode::from(1)
        }
    }
}

#[cfg(debug_assertions)]
fn debug_tokens(path: &Path) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => return io_error(path, err),
    };
    match tarn_core::syntax::Tokenizer::tokenize(&source) {
        Ok((tokens, _)) => {
            for token in tokens {
                println!("{:6}  {:?}", token.offset, token.kind);
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            report_anchored(&path.display().to_string(), &source, err.offset, &err.message);
            ExitCode::from(1)
        }
    }
}

#[cfg(debug_assertions)]
fn debug_write(path: &Path, out: &Path) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => return io_error(path, err),
    };
    match engine().compile(&path.display().to_string(), &source) {
        Ok(module) => match std::fs::write(out, tarn_core::bytecode::write_module(&module)) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => io_error(out, err),
        },
        Err(err) => {
            report_with_source(&path.display().to_string(), Some(&source), &err);
            ExitCode::from(1)
        }
    }
}

#[cfg(debug_assertions)]
fn debug_read(path: &Path) -> ExitCode {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => return io_error(path, err),
    };
    match load_module(&bytes) {
        Ok(module) => {
            print!("{module}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            report_error(&err);
            ExitCode::from(1)
        }
    }
}
