//! slo - the slo language interpreter
//!
//! Usage:
//!   slo                # interactive REPL (exit with `exit` or EOF)
//!   slo script.slo     # compile and run a file
//!
//! Exit codes: 0 on success, 65 on compile error, 70 on runtime error.
//!
//! Diagnostics go through `tracing`; set RUST_LOG=debug to watch the GC and
//! compiler, or use --print-code / --trace-execution for bytecode-level
//! output.

mod repl;

use clap::Parser as ClapParser;
use slo_runtime::{InterpretError, Vm};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const EXIT_COMPILE_ERROR: u8 = 65;
const EXIT_RUNTIME_ERROR: u8 = 70;

#[derive(ClapParser)]
#[command(name = "slo")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "The slo language interpreter", long_about = None)]
struct Cli {
    /// Script to run; starts the REPL when omitted
    script: Option<PathBuf>,

    /// Disassemble each compiled chunk before running it
    #[arg(long)]
    print_code: bool,

    /// Trace the dispatch loop (requires RUST_LOG=trace to be visible)
    #[arg(long)]
    trace_execution: bool,

    /// Collect garbage at every allocation point
    #[arg(long)]
    gc_stress: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut vm = Vm::new();
    vm.print_code = cli.print_code;
    vm.trace_execution = cli.trace_execution;
    vm.heap.stress = cli.gc_stress;

    match cli.script {
        Some(path) => run_file(&mut vm, &path),
        None => repl::run(&mut vm),
    }
}

fn run_file(vm: &mut Vm, path: &PathBuf) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Could not read {}: {e}", path.display());
            return ExitCode::from(EXIT_COMPILE_ERROR);
        }
    };
    match vm.interpret(&source, &path.display().to_string()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", err.render());
            match err {
                InterpretError::Compile(_) => ExitCode::from(EXIT_COMPILE_ERROR),
                InterpretError::Runtime(_) => ExitCode::from(EXIT_RUNTIME_ERROR),
            }
        }
    }
}
