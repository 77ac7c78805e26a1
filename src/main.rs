//! Batch driver: read a whole program, evaluate it, print the results.

use std::io::{self, Read};
use std::process::ExitCode;

use argh::FromArgs;
use scheval::evaluator::EvalConfig;
use scheval::printer::render_results;
use scheval::{Error, Interpreter, MAX_EVAL_DEPTH};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

#[derive(FromArgs)]
/// Evaluate a program in a small, strictly typed Scheme dialect
struct Args {
    /// program file to run; standard input when omitted
    #[argh(positional)]
    file: Option<String>,
    /// evaluate without printing results
    #[argh(switch, short = 'q')]
    quiet: bool,
    /// maximum evaluation nesting before a program is aborted
    #[argh(option, default = "MAX_EVAL_DEPTH")]
    max_depth: usize,
}

fn init_tracing() {
    // Diagnostics go to stderr; stdout carries program output only
    let filter = EnvFilter::try_from_env("SCHEVAL_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true)
        .init();
}

fn read_source(file: Option<&str>) -> io::Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path),
        None => {
            let mut source = String::new();
            io::stdin().read_to_string(&mut source)?;
            Ok(source)
        }
    }
}

fn run(interp: &Interpreter, source: &str, quiet: bool) -> Result<(), Error> {
    let results = interp.eval_program(source)?;
    debug!(forms = results.len(), "program finished");
    if !quiet {
        println!("{}", render_results(&results));
    }
    Ok(())
}

fn main() -> ExitCode {
    let args: Args = argh::from_env();
    init_tracing();

    let source = match read_source(args.file.as_deref()) {
        Ok(source) => source,
        Err(err) => {
            let origin = args.file.as_deref().unwrap_or("<stdin>");
            error!(%origin, %err, "failed to read program");
            eprintln!("scheval: cannot read {origin}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let interp = Interpreter::with_config(EvalConfig {
        max_depth: args.max_depth,
    });

    match run(&interp, &source, args.quiet) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            println!("{}", err.report());
            ExitCode::FAILURE
        }
    }
}
