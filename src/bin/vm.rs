//! Command-line driver: load a JSON-encoded [`Function`] program, run its
//! entry point through the executor, and print the result plus any
//! diagnostics.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use comptime_vm::executor::Executor;
use comptime_vm::function::Program;
use comptime_vm::options::OptionsBuilder;
use comptime_vm::types::PointerWidth;
use comptime_vm::value::{InstructionValue, Ptr};
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(name = "vm", about = "Run a compile-time bytecode program")]
struct Cli {
    /// Path to a JSON-encoded Program.
    program: PathBuf,

    /// Address width for pointer values.
    #[arg(long, value_enum, default_value_t = PointerWidthArg::Bits64)]
    pointer_width: PointerWidthArg,

    /// Abort evaluation after this many instructions (0 disables the budget).
    #[arg(long)]
    step_budget: Option<u64>,

    /// Enable verbose (trace-level) instruction logging.
    #[arg(long)]
    verbose: bool,

    /// Entry-point argument, repeatable, in `kind:value` form (e.g. `i32:42`).
    #[arg(long = "arg")]
    args: Vec<String>,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum PointerWidthArg {
    Bits32,
    Bits64,
}

impl From<PointerWidthArg> for PointerWidth {
    fn from(value: PointerWidthArg) -> Self {
        match value {
            PointerWidthArg::Bits32 => PointerWidth::Bits32,
            PointerWidthArg::Bits64 => PointerWidth::Bits64,
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to read program file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse program JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid --arg '{0}': expected KIND:VALUE (e.g. i32:42)")]
    BadArg(String),
    #[error("entry point '{0}' is not defined in the program")]
    UnknownEntry(String),
}

fn parse_arg(spec: &str) -> Result<InstructionValue, CliError> {
    let (kind, value) = spec.split_once(':').ok_or_else(|| CliError::BadArg(spec.to_string()))?;
    let bad = || CliError::BadArg(spec.to_string());
    Ok(match kind {
        "i1" => InstructionValue::I1(value.parse::<u8>().map_err(|_| bad())?.ne(&0)),
        "i8" => InstructionValue::I8(value.parse().map_err(|_| bad())?),
        "i16" => InstructionValue::I16(value.parse().map_err(|_| bad())?),
        "i32" => InstructionValue::I32(value.parse().map_err(|_| bad())?),
        "i64" => InstructionValue::I64(value.parse().map_err(|_| bad())?),
        "f32" => InstructionValue::F32(value.parse().map_err(|_| bad())?),
        "f64" => InstructionValue::F64(value.parse().map_err(|_| bad())?),
        "ptr" => {
            let addr = value.strip_prefix("0x").map(|hex| u64::from_str_radix(hex, 16)).unwrap_or_else(|| value.parse());
            InstructionValue::Ptr(Ptr(addr.map_err(|_| bad())?))
        }
        _ => return Err(bad()),
    })
}

fn run(cli: Cli) -> Result<ExitCode, CliError> {
    let text = fs::read_to_string(&cli.program).map_err(|source| CliError::Read { path: cli.program.clone(), source })?;
    let program: Program = serde_json::from_str(&text)?;

    if program.get(program.entry).is_none() {
        return Err(CliError::UnknownEntry(program.entry.to_string()));
    }

    let args = cli.args.iter().map(|spec| parse_arg(spec)).collect::<Result<Vec<_>, _>>()?;

    let options = OptionsBuilder::new()
        .pointer_width(cli.pointer_width.into())
        .step_budget(cli.step_budget.and_then(|b| if b == 0 { None } else { Some(b) }))
        .verbose(cli.verbose)
        .build();

    let entry = program.entry;
    let mut executor = Executor::new(program, options);
    let result = executor.run(entry, &args);

    for diagnostic in &result.diagnostics {
        let label = if diagnostic.is_error() { "error" } else { "warning" };
        eprintln!(
            "{label}: {} (line {})",
            diagnostic.message, diagnostic.src_token.line
        );
        for note in &diagnostic.notes {
            eprintln!("  note: {note}");
        }
    }

    match result.value {
        Some(value) => println!("{value:?}"),
        None => println!("<no value>"),
    }

    Ok(if result.has_error { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("vm: {err}");
            ExitCode::FAILURE
        }
    }
}
