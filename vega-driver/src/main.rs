//! Vega Compiler - Main Driver
//!
//! Runs the full backend pipeline over a resolved program: lowering to
//! per-function control flow graphs, instruction selection, liveness,
//! register allocation, and NASM emission.

mod samples;

use clap::{Parser, Subcommand};
use log::info;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use vega_backend::lower_program;
use vega_codegen::{
    allocate_registers, compute_liveness, linearize, CodeImage, FunctionCode, InstructionSet,
};
use vega_common::{BackendError, Program};
use vega_ir::register::ALLOCATABLE;

#[derive(Parser)]
#[command(name = "vega")]
#[command(about = "Vega compiler backend - compiles resolved programs to NASM x86-64")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile one of the built-in demonstration programs
    Demo {
        /// Demo name: factorial, nested, or globals
        name: String,

        /// Output file for the NASM listing (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print each function's register assignment as JSON to stderr
        #[arg(long)]
        dump_allocation: bool,
    },
    /// Compile a resolved program read from a JSON file
    Compile {
        /// Input JSON file holding the resolved program
        input: PathBuf,

        /// Output file for the NASM listing (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print each function's register assignment as JSON to stderr
        #[arg(long)]
        dump_allocation: bool,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            name,
            output,
            dump_allocation,
        } => {
            if let Err(e) = run_demo(&name, output.as_deref(), dump_allocation) {
                eprintln!("Error compiling demo '{}': {}", name, e);
                std::process::exit(1);
            }
        }
        Commands::Compile {
            input,
            output,
            dump_allocation,
        } => {
            if let Err(e) = run_compile(&input, output.as_deref(), dump_allocation) {
                eprintln!("Error compiling {}: {}", input.display(), e);
                std::process::exit(1);
            }
        }
    }
}

fn run_demo(
    name: &str,
    output: Option<&Path>,
    dump_allocation: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let program = samples::by_name(name).ok_or_else(|| {
        format!(
            "unknown demo '{}' (available: {})",
            name,
            samples::NAMES.join(", ")
        )
    })?;
    write_result(&program, output, dump_allocation)
}

fn run_compile(
    input: &Path,
    output: Option<&Path>,
    dump_allocation: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let text = fs::read_to_string(input)?;
    let program: Program = serde_json::from_str(&text)?;
    write_result(&program, output, dump_allocation)
}

fn write_result(
    program: &Program,
    output: Option<&Path>,
    dump_allocation: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let compiled = compile(program)?;
    if dump_allocation {
        eprintln!("{}", serde_json::to_string_pretty(&compiled.allocations)?);
    }
    match output {
        Some(path) => fs::write(path, &compiled.listing)?,
        None => print!("{}", compiled.listing),
    }
    Ok(())
}

/// Register assignment of one compiled function, for `--dump-allocation`.
#[derive(Debug, Serialize)]
struct FunctionAllocation {
    label: String,
    registers: BTreeMap<String, String>,
}

struct Compiled {
    listing: String,
    allocations: Vec<FunctionAllocation>,
}

/// The whole backend pipeline, program in, NASM listing out.
fn compile(program: &Program) -> Result<Compiled, BackendError> {
    let lowered = lower_program(program)?;
    let instruction_set = InstructionSet::default();

    let mut functions = Vec::new();
    let mut allocations = Vec::new();
    for mut function in lowered.functions {
        info!("compiling {}", function.label);
        let listing = linearize(
            &function.arena,
            &function.cfg,
            &instruction_set,
            &mut function.pool,
        )
        .map_err(|e| BackendError::Selection {
            message: e.to_string(),
        })?;

        let graphs = compute_liveness(&listing);
        let allocation =
            allocate_registers(&graphs, &ALLOCATABLE).map_err(|e| {
                BackendError::RegisterAllocation {
                    message: e.to_string(),
                }
            })?;

        allocations.push(FunctionAllocation {
            label: function.label.clone(),
            registers: allocation
                .assignment
                .iter()
                .map(|(register, phys)| (register.to_string(), phys.to_nasm().to_string()))
                .collect(),
        });
        functions.push((
            function.label,
            FunctionCode {
                instructions: listing,
                allocation: allocation.assignment,
            },
        ));
    }

    let image = CodeImage {
        main_label: lowered.main_label,
        ignore_main_result: !program.function(program.main).returns_value(),
        externs: lowered.externs,
        globals_slot_count: lowered.globals_slot_count,
        display_slot_count: lowered.display_slot_count,
        functions,
    };
    let listing = image.to_nasm().map_err(|e| BackendError::Emission {
        message: e.to_string(),
    })?;
    Ok(Compiled {
        listing,
        allocations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_demo_compiles() {
        for name in samples::NAMES {
            let program = samples::by_name(name).unwrap();
            let compiled = compile(&program).unwrap();
            assert!(compiled.listing.contains("section .text"));
            assert!(compiled.listing.contains("global main"));
            assert!(compiled.listing.contains("extern print_int"));
            assert!(!compiled.allocations.is_empty());
        }
    }

    #[test]
    fn test_nested_demo_sizes_the_display() {
        let program = samples::by_name("nested").unwrap();
        let compiled = compile(&program).unwrap();
        assert!(compiled.listing.contains("display: resq 2"));
        assert!(compiled.listing.contains("fun$main$bump:"));
    }

    #[test]
    fn test_globals_demo_reserves_only_nonconstant_slots() {
        let program = samples::by_name("globals").unwrap();
        let compiled = compile(&program).unwrap();
        // `counter` gets a slot; the constant `step` folds away.
        assert!(compiled.listing.contains("globals: resq 1"));
    }

    #[test]
    fn test_demo_main_result_is_ignored() {
        let program = samples::by_name("factorial").unwrap();
        let compiled = compile(&program).unwrap();
        assert!(compiled.listing.contains("xor rax, rax"));
    }

    #[test]
    fn test_allocation_dump_serializes() {
        let program = samples::by_name("factorial").unwrap();
        let compiled = compile(&program).unwrap();
        let json = serde_json::to_string(&compiled.allocations).unwrap();
        assert!(json.contains("fun$factorial"));
    }

    #[test]
    fn test_program_round_trips_through_json() {
        let program = samples::by_name("globals").unwrap();
        let text = serde_json::to_string(&program).unwrap();
        let parsed: Program = serde_json::from_str(&text).unwrap();
        assert_eq!(compile(&parsed).unwrap().listing, compile(&program).unwrap().listing);
    }
}
