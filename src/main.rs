use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sim86::{decode_all, Executor, ExecutorConfig, MachineState, Program, StepTrace};

/// Decode and simulate an 8086 program.
#[derive(Parser, Debug)]
#[command(name = "sim86", version)]
struct Args {
    /// Assembled program binary.
    program: PathBuf,

    /// Print each executed instruction and its effects.
    #[arg(long)]
    print: bool,

    /// Add the estimated cycles of every step and the running total.
    #[arg(long)]
    cycles: bool,

    /// Add the raw instruction bytes.
    #[arg(long)]
    instbytes: bool,

    /// Print the decoded listing before executing.
    #[arg(long)]
    disasm: bool,

    /// Print the final registers and flags.
    #[arg(long)]
    dumpreg: bool,

    /// Write the memory image to `<PROGRAM>_memory.DATA`.
    #[arg(long)]
    savemem: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let bytes = fs::read(&args.program)
        .with_context(|| format!("failed to read {}", args.program.display()))?;
    tracing::info!(path = %args.program.display(), len = bytes.len(), "loaded program");

    let program = decode_all(&bytes)
        .with_context(|| format!("failed to decode {}", args.program.display()))?;

    let mut state = MachineState::new();
    state.load_program(&bytes)?;
    let config = ExecutorConfig {
        estimate_cycles: args.cycles,
    };
    let mut executor = Executor::new(program, state, config);

    let mut out = io::stdout().lock();
    if args.disasm {
        write_listing(&mut out, executor.program())?;
    }

    let mut total_cycles = 0u64;
    let mut write_error = None;
    let outcome = executor.run(|trace| {
        if !args.print || write_error.is_some() {
            return;
        }
        if let Err(err) = write_step(&mut out, trace, &args, &mut total_cycles) {
            write_error = Some(err);
        }
    });
    if let Some(err) = write_error {
        return Err(err).context("failed to write trace");
    }

    if outcome.is_err() {
        eprintln!("{}", executor.state().register_dump());
    }
    let summary = outcome.context("simulation failed")?;
    tracing::info!(steps = summary.steps, cycles = summary.total_cycles, "simulation complete");

    if args.dumpreg {
        writeln!(out, "{}", executor.state().register_dump())?;
    }
    if args.savemem {
        let path = memory_dump_path(&args.program);
        fs::write(&path, executor.state().memory())
            .with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), "saved memory image");
    }
    Ok(())
}

fn write_listing(out: &mut impl Write, program: &Program) -> io::Result<()> {
    writeln!(out, "bits 16")?;
    writeln!(out)?;
    for instruction in program.iter() {
        writeln!(out, "{}", instruction)?;
    }
    writeln!(out)
}

fn write_step(
    out: &mut impl Write,
    trace: &StepTrace,
    args: &Args,
    total_cycles: &mut u64,
) -> io::Result<()> {
    let mut line = String::new();
    if args.instbytes {
        let bytes: Vec<String> = trace.bytes.iter().map(|b| format!("{b:08b}")).collect();
        line.push_str(&format!("{:<40} ", bytes.join(" ")));
    }
    line.push_str(&trace.to_string());
    if let Some(estimate) = trace.cycles {
        *total_cycles += estimate.total() as u64;
        line.push_str(&format!(
            " ; cycles: +{} = {} [{}]",
            estimate.total(),
            total_cycles,
            estimate
        ));
    }
    writeln!(out, "{}", line)
}

fn memory_dump_path(program: &Path) -> PathBuf {
    let mut name = program.as_os_str().to_owned();
    name.push("_memory.DATA");
    PathBuf::from(name)
}
