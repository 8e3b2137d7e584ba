//! CLI binary for the stepwise model checker.
//!
//! Launches a program linked against `stepwise-sdk` and explores its
//! interleavings, or replays a recorded counter-example.
//!
//! # Usage
//!
//! ```bash
//! # Safety with DPOR, stateless
//! stepwise run ./pingpong
//!
//! # Exhaustive, with state-equality reduction and a dot graph
//! stepwise run --reduction none --visited 1000 --dot-output graph.dot ./pingpong
//!
//! # Communication determinism
//! stepwise run --comms-determinism ./ring -- --size 3
//!
//! # Liveness property given as a never-claim
//! stepwise run --property-file cs.never ./bakery
//!
//! # Replay a path printed with a violation
//! stepwise replay --path "1;2/1;1" ./pingpong
//! ```
//!
//! The process exit status tells what was found: 0 nothing, 1 safety,
//! 2 liveness, 3 deadlock, 4 non-termination, 5 non-determinism, 6 crash of
//! the checked program, 63 failure of the checker itself.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use stepwise_explore::checker::{explore, ExploreError};
use stepwise_explore::config::{CheckerConfig, Reduction};
use stepwise_explore::record::{replay, RecordTrace};
use stepwise_explore::remote_session::RemoteSession;
use stepwise_explore::report::format_report;
use stepwise_protocol::ExitStatus;

#[derive(Parser)]
#[command(name = "stepwise")]
#[command(about = "Out-of-process model checker for simulated distributed programs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Explore the interleavings of a program.
    Run {
        #[command(flatten)]
        options: CheckerOptions,

        /// Write the exploration report here as JSON.
        #[arg(long)]
        report: Option<PathBuf>,

        /// Program to check.
        program: String,

        /// Arguments of the program.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Replay a record path.
    Replay {
        /// Path to replay, as printed with a violation (`1;2/1;1`).
        #[arg(short, long)]
        path: String,

        /// Program to run.
        program: String,

        /// Arguments of the program.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Args)]
struct CheckerOptions {
    /// Reduction: "none" or "dpor" (default unless something forces none).
    #[arg(long, value_parser = parse_reduction)]
    reduction: Option<Reduction>,

    /// Maximal exploration depth.
    #[arg(long, default_value = "1000")]
    max_depth: usize,

    /// Visited states kept for state-equality reduction (0 = stateless).
    #[arg(long = "visited", default_value = "0")]
    max_visited_states: usize,

    /// Detect non-progressive cycles.
    #[arg(long)]
    termination: bool,

    /// Compare state hashes before contents.
    #[arg(long)]
    hash: bool,

    /// Store snapshots page by page.
    #[arg(long)]
    sparse_checkpoint: bool,

    /// Snapshot every N states (0 = only when needed).
    #[arg(long, default_value = "0")]
    checkpoint: u64,

    /// Record open files in snapshots.
    #[arg(long)]
    snapshot_fds: bool,

    /// Write the explored graph in dot format.
    #[arg(long)]
    dot_output: Option<PathBuf>,

    /// Never-claim of a liveness property.
    #[arg(long)]
    property_file: Option<PathBuf>,

    /// Check that sends and receives are deterministic.
    #[arg(long)]
    comms_determinism: bool,

    /// Check that sends are deterministic.
    #[arg(long)]
    send_determinism: bool,

    /// Visited pairs kept by the liveness checker.
    #[arg(long, default_value = "0")]
    visited_pairs: usize,
}

impl From<CheckerOptions> for CheckerConfig {
    fn from(options: CheckerOptions) -> Self {
        Self {
            reduction: options.reduction,
            max_depth: options.max_depth,
            max_visited_states: options.max_visited_states,
            termination: options.termination,
            hash: options.hash,
            sparse_checkpoint: options.sparse_checkpoint,
            checkpoint: options.checkpoint,
            snapshot_fds: options.snapshot_fds,
            dot_output: options.dot_output,
            property_file: options.property_file,
            comms_determinism: options.comms_determinism,
            send_determinism: options.send_determinism,
            visited_pairs: options.visited_pairs,
        }
    }
}

fn parse_reduction(s: &str) -> Result<Reduction, String> {
    s.parse().map_err(|e: ExploreError| e.to_string())
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let status = match cli.command {
        Commands::Run {
            options,
            report,
            program,
            args,
        } => cmd_run(options.into(), report, &program, &args),
        Commands::Replay {
            path,
            program,
            args,
        } => cmd_replay(&path, &program, &args),
    };
    std::process::exit(status.code());
}

fn cmd_run(
    config: CheckerConfig,
    report_path: Option<PathBuf>,
    program: &str,
    args: &[String],
) -> ExitStatus {
    let config = match config.validate() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitStatus::Error;
        }
    };

    eprintln!("═══════════════════════════════════════════════════════════════════════");
    eprintln!("  stepwise");
    eprintln!("═══════════════════════════════════════════════════════════════════════");
    eprintln!();
    eprintln!("Configuration:");
    eprintln!("  Program:        {program} {}", args.join(" "));
    eprintln!("  Reduction:      {}", config.reduction());
    eprintln!("  Max depth:      {}", config.max_depth);
    eprintln!("  Visited states: {}", config.max_visited_states);
    if let Some(ref property) = config.property_file {
        eprintln!("  Property:       {}", property.display());
    }
    if let Some(ref dot) = config.dot_output {
        eprintln!("  Dot output:     {}", dot.display());
    }
    eprintln!();

    let mut session = match RemoteSession::launch(program, args, &config) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitStatus::Error;
        }
    };

    let outcome = explore(&mut session, &config);
    session.shutdown();
    let report = match outcome {
        Ok(report) => report,
        Err(e) => {
            eprintln!();
            eprintln!("Exploration failed: {e}");
            return e.exit_status();
        }
    };

    println!("{}", format_report(&report));

    if let Some(path) = report_path {
        if let Err(e) = report.save_json(&path) {
            eprintln!("Warning: failed to save report: {e}");
        } else {
            eprintln!("Saved report to: {}", path.display());
        }
    }

    report.exit_status()
}

fn cmd_replay(path: &str, program: &str, args: &[String]) -> ExitStatus {
    let trace: RecordTrace = match path.parse() {
        Ok(trace) => trace,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitStatus::Error;
        }
    };

    let config = CheckerConfig::default();
    let mut session = match RemoteSession::launch(program, args, &config) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitStatus::Error;
        }
    };

    let outcome = replay(&mut session, &trace);
    session.shutdown();
    match outcome {
        Ok(steps) => {
            eprintln!("Replayed {steps} transitions without violation.");
            ExitStatus::Success
        }
        Err(ExploreError::Violation(report)) => {
            for line in report.lines() {
                println!("{line}");
            }
            report.kind.exit_status()
        }
        Err(e) => {
            eprintln!("Replay failed: {e}");
            e.exit_status()
        }
    }
}
