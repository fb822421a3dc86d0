//! expman — runtime helper binary.
//!
//! Carries the hidden `_supervise` and `_serve` sub-commands the library
//! spawns, plus small inspection commands for job output directories.
//! Logs go to stderr.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use expman::automator::HelperCommand;
use expman::job;

#[derive(Debug, Parser)]
#[command(name = "expman")]
#[command(about = "Experiment automation runtime helper", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the status record of a job's output directory.
    Status {
        /// The job's output directory.
        output_dir: PathBuf,
    },

    /// Print the tail of a job's logs.
    Tail {
        /// How many trailing bytes of each log to show.
        #[arg(long, default_value = "4096")]
        max_bytes: usize,

        /// The job's output directory.
        output_dir: PathBuf,
    },

    #[command(flatten)]
    Helper(HelperCommand),
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Status { output_dir } => {
            let info = job::read_info_in(&output_dir);
            println!("{}", serde_json::to_string_pretty(&info)?);
        }

        Command::Tail {
            max_bytes,
            output_dir,
        } => {
            let stdout = job::tail_file(&output_dir.join(job::STDOUT_FILE), max_bytes);
            let stderr = job::tail_file(&output_dir.join(job::STDERR_FILE), max_bytes);
            println!("==> {} <==", job::STDOUT_FILE);
            print!("{stdout}");
            println!("==> {} <==", job::STDERR_FILE);
            print!("{stderr}");
        }

        Command::Helper(helper) => helper.execute()?,
    }
    Ok(())
}
