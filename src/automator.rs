//! The command-line front-end that automation scripts embed.
//!
//! A user binary declares its problems and hands control over:
//!
//! ```no_run
//! use expman::{Automator, problem_factory};
//! # use expman::{Problem, ProblemData};
//! # struct Squares { data: ProblemData }
//! # impl Squares {
//! #     fn new(sim: &std::path::Path, out: &std::path::Path) -> Self {
//! #         Squares { data: ProblemData::new(sim, out) }
//! #     }
//! # }
//! # impl Problem for Squares {
//! #     fn name(&self) -> String { "squares".into() }
//! #     fn data(&self) -> &ProblemData { &self.data }
//! #     fn data_mut(&mut self) -> &mut ProblemData { &mut self.data }
//! #     fn run(&mut self) -> anyhow::Result<()> { self.make_output_dir() }
//! # }
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut automator = Automator::new(
//!         "outputs",
//!         "manuscript/figures",
//!         vec![problem_factory(Squares::new)],
//!     );
//!     let code = automator.run(std::env::args().skip(1))?;
//!     std::process::exit(code);
//! }
//! ```
//!
//! The same binary transparently serves as the job supervisor and the
//! remote manager: `Automator::run` recognises the hidden `_supervise`
//! and `_serve` invocations and registers itself as the helper
//! executable, so nothing besides the automation script needs to be
//! installed locally.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cluster::{CONFIG_FILE, ClusterConfig};
use crate::job::{self, SuperviseOpts};
use crate::problem::{ProblemFactory, RunAll};
use crate::remote::{self, ServeOpts};
use crate::runner::TaskRunner;
use crate::scheduler::Scheduler;
use crate::task::task_ref;

/// The hidden sub-commands every `expman`-based binary understands.
#[derive(Debug, clap::Subcommand)]
pub enum HelperCommand {
    /// [Internal] Supervise one job's child process.
    #[command(name = "_supervise", hide = true)]
    Supervise {
        #[arg(long)]
        output_dir: PathBuf,

        /// KEY=VALUE entries applied on top of the inherited environment.
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,

        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// [Internal] Serve jobs to a remote scheduler over stdio.
    #[command(name = "_serve", hide = true)]
    Serve {
        #[arg(long)]
        chdir: Option<PathBuf>,
    },
}

impl HelperCommand {
    pub fn execute(self) -> Result<()> {
        match self {
            HelperCommand::Supervise {
                output_dir,
                env,
                command,
            } => job::supervise(SuperviseOpts {
                output_dir,
                env,
                command,
            }),
            HelperCommand::Serve { chdir } => remote::serve(ServeOpts { chdir }),
        }
    }
}

#[derive(Debug, Parser)]
struct HelperCli {
    #[command(subcommand)]
    command: HelperCommand,
}

#[derive(Debug, Parser)]
#[command(about = "Run the declared problems", long_about = None)]
struct AutomatorArgs {
    /// Add a worker host to the cluster configuration and exit.
    #[arg(short = 'a', long = "add-node", value_name = "HOST")]
    add_node: Option<String>,

    /// Remote home directory used when adding a node.
    #[arg(long, requires = "add_node")]
    home: Option<String>,

    /// The added node shares this filesystem; outputs need no copy back.
    #[arg(long, requires = "add_node")]
    nfs: bool,

    /// Only run simulations whose name matches this glob.
    #[arg(short = 'm', long = "match", value_name = "GLOB")]
    match_pattern: Option<String>,

    /// Ignore existing outputs; clean and rebuild.
    #[arg(short, long)]
    force: bool,

    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Builds and drives the task graph for a set of problems.
pub struct Automator {
    sim_dir: PathBuf,
    out_dir: PathBuf,
    factories: Vec<ProblemFactory>,
    config_path: PathBuf,
    wait: Duration,
}

impl Automator {
    pub fn new(
        sim_dir: impl Into<PathBuf>,
        out_dir: impl Into<PathBuf>,
        factories: Vec<ProblemFactory>,
    ) -> Self {
        Automator {
            sim_dir: sim_dir.into(),
            out_dir: out_dir.into(),
            factories,
            config_path: PathBuf::from(CONFIG_FILE),
            wait: Duration::from_secs(5),
        }
    }

    /// Where the cluster configuration lives. Defaults to `config.json`.
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = path.into();
        self
    }

    /// Poll interval of the runner and the scheduler.
    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Parse `args` (without the program name) and act on them. Returns
    /// the process exit code: non-zero iff any task reported an error.
    pub fn run<I, S>(&mut self, args: I) -> Result<i32>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv: Vec<String> = vec!["automate".to_string()];
        argv.extend(args.into_iter().map(Into::into));

        // Re-invocations of this binary as the runtime helper.
        if matches!(
            argv.get(1).map(String::as_str),
            Some("_supervise") | Some("_serve")
        ) {
            HelperCli::parse_from(&argv).command.execute()?;
            return Ok(0);
        }

        let cli = match AutomatorArgs::try_parse_from(&argv) {
            Ok(cli) => cli,
            Err(e) => {
                e.print()?;
                return Ok(if e.use_stderr() { 2 } else { 0 });
            }
        };

        init_logging(cli.verbose);
        register_helper_exe();

        let mut config = ClusterConfig::load_or_create(&self.config_path)?;
        if let Some(host) = &cli.add_node {
            config.add_worker(host, cli.home.as_deref(), cli.nfs);
            config.save(&self.config_path)?;
            info!(host = %host, "worker added to cluster config");
            return Ok(0);
        }

        let mut runner =
            self.make_runner(cli.match_pattern.as_deref(), cli.force, &config)?;
        let n_errors = runner.run(self.wait)?;
        Ok(if n_errors > 0 { 1 } else { 0 })
    }

    /// Build the runner for one invocation. Split out so scripts and
    /// tests can inspect the graph without driving it.
    pub fn make_runner(
        &self,
        match_pattern: Option<&str>,
        force: bool,
        config: &ClusterConfig,
    ) -> Result<TaskRunner> {
        let scheduler = Scheduler::new(".", config.workers.clone()).wait(self.wait);
        let run_all = RunAll::new(
            &self.sim_dir,
            &self.out_dir,
            self.factories.clone(),
            match_pattern,
            force,
        )?;
        TaskRunner::new(vec![task_ref(run_all)], scheduler)
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}

/// Make this binary the job supervisor unless one is already configured.
fn register_helper_exe() {
    if std::env::var_os(job::HELPER_ENV).is_none()
        && let Ok(exe) = std::env::current_exe()
    {
        // SAFETY: runs in the single-threaded front-end, before any jobs
        // or workers exist.
        unsafe { std::env::set_var(job::HELPER_ENV, &exe) };
    }
}
