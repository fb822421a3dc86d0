//! expman — reproducible computational experiment automation.
//!
//! Users declare *problems* (post-processing units) and *simulations*
//! (parameterised external commands). The framework resolves their
//! dependencies, distributes the commands across local and remote worker
//! machines, supervises each subprocess, records durable status in the
//! output directories, copies remote results back, and runs
//! post-processing once its inputs are complete. Work that is already
//! done is skipped on re-runs, so a campaign can be re-invoked until it
//! converges.
//!
//! The layers, bottom up: [`job::Job`] is one supervised subprocess;
//! [`worker::Worker`] is a placement target (local, or remote over an
//! `expman _serve` channel); [`scheduler::Scheduler`] admits jobs onto
//! workers subject to core budgets; [`task::Task`] nodes form the
//! dependency graph that [`runner::TaskRunner`] drives to quiescence; and
//! [`automator::Automator`] is the front-end an automation script embeds.

pub mod automator;
pub mod cluster;
pub mod job;
pub mod problem;
pub mod remote;
pub mod runner;
pub mod scheduler;
pub mod sim;
pub mod task;
pub mod utils;
pub mod worker;

pub use automator::Automator;
pub use cluster::ClusterConfig;
pub use job::{Job, JobInfo, JobStatus};
pub use problem::{
    Problem, ProblemData, ProblemFactory, Requirement, RunAll, SharedProblem, SolveProblem,
    problem_factory, shared,
};
pub use remote::RemoteWorker;
pub use runner::TaskRunner;
pub use scheduler::{Scheduler, WorkerConfig};
pub use sim::Simulation;
pub use task::{CommandTask, ConfigError, JobFailed, Task, TaskRef, task_ref};
pub use utils::{
    LineStyle, Opts, compare_runs, dprod, filter_by_name, filter_cases, filter_cases_by,
    linestyles, mdict, opts2path,
};
pub use worker::{JobProxy, LocalWorker, Worker};
