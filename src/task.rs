//! Nodes of the dependency graph.
//!
//! A [`Task`] knows whether it is complete, what it depends on, and how to
//! start itself on a [`Scheduler`]. Completion is a pure observation of
//! filesystem state plus any held [`JobProxy`]; a task whose underlying
//! work failed reports that by *erroring* from `complete()`, which is
//! distinct from returning `false` ("not yet").

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};

use crate::job::{self, Job, JobStatus};
use crate::scheduler::Scheduler;
use crate::worker::JobProxy;

pub type TaskRef = Arc<Mutex<dyn Task + Send>>;

/// Wrap a concrete task for use in the graph.
pub fn task_ref<T: Task + 'static>(task: T) -> TaskRef {
    Arc::new(Mutex::new(task))
}

pub(crate) fn lock_task(task: &TaskRef) -> Result<MutexGuard<'_, dyn Task + Send + 'static>> {
    task.lock().map_err(move |_| anyhow!("task lock poisoned"))
}

pub trait Task: Send {
    /// Identity used for deduplication: two tasks with equal names are the
    /// same node.
    fn name(&self) -> String;

    /// Whether the task's artifacts exist. Errors with [`JobFailed`] when
    /// the underlying work failed.
    fn complete(&mut self) -> Result<bool>;

    /// Start the task. Idempotent.
    fn run(&mut self, scheduler: &mut Scheduler) -> Result<()>;

    /// The artifact directory this task produces.
    fn output(&self) -> PathBuf;

    /// Direct dependencies only; the runner computes the closure.
    fn requires(&self) -> Vec<TaskRef>;

    /// Bring outputs produced elsewhere back under `dest`.
    fn copy_output(&mut self, _dest: &Path) -> Result<()> {
        Ok(())
    }
}

/// The underlying job of a task reached the `error` status.
///
/// Raised from `complete()` on every call once observed, so dependents are
/// never scheduled. Recovery requires an explicit clean or `--force`.
#[derive(Debug, Clone)]
pub struct JobFailed {
    pub command: String,
    pub output_dir: PathBuf,
}

impl std::fmt::Display for JobFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "job failed: {} (logs in {})",
            self.command,
            self.output_dir.display()
        )
    }
}

impl std::error::Error for JobFailed {}

/// The task graph or a problem definition is malformed.
#[derive(Debug, Clone)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// A task wrapping one [`Job`].
///
/// The literal token `$output_dir` in the command expands to the task's
/// output directory before shell tokenisation.
pub struct CommandTask {
    command: String,
    output_dir: PathBuf,
    n_core: i32,
    n_thread: Option<i32>,
    depends: Vec<TaskRef>,
    job_proxy: Option<JobProxy>,
}

impl CommandTask {
    pub fn new(command: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        CommandTask {
            command: command.into(),
            output_dir: output_dir.into(),
            n_core: 1,
            n_thread: Some(1),
            depends: Vec::new(),
            job_proxy: None,
        }
    }

    pub fn cores(mut self, n_core: i32) -> Self {
        self.n_core = n_core;
        self
    }

    pub fn threads(mut self, n_thread: Option<i32>) -> Self {
        self.n_thread = n_thread;
        self
    }

    pub fn depends(mut self, depends: Vec<TaskRef>) -> Self {
        self.depends = depends;
        self
    }

    pub fn add_depend(&mut self, dep: TaskRef) {
        self.depends.push(dep);
    }

    pub fn job_proxy(&self) -> Option<&JobProxy> {
        self.job_proxy.as_ref()
    }

    fn resolved_command(&self) -> String {
        self.command
            .replace("$output_dir", &self.output_dir.display().to_string())
    }

    fn from_status(&self, status: JobStatus) -> Result<bool> {
        match status {
            JobStatus::Done => Ok(true),
            JobStatus::Error => Err(JobFailed {
                command: self.resolved_command(),
                output_dir: self.output_dir.clone(),
            }
            .into()),
            JobStatus::Running | JobStatus::NotStarted => Ok(false),
        }
    }
}

impl Task for CommandTask {
    fn name(&self) -> String {
        format!("{} -> {}", self.command, self.output_dir.display())
    }

    fn complete(&mut self) -> Result<bool> {
        match &self.job_proxy {
            Some(proxy) => {
                let status = proxy.status()?;
                self.from_status(status)
            }
            None if self.output_dir.exists() => {
                // A previous run (possibly of a crashed driver) left its
                // record behind; probe it with liveness checks applied.
                let mut probe = Job::from_command_line(&self.resolved_command(), &self.output_dir)?;
                let status = probe.status();
                self.from_status(status)
            }
            None => Ok(false),
        }
    }

    fn run(&mut self, scheduler: &mut Scheduler) -> Result<()> {
        if self.job_proxy.is_some() {
            return Ok(());
        }
        let job = Job::from_command_line(&self.resolved_command(), &self.output_dir)?
            .cores(self.n_core)
            .threads(self.n_thread);
        self.job_proxy = Some(scheduler.submit(job)?);
        Ok(())
    }

    fn output(&self) -> PathBuf {
        self.output_dir.clone()
    }

    fn requires(&self) -> Vec<TaskRef> {
        self.depends.clone()
    }

    fn copy_output(&mut self, dest: &Path) -> Result<()> {
        match &self.job_proxy {
            Some(proxy) => proxy.copy_output(dest),
            None => Ok(()),
        }
    }
}

/// Last bytes of a failed task's stderr, for fatal reports.
pub(crate) fn stderr_tail_of(output_dir: &Path, max_bytes: usize) -> String {
    job::tail_file(&output_dir.join(job::STDERR_FILE), max_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_dir_macro_expands_before_tokenisation() {
        let task = CommandTask::new("sh -c 'echo $output_dir'", "sim/run1");
        assert_eq!(task.resolved_command(), "sh -c 'echo sim/run1'");
    }

    #[test]
    fn name_identifies_command_and_directory() {
        let a = CommandTask::new("echo 1", "sim");
        let b = CommandTask::new("echo 1", "sim");
        let c = CommandTask::new("echo 1", "other");
        assert_eq!(a.name(), b.name());
        assert_ne!(a.name(), c.name());
    }

    #[test]
    fn incomplete_without_proxy_or_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = CommandTask::new("echo 1", dir.path().join("missing"));
        assert!(!task.complete().unwrap());
    }

    #[test]
    fn on_disk_error_record_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let info = crate::job::JobInfo {
            status: JobStatus::Error,
            pid: None,
            start: String::new(),
            end: String::new(),
            exitcode: Some(2),
        };
        crate::job::write_info_in(dir.path(), &info).unwrap();
        let mut task = CommandTask::new("echo 1", dir.path());
        let err = task.complete().unwrap_err();
        assert!(err.downcast_ref::<JobFailed>().is_some());
    }

    #[test]
    fn on_disk_done_record_completes() {
        let dir = tempfile::tempdir().unwrap();
        let info = crate::job::JobInfo {
            status: JobStatus::Done,
            pid: None,
            start: String::new(),
            end: String::new(),
            exitcode: Some(0),
        };
        crate::job::write_info_in(dir.path(), &info).unwrap();
        let mut task = CommandTask::new("echo 1", dir.path());
        assert!(task.complete().unwrap());
    }
}
