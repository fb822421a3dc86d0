//! Placement targets for jobs.
//!
//! A [`Worker`] hosts jobs and accounts for their cores. The trait is
//! object-safe; the scheduler shares workers as [`WorkerHandle`] and hands
//! out [`JobProxy`] values as the only handle a task keeps after
//! submission. [`LocalWorker`] runs jobs in this machine's process tree;
//! the remote variant lives in [`crate::remote`].

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use tracing::info;

use crate::job::{self, Job, JobInfo, JobStatus, cores_required_for};

pub type WorkerHandle = Arc<Mutex<dyn Worker + Send>>;

/// A machine that can host jobs.
pub trait Worker: Send {
    fn host(&self) -> &str;

    fn total_cores(&mut self) -> Result<u32>;

    fn free_cores(&mut self) -> Result<u32>;

    /// Admission predicate: can a job needing `n_core` start right now?
    ///
    /// Zero-core jobs are coordinators and are always admitted. Otherwise
    /// the worker probes its free cores, sweeps finished jobs out of the
    /// running set, and admits iff what remains after subtracting the
    /// running jobs' cores covers the request.
    fn can_run(&mut self, n_core: i32) -> Result<bool>;

    /// Start the job, returning the worker-local id.
    fn run_job(&mut self, job: Job) -> Result<u64>;

    /// Status of a job; terminal states drop the id from the running set.
    fn status(&mut self, job_id: u64) -> Result<JobStatus>;

    fn copy_output(&mut self, job_id: u64, dest: &Path) -> Result<()>;

    fn clean(&mut self, job_id: u64, force: bool) -> Result<()>;

    fn get_stdout(&mut self, job_id: u64) -> Result<String>;

    fn get_stderr(&mut self, job_id: u64) -> Result<String>;

    fn get_info(&mut self, job_id: u64) -> Result<JobInfo>;
}

/// Handle to a submitted job: the worker that hosts it plus its id there.
#[derive(Clone)]
pub struct JobProxy {
    worker: WorkerHandle,
    host: String,
    job_id: u64,
    n_core: i32,
    command: String,
    output_dir: PathBuf,
}

impl JobProxy {
    pub(crate) fn from_parts(
        worker: WorkerHandle,
        host: String,
        job_id: u64,
        n_core: i32,
        command: String,
        output_dir: PathBuf,
    ) -> Self {
        JobProxy {
            worker,
            host,
            job_id,
            n_core,
            command,
            output_dir,
        }
    }

    fn worker(&self) -> Result<MutexGuard<'_, dyn Worker + Send + 'static>> {
        self.worker.lock().map_err(move |_| anyhow!("worker lock poisoned"))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    pub fn n_core(&self) -> i32 {
        self.n_core
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn status(&self) -> Result<JobStatus> {
        self.worker()?.status(self.job_id)
    }

    pub fn copy_output(&self, dest: &Path) -> Result<()> {
        self.worker()?.copy_output(self.job_id, dest)
    }

    pub fn clean(&self, force: bool) -> Result<()> {
        self.worker()?.clean(self.job_id, force)
    }

    pub fn get_stdout(&self) -> Result<String> {
        self.worker()?.get_stdout(self.job_id)
    }

    pub fn get_stderr(&self) -> Result<String> {
        self.worker()?.get_stderr(self.job_id)
    }

    pub fn get_info(&self) -> Result<JobInfo> {
        self.worker()?.get_info(self.job_id)
    }
}

impl std::fmt::Debug for JobProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobProxy({} on {})", self.job_id, self.host)
    }
}

/// Runs jobs on this machine.
pub struct LocalWorker {
    host: String,
    capacity: Option<u32>,
    jobs: HashMap<u64, Job>,
    running: HashSet<u64>,
    next_id: u64,
}

impl LocalWorker {
    pub fn new() -> Self {
        LocalWorker {
            host: "localhost".to_string(),
            capacity: None,
            jobs: HashMap::new(),
            running: HashSet::new(),
            next_id: 0,
        }
    }

    /// A local worker with a pinned core budget instead of load probing.
    pub fn with_capacity(cores: u32) -> Self {
        LocalWorker {
            capacity: Some(cores),
            ..LocalWorker::new()
        }
    }

    fn sweep_running(&mut self) -> Result<()> {
        for id in self.running.clone() {
            self.status(id)?;
        }
        Ok(())
    }

    fn job_mut(&mut self, job_id: u64) -> Result<&mut Job> {
        self.jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow!("invalid job id {job_id}"))
    }
}

impl Default for LocalWorker {
    fn default() -> Self {
        LocalWorker::new()
    }
}

impl Worker for LocalWorker {
    fn host(&self) -> &str {
        &self.host
    }

    fn total_cores(&mut self) -> Result<u32> {
        Ok(self.capacity.unwrap_or_else(job::total_cores))
    }

    fn free_cores(&mut self) -> Result<u32> {
        Ok(self.capacity.unwrap_or_else(job::free_cores))
    }

    fn can_run(&mut self, n_core: i32) -> Result<bool> {
        if n_core == 0 {
            return Ok(true);
        }
        let total = self.total_cores()?;
        let needed = cores_required_for(n_core, total);
        let free = self.free_cores()?;
        if free < needed {
            return Ok(false);
        }
        self.sweep_running()?;
        let used: u32 = self
            .running
            .iter()
            .map(|id| cores_required_for(self.jobs[id].n_core(), total))
            .sum();
        Ok(free.saturating_sub(used) >= needed)
    }

    fn run_job(&mut self, mut job: Job) -> Result<u64> {
        let id = self.next_id;
        self.next_id += 1;
        info!(host = %self.host, command = %job.pretty_command(), "running job");
        job.run()?;
        self.jobs.insert(id, job);
        self.running.insert(id);
        Ok(id)
    }

    fn status(&mut self, job_id: u64) -> Result<JobStatus> {
        let status = self.job_mut(job_id)?.status();
        if status.is_terminal() {
            self.running.remove(&job_id);
        }
        Ok(status)
    }

    fn copy_output(&mut self, _job_id: u64, _dest: &Path) -> Result<()> {
        // Local outputs are already where they belong.
        Ok(())
    }

    fn clean(&mut self, job_id: u64, force: bool) -> Result<()> {
        // Local files are usually worth keeping; only honour forced cleans.
        if force {
            self.job_mut(job_id)?.clean(true)?;
        }
        Ok(())
    }

    fn get_stdout(&mut self, job_id: u64) -> Result<String> {
        self.job_mut(job_id)?.get_stdout()
    }

    fn get_stderr(&mut self, job_id: u64) -> Result<String> {
        self.job_mut(job_id)?.get_stderr()
    }

    fn get_info(&mut self, job_id: u64) -> Result<JobInfo> {
        Ok(self.job_mut(job_id)?.get_info())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_core_jobs_are_always_admitted() {
        let mut w = LocalWorker::with_capacity(0);
        assert!(w.can_run(0).unwrap());
        assert!(!w.can_run(1).unwrap());
    }

    #[test]
    fn admission_respects_pinned_capacity() {
        let mut w = LocalWorker::with_capacity(2);
        assert!(w.can_run(1).unwrap());
        assert!(w.can_run(2).unwrap());
        assert!(!w.can_run(3).unwrap());
        // -2 of a 2-core budget is one core; -1 is both.
        assert!(w.can_run(-2).unwrap());
        assert!(w.can_run(-1).unwrap());
    }

    #[test]
    fn unknown_job_ids_are_errors() {
        let mut w = LocalWorker::new();
        let err = w.status(99).unwrap_err();
        assert!(err.to_string().contains("invalid job id"));
    }
}
