//! Admission of jobs onto workers.
//!
//! The scheduler owns an ordered list of worker configurations and
//! instantiates workers lazily, so the cost of an ssh connection is only
//! paid when a job actually lands on that host. Once every configured
//! worker is up, placement rotates round-robin so the tail of the list is
//! not starved.

use std::collections::{HashSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::job::Job;
use crate::remote::RemoteWorker;
use crate::worker::{JobProxy, LocalWorker, WorkerHandle};

/// One entry of the scheduler's worker list, as stored in `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub host: String,
    /// Path of the `expman` binary on the worker host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,
    /// Working directory on the worker host (the synced project tree).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chdir: Option<PathBuf>,
    /// Outputs are on a shared filesystem; skip the copy back.
    #[serde(default)]
    pub nfs: bool,
    /// Spawn the manager as a local child instead of over ssh.
    #[serde(default)]
    pub testing: bool,
    /// Pin the core budget instead of probing the machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
}

impl WorkerConfig {
    pub fn localhost() -> Self {
        WorkerConfig {
            host: "localhost".to_string(),
            exe: None,
            home: None,
            chdir: None,
            nfs: false,
            testing: false,
            cores: None,
        }
    }

    pub fn is_local(&self) -> bool {
        self.host == "localhost"
    }

    fn instantiate(&self) -> Result<WorkerHandle> {
        if self.is_local() {
            let worker = match self.cores {
                Some(cores) => LocalWorker::with_capacity(cores),
                None => LocalWorker::new(),
            };
            Ok(Arc::new(Mutex::new(worker)))
        } else {
            let worker = RemoteWorker::connect(
                self.host.clone(),
                self.exe.clone(),
                self.chdir.clone(),
                self.nfs,
                self.testing,
            )?;
            Ok(Arc::new(Mutex::new(worker)))
        }
    }
}

/// Places jobs onto workers, respecting per-worker core budgets.
pub struct Scheduler {
    root: PathBuf,
    worker_config: Vec<WorkerConfig>,
    workers: VecDeque<WorkerHandle>,
    active: Vec<JobProxy>,
    completed: Vec<JobProxy>,
    wait: Duration,
}

impl Scheduler {
    pub fn new(root: impl Into<PathBuf>, worker_config: Vec<WorkerConfig>) -> Self {
        Scheduler {
            root: root.into(),
            worker_config,
            workers: VecDeque::new(),
            active: Vec::new(),
            completed: Vec::new(),
            wait: Duration::from_secs(5),
        }
    }

    /// How long `submit` sleeps between rounds when every worker is full.
    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Append a worker to the configuration. It is not started here.
    pub fn add_worker(&mut self, conf: WorkerConfig) {
        self.worker_config.push(conf);
    }

    /// Number of workers actually instantiated so far.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn config_count(&self) -> usize {
        self.worker_config.len()
    }

    /// Place a job on some worker, blocking until one can accept it.
    pub fn submit(&mut self, job: Job) -> Result<JobProxy> {
        anyhow::ensure!(
            !self.worker_config.is_empty(),
            "no workers configured; add one before submitting jobs"
        );
        let n_core = job.n_core();
        let mut job = Some(job);
        let mut slept = false;
        loop {
            for _ in 0..self.worker_config.len() {
                let worker = self.get_worker(n_core)?;
                let admitted = lock_worker(&worker)?.can_run(n_core)?;
                if admitted {
                    if slept {
                        eprintln!();
                    }
                    let (host, job_id, proxy_job);
                    {
                        let mut w = lock_worker(&worker)?;
                        host = w.host().to_string();
                        let j = job.take().expect("job still pending");
                        proxy_job = (j.n_core(), j.pretty_command(), j.output_dir().to_path_buf());
                        job_id = w.run_job(j)?;
                    }
                    debug!(host = %host, job_id, "job placed");
                    let proxy = JobProxy::from_parts(
                        worker, host, job_id, proxy_job.0, proxy_job.1, proxy_job.2,
                    );
                    self.active.push(proxy.clone());
                    return Ok(proxy);
                }
            }
            std::thread::sleep(self.wait);
            eprint!("\rwaiting for a free worker ...");
            let _ = std::io::stderr().flush();
            slept = true;
        }
    }

    /// Pick the worker to try next.
    ///
    /// With every configured worker up, this is plain rotation. Before
    /// that, an already-instantiated worker with no running work is reused
    /// if it can take the job; otherwise the next configured worker is
    /// started.
    fn get_worker(&mut self, n_core: i32) -> Result<WorkerHandle> {
        if self.workers.len() == self.worker_config.len() {
            let worker = self.workers.pop_front().expect("workers non-empty");
            self.workers.push_back(worker.clone());
            return Ok(worker);
        }
        let busy_hosts = self.reap_completed()?;
        if self.workers.len() > busy_hosts.len() {
            for worker in &self.workers {
                let mut w = lock_worker(worker)?;
                if !busy_hosts.contains(w.host()) && w.can_run(n_core)? {
                    drop(w);
                    return Ok(worker.clone());
                }
            }
        }
        self.create_worker()
    }

    /// Move finished proxies to the completed list; return hosts that
    /// still have running work.
    fn reap_completed(&mut self) -> Result<HashSet<String>> {
        let mut busy = HashSet::new();
        let mut still_active = Vec::new();
        for proxy in self.active.drain(..) {
            if proxy.status()?.is_terminal() {
                self.completed.push(proxy);
            } else {
                busy.insert(proxy.host().to_string());
                still_active.push(proxy);
            }
        }
        self.active = still_active;
        Ok(busy)
    }

    fn create_worker(&mut self) -> Result<WorkerHandle> {
        let conf = &self.worker_config[self.workers.len()];
        info!(host = %conf.host, "starting worker");
        let worker = conf.instantiate()?;
        self.workers.push_back(worker.clone());
        Ok(worker)
    }
}

pub(crate) fn lock_worker(
    worker: &WorkerHandle,
) -> Result<std::sync::MutexGuard<'_, dyn crate::worker::Worker + Send + 'static>> {
    worker.lock().map_err(move |_| anyhow!("worker lock poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_worker_is_started_at_construction() {
        let s = Scheduler::new(".", vec![WorkerConfig::localhost()]);
        assert_eq!(s.worker_count(), 0);
        assert_eq!(s.config_count(), 1);
    }

    #[test]
    fn add_worker_only_grows_the_config() {
        let mut s = Scheduler::new(".", vec![]);
        s.add_worker(WorkerConfig::localhost());
        assert_eq!(s.config_count(), 1);
        assert_eq!(s.worker_count(), 0);
    }

    #[test]
    fn worker_config_defaults_from_bare_host() {
        let conf: WorkerConfig = serde_json::from_str(r#"{"host": "beefy"}"#).unwrap();
        assert_eq!(conf.host, "beefy");
        assert!(!conf.nfs);
        assert!(!conf.testing);
        assert!(conf.exe.is_none());
    }
}
