//! The single-threaded cooperative driver.
//!
//! The runner expands the transitive closure of its root tasks into a
//! deduplicated list, then walks it to quiescence: tasks whose
//! dependencies are complete get submitted, running tasks are polled, and
//! finished remote outputs are copied back. A task that reports a fatal
//! from `complete()` is counted; its dependents observe it as incomplete
//! and are never scheduled, and once any fatal is seen no further tasks
//! are admitted while the already-running set drains.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, info};

use crate::job::JobStatus;
use crate::scheduler::Scheduler;
use crate::task::{ConfigError, JobFailed, TaskRef, lock_task, stderr_tail_of};

const STDERR_TAIL_BYTES: usize = 2048;

/// Walks the task DAG, dispatching ready leaves to the scheduler.
pub struct TaskRunner {
    scheduler: Scheduler,
    todo: Vec<TaskRef>,
    running: Vec<TaskRef>,
    task_status: HashMap<String, JobStatus>,
    n_errors: usize,
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("todo", &self.todo.len())
            .field("running", &self.running.len())
            .field("task_status", &self.task_status)
            .field("n_errors", &self.n_errors)
            .finish()
    }
}

impl TaskRunner {
    /// Expand the graph under `tasks` and filter out what is already done.
    ///
    /// Deduplication is by task name; a requirement cycle is a fatal
    /// configuration error. Tasks whose previous run already failed count
    /// as errors immediately and are not re-admitted.
    pub fn new(tasks: Vec<TaskRef>, scheduler: Scheduler) -> Result<Self> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut path = Vec::new();
        for task in &tasks {
            expand(task, &mut order, &mut seen, &mut path)?;
        }

        let mut runner = TaskRunner {
            scheduler,
            todo: Vec::new(),
            running: Vec::new(),
            task_status: HashMap::new(),
            n_errors: 0,
        };

        for task in order {
            let (name, output) = {
                let t = lock_task(&task)?;
                (t.name(), t.output())
            };
            let state = lock_task(&task)?.complete();
            match state {
                Ok(true) => {
                    debug!(task = %name, "already complete");
                    runner.task_status.insert(name, JobStatus::Done);
                }
                Ok(false) => {
                    runner.task_status.insert(name, JobStatus::NotStarted);
                    runner.todo.push(task);
                }
                Err(e) if e.downcast_ref::<JobFailed>().is_some() => {
                    let failed = e.downcast_ref::<JobFailed>().expect("checked");
                    if failed.output_dir == output {
                        // This task's own previous run failed; never
                        // re-admit it.
                        report_fatal(&e);
                        runner.task_status.insert(name, JobStatus::Error);
                        runner.n_errors += 1;
                    } else {
                        // A requirement failed; the error is counted
                        // against the task that owns it.
                        runner.task_status.insert(name, JobStatus::NotStarted);
                        runner.todo.push(task);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(runner)
    }

    /// Names of the still-incomplete tasks, in expansion order.
    pub fn todo_names(&self) -> Vec<String> {
        self.todo
            .iter()
            .filter_map(|t| t.lock().ok().map(|t| t.name()))
            .collect()
    }

    pub fn todo_len(&self) -> usize {
        self.todo.len()
    }

    /// Terminal states observed per task name.
    pub fn task_status(&self) -> &HashMap<String, JobStatus> {
        &self.task_status
    }

    /// Drive the graph to quiescence, polling every `wait`.
    ///
    /// Returns the number of tasks that ended in error. Transport failures
    /// are not contained; they propagate.
    pub fn run(&mut self, wait: Duration) -> Result<usize> {
        info!(tasks = self.todo.len(), "task runner started");
        while !self.todo.is_empty() || !self.running.is_empty() {
            let mut progress = false;

            if self.n_errors == 0 {
                progress |= self.schedule_ready()?;
            }
            progress |= self.poll_running()?;

            if self.n_errors > 0 && self.running.is_empty() {
                // Drained after a fatal; dependents stay in todo.
                break;
            }
            if !progress && !(self.todo.is_empty() && self.running.is_empty()) {
                std::thread::sleep(wait);
            }
        }
        info!(errors = self.n_errors, pending = self.todo.len(), "task runner finished");
        Ok(self.n_errors)
    }

    fn schedule_ready(&mut self) -> Result<bool> {
        let mut progress = false;
        let mut index = 0;
        while index < self.todo.len() {
            let task = self.todo[index].clone();
            if self.deps_complete(&task)? {
                self.todo.remove(index);
                let name = lock_task(&task)?.name();
                debug!(task = %name, "dependencies complete, running");
                lock_task(&task)?.run(&mut self.scheduler)?;
                self.task_status.insert(name, JobStatus::Running);
                self.running.push(task);
                progress = true;
            } else {
                index += 1;
            }
        }
        Ok(progress)
    }

    fn deps_complete(&self, task: &TaskRef) -> Result<bool> {
        let requires = lock_task(task)?.requires();
        for dep in requires {
            let state = lock_task(&dep)?.complete();
            match state {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                // A failed dependency reads as incomplete here; it is
                // counted where it runs.
                Err(e) if e.downcast_ref::<JobFailed>().is_some() => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn poll_running(&mut self) -> Result<bool> {
        let mut progress = false;
        let mut still_running = Vec::new();
        let dest = self.scheduler.root().to_path_buf();
        for task in self.running.drain(..) {
            let state = lock_task(&task)?.complete();
            match state {
                Ok(true) => {
                    let mut t = lock_task(&task)?;
                    t.copy_output(&dest)?;
                    self.task_status.insert(t.name(), JobStatus::Done);
                    progress = true;
                }
                Ok(false) => still_running.push(task),
                Err(e) if e.downcast_ref::<JobFailed>().is_some() => {
                    report_fatal(&e);
                    let name = lock_task(&task)?.name();
                    self.task_status.insert(name, JobStatus::Error);
                    self.n_errors += 1;
                    progress = true;
                }
                Err(e) => return Err(e),
            }
        }
        self.running = still_running;
        Ok(progress)
    }
}

fn expand(
    task: &TaskRef,
    order: &mut Vec<TaskRef>,
    seen: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> Result<()> {
    let (name, requires) = {
        let t = lock_task(task)?;
        (t.name(), t.requires())
    };
    if path.contains(&name) {
        return Err(ConfigError(format!("dependency cycle involving {name}")).into());
    }
    if !seen.insert(name.clone()) {
        return Ok(());
    }
    order.push(task.clone());
    path.push(name);
    for dep in requires {
        expand(&dep, order, seen, path)?;
    }
    path.pop();
    Ok(())
}

fn report_fatal(e: &anyhow::Error) {
    if let Some(failed) = e.downcast_ref::<JobFailed>() {
        let tail = stderr_tail_of(&failed.output_dir, STDERR_TAIL_BYTES);
        error!(
            command = %failed.command,
            logs = %failed.output_dir.display(),
            "task failed"
        );
        if !tail.is_empty() {
            eprintln!("--- stderr tail ({}) ---", failed.output_dir.display());
            eprintln!("{}", tail.trim_end());
        }
    } else {
        error!(error = %e, "task failed");
    }
}
