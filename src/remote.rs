//! Remote workers and the peer manager they talk to.
//!
//! A [`RemoteWorker`] starts `expman _serve` on another host (over `ssh`,
//! or directly as a local child in testing mode) and keeps the child's
//! stdio as an opaque request/reply channel: one JSON object per line,
//! `{method, args}` out, `{ok, result|error}` back. The peer holds real
//! [`Job`] values in memory keyed by a monotonically increasing id; the
//! method set mirrors the [`Worker`] interface. Because requests are
//! answered one at a time, the channel doubles as the per-worker mutex.
//!
//! Bootstrapping the remote side (installing the binary, syncing sources)
//! is the cluster manager's business; this module assumes `expman` is
//! already reachable at the configured path.

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::job::{self, Job, JobInfo, JobSpec, JobStatus, cores_required_for};
use crate::worker::Worker;

#[derive(Debug, Serialize, Deserialize)]
struct Request {
    method: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct Reply {
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

/// One live request/reply channel to a peer process.
struct Channel {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl Channel {
    fn open(mut cmd: Command) -> Result<Self> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut child = cmd.spawn().context("spawn remote manager")?;
        let stdin = child.stdin.take().expect("channel stdin piped");
        let stdout = BufReader::new(child.stdout.take().expect("channel stdout piped"));
        Ok(Channel {
            child,
            stdin: Some(stdin),
            stdout,
        })
    }

    fn call(&mut self, method: &str, args: Value) -> Result<Value> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("remote channel already closed"))?;
        let request = serde_json::to_string(&Request {
            method: method.to_string(),
            args,
        })?;
        writeln!(stdin, "{request}").context("write to remote channel")?;
        stdin.flush()?;

        let mut line = String::new();
        let n = self
            .stdout
            .read_line(&mut line)
            .context("read from remote channel")?;
        anyhow::ensure!(n > 0, "remote channel dropped during {method}");
        let reply: Reply = serde_json::from_str(line.trim())
            .with_context(|| format!("malformed reply to {method}: {line}"))?;
        if reply.ok {
            Ok(reply.result)
        } else {
            Err(anyhow!(
                "remote {method} failed: {}",
                reply.error.unwrap_or_else(|| "unknown error".to_string())
            ))
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Closing stdin makes the peer's serve loop exit on EOF.
        drop(self.stdin.take());
        let _ = self.child.wait();
    }
}

/// A worker reached over an `expman _serve` channel on another host.
pub struct RemoteWorker {
    host: String,
    exe: String,
    chdir: Option<PathBuf>,
    nfs: bool,
    testing: bool,
    channel: Channel,
    n_cores: HashMap<u64, i32>,
    output_dirs: HashMap<u64, PathBuf>,
    running: HashSet<u64>,
}

impl RemoteWorker {
    /// Open the channel to `host` and start the resident manager there.
    ///
    /// With `testing` the manager is spawned as a direct local child (no
    /// ssh), which exercises the full protocol against this machine.
    pub fn connect(
        host: impl Into<String>,
        exe: Option<String>,
        chdir: Option<PathBuf>,
        nfs: bool,
        testing: bool,
    ) -> Result<Self> {
        let host = host.into();
        let exe = exe.unwrap_or_else(|| job::helper_exe().display().to_string());
        let mut cmd = if testing {
            Command::new(&exe)
        } else {
            let mut c = Command::new("ssh");
            c.arg(&host).arg(&exe);
            c
        };
        cmd.arg("_serve");
        if let Some(dir) = &chdir {
            cmd.arg("--chdir").arg(dir);
        }
        info!(host = %host, testing, "connecting remote worker");
        let channel = Channel::open(cmd)?;
        Ok(RemoteWorker {
            host,
            exe,
            chdir,
            nfs,
            testing,
            channel,
            n_cores: HashMap::new(),
            output_dirs: HashMap::new(),
            running: HashSet::new(),
        })
    }

    pub fn exe(&self) -> &str {
        &self.exe
    }

    fn call<T: DeserializeOwned>(&mut self, method: &str, args: Value) -> Result<T> {
        let result = self.channel.call(method, args)?;
        serde_json::from_value(result)
            .with_context(|| format!("unexpected result type from {method}"))
    }

    fn sweep_running(&mut self) -> Result<()> {
        for id in self.running.clone() {
            self.status(id)?;
        }
        Ok(())
    }

    fn remote_output_dir(&self, job_id: u64) -> Result<&PathBuf> {
        self.output_dirs
            .get(&job_id)
            .ok_or_else(|| anyhow!("invalid job id {job_id}"))
    }
}

impl Worker for RemoteWorker {
    fn host(&self) -> &str {
        &self.host
    }

    fn total_cores(&mut self) -> Result<u32> {
        self.call("total_cores", json!([]))
    }

    fn free_cores(&mut self) -> Result<u32> {
        self.call("free_cores", json!([]))
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
            .map(|id| cores_required_for(self.n_cores[id], total))
            .sum();
        Ok(free.saturating_sub(used) >= needed)
    }

    fn run_job(&mut self, job: Job) -> Result<u64> {
        info!(host = %self.host, command = %job.pretty_command(), "running job");
        let job_id: u64 = self.call("run", json!([job.spec()]))?;
        self.n_cores.insert(job_id, job.n_core());
        self.output_dirs
            .insert(job_id, job.output_dir().to_path_buf());
        self.running.insert(job_id);
        Ok(job_id)
    }

    fn status(&mut self, job_id: u64) -> Result<JobStatus> {
        let status: JobStatus = self.call("status", json!([job_id]))?;
        if status.is_terminal() {
            self.running.remove(&job_id);
        }
        Ok(status)
    }

    /// Bring a finished job's outputs back to this machine.
    ///
    /// In testing mode this is an in-process copy; over NFS there is
    /// nothing to do; otherwise an out-of-band `scp -qr` fetches the tree.
    fn copy_output(&mut self, job_id: u64, dest: &Path) -> Result<()> {
        let output_dir = self.remote_output_dir(job_id)?.clone();
        let remote_path = match &self.chdir {
            Some(chdir) => chdir.join(&output_dir),
            None => output_dir.clone(),
        };
        if self.testing {
            copy_tree(&remote_path, &dest.join(&output_dir))
        } else if !self.nfs {
            let parent = dest.join(output_dir.parent().unwrap_or_else(|| Path::new("")));
            std::fs::create_dir_all(&parent)
                .with_context(|| format!("create {}", parent.display()))?;
            let src = format!("{}:{}", self.host, remote_path.display());
            info!(src = %src, dest = %parent.display(), "scp -qr");
            let status = Command::new("scp")
                .arg("-qr")
                .arg(&src)
                .arg(&parent)
                .status()
                .context("spawn scp")?;
            anyhow::ensure!(status.success(), "scp of {src} failed: {status}");
            Ok(())
        } else {
            Ok(())
        }
    }

    fn clean(&mut self, job_id: u64, force: bool) -> Result<()> {
        self.call("clean", json!([job_id, force]))
    }

    fn get_stdout(&mut self, job_id: u64) -> Result<String> {
        self.call("get_stdout", json!([job_id]))
    }

    fn get_stderr(&mut self, job_id: u64) -> Result<String> {
        self.call("get_stderr", json!([job_id]))
    }

    fn get_info(&mut self, job_id: u64) -> Result<JobInfo> {
        self.call("get_info", json!([job_id]))
    }
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;
    for entry in std::fs::read_dir(src).with_context(|| format!("read {}", src.display()))? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}

/// Options for the internal `_serve` sub-command.
#[derive(Debug)]
pub struct ServeOpts {
    pub chdir: Option<PathBuf>,
}

/// Body of the `_serve` sub-command: the resident manager on a worker host.
///
/// Reads one request per line from stdin and answers on stdout until EOF.
/// The working directory moves to `--chdir` first, and this binary's own
/// directory is prepended to `PATH` so jobs can say `expman` without
/// knowing where it was installed.
pub fn serve(opts: ServeOpts) -> Result<()> {
    if let Some(dir) = &opts.chdir {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        std::env::set_current_dir(dir)
            .with_context(|| format!("chdir to {}", dir.display()))?;
    }
    prepend_self_to_path()?;

    let mut manager = Manager::default();
    let stdin = std::io::stdin().lock();
    let mut stdout = std::io::stdout().lock();
    for line in stdin.lines() {
        let line = line.context("read request")?;
        if line.trim().is_empty() {
            continue;
        }
        let outcome = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                debug!(method = %request.method, "request");
                manager.dispatch(&request.method, request.args)
            }
            Err(e) => Err(anyhow!("malformed request: {e}")),
        };
        let reply = match outcome {
            Ok(result) => Reply {
                ok: true,
                result,
                error: None,
            },
            Err(e) => Reply {
                ok: false,
                result: Value::Null,
                error: Some(format!("{e:#}")),
            },
        };
        writeln!(stdout, "{}", serde_json::to_string(&reply)?)?;
        stdout.flush()?;
    }
    Ok(())
}

fn prepend_self_to_path() -> Result<()> {
    let exe = std::env::current_exe().context("resolve current exe")?;
    let Some(dir) = exe.parent() else {
        return Ok(());
    };
    let path = std::env::var_os("PATH").unwrap_or_default();
    let mut parts: Vec<PathBuf> = std::env::split_paths(&path).collect();
    if !parts.iter().any(|p| p == dir) {
        parts.insert(0, dir.to_path_buf());
        let joined = std::env::join_paths(parts).context("rebuild PATH")?;
        // SAFETY: called once at serve startup, before any threads exist.
        unsafe { std::env::set_var("PATH", joined) };
    }
    Ok(())
}

/// In-memory job table on the peer side.
#[derive(Default)]
struct Manager {
    jobs: HashMap<u64, Job>,
    next_id: u64,
}

impl Manager {
    fn job_mut(&mut self, job_id: u64) -> Result<&mut Job> {
        self.jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow!("invalid job id {job_id}"))
    }

    fn dispatch(&mut self, method: &str, args: Value) -> Result<Value> {
        match method {
            "free_cores" => Ok(json!(job::free_cores())),
            "total_cores" => Ok(json!(job::total_cores())),
            "run" => {
                let spec: JobSpec = arg(&args, 0)?;
                let mut job = Job::from_spec(spec)?;
                job.run()?;
                let job_id = self.next_id;
                self.next_id += 1;
                self.jobs.insert(job_id, job);
                Ok(json!(job_id))
            }
            "status" => {
                let job_id: u64 = arg(&args, 0)?;
                let status = self.job_mut(job_id)?.status();
                Ok(serde_json::to_value(status)?)
            }
            "clean" => {
                let job_id: u64 = arg(&args, 0)?;
                let force: bool = arg(&args, 1)?;
                self.job_mut(job_id)?.clean(force)?;
                Ok(Value::Null)
            }
            "get_stdout" => {
                let job_id: u64 = arg(&args, 0)?;
                Ok(json!(self.job_mut(job_id)?.get_stdout()?))
            }
            "get_stderr" => {
                let job_id: u64 = arg(&args, 0)?;
                Ok(json!(self.job_mut(job_id)?.get_stderr()?))
            }
            "get_info" => {
                let job_id: u64 = arg(&args, 0)?;
                Ok(serde_json::to_value(self.job_mut(job_id)?.get_info())?)
            }
            other => Err(anyhow!("unknown method {other}")),
        }
    }
}

fn arg<T: DeserializeOwned>(args: &Value, index: usize) -> Result<T> {
    let value = args.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).with_context(|| format!("bad argument {index}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_rejects_unknown_ids_with_sentinel() {
        let mut manager = Manager::default();
        let err = manager.dispatch("status", json!([7])).unwrap_err();
        assert!(err.to_string().contains("invalid job id 7"));
    }

    #[test]
    fn manager_rejects_unknown_methods() {
        let mut manager = Manager::default();
        let err = manager.dispatch("frobnicate", json!([])).unwrap_err();
        assert!(err.to_string().contains("unknown method"));
    }

    #[test]
    fn manager_reports_cores() {
        let mut manager = Manager::default();
        let total = manager.dispatch("total_cores", json!([])).unwrap();
        assert!(total.as_u64().unwrap() >= 1);
    }

    #[test]
    fn request_round_trips() {
        let request = Request {
            method: "status".into(),
            args: json!([3]),
        };
        let line = serde_json::to_string(&request).unwrap();
        let back: Request = serde_json::from_str(&line).unwrap();
        assert_eq!(back.method, "status");
        assert_eq!(back.args, json!([3]));
    }
}
