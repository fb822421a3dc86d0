//! A supervised external process with a durable status record.
//!
//! A [`Job`] owns its output directory. Everything durable about the job
//! lives there: `stdout.txt`, `stderr.txt` and `job_info.json`. The driver
//! process never waits on the child directly; `run()` spawns the `expman
//! _supervise` helper as a separate OS process which starts the child,
//! records its pid and writes the terminal status when it exits. Because
//! the record is on disk, a job started by a driver that later crashed can
//! still be resolved by a fresh process.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, System};
use tracing::debug;

pub const INFO_FILE: &str = "job_info.json";
pub const STDOUT_FILE: &str = "stdout.txt";
pub const STDERR_FILE: &str = "stderr.txt";

/// Environment variable overriding where the `expman` helper binary lives.
pub const HELPER_ENV: &str = "EXPMAN_EXE";

/// Status of a job as recorded in `job_info.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[serde(rename = "not started")]
    NotStarted,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::NotStarted => "not started",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The on-disk record at `<output_dir>/job_info.json`.
///
/// An absent file means "not started". An unparsable file means "running":
/// it is a half-written snapshot observed during startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub status: JobStatus,
    pub pid: Option<u32>,
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub end: String,
    pub exitcode: Option<i32>,
}

impl JobInfo {
    fn not_started() -> Self {
        JobInfo {
            status: JobStatus::NotStarted,
            pid: None,
            start: String::new(),
            end: String::new(),
            exitcode: None,
        }
    }

    fn running() -> Self {
        JobInfo {
            status: JobStatus::Running,
            pid: None,
            start: String::new(),
            end: String::new(),
            exitcode: None,
        }
    }
}

/// Read the info record of the job in `output_dir`.
pub fn read_info_in(output_dir: &Path) -> JobInfo {
    let path = output_dir.join(INFO_FILE);
    if !path.exists() {
        return JobInfo::not_started();
    }
    match std::fs::read(&path) {
        Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|_| JobInfo::running()),
        Err(_) => JobInfo::running(),
    }
}

/// Write the info record, renaming into place so readers never observe a
/// torn record.
pub fn write_info_in(output_dir: &Path, info: &JobInfo) -> Result<()> {
    let tmp = tempfile::NamedTempFile::new_in(output_dir)
        .with_context(|| format!("create temp info file in {}", output_dir.display()))?;
    serde_json::to_writer(&tmp, info)?;
    tmp.persist(output_dir.join(INFO_FILE))
        .with_context(|| format!("persist {} in {}", INFO_FILE, output_dir.display()))?;
    Ok(())
}

fn now_stamp() -> String {
    humantime::format_rfc3339_seconds(std::time::SystemTime::now()).to_string()
}

/// Number of cores on this machine.
pub fn total_cores() -> u32 {
    let mut sys = System::new();
    sys.refresh_cpu_list(CpuRefreshKind::nothing());
    sys.cpus().len() as u32
}

/// Estimate of currently idle cores, from a short CPU-load sample.
pub fn free_cores() -> u32 {
    let mut sys = System::new();
    sys.refresh_cpu_usage();
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu_usage();
    let idle = (1.0 - sys.global_cpu_usage() / 100.0).max(0.0);
    (idle * total_cores() as f32).round() as u32
}

/// Resolve an `n_core` request against this machine.
///
/// Positive counts are taken as-is, zero stays zero, and a negative count
/// means "relative to the machine total": `-1` is every core, `-2` half of
/// them, and so on.
pub fn cores_required(n_core: i32) -> u32 {
    cores_required_for(n_core, total_cores())
}

pub(crate) fn cores_required_for(n_core: i32, total: u32) -> u32 {
    match n_core {
        n if n > 0 => n as u32,
        0 => 0,
        n => total / n.unsigned_abs(),
    }
}

/// Resolve an `n_thread` request. A negative count means threads per
/// resolved core, so `threads_required(-2, -1)` on a four-core machine is 8.
pub fn threads_required(n_thread: i32, n_core: i32) -> u32 {
    threads_required_for(n_thread, n_core, total_cores())
}

pub(crate) fn threads_required_for(n_thread: i32, n_core: i32, total: u32) -> u32 {
    match n_thread {
        n if n > 0 => n as u32,
        0 => 0,
        n => cores_required_for(n_core, total) * n.unsigned_abs(),
    }
}

/// Serializable description of a job, used to ship it to a remote manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub command: Vec<String>,
    pub output_dir: PathBuf,
    pub n_core: i32,
    pub n_thread: Option<i32>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

/// One supervised OS subprocess.
#[derive(Debug)]
pub struct Job {
    command: Vec<String>,
    output_dir: PathBuf,
    n_core: i32,
    n_thread: Option<i32>,
    env: Vec<(String, String)>,
    output_already_exists: bool,
    supervisor: Option<Child>,
}

impl Job {
    /// Create a job from a pre-split argument sequence.
    pub fn new(command: Vec<String>, output_dir: impl Into<PathBuf>) -> Result<Self> {
        anyhow::ensure!(!command.is_empty(), "job command must not be empty");
        let output_dir = output_dir.into();
        let output_already_exists = output_dir.exists();
        Ok(Job {
            command,
            output_dir,
            n_core: 1,
            n_thread: Some(1),
            env: Vec::new(),
            output_already_exists,
            supervisor: None,
        })
    }

    /// Create a job from a shell-style command line.
    pub fn from_command_line(command: &str, output_dir: impl Into<PathBuf>) -> Result<Self> {
        let args = shlex::split(command)
            .ok_or_else(|| anyhow::anyhow!("failed to tokenise command: {command}"))?;
        Job::new(args, output_dir)
    }

    pub fn cores(mut self, n_core: i32) -> Self {
        self.n_core = n_core;
        self
    }

    pub fn threads(mut self, n_thread: Option<i32>) -> Self {
        self.n_thread = n_thread;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn pretty_command(&self) -> String {
        self.command.join(" ")
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn n_core(&self) -> i32 {
        self.n_core
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.output_dir.join(STDOUT_FILE)
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.output_dir.join(STDERR_FILE)
    }

    pub fn info_path(&self) -> PathBuf {
        self.output_dir.join(INFO_FILE)
    }

    /// Description suitable for reconstructing this job elsewhere.
    pub fn spec(&self) -> JobSpec {
        JobSpec {
            command: self.command.clone(),
            output_dir: self.output_dir.clone(),
            n_core: self.n_core,
            n_thread: self.n_thread,
            env: self.env.clone(),
        }
    }

    /// Reconstruct a job from a shipped spec. The pre-existing flag is
    /// evaluated here, on the machine that will run the job.
    pub fn from_spec(spec: JobSpec) -> Result<Self> {
        let job = Job::new(spec.command, spec.output_dir)?
            .cores(spec.n_core)
            .threads(spec.n_thread);
        Ok(spec.env.into_iter().fold(job, |j, (k, v)| j.env(k, v)))
    }

    /// Replace each argument whose path basename equals `basename`.
    ///
    /// Useful when `["expman", ...]` or `["python", "script.py"]` must be
    /// pinned to a specific executable because `PATH` cannot be relied upon.
    pub fn substitute_in_command(&mut self, basename: &str, replacement: &str) {
        for arg in &mut self.command {
            if Path::new(arg.as_str()).file_name().and_then(|n| n.to_str()) == Some(basename) {
                *arg = replacement.to_string();
            }
        }
    }

    /// Start the job under a freshly spawned supervisor process.
    pub fn run(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("create output dir {}", self.output_dir.display()))?;

        let info = JobInfo {
            status: JobStatus::Running,
            pid: None,
            start: now_stamp(),
            end: String::new(),
            exitcode: None,
        };
        write_info_in(&self.output_dir, &info)?;

        let mut env = self.env.clone();
        if let Some(n_thread) = self.n_thread {
            env.push((
                "OMP_NUM_THREADS".to_string(),
                threads_required(n_thread, self.n_core).to_string(),
            ));
        }

        let mut cmd = Command::new(helper_exe());
        cmd.arg("_supervise")
            .arg("--output-dir")
            .arg(&self.output_dir);
        for (key, value) in &env {
            cmd.arg("--env").arg(format!("{key}={value}"));
        }
        cmd.arg("--")
            .args(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = cmd.spawn().context("spawn job supervisor")?;
        debug!(supervisor_pid = child.id(), command = %self.pretty_command(), "supervisor spawned");
        self.supervisor = Some(child);
        Ok(())
    }

    /// Wait for the supervisor (and therefore the child) to finish.
    pub fn join(&mut self) -> Result<()> {
        if let Some(mut child) = self.supervisor.take() {
            child.wait().context("wait for job supervisor")?;
        }
        Ok(())
    }

    pub fn get_info(&self) -> JobInfo {
        read_info_in(&self.output_dir)
    }

    /// Status derived from the on-disk record plus a liveness check.
    ///
    /// If the record claims `running` but no supervisor handle is held and
    /// the recorded pid is dead, the job (or the driver that started it)
    /// was killed, and the status resolves to `error`.
    pub fn status(&mut self) -> JobStatus {
        if let Some(child) = self.supervisor.as_mut()
            && matches!(child.try_wait(), Ok(Some(_)))
        {
            self.supervisor = None;
        }
        let info = self.get_info();
        let mut status = info.status;
        if status == JobStatus::Running
            && self.supervisor.is_none()
            && let Some(pid) = info.pid
            && !pid_alive(pid)
        {
            status = JobStatus::Error;
        }
        status
    }

    pub fn get_stdout(&self) -> Result<String> {
        read_log(&self.stdout_path())
    }

    pub fn get_stderr(&self) -> Result<String> {
        read_log(&self.stderr_path())
    }

    /// Remove job outputs.
    ///
    /// If the output directory pre-existed this job and `force` is not set,
    /// only the log files are removed and user data is preserved. Otherwise
    /// the whole directory tree goes.
    pub fn clean(&self, force: bool) -> Result<()> {
        if self.output_already_exists && !force {
            for path in [self.stdout_path(), self.stderr_path()] {
                if path.exists() {
                    std::fs::remove_file(&path)
                        .with_context(|| format!("remove {}", path.display()))?;
                }
            }
        } else if self.output_dir.exists() {
            std::fs::remove_dir_all(&self.output_dir)
                .with_context(|| format!("remove {}", self.output_dir.display()))?;
        }
        Ok(())
    }
}

fn read_log(path: &Path) -> Result<String> {
    let raw = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Read the last `max_bytes` of a file, returning lossy UTF-8.
pub fn tail_file(path: &Path, max_bytes: usize) -> String {
    let Ok(data) = std::fs::read(path) else {
        return String::new();
    };
    let start = data.len().saturating_sub(max_bytes);
    String::from_utf8_lossy(&data[start..]).into_owned()
}

/// Locate the `expman` helper binary that carries `_supervise` and `_serve`.
///
/// Order: the `EXPMAN_EXE` override; the current executable when it is
/// itself `expman`; a sibling named `expman` next to the current executable
/// (stepping out of cargo's `deps/` directory); finally `expman` on `PATH`.
pub fn helper_exe() -> PathBuf {
    if let Ok(exe) = std::env::var(HELPER_ENV)
        && !exe.is_empty()
    {
        return PathBuf::from(exe);
    }
    if let Ok(mut exe) = std::env::current_exe() {
        if exe.file_stem().is_some_and(|stem| stem == "expman") {
            return exe;
        }
        exe.pop();
        if exe.ends_with("deps") {
            exe.pop();
        }
        let sibling = exe.join(format!("expman{}", std::env::consts::EXE_SUFFIX));
        if sibling.exists() {
            return sibling;
        }
    }
    PathBuf::from("expman")
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // Signal 0 probes existence without delivering anything.
    // SAFETY: kill(2) is safe to call with any pid and signal 0.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
fn pid_alive(pid: u32) -> bool {
    use windows::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
    use windows::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };
    unsafe {
        let Ok(handle) = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) else {
            return false;
        };
        let mut code = 0u32;
        let alive =
            GetExitCodeProcess(handle, &mut code).is_ok() && code == STILL_ACTIVE.0 as u32;
        let _ = CloseHandle(handle);
        alive
    }
}

#[cfg(not(any(unix, windows)))]
fn pid_alive(_pid: u32) -> bool {
    true
}

/// Options for the internal `_supervise` sub-command.
#[derive(Debug)]
pub struct SuperviseOpts {
    pub output_dir: PathBuf,
    /// KEY=VALUE overlay entries applied on top of the inherited environment.
    pub env: Vec<String>,
    pub command: Vec<String>,
}

/// Body of the `_supervise` sub-command.
///
/// Opens the log files in append mode, spawns the child with the composed
/// environment, records the real pid, waits, and writes the terminal
/// status and exit code. A failed spawn is itself recorded as `error` so
/// the driver (which may have moved on) sees it on the next poll.
pub fn supervise(opts: SuperviseOpts) -> Result<()> {
    anyhow::ensure!(!opts.command.is_empty(), "supervisor: no command");
    let dir = &opts.output_dir;

    let stdout = open_log(&dir.join(STDOUT_FILE))?;
    let stderr = open_log(&dir.join(STDERR_FILE))?;

    // Carries the start stamp written by the driver.
    let mut info = read_info_in(dir);

    let mut cmd = Command::new(&opts.command[0]);
    cmd.args(&opts.command[1..])
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr);
    for entry in &opts.env {
        let (key, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
        cmd.env(key, value);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            info.status = JobStatus::Error;
            info.end = now_stamp();
            write_info_in(dir, &info)?;
            return Err(e).with_context(|| format!("supervisor: spawn {:?}", opts.command[0]));
        }
    };

    info.pid = Some(child.id());
    info.status = JobStatus::Running;
    write_info_in(dir, &info)?;
    debug!(pid = child.id(), "child process started");

    let exit = child.wait().context("supervisor: wait for child")?;
    info.status = if exit.success() {
        JobStatus::Done
    } else {
        JobStatus::Error
    };
    info.exitcode = exit.code();
    info.end = now_stamp();
    write_info_in(dir, &info)?;
    debug!(exitcode = ?exit.code(), "child process finished");
    Ok(())
}

fn open_log(path: &Path) -> Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cores_required_resolves_negative_counts() {
        assert_eq!(cores_required_for(0, 4), 0);
        assert_eq!(cores_required_for(1, 4), 1);
        assert_eq!(cores_required_for(3, 4), 3);
        assert_eq!(cores_required_for(-1, 4), 4);
        assert_eq!(cores_required_for(-2, 4), 2);
        assert_eq!(cores_required_for(-4, 4), 1);
    }

    #[test]
    fn threads_required_scale_by_resolved_cores() {
        assert_eq!(threads_required_for(1, 1, 4), 1);
        assert_eq!(threads_required_for(2, 2, 4), 2);
        assert_eq!(threads_required_for(2, -1, 4), 2);
        assert_eq!(threads_required_for(-1, -1, 4), 4);
        assert_eq!(threads_required_for(-2, -1, 4), 8);
        assert_eq!(threads_required_for(-2, -2, 4), 4);
        assert_eq!(threads_required_for(-4, -1, 4), 16);
    }

    #[test]
    fn command_line_is_shell_split() {
        let job = Job::from_command_line("sh -c 'echo hello world'", "out").unwrap();
        assert_eq!(job.command(), ["sh", "-c", "echo hello world"]);
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(Job::new(vec![], "out").is_err());
        assert!(Job::from_command_line("", "out").is_err());
    }

    #[test]
    fn substitute_replaces_by_basename() {
        let mut job = Job::new(
            vec!["python".into(), "-c".into(), "print(1)".into()],
            "out",
        )
        .unwrap();
        job.substitute_in_command("python", "/opt/py/bin/python");
        assert_eq!(job.command()[0], "/opt/py/bin/python");
        assert_eq!(job.command()[1], "-c");
    }

    #[test]
    fn absent_info_file_means_not_started() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_info_in(dir.path()).status, JobStatus::NotStarted);
    }

    #[test]
    fn unparsable_info_file_means_running() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(INFO_FILE), b"{\"status\": \"runn").unwrap();
        assert_eq!(read_info_in(dir.path()).status, JobStatus::Running);
    }

    #[test]
    fn info_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let info = JobInfo {
            status: JobStatus::Done,
            pid: Some(42),
            start: "start".into(),
            end: "end".into(),
            exitcode: Some(0),
        };
        write_info_in(dir.path(), &info).unwrap();
        let read = read_info_in(dir.path());
        assert_eq!(read.status, JobStatus::Done);
        assert_eq!(read.pid, Some(42));
        assert_eq!(read.exitcode, Some(0));
    }

    #[test]
    fn status_serialises_with_spaces() {
        assert_eq!(
            serde_json::to_string(&JobStatus::NotStarted).unwrap(),
            "\"not started\""
        );
        assert_eq!(serde_json::to_string(&JobStatus::Done).unwrap(), "\"done\"");
    }

    #[test]
    fn spec_round_trips() {
        let job = Job::from_command_line("sleep 1", "out/dir")
            .unwrap()
            .cores(2)
            .threads(Some(-2))
            .env("FOO", "bar");
        let spec = job.spec();
        let json = serde_json::to_string(&spec).unwrap();
        let back = Job::from_spec(serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(back.command(), job.command());
        assert_eq!(back.n_core(), 2);
    }
}
