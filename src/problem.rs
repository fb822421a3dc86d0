//! User problems and the tasks that drive them.
//!
//! A [`Problem`] bundles a set of simulations (its cases) with the
//! post-processing that consumes their outputs. Problems materialise in
//! the task graph as [`SolveProblem`] nodes whose requirements come from
//! `get_requires`; [`RunAll`] fans out over a set of problem factories
//! with optional glob filtering of simulation names.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use globset::{Glob, GlobMatcher};

use crate::sim::Simulation;
use crate::task::{CommandTask, ConfigError, Task, TaskRef, lock_task, task_ref};

pub type SharedProblem = Arc<Mutex<dyn Problem + Send>>;

/// Builds a problem from the base simulation and output directories.
pub type ProblemFactory = Arc<dyn Fn(&Path, &Path) -> Result<SharedProblem> + Send + Sync>;

/// Wrap a concrete problem for sharing.
pub fn shared<P: Problem + 'static>(problem: P) -> SharedProblem {
    Arc::new(Mutex::new(problem))
}

/// Wrap a constructor as a [`ProblemFactory`].
pub fn problem_factory<P, F>(build: F) -> ProblemFactory
where
    P: Problem + 'static,
    F: Fn(&Path, &Path) -> P + Send + Sync + 'static,
{
    Arc::new(move |sim_dir: &Path, out_dir: &Path| Ok(shared(build(sim_dir, out_dir))))
}

/// State every problem carries: the base directories and its cases.
#[derive(Default)]
pub struct ProblemData {
    pub sim_dir: PathBuf,
    pub out_dir: PathBuf,
    pub cases: Vec<Arc<Simulation>>,
    pub(crate) case_filter: Option<GlobMatcher>,
    pub(crate) set_up: bool,
}

impl ProblemData {
    pub fn new(sim_dir: impl Into<PathBuf>, out_dir: impl Into<PathBuf>) -> Self {
        ProblemData {
            sim_dir: sim_dir.into(),
            out_dir: out_dir.into(),
            cases: Vec::new(),
            case_filter: None,
            set_up: false,
        }
    }
}

/// One element of a problem's requirements.
pub enum Requirement {
    /// A ready-made task.
    Task(TaskRef),
    /// Another problem instance, solved before this one.
    Problem(SharedProblem),
    /// A problem built from this problem's base directories.
    Factory(ProblemFactory),
}

impl std::fmt::Debug for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Requirement::Task(_) => write!(f, "Requirement::Task(..)"),
            Requirement::Problem(_) => write!(f, "Requirement::Problem(..)"),
            Requirement::Factory(_) => write!(f, "Requirement::Factory(..)"),
        }
    }
}

pub trait Problem: Send {
    fn name(&self) -> String;

    fn data(&self) -> &ProblemData;

    fn data_mut(&mut self) -> &mut ProblemData;

    /// Populate the cases. Called once, before requirements are resolved.
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Post-processing, run once every requirement is complete. Expected
    /// to produce artifacts under `output_path`.
    fn run(&mut self) -> Result<()>;

    /// Direct requirements. The default yields one command task per case,
    /// wiring case dependencies and honouring the active case filter.
    fn get_requires(&mut self) -> Result<Vec<(String, Requirement)>> {
        requires_from_cases(self.data())
    }

    /// This problem's simulation directory.
    fn simulation_dir(&self) -> PathBuf {
        self.data().sim_dir.join(self.name())
    }

    /// This problem's output directory.
    fn output_dir(&self) -> PathBuf {
        self.data().out_dir.join(self.name())
    }

    fn input_path(&self, rel: impl AsRef<Path>) -> PathBuf
    where
        Self: Sized,
    {
        self.simulation_dir().join(rel)
    }

    fn output_path(&self, rel: impl AsRef<Path>) -> PathBuf
    where
        Self: Sized,
    {
        self.output_dir().join(rel)
    }

    fn make_output_dir(&self) -> Result<()> {
        let dir = self.output_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|e| anyhow!("create output dir {}: {e}", dir.display()))
    }

    /// Remove this problem's outputs; simulation results are preserved.
    fn clean(&self) -> Result<()> {
        let dir = self.output_dir();
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .map_err(|e| anyhow!("remove output dir {}: {e}", dir.display()))?;
        }
        Ok(())
    }
}

pub(crate) fn lock_problem(
    problem: &SharedProblem,
) -> Result<MutexGuard<'_, dyn Problem + Send + 'static>> {
    problem.lock().map_err(move |_| anyhow!("problem lock poisoned"))
}

pub(crate) fn ensure_setup(problem: &mut dyn Problem) -> Result<()> {
    if !problem.data().set_up {
        problem.setup()?;
        problem.data_mut().set_up = true;
    }
    Ok(())
}

/// One command task per case, case `depends` wired through, filtered by
/// the active glob when one is set. Dependencies of a matched case are
/// kept even when they do not match themselves.
pub fn requires_from_cases(data: &ProblemData) -> Result<Vec<(String, Requirement)>> {
    let mut included: HashSet<String> = match &data.case_filter {
        None => data.cases.iter().map(|c| c.name().to_string()).collect(),
        Some(matcher) => data
            .cases
            .iter()
            .filter(|c| matcher.is_match(c.name()))
            .map(|c| c.name().to_string())
            .collect(),
    };

    // Pull in dependencies of included cases until stable.
    loop {
        let mut grew = false;
        for case in &data.cases {
            if included.contains(case.name()) {
                for dep in case.dependencies() {
                    if included.insert(dep.name().to_string()) {
                        grew = true;
                    }
                }
            }
        }
        if !grew {
            break;
        }
    }

    let mut tasks: HashMap<String, Arc<Mutex<CommandTask>>> = HashMap::new();
    let mut ordered = Vec::new();
    for case in &data.cases {
        if !included.contains(case.name()) {
            continue;
        }
        let task = Arc::new(Mutex::new(
            CommandTask::new(case.command_line(), case.root())
                .cores(case.n_core())
                .threads(case.n_thread()),
        ));
        tasks.insert(case.name().to_string(), task.clone());
        ordered.push(case.clone());
    }

    for case in &ordered {
        let task = &tasks[case.name()];
        for dep in case.dependencies() {
            let dep_task = tasks.get(dep.name()).ok_or_else(|| {
                ConfigError(format!(
                    "case {} depends on unknown case {}",
                    case.name(),
                    dep.name()
                ))
            })?;
            let dep_ref: TaskRef = dep_task.clone();
            task.lock()
                .map_err(|_| anyhow!("task lock poisoned"))?
                .add_depend(dep_ref);
        }
    }

    Ok(ordered
        .into_iter()
        .map(|case| {
            let task: TaskRef = tasks[case.name()].clone();
            (case.name().to_string(), Requirement::Task(task))
        })
        .collect())
}

/// Task that runs a problem's post-processing once its requirements are
/// complete.
pub struct SolveProblem {
    problem: SharedProblem,
    problem_name: String,
    out_dir: PathBuf,
    requires: Vec<TaskRef>,
}

impl SolveProblem {
    pub fn new(problem: SharedProblem) -> Result<Self> {
        SolveProblem::with_match(problem, None)
    }

    /// Resolve the problem's requirements, restricting case-derived tasks
    /// to simulation names matching `matcher` when one is given.
    pub fn with_match(problem: SharedProblem, matcher: Option<GlobMatcher>) -> Result<Self> {
        let (problem_name, out_dir, sim_base, out_base, raw_requires) = {
            let mut p = lock_problem(&problem)?;
            p.data_mut().case_filter = matcher;
            ensure_setup(&mut *p)?;
            let raw = p.get_requires()?;
            (
                p.name(),
                p.output_dir(),
                p.data().sim_dir.clone(),
                p.data().out_dir.clone(),
                raw,
            )
        };

        let mut requires = Vec::with_capacity(raw_requires.len());
        for (_name, requirement) in raw_requires {
            match requirement {
                Requirement::Task(task) => requires.push(task),
                Requirement::Problem(child) => {
                    requires.push(task_ref(SolveProblem::new(child)?));
                }
                Requirement::Factory(factory) => {
                    let child = factory(&sim_base, &out_base)?;
                    requires.push(task_ref(SolveProblem::new(child)?));
                }
            }
        }

        Ok(SolveProblem {
            problem,
            problem_name,
            out_dir,
            requires,
        })
    }

    pub fn problem(&self) -> &SharedProblem {
        &self.problem
    }
}

impl Task for SolveProblem {
    fn name(&self) -> String {
        format!("solve {}", self.problem_name)
    }

    fn complete(&mut self) -> Result<bool> {
        if !self.out_dir.exists() {
            return Ok(false);
        }
        for requirement in &self.requires {
            if !lock_task(requirement)?.complete()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn run(&mut self, _scheduler: &mut crate::scheduler::Scheduler) -> Result<()> {
        lock_problem(&self.problem)?.run()
    }

    fn output(&self) -> PathBuf {
        self.out_dir.clone()
    }

    fn requires(&self) -> Vec<TaskRef> {
        self.requires.clone()
    }
}

/// Fan-out task over a set of problem classes.
pub struct RunAll {
    out_dir: PathBuf,
    requires: Vec<TaskRef>,
}

impl RunAll {
    pub fn new(
        sim_dir: impl AsRef<Path>,
        out_dir: impl AsRef<Path>,
        problems: Vec<ProblemFactory>,
        match_pattern: Option<&str>,
        force: bool,
    ) -> Result<Self> {
        let sim_dir = sim_dir.as_ref();
        let out_dir = out_dir.as_ref();
        let matcher = match match_pattern {
            Some(pattern) => Some(
                Glob::new(pattern)
                    .map_err(|e| ConfigError(format!("bad match pattern {pattern}: {e}")))?
                    .compile_matcher(),
            ),
            None => None,
        };

        let mut requires = Vec::new();
        for factory in &problems {
            let problem = factory(sim_dir, out_dir)?;
            let skip = {
                let mut p = lock_problem(&problem)?;
                ensure_setup(&mut *p)?;
                if force {
                    p.clean()?;
                }
                // A problem with named cases and no match is left out
                // entirely; one without cases ignores the filter.
                match &matcher {
                    Some(m) => {
                        let cases = &p.data().cases;
                        !cases.is_empty() && !cases.iter().any(|c| m.is_match(c.name()))
                    }
                    None => false,
                }
            };
            if skip {
                continue;
            }
            requires.push(task_ref(SolveProblem::with_match(
                problem,
                matcher.clone(),
            )?));
        }

        Ok(RunAll {
            out_dir: out_dir.to_path_buf(),
            requires,
        })
    }
}

impl Task for RunAll {
    fn name(&self) -> String {
        "run_all".to_string()
    }

    fn complete(&mut self) -> Result<bool> {
        for requirement in &self.requires {
            if !lock_task(requirement)?.complete()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn run(&mut self, _scheduler: &mut crate::scheduler::Scheduler) -> Result<()> {
        // Pure fan-out; the work is in the requirements.
        Ok(())
    }

    fn output(&self) -> PathBuf {
        self.out_dir.clone()
    }

    fn requires(&self) -> Vec<TaskRef> {
        self.requires.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Toy {
        data: ProblemData,
    }

    impl Toy {
        fn new(sim_dir: &Path, out_dir: &Path) -> Self {
            Toy {
                data: ProblemData::new(sim_dir, out_dir),
            }
        }
    }

    impl Problem for Toy {
        fn name(&self) -> String {
            "toy".to_string()
        }

        fn data(&self) -> &ProblemData {
            &self.data
        }

        fn data_mut(&mut self) -> &mut ProblemData {
            &mut self.data
        }

        fn setup(&mut self) -> Result<()> {
            let first = Arc::new(Simulation::new(self.input_path("update_h"), "solver run"));
            let second = Arc::new(
                Simulation::new(self.input_path("no_update_h"), "solver run")
                    .depends(vec![first.clone()]),
            );
            self.data.cases = vec![first, second];
            Ok(())
        }

        fn run(&mut self) -> Result<()> {
            self.make_output_dir()
        }
    }

    fn set_up_toy() -> Toy {
        let mut toy = Toy::new(Path::new("sim"), Path::new("out"));
        ensure_setup(&mut toy).unwrap();
        toy
    }

    #[test]
    fn default_requires_covers_all_cases() {
        let toy = set_up_toy();
        let requires = requires_from_cases(toy.data()).unwrap();
        assert_eq!(requires.len(), 2);
        assert_eq!(requires[0].0, "update_h");
        assert_eq!(requires[1].0, "no_update_h");
    }

    #[test]
    fn case_dependencies_are_wired_into_tasks() {
        let toy = set_up_toy();
        let requires = requires_from_cases(toy.data()).unwrap();
        let Requirement::Task(second) = &requires[1].1 else {
            panic!("expected a task requirement");
        };
        assert_eq!(lock_task(second).unwrap().requires().len(), 1);
    }

    #[test]
    fn filter_keeps_dependencies_of_matched_cases() {
        let mut toy = set_up_toy();
        toy.data_mut().case_filter =
            Some(Glob::new("*no_up*").unwrap().compile_matcher());
        let requires = requires_from_cases(toy.data()).unwrap();
        // no_update_h matches; update_h rides along as its dependency.
        assert_eq!(requires.len(), 2);
    }

    #[test]
    fn problem_directories_are_name_scoped() {
        let toy = set_up_toy();
        assert_eq!(toy.simulation_dir(), PathBuf::from("sim/toy"));
        assert_eq!(toy.output_path("result.txt"), PathBuf::from("out/toy/result.txt"));
    }

    #[test]
    fn unknown_case_dependency_is_a_config_error() {
        let orphan = Arc::new(Simulation::new("sim/elsewhere", "solver"));
        let case = Arc::new(Simulation::new("sim/here", "solver").depends(vec![orphan]));
        let mut data = ProblemData::new("sim", "out");
        data.cases = vec![case];
        let err = requires_from_cases(&data).unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }
}
