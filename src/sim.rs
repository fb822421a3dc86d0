//! Parameterised simulations.
//!
//! A [`Simulation`] describes one invocation of the user's solver: a base
//! command, an ordered set of command-line parameters, and an output
//! directory (its `root`) that encodes which case it is. Problems collect
//! simulations as their cases; at scheduling time each one flattens into a
//! [`crate::task::CommandTask`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

/// One parameterised run of an external command.
#[derive(Debug, Clone)]
pub struct Simulation {
    root: PathBuf,
    base_command: String,
    name: String,
    n_core: i32,
    n_thread: Option<i32>,
    params: Vec<(String, Value)>,
    depends: Vec<Arc<Simulation>>,
    out_dir: Option<PathBuf>,
}

impl Simulation {
    /// A simulation writing under `root`. The name defaults to the
    /// basename of `root`.
    pub fn new(root: impl Into<PathBuf>, base_command: impl Into<String>) -> Self {
        let root = root.into();
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Simulation {
            root,
            base_command: base_command.into(),
            name,
            n_core: 1,
            n_thread: Some(1),
            params: Vec::new(),
            depends: Vec::new(),
            out_dir: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn cores(mut self, n_core: i32) -> Self {
        self.n_core = n_core;
        self
    }

    pub fn threads(mut self, n_thread: Option<i32>) -> Self {
        self.n_thread = n_thread;
        self
    }

    /// Add a `--key value` parameter. Parameters render in insertion order.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Add a bare `--key` flag.
    pub fn flag(mut self, key: impl Into<String>) -> Self {
        self.params.push((key.into(), Value::Null));
        self
    }

    /// Declare that other simulations of the same problem must finish first.
    pub fn depends(mut self, depends: Vec<Arc<Simulation>>) -> Self {
        self.depends = depends;
        self
    }

    /// The directory post-processing output goes under, normally the
    /// problem's output directory.
    pub fn output_root(mut self, out_dir: impl Into<PathBuf>) -> Self {
        self.out_dir = Some(out_dir.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn n_core(&self) -> i32 {
        self.n_core
    }

    pub fn n_thread(&self) -> Option<i32> {
        self.n_thread
    }

    pub fn params(&self) -> &[(String, Value)] {
        &self.params
    }

    pub fn get_param(&self, key: &str) -> Option<&Value> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn dependencies(&self) -> &[Arc<Simulation>] {
        &self.depends
    }

    /// The full command line: base command, rendered parameters, and the
    /// output directory.
    pub fn command_line(&self) -> String {
        let mut cmd = self.base_command.clone();
        for (key, value) in &self.params {
            match value {
                Value::Null => {
                    cmd.push_str(&format!(" --{key}"));
                }
                other => {
                    cmd.push_str(&format!(" --{key} {}", render_value(other)));
                }
            }
        }
        cmd.push_str(&format!(" --output-dir {}", self.root.display()));
        cmd
    }

    pub fn input_path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.root.join(rel)
    }

    pub fn output_path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.out_dir.as_ref().unwrap_or(&self.root).join(rel)
    }

    /// Plot label built from the given parameter keys: `key=value` pairs,
    /// bare keys for flags.
    pub fn get_labels(&self, keys: &[&str]) -> String {
        keys.iter()
            .filter_map(|key| {
                self.get_param(key).map(|value| match value {
                    Value::Null => key.to_string(),
                    other => format!("{key}={}", render_value(other)),
                })
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub(crate) fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
