//! The cluster configuration file.
//!
//! `config.json` in the project directory records the worker machines and
//! the remote filesystem layout: each added host gets
//! `<home>/<root>/envs/<project>/bin/expman` as its helper binary and
//! `<home>/<root>/<project>` as its synced working directory. Installing
//! the binary and syncing the sources onto the host is done out of band;
//! this module only records and consumes the layout.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::scheduler::WorkerConfig;

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Root directory on worker homes holding environments and projects.
    pub root: String,
    pub project_name: String,
    /// Source trees synced to each worker.
    #[serde(default)]
    pub sources: Vec<PathBuf>,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

impl ClusterConfig {
    /// A fresh configuration: localhost only, project named after the
    /// current directory.
    pub fn defaults() -> Result<Self> {
        let cwd = std::env::current_dir().context("resolve current dir")?;
        let project_name = cwd
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());
        Ok(ClusterConfig {
            root: "expman".to_string(),
            project_name,
            sources: vec![cwd],
            workers: vec![WorkerConfig::localhost()],
        })
    }

    /// Read the config, writing the defaults first if there is none yet.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw =
                std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
            serde_json::from_slice(&raw)
                .with_context(|| format!("parse {}", path.display()))
        } else {
            let config = ClusterConfig::defaults()?;
            config.save(path)?;
            info!(path = %path.display(), "wrote initial cluster config");
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("write {}", path.display()))
    }

    /// Register a worker host, deriving its remote layout.
    pub fn add_worker(&mut self, host: &str, home: Option<&str>, nfs: bool) {
        let home = home.unwrap_or("~");
        let exe = format!(
            "{home}/{root}/envs/{project}/bin/expman",
            root = self.root,
            project = self.project_name
        );
        let chdir = format!(
            "{home}/{root}/{project}",
            root = self.root,
            project = self.project_name
        );
        self.workers.push(WorkerConfig {
            host: host.to_string(),
            exe: Some(exe),
            home: Some(home.to_string()),
            chdir: Some(PathBuf::from(chdir)),
            nfs,
            testing: false,
            cores: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClusterConfig {
        ClusterConfig {
            root: "expman".to_string(),
            project_name: "cavity".to_string(),
            sources: vec![],
            workers: vec![WorkerConfig::localhost()],
        }
    }

    #[test]
    fn add_worker_derives_the_remote_layout() {
        let mut c = config();
        c.add_worker("beefy", Some("/home/me"), true);
        let w = &c.workers[1];
        assert_eq!(w.host, "beefy");
        assert_eq!(
            w.exe.as_deref(),
            Some("/home/me/expman/envs/cavity/bin/expman")
        );
        assert_eq!(w.chdir, Some(PathBuf::from("/home/me/expman/cavity")));
        assert!(w.nfs);
    }

    #[test]
    fn config_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut c = config();
        c.add_worker("beefy", None, false);
        c.save(&path).unwrap();
        let back = ClusterConfig::load_or_create(&path).unwrap();
        assert_eq!(back.project_name, "cavity");
        assert_eq!(back.workers.len(), 2);
        assert_eq!(back.workers[1].home.as_deref(), Some("~"));
    }
}
