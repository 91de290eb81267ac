//! Experiment runs
//!
//! A run owns a directory `<log_root>/<name>/<run_id>` holding:
//!
//! - `run.json`: name, comment, run id and creation time
//! - `configs.json`: the resolved configuration
//! - `metrics.csv`: one row per epoch
//! - `checkpoints/epoch_NNNN.safetensors`
//! - the log files of the run

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use uuid::Uuid;

use crate::training::config::Configs;
use crate::{ExperimentError, Result};

const RUN_FILE: &str = "run.json";
const CONFIGS_FILE: &str = "configs.json";
const METRICS_FILE: &str = "metrics.csv";
const CHECKPOINT_DIR: &str = "checkpoints";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunInfo {
    name: String,
    comment: String,
    run_id: String,
    created: DateTime<Local>,
}

#[derive(Debug)]
pub struct Experiment {
    info: RunInfo,
    run_dir: PathBuf,
}

impl Experiment {
    /// Start a new run under `log_root`
    pub fn create(name: &str, comment: &str, log_root: impl AsRef<Path>) -> Result<Self> {
        let run_id = Uuid::new_v4().simple().to_string();
        let run_dir = log_root.as_ref().join(name).join(&run_id);
        fs::create_dir_all(run_dir.join(CHECKPOINT_DIR))?;

        let info = RunInfo {
            name: name.to_string(),
            comment: comment.to_string(),
            run_id,
            created: Local::now(),
        };
        fs::write(run_dir.join(RUN_FILE), serde_json::to_string_pretty(&info)?)?;

        Ok(Self { info, run_dir })
    }

    /// Reopen the run stored in `run_dir`
    pub fn resume(run_dir: impl AsRef<Path>) -> Result<Self> {
        let run_dir = run_dir.as_ref().to_path_buf();
        let run_file = run_dir.join(RUN_FILE);
        if !run_file.is_file() {
            return Err(ExperimentError::Config(format!(
                "{} is not a run directory (no {})",
                run_dir.display(),
                RUN_FILE
            )));
        }
        let info: RunInfo = serde_json::from_str(&fs::read_to_string(run_file)?)?;
        fs::create_dir_all(run_dir.join(CHECKPOINT_DIR))?;
        Ok(Self { info, run_dir })
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn comment(&self) -> &str {
        &self.info.comment
    }

    pub fn run_id(&self) -> &str {
        &self.info.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.run_dir.join(METRICS_FILE)
    }

    pub fn checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.run_dir
            .join(CHECKPOINT_DIR)
            .join(format!("epoch_{:04}.safetensors", epoch))
    }

    /// Apply `overrides`, validate, and record the resolved configuration
    pub fn configs<K, V>(&self, configs: &mut Configs, overrides: &[(K, V)]) -> Result<()>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        configs.apply_overrides(overrides)?;
        configs.validate()?;
        fs::write(self.run_dir.join(CONFIGS_FILE), configs.to_json()?)?;
        log::debug!("Configuration written to {}", self.run_dir.join(CONFIGS_FILE).display());
        Ok(())
    }

    /// Configuration recorded by an earlier `configs` call, if any
    pub fn saved_configs(&self) -> Result<Option<Configs>> {
        let path = self.run_dir.join(CONFIGS_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        Configs::from_json_file(path).map(Some)
    }

    /// Highest-epoch checkpoint of this run
    pub fn latest_checkpoint(&self) -> Result<Option<(usize, PathBuf)>> {
        let dir = self.run_dir.join(CHECKPOINT_DIR);
        let pattern = format!(
            "{}/epoch_*.safetensors",
            glob::Pattern::escape(&dir.to_string_lossy())
        );
        let entries = glob::glob(&pattern)
            .map_err(|e| ExperimentError::Checkpoint(format!("bad checkpoint pattern: {}", e)))?;

        let mut latest: Option<(usize, PathBuf)> = None;
        for entry in entries {
            let path = entry.map_err(|e| ExperimentError::Checkpoint(e.to_string()))?;
            let epoch = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.strip_prefix("epoch_"))
                .and_then(|digits| digits.parse::<usize>().ok());
            match epoch {
                Some(epoch) if latest.as_ref().map_or(true, |(best, _)| epoch > *best) => {
                    latest = Some((epoch, path));
                }
                Some(_) => {}
                None => log::warn!("⚠️ Ignoring unrecognised checkpoint {}", path.display()),
            }
        }
        Ok(latest)
    }

    /// Mark the run as started; the guard logs the run time when dropped
    pub fn start(&self) -> Result<RunGuard<'_>> {
        log::info!(
            "🚀 Experiment {} ({}) run {} started, created {}",
            self.info.name,
            self.info.comment,
            self.info.run_id,
            self.info.created.format("%Y-%m-%d %H:%M:%S")
        );
        log::info!("📁 Run directory: {}", self.run_dir.display());
        Ok(RunGuard {
            experiment: self,
            started: Instant::now(),
        })
    }
}

pub struct RunGuard<'a> {
    experiment: &'a Experiment,
    started: Instant,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        log::info!(
            "🏁 Run {} finished after {:.1}s",
            self.experiment.run_id(),
            self.started.elapsed().as_secs_f64()
        );
    }
}
