//! Experiment configuration
//!
//! Values are resolved in layers: defaults, an optional JSON file, then
//! `key=value` overrides using dotted keys for nested sections
//! (`optimizer.learning_rate`, `augment.flip`, ...).

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tch::Device;

use crate::data::AugmentConfig;
use crate::neural::model::{ModelConfig, VGG_STAGES};
use crate::training::optimizer::OptimizerConfigs;
use crate::{ExperimentError, Result};

/// Configuration of one CIFAR-10 group-norm run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configs {
    /// Number of group-norm groups; must divide every stage's channel count
    pub groups: i64,
    pub norm_eps: f64,
    /// Channel counts of the convolution stages
    pub stages: Vec<Vec<i64>>,
    pub epochs: usize,
    pub train_batch_size: i64,
    pub valid_batch_size: i64,
    pub seed: i64,
    /// `auto`, `cpu`, `cuda` or `cuda:N`
    pub device: String,
    pub data_dir: PathBuf,
    /// Training batches between progress lines
    pub log_interval: usize,
    /// Epochs between checkpoints (0 = only after the last epoch)
    pub save_every: usize,
    pub optimizer: OptimizerConfigs,
    pub augment: AugmentConfig,
}

impl Default for Configs {
    fn default() -> Self {
        Self {
            groups: 16,
            norm_eps: 1e-5,
            stages: VGG_STAGES.iter().map(|stage| stage.to_vec()).collect(),
            epochs: 10,
            train_batch_size: 64,
            valid_batch_size: 256,
            seed: 5,
            device: "auto".to_string(),
            data_dir: PathBuf::from("data/cifar10"),
            log_interval: 100,
            save_every: 1,
            optimizer: OptimizerConfigs::default(),
            augment: AugmentConfig::default(),
        }
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| invalid_value(key, value, e))
}

fn invalid_value(key: &str, value: &str, e: impl Display) -> ExperimentError {
    ExperimentError::Config(format!("invalid value '{}' for '{}': {}", value, key, e))
}

impl Configs {
    /// Read a (possibly partial) configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Override a single value by its dotted key
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "groups" => self.groups = parse(key, value)?,
            "norm_eps" => self.norm_eps = parse(key, value)?,
            "stages" => {
                self.stages =
                    serde_json::from_str(value).map_err(|e| invalid_value(key, value, e))?
            }
            "epochs" => self.epochs = parse(key, value)?,
            "train_batch_size" => self.train_batch_size = parse(key, value)?,
            "valid_batch_size" => self.valid_batch_size = parse(key, value)?,
            "seed" => self.seed = parse(key, value)?,
            "device" => self.device = value.trim().to_string(),
            "data_dir" => self.data_dir = PathBuf::from(value),
            "log_interval" => self.log_interval = parse(key, value)?,
            "save_every" => self.save_every = parse(key, value)?,
            "optimizer.optimizer" => self.optimizer.optimizer = value.trim().parse()?,
            "optimizer.learning_rate" => self.optimizer.learning_rate = parse(key, value)?,
            "optimizer.weight_decay" => self.optimizer.weight_decay = parse(key, value)?,
            "optimizer.momentum" => self.optimizer.momentum = parse(key, value)?,
            "optimizer.beta1" => self.optimizer.beta1 = parse(key, value)?,
            "optimizer.beta2" => self.optimizer.beta2 = parse(key, value)?,
            "optimizer.eps" => self.optimizer.eps = parse(key, value)?,
            "optimizer.amsgrad" => self.optimizer.amsgrad = parse(key, value)?,
            "augment.flip" => self.augment.flip = parse(key, value)?,
            "augment.crop_padding" => self.augment.crop_padding = parse(key, value)?,
            "augment.cutout" => self.augment.cutout = parse(key, value)?,
            _ => {
                return Err(ExperimentError::Config(format!(
                    "unknown configuration key '{}'",
                    key
                )))
            }
        }
        Ok(())
    }

    pub fn apply_overrides<K, V>(&mut self, overrides: &[(K, V)]) -> Result<()>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in overrides {
            self.set(key.as_ref(), value.as_ref())?;
            log::debug!("config override {} = {}", key.as_ref(), value.as_ref());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.groups <= 0 {
            return Err(ExperimentError::Config(format!(
                "groups must be positive, got {}",
                self.groups
            )));
        }
        if self.stages.is_empty() || self.stages.iter().any(|stage| stage.is_empty()) {
            return Err(ExperimentError::Config("stages must be non-empty".to_string()));
        }
        let indivisible = self
            .stages
            .iter()
            .flatten()
            .find(|&&c| c <= 0 || c % self.groups != 0);
        if let Some(&channels) = indivisible {
            return Err(ExperimentError::Config(format!(
                "number of channels ({}) must be divisible by the number of groups ({})",
                channels, self.groups
            )));
        }
        if !(self.norm_eps.is_finite() && self.norm_eps > 0.0) {
            return Err(ExperimentError::Config(format!(
                "norm_eps must be positive, got {}",
                self.norm_eps
            )));
        }
        if self.epochs == 0 || self.train_batch_size <= 0 || self.valid_batch_size <= 0 {
            return Err(ExperimentError::Config(format!(
                "epochs and batch sizes must be positive (epochs={}, train={}, valid={})",
                self.epochs, self.train_batch_size, self.valid_batch_size
            )));
        }
        if self.augment.crop_padding < 0 || self.augment.cutout < 0 {
            return Err(ExperimentError::Config(
                "augmentation sizes cannot be negative".to_string(),
            ));
        }
        self.optimizer.validate()?;
        parse_device(&self.device)?;
        Ok(())
    }

    pub fn device(&self) -> Result<Device> {
        parse_device(&self.device)
    }

    /// Model architecture for images of `in_channels × image_size × image_size`
    pub fn model_config(&self, in_channels: i64, image_size: i64, num_classes: i64) -> ModelConfig {
        ModelConfig {
            in_channels,
            image_size,
            stages: self.stages.clone(),
            groups: self.groups,
            norm_eps: self.norm_eps,
            num_classes,
        }
    }
}

fn parse_device(device: &str) -> Result<Device> {
    let device = device.trim().to_ascii_lowercase();
    let requested = match device.as_str() {
        "auto" => return Ok(Device::cuda_if_available()),
        "cpu" => return Ok(Device::Cpu),
        "cuda" => 0,
        other => match other.strip_prefix("cuda:") {
            Some(index) => parse::<usize>("device", index)?,
            None => {
                return Err(ExperimentError::Config(format!(
                    "unknown device '{}' (expected auto, cpu, cuda or cuda:N)",
                    other
                )))
            }
        },
    };
    if requested >= tch::Cuda::device_count() as usize {
        return Err(ExperimentError::Config(format!("CUDA device {} is not available", requested)));
    }
    Ok(Device::Cuda(requested))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::training::optimizer::OptimizerKind;

    #[test]
    fn test_defaults_match_group_norm_experiment() {
        let configs = Configs::default();
        assert_eq!(configs.groups, 16);
        assert_eq!(configs.stages.len(), 5);
        assert_eq!(configs.optimizer.optimizer, OptimizerKind::Adam);
        assert!(configs.validate().is_ok());
    }

    #[test]
    fn test_dotted_overrides() {
        let mut configs = Configs::default();
        configs
            .apply_overrides(&[
                ("optimizer.optimizer", "Adam"),
                ("optimizer.learning_rate", "2.5e-4"),
                ("groups", "32"),
                ("augment.flip", "false"),
                ("stages", "[[32, 32], [64]]"),
            ])
            .unwrap();

        assert_eq!(configs.optimizer.learning_rate, 2.5e-4);
        assert_eq!(configs.groups, 32);
        assert!(!configs.augment.flip);
        assert_eq!(configs.stages, vec![vec![32, 32], vec![64]]);
    }

    #[test]
    fn test_unknown_key_and_bad_value_rejected() {
        let mut configs = Configs::default();
        assert_matches!(configs.set("optimiser.lr", "1e-3"), Err(ExperimentError::Config(_)));
        assert_matches!(configs.set("epochs", "ten"), Err(ExperimentError::Config(_)));
        assert_matches!(
            configs.set("optimizer.optimizer", "lbfgs"),
            Err(ExperimentError::Config(_))
        );
        assert_eq!(configs, Configs::default());
    }

    #[test]
    fn test_indivisible_groups_fail_validation() {
        let mut configs = Configs::default();
        configs.set("groups", "48").unwrap();
        assert_matches!(configs.validate(), Err(ExperimentError::Config(_)));
    }

    #[test]
    fn test_device_parsing() {
        assert_eq!(parse_device("cpu").unwrap(), Device::Cpu);
        assert_eq!(parse_device(" CPU ").unwrap(), Device::Cpu);
        assert!(parse_device("auto").is_ok());
        assert_matches!(parse_device("tpu"), Err(ExperimentError::Config(_)));
        assert_matches!(parse_device("cuda:x"), Err(ExperimentError::Config(_)));
    }

    #[test]
    fn test_partial_json_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("configs.json");
        fs::write(&path, r#"{ "epochs": 3, "optimizer": { "optimizer": "SGD" } }"#).unwrap();

        let configs = Configs::from_json_file(&path).unwrap();
        assert_eq!(configs.epochs, 3);
        assert_eq!(configs.optimizer.optimizer, OptimizerKind::Sgd);
        assert_eq!(configs.optimizer.momentum, 0.5);
        assert_eq!(configs.groups, 16);
    }

    #[test]
    fn test_json_round_trip() {
        let mut configs = Configs::default();
        configs.set("seed", "42").unwrap();
        let parsed: Configs = serde_json::from_str(&configs.to_json().unwrap()).unwrap();
        assert_eq!(parsed, configs);
    }
}
