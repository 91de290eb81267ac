use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tch::nn::{self, OptimizerConfig};

use crate::{ExperimentError, Result};

/// Supported optimization algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    #[serde(rename = "SGD")]
    Sgd,
    Adam,
    AdamW,
    #[serde(rename = "RMSProp")]
    RmsProp,
}

impl FromStr for OptimizerKind {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sgd" => Ok(Self::Sgd),
            "adam" => Ok(Self::Adam),
            "adamw" => Ok(Self::AdamW),
            "rmsprop" => Ok(Self::RmsProp),
            other => Err(ExperimentError::Config(format!(
                "unknown optimizer '{}' (expected SGD, Adam, AdamW or RMSProp)",
                other
            ))),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sgd => "SGD",
            Self::Adam => "Adam",
            Self::AdamW => "AdamW",
            Self::RmsProp => "RMSProp",
        };
        f.write_str(name)
    }
}

/// Optimizer choice and hyper-parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfigs {
    pub optimizer: OptimizerKind,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// SGD / RMSProp momentum
    pub momentum: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub amsgrad: bool,
}

impl Default for OptimizerConfigs {
    fn default() -> Self {
        Self {
            optimizer: OptimizerKind::Adam,
            learning_rate: 0.01,
            weight_decay: 0.0,
            momentum: 0.5,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            amsgrad: false,
        }
    }
}

impl OptimizerConfigs {
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ExperimentError::Config(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.weight_decay < 0.0 || self.momentum < 0.0 || self.eps <= 0.0 {
            return Err(ExperimentError::Config(format!(
                "invalid optimizer settings: weight_decay={} momentum={} eps={}",
                self.weight_decay, self.momentum, self.eps
            )));
        }
        for beta in [self.beta1, self.beta2] {
            if !(0.0..1.0).contains(&beta) {
                return Err(ExperimentError::Config(format!(
                    "beta must lie in [0, 1), got {}",
                    beta
                )));
            }
        }
        Ok(())
    }

    /// Build an optimizer over every trainable variable of `vs`
    pub fn build(&self, vs: &nn::VarStore) -> Result<nn::Optimizer> {
        self.validate()?;
        let optimizer = match self.optimizer {
            OptimizerKind::Sgd => nn::Sgd {
                momentum: self.momentum,
                wd: self.weight_decay,
                ..Default::default()
            }
            .build(vs, self.learning_rate)?,
            OptimizerKind::Adam => nn::Adam {
                beta1: self.beta1,
                beta2: self.beta2,
                wd: self.weight_decay,
                eps: self.eps,
                amsgrad: self.amsgrad,
            }
            .build(vs, self.learning_rate)?,
            OptimizerKind::AdamW => nn::AdamW {
                beta1: self.beta1,
                beta2: self.beta2,
                wd: self.weight_decay,
                eps: self.eps,
                amsgrad: self.amsgrad,
            }
            .build(vs, self.learning_rate)?,
            OptimizerKind::RmsProp => nn::RmsProp {
                momentum: self.momentum,
                wd: self.weight_decay,
                eps: self.eps,
                ..Default::default()
            }
            .build(vs, self.learning_rate)?,
        };
        log::debug!(
            "{} optimizer built (lr={:.2e}, wd={})",
            self.optimizer,
            self.learning_rate,
            self.weight_decay
        );
        Ok(optimizer)
    }
}
