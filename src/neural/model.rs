use tch::{nn, Tensor};

use crate::neural::group_norm::{GroupNorm, GroupNormConfig};
use crate::{ExperimentError, Result};

/// Channel counts per stage; every stage ends with a 2×2 max-pool.
pub const VGG_STAGES: &[&[i64]] = &[
    &[64, 64],
    &[128, 128],
    &[256, 256, 256],
    &[512, 512, 512],
    &[512, 512, 512],
];

/// Architecture of [`GroupNormVgg`]
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub in_channels: i64,
    /// Height and width of the (square) input images
    pub image_size: i64,
    pub stages: Vec<Vec<i64>>,
    pub groups: i64,
    pub norm_eps: f64,
    pub num_classes: i64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            image_size: 32,
            stages: VGG_STAGES.iter().map(|stage| stage.to_vec()).collect(),
            groups: 32,
            norm_eps: 1e-5,
            num_classes: 10,
        }
    }
}

impl ModelConfig {
    fn validate(&self) -> Result<()> {
        if self.stages.is_empty() || self.stages.iter().any(|stage| stage.is_empty()) {
            return Err(ExperimentError::Config(
                "model needs at least one stage and no empty stages".to_string(),
            ));
        }
        if self.in_channels <= 0 || self.num_classes <= 0 {
            return Err(ExperimentError::Config(format!(
                "invalid model dims: in_channels={} num_classes={}",
                self.in_channels, self.num_classes
            )));
        }
        // each stage halves the side, so it needs one factor of two per stage
        let halvings = self.image_size.trailing_zeros() as usize;
        if self.image_size <= 0 || halvings < self.stages.len() {
            return Err(ExperimentError::Config(format!(
                "image size {} cannot be max-pooled {} times",
                self.image_size,
                self.stages.len()
            )));
        }
        Ok(())
    }

    /// Spatial side length after the last pooling stage
    pub fn final_size(&self) -> i64 {
        self.image_size >> self.stages.len()
    }
}

/// 3×3 convolution followed by group norm and ReLU
#[derive(Debug)]
struct ConvBlock {
    conv: nn::Conv2D,
    norm: GroupNorm,
}

impl ConvBlock {
    fn new(
        path: &nn::Path,
        channels_in: i64,
        channels_out: i64,
        config: &ModelConfig,
    ) -> Result<Self> {
        let conv = nn::conv2d(
            path / "conv",
            channels_in,
            channels_out,
            3,
            nn::ConvConfig {
                padding: 1,
                ..Default::default()
            },
        );
        let norm = GroupNorm::new(
            path / "norm",
            config.groups,
            channels_out,
            GroupNormConfig {
                eps: config.norm_eps,
                ..Default::default()
            },
        )?;
        Ok(Self { conv, norm })
    }

    fn forward(&self, x: &Tensor) -> Tensor {
        x.apply(&self.conv).apply(&self.norm).relu()
    }
}

/// VGG-style classifier using group normalization after every convolution
#[derive(Debug)]
pub struct GroupNormVgg {
    config: ModelConfig,
    stages: Vec<Vec<ConvBlock>>,
    fc: nn::Linear,
}

impl GroupNormVgg {
    pub fn new(path: &nn::Path, config: ModelConfig) -> Result<Self> {
        config.validate()?;

        let mut stages = Vec::with_capacity(config.stages.len());
        let mut in_channels = config.in_channels;
        for (stage_idx, stage) in config.stages.iter().enumerate() {
            let mut blocks = Vec::with_capacity(stage.len());
            for (block_idx, &out_channels) in stage.iter().enumerate() {
                let block_path = path / format!("stage_{stage_idx}") / format!("block_{block_idx}");
                blocks.push(ConvBlock::new(&block_path, in_channels, out_channels, &config)?);
                in_channels = out_channels;
            }
            stages.push(blocks);
        }

        let final_size = config.final_size();
        let flatten_size = in_channels * final_size * final_size;
        log::debug!(
            "GroupNormVgg flatten_size: {} (channels={}, spatial={}x{})",
            flatten_size,
            in_channels,
            final_size,
            final_size
        );
        let fc = nn::linear(path / "fc", flatten_size, config.num_classes, Default::default());

        Ok(Self { config, stages, fc })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }
}

impl nn::ModuleT for GroupNormVgg {
    /// Logits of shape `(N, num_classes)`. Group norm has no running
    /// statistics, so `train` does not change the result.
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Tensor {
        let mut h = xs.shallow_clone();
        for stage in &self.stages {
            for block in stage {
                h = block.forward(&h);
            }
            h = h.max_pool2d_default(2);
        }
        h = h.avg_pool2d_default(1);

        let batch = h.size()[0];
        h.view([batch, -1]).apply(&self.fc)
    }
}

/// Number of scalar trainable parameters in a var store
pub fn parameter_count(vs: &nn::VarStore) -> i64 {
    vs.trainable_variables().iter().map(|t| t.numel() as i64).sum()
}
