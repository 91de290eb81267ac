//! Training-time image augmentation
//!
//! Random horizontal flips, random crops from a padded image and optional
//! cutout, applied independently to every image of a training batch.
//! Validation batches are never augmented.

use serde::{Deserialize, Serialize};
use tch::Tensor;

/// Which augmentations to apply to training batches
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    /// Flip each image horizontally with probability 1/2
    pub flip: bool,
    /// Pad by this many pixels and crop back to the original size at a random offset (0 = off)
    pub crop_padding: i64,
    /// Side of a random square zeroed out in each image (0 = off)
    pub cutout: i64,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            flip: true,
            crop_padding: 4,
            cutout: 0,
        }
    }
}

impl AugmentConfig {
    /// No augmentation at all
    pub fn none() -> Self {
        Self {
            flip: false,
            crop_padding: 0,
            cutout: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.flip || self.crop_padding > 0 || self.cutout > 0
    }

    /// Augment a `(N, C, H, W)` batch; the shape is preserved
    pub fn apply(&self, images: &Tensor) -> Tensor {
        if !self.is_enabled() {
            return images.shallow_clone();
        }
        tch::no_grad(|| {
            tch::vision::dataset::augmentation(images, self.flip, self.crop_padding, self.cutout)
        })
    }
}
