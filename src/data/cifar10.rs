//! CIFAR-10 dataset
//!
//! Images are kept on the host as `(N, 3, 32, 32)` float tensors, already
//! normalized per channel; labels are `(N,)` int64 class indices.

use std::path::Path;
use tch::data::Iter2;
use tch::{Device, Kind, Tensor};

use crate::{ExperimentError, Result};

pub const CIFAR10_CLASSES: [&str; 10] = [
    "airplane", "automobile", "bird", "cat", "deer", "dog", "frog", "horse", "ship", "truck",
];

/// Per-channel normalization constants mapping [0, 1] pixels to [-1, 1]
pub const CIFAR10_MEAN: [f64; 3] = [0.5, 0.5, 0.5];
pub const CIFAR10_STD: [f64; 3] = [0.5, 0.5, 0.5];

/// Train and validation splits of an image classification dataset
#[derive(Debug)]
pub struct ImageDataset {
    pub train_images: Tensor,
    pub train_labels: Tensor,
    pub valid_images: Tensor,
    pub valid_labels: Tensor,
    pub num_classes: i64,
}

impl ImageDataset {
    /// Load the CIFAR-10 binary batches (`data_batch_{1..5}.bin`, `test_batch.bin`)
    pub fn load_cifar10(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(ExperimentError::Data(format!(
                "CIFAR-10 directory {} not found \
                 (expected the binary version: data_batch_1.bin .. test_batch.bin)",
                dir.display()
            )));
        }

        log::info!("📂 Loading CIFAR-10 from {}", dir.display());
        let raw = tch::vision::cifar::load_dir(dir)
            .map_err(|e| ExperimentError::Data(format!("{}: {}", dir.display(), e)))?;

        let dataset = Self::from_tensors(
            normalize(&raw.train_images, &CIFAR10_MEAN, &CIFAR10_STD)?,
            raw.train_labels,
            normalize(&raw.test_images, &CIFAR10_MEAN, &CIFAR10_STD)?,
            raw.test_labels,
            CIFAR10_CLASSES.len() as i64,
        )?;
        log::info!(
            "✅ CIFAR-10 loaded: {} train / {} valid images",
            dataset.train_len(),
            dataset.valid_len()
        );
        Ok(dataset)
    }

    /// Build a dataset from in-memory tensors, checking their layout
    pub fn from_tensors(
        train_images: Tensor,
        train_labels: Tensor,
        valid_images: Tensor,
        valid_labels: Tensor,
        num_classes: i64,
    ) -> Result<Self> {
        check_split("train", &train_images, &train_labels)?;
        check_split("valid", &valid_images, &valid_labels)?;
        if train_images.size()[1..] != valid_images.size()[1..] {
            return Err(ExperimentError::Data(format!(
                "train images {:?} and valid images {:?} differ in layout",
                train_images.size(),
                valid_images.size()
            )));
        }
        if num_classes <= 0 {
            return Err(ExperimentError::Data(format!("invalid class count {}", num_classes)));
        }

        Ok(Self {
            train_images: train_images.to_kind(Kind::Float),
            train_labels: train_labels.to_kind(Kind::Int64),
            valid_images: valid_images.to_kind(Kind::Float),
            valid_labels: valid_labels.to_kind(Kind::Int64),
            num_classes,
        })
    }

    pub fn train_len(&self) -> i64 {
        self.train_images.size()[0]
    }

    pub fn valid_len(&self) -> i64 {
        self.valid_images.size()[0]
    }

    /// (channels, height, width) of one image
    pub fn image_dim(&self) -> (i64, i64, i64) {
        let size = self.train_images.size();
        (size[1], size[2], size[3])
    }

    /// Shuffled training batches, the last one possibly smaller
    pub fn train_iter(&self, batch_size: i64, device: Device) -> Iter2 {
        let mut iter = Iter2::new(&self.train_images, &self.train_labels, batch_size);
        iter.shuffle().to_device(device).return_smaller_last_batch();
        iter
    }

    /// Validation batches in dataset order
    pub fn valid_iter(&self, batch_size: i64, device: Device) -> Iter2 {
        let mut iter = Iter2::new(&self.valid_images, &self.valid_labels, batch_size);
        iter.to_device(device).return_smaller_last_batch();
        iter
    }
}

fn check_split(split: &str, images: &Tensor, labels: &Tensor) -> Result<()> {
    let image_size = images.size();
    let label_size = labels.size();
    if image_size.len() != 4 {
        return Err(ExperimentError::Data(format!(
            "{} images must be (N, C, H, W), got {:?}",
            split, image_size
        )));
    }
    if label_size.len() != 1 || label_size[0] != image_size[0] {
        return Err(ExperimentError::Data(format!(
            "{} labels {:?} do not match {} images",
            split, label_size, image_size[0]
        )));
    }
    if image_size[0] == 0 {
        return Err(ExperimentError::Data(format!("{} split is empty", split)));
    }
    Ok(())
}

/// `(x - mean[c]) / std[c]` for every channel `c` of an `(N, C, H, W)` tensor
pub fn normalize(images: &Tensor, mean: &[f64], std: &[f64]) -> Result<Tensor> {
    let channels = images.size().get(1).copied().unwrap_or(0);
    if mean.len() as i64 != channels || std.len() as i64 != channels {
        return Err(ExperimentError::Data(format!(
            "normalization has {} means / {} stds for {} channels",
            mean.len(),
            std.len(),
            channels
        )));
    }
    let kind = images.kind();
    let mean = Tensor::from_slice(mean).to_kind(kind).view([1, channels, 1, 1]);
    let std = Tensor::from_slice(std).to_kind(kind).view([1, channels, 1, 1]);
    Ok((images - mean) / std)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tch::kind::FLOAT_CPU;

    use super::*;

    fn synthetic(train: i64, valid: i64) -> ImageDataset {
        ImageDataset::from_tensors(
            Tensor::rand(&[train, 3, 8, 8], FLOAT_CPU),
            Tensor::randint(10, &[train], (Kind::Int64, Device::Cpu)),
            Tensor::rand(&[valid, 3, 8, 8], FLOAT_CPU),
            Tensor::randint(10, &[valid], (Kind::Int64, Device::Cpu)),
            10,
        )
        .unwrap()
    }

    #[test]
    fn test_normalize_maps_unit_range_to_symmetric() {
        let images = Tensor::cat(
            &[
                Tensor::zeros(&[1, 3, 2, 2], FLOAT_CPU),
                Tensor::ones(&[1, 3, 2, 2], FLOAT_CPU),
            ],
            0,
        );
        let normalized = normalize(&images, &CIFAR10_MEAN, &CIFAR10_STD).unwrap();

        assert_eq!(normalized.min().double_value(&[]), -1.0);
        assert_eq!(normalized.max().double_value(&[]), 1.0);
    }

    #[test]
    fn test_normalize_rejects_channel_mismatch() {
        let images = Tensor::zeros(&[1, 1, 2, 2], FLOAT_CPU);
        assert_matches!(
            normalize(&images, &CIFAR10_MEAN, &CIFAR10_STD),
            Err(ExperimentError::Data(_))
        );
    }

    #[test]
    fn test_train_iter_covers_every_sample() {
        let dataset = synthetic(10, 4);
        let sizes: Vec<i64> = dataset
            .train_iter(4, Device::Cpu)
            .map(|(images, labels)| {
                assert_eq!(images.size()[1..], [3, 8, 8]);
                labels.size()[0]
            })
            .collect();

        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(dataset.image_dim(), (3, 8, 8));
    }

    #[test]
    fn test_label_count_mismatch_rejected() {
        let result = ImageDataset::from_tensors(
            Tensor::rand(&[5, 3, 8, 8], FLOAT_CPU),
            Tensor::zeros(&[4], (Kind::Int64, Device::Cpu)),
            Tensor::rand(&[2, 3, 8, 8], FLOAT_CPU),
            Tensor::zeros(&[2], (Kind::Int64, Device::Cpu)),
            10,
        );
        assert_matches!(result, Err(ExperimentError::Data(_)));
    }

    #[test]
    fn test_missing_directory_is_data_error() {
        assert_matches!(
            ImageDataset::load_cifar10("/nonexistent/cifar-10-batches-bin"),
            Err(ExperimentError::Data(_))
        );
    }
}
