pub mod augmentation;
pub mod cifar10;

pub use augmentation::AugmentConfig;
pub use cifar10::{normalize, ImageDataset, CIFAR10_CLASSES};
