//! # Group Normalization on CIFAR-10
//!
//! Trains a VGG-style convolutional classifier on CIFAR-10 where every
//! convolution is followed by Group Normalization instead of Batch Normalization.
//!
//! ## Features
//!
//! - **Group Normalization**: batch-independent normalization layer over channel groups
//! - **Model**: conv / group-norm / ReLU stages with max-pooling and a linear head
//! - **Data**: CIFAR-10 loading, per-channel normalization and augmentation
//! - **Training**: configurable optimizers, metric history and safetensors checkpoints
//!
//! ## Usage
//!
//! ```rust,no_run
//! use group_norm_cifar10::{
//!     data::ImageDataset,
//!     training::{Configs, Experiment, Trainer},
//! };
//!
//! # fn main() -> group_norm_cifar10::Result<()> {
//! let experiment = Experiment::create("cifar10", "group norm", "logs")?;
//! let mut configs = Configs::default();
//! experiment.configs(&mut configs, &[("optimizer.learning_rate", "2.5e-4")])?;
//! let dataset = ImageDataset::load_cifar10(&configs.data_dir)?;
//! let mut trainer = Trainer::new(configs, dataset)?;
//! let _run = experiment.start()?;
//! trainer.run(&experiment)?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// PUBLIC API MODULES
// ============================================================================

/// Dataset loading and augmentation
pub mod data;

/// Neural network components (group norm, model, checkpoints)
pub mod neural;

/// Configuration, experiment runs and the training loop
pub mod training;

/// Logger initialisation
pub mod logging;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use neural::group_norm::{group_norm, GroupNorm, GroupNormConfig};
pub use neural::model::{GroupNormVgg, ModelConfig};
pub use training::{Configs, Experiment, Trainer};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Main error type for the library
#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Torch error: {0}")]
    Torch(#[from] tch::TchError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Logging error: {0}")]
    Logging(#[from] flexi_logger::FlexiLoggerError),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ExperimentError>;

// ============================================================================
// LIBRARY VERSION INFO
// ============================================================================

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Library description
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
