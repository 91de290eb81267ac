pub mod config;
pub mod experiment;
pub mod metrics;
pub mod optimizer;
pub mod trainer;

pub use config::Configs;
pub use experiment::{Experiment, RunGuard};
pub use metrics::{EpochRecord, EpochStats, MetricsHistory};
pub use optimizer::{OptimizerConfigs, OptimizerKind};
pub use trainer::{RunSummary, Trainer};
