pub mod group_norm;
pub mod model;
pub mod model_io;

// Re-export key components for convenience
pub use group_norm::{group_norm, GroupNorm, GroupNormConfig};
pub use model::{parameter_count, GroupNormVgg, ModelConfig};
pub use model_io::{load_checkpoint, save_checkpoint, CheckpointMeta};
