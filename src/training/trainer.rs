use std::path::Path;
use std::time::Instant;
use tch::{nn, nn::ModuleT, Device};

use crate::data::ImageDataset;
use crate::neural::model::{parameter_count, GroupNormVgg};
use crate::neural::model_io::{load_checkpoint, save_checkpoint, CheckpointMeta};
use crate::training::config::Configs;
use crate::training::experiment::Experiment;
use crate::training::metrics::{EpochRecord, EpochStats, MetricsHistory, RunningStats};
use crate::{ExperimentError, Result};

/// Outcome of [`Trainer::run`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub epochs_run: usize,
    pub last_epoch: usize,
    pub best_valid_accuracy: f64,
    pub last_valid: Option<EpochStats>,
}

/// Owns the model, its optimizer and the data for one run
pub struct Trainer {
    configs: Configs,
    device: Device,
    vs: nn::VarStore,
    model: GroupNormVgg,
    optimizer: nn::Optimizer,
    dataset: ImageDataset,
    /// Epochs completed so far, including those restored from a checkpoint
    epoch: usize,
}

impl Trainer {
    pub fn new(configs: Configs, dataset: ImageDataset) -> Result<Self> {
        configs.validate()?;
        tch::manual_seed(configs.seed);
        let device = configs.device()?;

        let (channels, height, width) = dataset.image_dim();
        if height != width {
            return Err(ExperimentError::Data(format!(
                "square images expected, got {}x{}",
                height, width
            )));
        }

        let vs = nn::VarStore::new(device);
        let model = GroupNormVgg::new(
            &vs.root(),
            configs.model_config(channels, height, dataset.num_classes),
        )?;
        let optimizer = configs.optimizer.build(&vs)?;

        log::info!(
            "🧠 GroupNormVgg ready on {:?}: {} parameters, {} groups, {} optimizer (lr={:.2e})",
            device,
            parameter_count(&vs),
            configs.groups,
            configs.optimizer.optimizer,
            configs.optimizer.learning_rate
        );

        Ok(Self {
            configs,
            device,
            vs,
            model,
            optimizer,
            dataset,
            epoch: 0,
        })
    }

    pub fn configs(&self) -> &Configs {
        &self.configs
    }

    pub fn model(&self) -> &GroupNormVgg {
        &self.model
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn epochs_completed(&self) -> usize {
        self.epoch
    }

    /// Load model weights from a checkpoint and continue after its epoch.
    ///
    /// Checkpoints hold model variables only: the optimizer restarts from a
    /// fresh state (Adam moments at zero). The RNG is reseeded with
    /// `seed + epoch` so the resumed epochs do not replay the shuffle and
    /// augmentation order of the first epochs.
    pub fn restore(&mut self, path: impl AsRef<Path>) -> Result<CheckpointMeta> {
        let meta = load_checkpoint(&mut self.vs, path)?;
        self.epoch = meta.epoch;
        tch::manual_seed(self.configs.seed.wrapping_add(meta.epoch as i64));
        Ok(meta)
    }

    /// One pass over the shuffled, augmented training split
    pub fn train_epoch(&mut self) -> Result<EpochStats> {
        let mut stats = RunningStats::default();
        let log_interval = self.configs.log_interval.max(1);

        let batches = self
            .dataset
            .train_iter(self.configs.train_batch_size, self.device);
        for (batch_idx, (images, labels)) in batches.enumerate() {
            let images = self.configs.augment.apply(&images);

            let logits = self.model.forward_t(&images, true);
            let loss = logits.cross_entropy_for_logits(&labels);
            self.optimizer.backward_step(&loss);

            let loss_value = loss.double_value(&[]);
            if !loss_value.is_finite() {
                return Err(ExperimentError::Training(format!(
                    "loss diverged to {} at batch {} of epoch {}",
                    loss_value,
                    batch_idx,
                    self.epoch + 1
                )));
            }
            stats.update(loss_value, &logits, &labels);

            if (batch_idx + 1) % log_interval == 0 {
                log::debug!(
                    "epoch {} batch {} | samples {} | loss {:.4} | running acc {:.2}%",
                    self.epoch + 1,
                    batch_idx + 1,
                    stats.samples(),
                    loss_value,
                    stats.finish().accuracy * 100.0
                );
            }
        }

        Ok(stats.finish())
    }

    /// Loss and accuracy on the validation split, without gradients
    pub fn validate(&self) -> EpochStats {
        tch::no_grad(|| {
            let mut stats = RunningStats::default();
            for (images, labels) in self
                .dataset
                .valid_iter(self.configs.valid_batch_size, self.device)
            {
                let logits = self.model.forward_t(&images, false);
                let loss = logits.cross_entropy_for_logits(&labels).double_value(&[]);
                stats.update(loss, &logits, &labels);
            }
            stats.finish()
        })
    }

    fn should_save(&self, epoch: usize) -> bool {
        let every = self.configs.save_every;
        epoch == self.configs.epochs || (every > 0 && epoch % every == 0)
    }

    /// Train until `configs.epochs`, logging and checkpointing into the run
    pub fn run(&mut self, experiment: &Experiment) -> Result<RunSummary> {
        // rows past the restored epoch belong to epochs that are about to be re-run
        let dropped = MetricsHistory::truncate(experiment.metrics_path(), self.epoch)?;
        if dropped > 0 {
            log::warn!(
                "⚠️ Dropped {} metrics rows recorded after epoch {}",
                dropped,
                self.epoch
            );
        }
        let mut history = MetricsHistory::open(experiment.metrics_path())?;
        let first_epoch = self.epoch + 1;
        let last_epoch = self.configs.epochs;

        if first_epoch > last_epoch {
            log::warn!(
                "⚠️ Nothing to do: {} of {} epochs already completed",
                self.epoch,
                last_epoch
            );
        }

        let mut summary = RunSummary {
            epochs_run: 0,
            last_epoch: self.epoch,
            best_valid_accuracy: 0.0,
            last_valid: None,
        };

        for epoch in first_epoch..=last_epoch {
            let started = Instant::now();
            let train = self.train_epoch()?;
            let valid = self.validate();
            self.epoch = epoch;
            let seconds = started.elapsed().as_secs_f64();

            log::info!(
                "Epoch {:3}/{:3} | Train Loss: {:.4}, Acc: {:.2}% | \
                 Val Loss: {:.4}, Acc: {:.2}% | {:.1}s{}",
                epoch,
                last_epoch,
                train.loss,
                train.accuracy * 100.0,
                valid.loss,
                valid.accuracy * 100.0,
                seconds,
                if valid.accuracy > summary.best_valid_accuracy { " ⭐" } else { "" }
            );

            // checkpoint first: a row must never be newer than the newest checkpoint
            if self.should_save(epoch) {
                let path = experiment.checkpoint_path(epoch);
                save_checkpoint(
                    &self.vs,
                    &path,
                    CheckpointMeta {
                        epoch,
                        valid_accuracy: valid.accuracy,
                    },
                )?;
                log::info!("💾 Checkpoint saved to {}", path.display());
            }
            history.append(&EpochRecord::new(epoch, train, valid, seconds))?;

            summary.epochs_run += 1;
            summary.last_epoch = epoch;
            summary.best_valid_accuracy = summary.best_valid_accuracy.max(valid.accuracy);
            summary.last_valid = Some(valid);
        }

        Ok(summary)
    }
}
