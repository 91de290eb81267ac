use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::Path;
use tch::{Kind, Tensor};

use crate::Result;

/// Number of rows whose arg-max logit equals the label
pub fn correct_predictions(logits: &Tensor, labels: &Tensor) -> i64 {
    logits
        .argmax(-1, false)
        .eq_tensor(labels)
        .sum(Kind::Int64)
        .int64_value(&[])
}

/// Loss and accuracy accumulated over the batches of one pass
#[derive(Debug, Default, Clone, Copy)]
pub struct RunningStats {
    loss_sum: f64,
    correct: i64,
    samples: i64,
}

impl RunningStats {
    /// `loss` is the batch mean; it is re-weighted by the batch size
    pub fn update(&mut self, loss: f64, logits: &Tensor, labels: &Tensor) {
        let batch = labels.size()[0];
        self.loss_sum += loss * batch as f64;
        self.correct += correct_predictions(logits, labels);
        self.samples += batch;
    }

    pub fn samples(&self) -> i64 {
        self.samples
    }

    pub fn finish(&self) -> EpochStats {
        if self.samples == 0 {
            return EpochStats::default();
        }
        EpochStats {
            loss: self.loss_sum / self.samples as f64,
            accuracy: self.correct as f64 / self.samples as f64,
            samples: self.samples,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub loss: f64,
    pub accuracy: f64,
    pub samples: i64,
}

/// One row of `metrics.csv`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub valid_loss: f64,
    pub valid_accuracy: f64,
    pub seconds: f64,
}

impl EpochRecord {
    pub fn new(epoch: usize, train: EpochStats, valid: EpochStats, seconds: f64) -> Self {
        Self {
            epoch,
            train_loss: train.loss,
            train_accuracy: train.accuracy,
            valid_loss: valid.loss,
            valid_accuracy: valid.accuracy,
            seconds,
        }
    }
}

/// Per-epoch CSV history; appends so a resumed run keeps its earlier rows
pub struct MetricsHistory {
    writer: csv::Writer<File>,
}

impl MetricsHistory {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let is_new = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let writer = csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(file);
        Ok(Self { writer })
    }

    pub fn append(&mut self, record: &EpochRecord) -> Result<()> {
        self.writer.serialize(record)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Vec<EpochRecord>> {
        let mut reader = csv::Reader::from_path(path)?;
        let records = reader.deserialize().collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Drop every row after `last_epoch`; returns how many rows were removed.
    /// A missing file has nothing to drop.
    pub fn truncate(path: impl AsRef<Path>, last_epoch: usize) -> Result<usize> {
        let path = path.as_ref();
        if !path.is_file() {
            return Ok(0);
        }
        let rows = Self::read(path)?;
        let (kept, dropped): (Vec<_>, Vec<_>) =
            rows.into_iter().partition(|row| row.epoch <= last_epoch);
        if dropped.is_empty() {
            return Ok(0);
        }

        let mut writer = csv::Writer::from_path(path)?;
        for row in &kept {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(dropped.len())
    }
}
