//! Train a VGG-style classifier with group normalization on CIFAR-10.
//!
//! Usage: cargo run --release -- --data-dir data/cifar-10-batches-bin --groups 16

use clap::Parser;
use std::path::PathBuf;

use group_norm_cifar10::data::ImageDataset;
use group_norm_cifar10::logging::setup_logging;
use group_norm_cifar10::training::{Configs, Experiment, Trainer};
use group_norm_cifar10::Result;

/// Optimizer settings of the group norm experiment, applied to fresh runs
const EXPERIMENT_OVERRIDES: &[(&str, &str)] = &[
    ("optimizer.optimizer", "Adam"),
    ("optimizer.learning_rate", "2.5e-4"),
];

#[derive(Parser, Debug)]
#[command(name = "group_norm_cifar10", version, about)]
struct Cli {
    /// Directory with the CIFAR-10 binary batches
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Number of group norm groups
    #[arg(short = 'g', long)]
    groups: Option<i64>,

    /// Training epochs
    #[arg(short = 'e', long)]
    epochs: Option<usize>,

    /// Training batch size
    #[arg(long)]
    train_batch_size: Option<i64>,

    /// auto, cpu, cuda or cuda:N
    #[arg(long)]
    device: Option<String>,

    /// Root directory for run directories
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Experiment name
    #[arg(long, default_value = "cifar10")]
    name: String,

    /// Free-form run comment
    #[arg(long, default_value = "group norm")]
    comment: String,

    /// JSON configuration file (partial files keep the defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Configuration override, e.g. --set optimizer.learning_rate=1e-3 (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_override)]
    overrides: Vec<(String, String)>,

    /// Continue a previous run from its latest checkpoint
    #[arg(long, value_name = "RUN_DIR")]
    resume: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_override(arg: &str) -> std::result::Result<(String, String), String> {
    match arg.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", arg)),
    }
}

impl Cli {
    /// Overrides in precedence order: experiment defaults, flags, then --set
    fn overrides(&self, fresh: bool) -> Vec<(String, String)> {
        let mut overrides: Vec<(String, String)> = Vec::new();
        if fresh {
            overrides.extend(
                EXPERIMENT_OVERRIDES
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string())),
            );
        }
        if let Some(dir) = &self.data_dir {
            overrides.push(("data_dir".into(), dir.display().to_string()));
        }
        if let Some(groups) = self.groups {
            overrides.push(("groups".into(), groups.to_string()));
        }
        if let Some(epochs) = self.epochs {
            overrides.push(("epochs".into(), epochs.to_string()));
        }
        if let Some(batch) = self.train_batch_size {
            overrides.push(("train_batch_size".into(), batch.to_string()));
        }
        if let Some(device) = &self.device {
            overrides.push(("device".into(), device.clone()));
        }
        overrides.extend(self.overrides.iter().cloned());
        overrides
    }
}

fn run(cli: Cli) -> Result<()> {
    let experiment = match &cli.resume {
        Some(run_dir) => Experiment::resume(run_dir)?,
        None => Experiment::create(&cli.name, &cli.comment, &cli.log_dir)?,
    };
    let _logger = setup_logging(experiment.run_dir(), &cli.log_level)?;

    let saved = experiment.saved_configs()?;
    let fresh = saved.is_none();
    let mut configs = match (&cli.config, saved) {
        (Some(path), _) => Configs::from_json_file(path)?,
        (None, Some(saved)) => saved,
        (None, None) => Configs::default(),
    };
    experiment.configs(&mut configs, &cli.overrides(fresh))?;

    let dataset = ImageDataset::load_cifar10(&configs.data_dir)?;
    let mut trainer = Trainer::new(configs, dataset)?;

    if cli.resume.is_some() {
        match experiment.latest_checkpoint()? {
            Some((epoch, path)) => {
                trainer.restore(&path)?;
                log::info!("🔁 Resuming after epoch {}", epoch);
            }
            None => log::warn!(
                "⚠️ No checkpoint in {}, starting from scratch",
                experiment.run_dir().display()
            ),
        }
    }

    let _run = experiment.start()?;
    let summary = trainer.run(&experiment)?;
    log::info!(
        "✅ Training complete: {} epochs run, best valid accuracy {:.2}%",
        summary.epochs_run,
        summary.best_valid_accuracy * 100.0
    );
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        log::error!("❌ {}", err);
        eprintln!("❌ {}", err);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_override() {
        assert_eq!(
            parse_override("optimizer.learning_rate=1e-3").unwrap(),
            ("optimizer.learning_rate".to_string(), "1e-3".to_string())
        );
        assert_eq!(
            parse_override("stages=[[64],[128]]").unwrap().1,
            "[[64],[128]]"
        );
        assert!(parse_override("groups").is_err());
        assert!(parse_override("=4").is_err());
    }

    #[test]
    fn test_flags_come_after_experiment_defaults() {
        let cli = Cli::parse_from([
            "group_norm_cifar10",
            "--groups",
            "32",
            "--set",
            "optimizer.learning_rate=1e-3",
        ]);
        let overrides = cli.overrides(true);

        let mut configs = Configs::default();
        configs.apply_overrides(&overrides).unwrap();
        assert_eq!(configs.groups, 32);
        assert_eq!(configs.optimizer.learning_rate, 1e-3);
        assert_eq!(overrides[0].0, "optimizer.optimizer");

        assert_eq!(cli.overrides(false).len(), 2);
    }
}
