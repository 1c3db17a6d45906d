//! Command line interface of the `finetune` binary.
//!
//! - `train`: fine-tune on a dataset with `train` and `test` splits, then export
//! - `evaluate`: loss and accuracy of an exported model on a dataset
//! - `predict`: top-k classes of an exported model for one image

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::TrainConfig;
use crate::logging::LogFormat;
use crate::ml::optim::OptimizerKind;
use crate::zoo::Architecture;

/// Fine-tune, evaluate and run small image classifiers
#[derive(Parser)]
#[command(name = "finetune")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log filter, e.g. `info` or `finetune_ml=debug`. RUST_LOG wins when set.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Train a classifier and export it as safetensors
    Train(TrainArgs),

    /// Report loss and accuracy of an exported model
    Evaluate(EvaluateArgs),

    /// Print the most likely classes for an image
    Predict(PredictArgs),
}

#[derive(Args)]
pub struct TrainArgs {
    /// Dataset root holding `train` and `test` splits (directories or CSV files)
    #[arg(long)]
    pub data: PathBuf,

    /// YAML file with training settings; flags override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub epochs: Option<usize>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub lr: Option<f32>,

    #[arg(long)]
    pub weight_decay: Option<f32>,

    #[arg(long, value_enum)]
    pub optimizer: Option<OptimizerKind>,

    #[arg(long, value_enum)]
    pub arch: Option<Architecture>,

    #[arg(long)]
    pub image_size: Option<usize>,

    #[arg(long)]
    pub channels: Option<usize>,

    /// Class count of pixel CSV splits (default: largest training label + 1)
    #[arg(long)]
    pub num_classes: Option<usize>,

    #[arg(long)]
    pub test_every: Option<usize>,

    /// Stop after this many evaluations with a rising test loss
    #[arg(long)]
    pub patience: Option<usize>,

    /// safetensors file whose `features.*` tensors seed the frozen backbone
    #[arg(long)]
    pub pretrained: Option<PathBuf>,

    /// Checkpoint directory to start from
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,

    /// Run name (default: run-YYYYmmdd-HHMMSS)
    #[arg(long)]
    pub name: Option<String>,

    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Export path (default: <run dir>/model.safetensors)
    #[arg(long)]
    pub export: Option<PathBuf>,

    #[arg(long)]
    pub seed: Option<u64>,
}

impl TrainArgs {
    /// Layers the flags that were given over `config`.
    pub fn apply(&self, config: &mut TrainConfig) {
        fn set<T: Clone>(flag: &Option<T>, field: &mut T) {
            if let Some(v) = flag {
                *field = v.clone();
            }
        }
        set(&self.epochs, &mut config.epochs);
        set(&self.batch_size, &mut config.batch_size);
        set(&self.lr, &mut config.learning_rate);
        set(&self.weight_decay, &mut config.weight_decay);
        set(&self.optimizer, &mut config.optimizer);
        set(&self.arch, &mut config.architecture);
        set(&self.image_size, &mut config.image_size);
        set(&self.channels, &mut config.channels);
        set(&self.test_every, &mut config.test_every);
        set(&self.output_dir, &mut config.output_dir);

        if self.num_classes.is_some() {
            config.num_classes = self.num_classes;
        }
        if self.patience.is_some() {
            config.patience = self.patience;
        }
        if self.pretrained.is_some() {
            config.pretrained = self.pretrained.clone();
        }
        if self.checkpoint.is_some() {
            config.checkpoint = self.checkpoint.clone();
        }
        if self.name.is_some() {
            config.name = self.name.clone();
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
    }
}

#[derive(Args)]
pub struct EvaluateArgs {
    /// Exported safetensors model
    #[arg(long)]
    pub model: PathBuf,

    /// Image folder or pixel CSV to evaluate on
    #[arg(long)]
    pub data: PathBuf,

    #[arg(long, default_value_t = 32, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    pub batch_size: usize,
}

#[derive(Args)]
pub struct PredictArgs {
    /// Exported safetensors model
    #[arg(long)]
    pub model: PathBuf,

    /// Image to classify
    pub image: PathBuf,

    #[arg(long, default_value_t = 5)]
    pub top_k: usize,
}
