//! Training run configuration, read from YAML and overridden from the
//! command line.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dataset::ImageSpec;
use crate::error::{Error, Result};
use crate::ml::optim::OptimizerKind;
use crate::zoo::Architecture;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub weight_decay: f32,
    pub optimizer: OptimizerKind,
    pub architecture: Architecture,
    /// Images are resized to `image_size` x `image_size`.
    pub image_size: usize,
    pub channels: usize,
    /// Class count of pixel CSV datasets; taken from their labels when unset.
    pub num_classes: Option<usize>,
    /// Evaluate on the test split every `test_every` epochs.
    pub test_every: usize,
    /// Stop after this many evaluations whose loss rose. `None` never stops
    /// early.
    pub patience: Option<usize>,
    pub shuffle: bool,
    /// safetensors file whose `features.*` tensors seed the backbone.
    pub pretrained: Option<PathBuf>,
    /// Checkpoint directory to resume from.
    pub checkpoint: Option<PathBuf>,
    /// Run name; `run-YYYYmmdd-HHMMSS` when unset.
    pub name: Option<String>,
    pub output_dir: PathBuf,
    pub seed: Option<u64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 32,
            learning_rate: 1e-3,
            weight_decay: 1e-4,
            optimizer: OptimizerKind::Sgd,
            architecture: Architecture::ConvNet,
            image_size: 32,
            channels: 3,
            num_classes: None,
            test_every: 1,
            patience: None,
            shuffle: true,
            pretrained: None,
            checkpoint: None,
            name: None,
            output_dir: PathBuf::from("runs"),
            seed: None,
        }
    }
}

impl TrainConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Parses YAML, filling missing keys with defaults.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let problem = if self.epochs == 0 {
            "epochs must be positive"
        } else if self.batch_size == 0 {
            "batch_size must be positive"
        } else if self.test_every == 0 {
            "test_every must be positive"
        } else if !(self.learning_rate > 0.0) {
            "learning_rate must be positive"
        } else if !(self.weight_decay >= 0.0) {
            "weight_decay must not be negative"
        } else if self.patience == Some(0) {
            "patience must be positive when set"
        } else if self.num_classes.is_some_and(|n| n < 2) {
            "num_classes must be at least 2 when set"
        } else {
            return Ok(());
        };
        Err(Error::Config(problem.to_string()))
    }

    pub fn image_spec(&self) -> Result<ImageSpec> {
        ImageSpec::square(self.channels, self.image_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config = TrainConfig::from_yaml("epochs: 3\noptimizer: adam\narchitecture: vgg11\n").unwrap();
        assert_eq!(config.epochs, 3);
        assert_eq!(config.optimizer, OptimizerKind::Adam);
        assert_eq!(config.architecture, Architecture::Vgg11);
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.output_dir, PathBuf::from("runs"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(TrainConfig::from_yaml("epoch: 3\n"), Err(Error::Yaml(_))));
    }

    #[test]
    fn validation_rejects_degenerate_values() {
        for yaml in [
            "epochs: 0",
            "batch_size: 0",
            "test_every: 0",
            "learning_rate: 0.0",
            "weight_decay: -0.1",
            "patience: 0",
            "num_classes: 1",
        ] {
            assert!(
                matches!(TrainConfig::from_yaml(yaml), Err(Error::Config(_))),
                "{yaml} should be rejected"
            );
        }
    }

    #[test]
    fn image_spec_follows_size_and_channels() {
        let config = TrainConfig {
            image_size: 8,
            channels: 1,
            ..TrainConfig::default()
        };
        assert_eq!(config.image_spec().unwrap().shape(), vec![1, 8, 8]);
    }
}
