#![allow(missing_docs)]
//! Fine-tuning of small image classifiers on a minimal autograd engine.
//!
//! `finetune_ml` trains a classifier head (optionally on top of a frozen,
//! pretrained backbone), evaluates it periodically with early stopping and
//! exports the result as safetensors:
//!
//! - Tensor operations and automatic differentiation ([`ml`])
//! - Convolutional and fully connected backbones ([`zoo`])
//! - Image folder and pixel CSV datasets with batching ([`dataset`])
//! - The classifier itself, with export and import ([`model`])
//! - The training loop, checkpoints and history ([`wrapper`])
//!
//! # Features
//!
//! - `progress` (default): progress bars during training (adds `indicatif`)
//! - `logging`: TensorBoard scalars in the run directory (adds `tensorboard-rs`)
//! - `full`: both
//!
//! # Usage Example
//!
//! ```no_run
//! use std::path::Path;
//! use finetune_ml::dataset::{open_splits, ClassificationDataset, Dataloader, ImageSpec};
//! use finetune_ml::ml::optim::OptimizerKind;
//! use finetune_ml::wrapper::ModelWrapper;
//! use finetune_ml::zoo::Architecture;
//!
//! # fn main() -> finetune_ml::error::Result<()> {
//! let spec = ImageSpec::square(3, 32)?;
//! let (train, test) = open_splits(Path::new("data"), &spec, None)?;
//! let num_classes = train.num_classes();
//!
//! let mut wrapper = ModelWrapper::new(None, Path::new("runs"), 1e-3, 1e-4)?;
//! wrapper.load_model(num_classes, Architecture::ConvNet, spec, None, None)?;
//! wrapper.init_optim(OptimizerKind::Adam)?;
//! let history = wrapper.train(
//!     &Dataloader::new(train, 32, false, true),
//!     &Dataloader::new(test, 32, false, false),
//!     10,
//!     1,
//!     Some(3),
//! )?;
//! println!("{}", history.to_csv());
//! wrapper.export(Path::new("model.safetensors"))?;
//! # Ok(())
//! # }
//! ```

/// Command line definitions for the `finetune` binary.
pub mod cli;
/// Training configuration loaded from YAML.
pub mod config;
/// Dataset utilities for loading and batching data.
pub mod dataset;
pub mod error;
/// Subscriber setup for `tracing`.
pub mod logging;
/// Core machine learning primitives including tensors, graphs, and layers.
pub mod ml;
/// The image classifier: build, train, predict, export.
pub mod model;
/// Utility functions for random number generation.
pub mod utills;
/// Training orchestration with checkpoints and early stopping.
pub mod wrapper;
/// Backbone architectures.
pub mod zoo;

#[cfg(test)]
mod test;
