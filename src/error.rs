use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading data, building models or training.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    Shape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("missing tensor {0} in weights file")]
    MissingTensor(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0} must be called first")]
    NotReady(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
