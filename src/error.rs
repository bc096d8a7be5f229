use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while loading data, training, or exporting a model.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The file is not a well-formed IDX file.
    #[error("Invalid IDX file {path}: {reason}")]
    Idx { path: PathBuf, reason: String },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    /// A CSV record had the wrong number of fields or a non-numeric value.
    #[error("Invalid record {record} in {path}: {reason}")]
    Record {
        path: PathBuf,
        record: usize,
        reason: String,
    },
    #[error("Label {label} is out of range for {num_classes} classes")]
    InvalidLabel { label: usize, num_classes: usize },
    #[error("Dataset has {images} images but {labels} labels")]
    LengthMismatch { images: usize, labels: usize },
    #[error("Dataset is empty")]
    EmptyDataset,
    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("Layer {layer} expected input shape {expected}, got {actual:?}")]
    InputShape {
        layer: &'static str,
        expected: String,
        actual: Vec<usize>,
    },
    #[error("Backward pass on {0} before a training forward pass")]
    MissingCache(&'static str),
    #[error("JSON error: {0}")]
    Json(#[from] json::Error),
    #[error("Invalid config file {path}: {source}")]
    Config {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to serialize config: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
    #[error("Download of {url} failed: {reason}")]
    Download { url: String, reason: String },
    /// `model.json` is missing a field or holds inconsistent tensors.
    #[error("Invalid exported model: {0}")]
    InvalidModel(String),
    #[error("Input pipeline worker panicked")]
    WorkerPanicked,
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
