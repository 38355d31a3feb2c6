//! Error type shared by the feature pipeline and the GAN trainer.
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, NetError>;

/// Everything that can abort a run. None of these are retried.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("column `{0}` is missing from the dataset header")]
    MissingColumn(String),

    #[error("column `{column}` row {row}: cannot parse `{value}`")]
    MalformedValue {
        column: String,
        row: usize,
        value: String,
    },

    #[error("feature schema: {0}")]
    Schema(String),

    #[error("column `{column}`: unknown category `{value}`")]
    UnknownCategory { column: String, value: String },

    #[error("{context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    #[error("dataset is empty: {0}")]
    EmptyDataset(String),

    #[error("non-finite value function at step {step}")]
    NonFinite { step: usize },

    #[error("parameter `{0}` holds NaN or infinity")]
    NonFiniteParameter(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl NetError {
    pub(crate) fn shape(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        NetError::ShapeMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }
}
