use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Dn3Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Could not read glob match: {0}")]
    Glob(#[from] glob::GlobError),

    #[error("Failed to encode state dict: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Failed to decode state dict: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("Included file not found: {0}")]
    IncludeNotFound(PathBuf),

    #[error("Include cycle detected at {0}")]
    IncludeCycle(PathBuf),

    #[error("`{field}` is required but missing in {context}")]
    MissingField { context: String, field: String },

    #[error("Invalid value for `{field}`: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Could not find {0} in datasets")]
    UnknownDataset(String),

    #[error("No auxiliary named `{0}`")]
    UnknownAuxiliary(String),

    #[error("Malformed signal file {path}: {reason}")]
    SignalFormat { path: PathBuf, reason: String },

    #[error("No usable recordings found under {0}")]
    NoRecordings(PathBuf),

    #[error("Sampling frequency mismatch: expected {expected}Hz, found {found}Hz")]
    SfreqMismatch { expected: f64, found: f64 },

    #[error("Index {index} out of range for {len} trials")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("State dict mismatch: {0}")]
    StateDictMismatch(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl Dn3Error {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Dn3Error::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn signal(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Dn3Error::SignalFormat {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Dn3Error>;
