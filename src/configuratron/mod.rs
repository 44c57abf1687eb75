//! Experiment configuration: YAML documents with includes, resolved into dataset entries.

pub mod config;
pub mod discovery;
pub mod include;

pub use config::{ConfiguratronSettings, DatasetConfig, EventLabels, ExperimentConfig};
pub use discovery::{FilenameFormat, SessionFile};
pub use include::load_document;
