pub mod layers;
pub mod models;
pub mod processes;

pub use layers::{
    ConvBlock2d, ConvBlockOptions, DenseFilter, DenseSpatialFilter, FilterAxis, TemporalFilter,
    TemporalResidual,
};
pub use models::{
    Architecture, DN3BaseModel, EEGNet, EEGNetParams, LogRegNetwork, TIDNet, TIDNetParams,
};
pub use processes::{EpochMetrics, FitOptions, Metrics, Predictions, StandardClassification, StepMetrics};
