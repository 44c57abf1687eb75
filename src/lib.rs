//! Configuration-driven EEG dataset construction and deep-learning models.
//!
//! Two loosely related halves live here: the configuratron, which turns a
//! YAML experiment description into datasets of windowed trials, and the
//! trainable models (EEGNet, TIDNet, logistic regression) built on a small
//! reverse-mode autograd engine.

pub mod autograd;
pub mod configuratron;
pub mod data;
pub mod error;
pub mod io;
pub mod nn;
pub mod ops;
pub mod tensor;
pub mod trainable;
pub mod transforms;
pub mod utils;

pub use autograd::no_grad;
pub use configuratron::{ConfiguratronSettings, DatasetConfig, ExperimentConfig};
pub use data::{Batch, DataLoader, Dataset, Dn3Dataset, Recording, Sfreq, Thinker, Trial};
pub use error::{Dn3Error, Result};
pub use io::{StateDict, TensorData};
pub use nn::layers::{
    AdaptiveAvgPool1d, AvgPool2d, BatchNorm2d, Conv2d, Dropout, Dropout2d, ELU, Expand, Flatten,
    LeakyReLU, Linear, MaxPool2d, ReLU, Sequential, Squeeze,
};
pub use nn::{Adam, Module, SGD};
pub use tensor::{RawTensor, Tensor, TensorOps, manual_seed};
pub use trainable::models::{
    Architecture, DN3BaseModel, EEGNet, EEGNetParams, LogRegNetwork, TIDNet, TIDNetParams,
};
pub use trainable::processes::{FitOptions, StandardClassification};
pub use transforms::{BatchTransform, RandomTemporalCrop};
