pub mod batch;

pub use batch::{BatchTransform, RandomTemporalCrop};
