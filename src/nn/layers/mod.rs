pub mod activation;
pub mod batchnorm;
pub mod conv;
pub mod dropout;
pub mod flatten;
pub mod linear;
pub mod pool;
pub mod sequential;
pub mod shape;

pub use activation::{Activation, ELU, LeakyReLU, ReLU};
pub use batchnorm::BatchNorm2d;
pub use conv::{Conv2d, Conv2dOptions};
pub use dropout::{Dropout, Dropout2d};
pub use flatten::Flatten;
pub use linear::Linear;
pub use pool::{AdaptiveAvgPool1d, AvgPool2d, MaxPool2d};
pub use sequential::Sequential;
pub use shape::{Expand, Squeeze};
