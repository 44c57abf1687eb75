pub mod adam;
pub mod sgd;

pub use adam::Adam;
pub use sgd::SGD;
