use crate::io::StateDict;
use crate::tensor::Tensor;

pub mod layers;
pub mod optim;

pub use layers::{
    AdaptiveAvgPool1d, AvgPool2d, BatchNorm2d, Conv2d, Conv2dOptions, Dropout, Dropout2d, ELU,
    Expand, Flatten, LeakyReLU, Linear, MaxPool2d, ReLU, Sequential, Squeeze,
};
pub use optim::{Adam, SGD};

pub trait Module {
    fn forward(&self, x: &Tensor) -> Tensor;
    fn parameters(&self) -> Vec<Tensor>;

    // State dict methods
    fn state_dict(&self) -> StateDict;
    fn load_state_dict(&mut self, state: &StateDict);

    /// Deep copy behind a trait object: weights and buffers are duplicated.
    fn clone_box(&self) -> Box<dyn Module>;

    fn zero_grad(&mut self) {
        for p in self.parameters() {
            p.borrow_mut().grad = None;
        }
    }

    /// Toggle gradient tracking on every parameter.
    fn set_requires_grad(&mut self, requires_grad: bool) {
        for p in self.parameters() {
            let mut p = p.borrow_mut();
            p.requires_grad = requires_grad;
            if !requires_grad {
                p.grad = None;
            }
        }
    }

    /// Switch between training and evaluation modes.
    /// Important for layers like `BatchNorm` and Dropout.
    fn train(&mut self, _mode: bool) {}
    fn eval(&mut self) {
        self.train(false);
    }
    fn is_training(&self) -> bool {
        false
    }
}

impl Clone for Box<dyn Module> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Copy stored values into an existing parameter or buffer, keeping its grad flag.
pub(crate) fn assign(target: &Tensor, state: &StateDict, key: &str) {
    if let Some(t) = state.get(key) {
        let mut b = target.borrow_mut();
        b.data = t.data.clone();
        b.shape = t.shape.clone();
    }
}
