use crate::io::StateDict;
use crate::nn::Module;
use crate::tensor::{Tensor, TensorOps};

/// Inserts a size-1 axis, e.g. (B, C, T) -> (B, 1, C, T) for `Expand::new(1)`.
#[derive(Clone, Copy, Debug)]
pub struct Expand {
    axis: usize,
}

impl Expand {
    pub fn new(axis: usize) -> Self {
        Self { axis }
    }
}

/// Removes a size-1 axis, the inverse of [`Expand`].
#[derive(Clone, Copy, Debug)]
pub struct Squeeze {
    axis: usize,
}

impl Squeeze {
    pub fn new(axis: usize) -> Self {
        Self { axis }
    }
}

impl Module for Expand {
    fn forward(&self, x: &Tensor) -> Tensor {
        x.unsqueeze(self.axis)
    }
    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
    fn state_dict(&self) -> StateDict {
        StateDict::new()
    }
    fn load_state_dict(&mut self, _state: &StateDict) {}
    fn clone_box(&self) -> Box<dyn Module> {
        Box::new(*self)
    }
}

impl Module for Squeeze {
    fn forward(&self, x: &Tensor) -> Tensor {
        x.squeeze(self.axis)
    }
    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
    fn state_dict(&self) -> StateDict {
        StateDict::new()
    }
    fn load_state_dict(&mut self, _state: &StateDict) {}
    fn clone_box(&self) -> Box<dyn Module> {
        Box::new(*self)
    }
}
