use crate::io::StateDict;
use crate::nn::Module;
use crate::tensor::{Tensor, TensorOps};

/// Flattens the input tensor into a 2D tensor (batch_size, remaining_features).
///
/// Input shape: (B, D1, D2, ...)
/// Output shape: (B, D1 * D2 * ...)
#[derive(Clone, Copy, Debug, Default)]
pub struct Flatten;

impl Flatten {
    pub fn new() -> Self {
        Flatten
    }
}

impl Module for Flatten {
    fn forward(&self, x: &Tensor) -> Tensor {
        let shape = x.shape();
        if shape.len() < 2 {
            return x.clone();
        }
        x.reshape(&[shape[0], shape[1..].iter().product()])
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }

    fn state_dict(&self) -> StateDict {
        StateDict::new()
    }

    fn load_state_dict(&mut self, _state: &StateDict) {
        // Stateless
    }

    fn clone_box(&self) -> Box<dyn Module> {
        Box::new(*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RawTensor;

    #[test]
    fn test_flatten() {
        let flatten = Flatten::new();
        let x = RawTensor::zeros(&[2, 2, 2, 2]);
        assert_eq!(flatten.forward(&x).shape(), vec![2, 8]);
    }
}
