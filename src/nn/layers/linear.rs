use crate::io::{StateDict, TensorData};
use crate::nn::{Module, assign};
use crate::tensor::{RawTensor, Tensor, TensorOps};

/// Fully-connected (dense/linear) layer
///
/// Computes: y = xW + b
/// where x is (batch, in_features), W is (in_features, out_features), b is (out_features)
pub struct Linear {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

impl Linear {
    /// Create a new linear layer with fan-in uniform initialization
    pub fn new(in_features: usize, out_features: usize, use_bias: bool) -> Self {
        let w = RawTensor::fan_in_uniform(&[in_features, out_features], in_features);
        Self::from_weight(w, in_features, out_features, use_bias, true)
    }

    /// Xavier-normal weight and zero bias, the initialisation used for classifiers.
    pub fn xavier_normal(in_features: usize, out_features: usize) -> Self {
        let w = RawTensor::xavier_normal(&[in_features, out_features], in_features, out_features);
        Self::from_weight(w, in_features, out_features, true, false)
    }

    fn from_weight(
        w: Tensor,
        in_features: usize,
        out_features: usize,
        use_bias: bool,
        random_bias: bool,
    ) -> Self {
        w.borrow_mut().requires_grad = true;
        let bias = use_bias.then(|| {
            let b = if random_bias {
                RawTensor::fan_in_uniform(&[out_features], in_features)
            } else {
                RawTensor::zeros(&[out_features])
            };
            b.borrow_mut().requires_grad = true;
            b
        });
        Linear { weight: w, bias }
    }

    pub fn in_features(&self) -> usize {
        self.weight.borrow().shape[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.borrow().shape[1]
    }
}

impl Module for Linear {
    fn forward(&self, x: &Tensor) -> Tensor {
        let out = x.matmul(&self.weight);
        match &self.bias {
            Some(b) => out.add(b),
            None => out,
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.weight.clone()];
        if let Some(ref bias) = self.bias {
            params.push(bias.clone());
        }
        params
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("weight".to_string(), TensorData::from_tensor(&self.weight));
        if let Some(b) = &self.bias {
            state.insert("bias".to_string(), TensorData::from_tensor(b));
        }
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) {
        assign(&self.weight, state, "weight");
        if let Some(b) = &self.bias {
            assign(b, state, "bias");
        }
    }

    fn clone_box(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }
}

impl Clone for Linear {
    fn clone(&self) -> Self {
        Linear {
            weight: RawTensor::detached_copy(&self.weight),
            bias: self.bias.as_ref().map(RawTensor::detached_copy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xavier_normal_classifier_has_zero_bias() {
        let layer = Linear::xavier_normal(12, 4);
        let bias = layer.bias.as_ref().unwrap();
        assert!(bias.to_vec().iter().all(|&b| b == 0.0));
        assert_eq!(layer.in_features(), 12);
        assert_eq!(layer.out_features(), 4);
    }

    #[test]
    fn linear_gradient() {
        let layer = Linear::new(3, 2, true);
        let x = RawTensor::new(vec![0.1, -0.3, 0.8, 0.5, 0.2, -0.6], &[2, 3], true);
        assert!(RawTensor::check_gradients_simple(&x, |t| layer.forward(t).sum()));
    }

    #[test]
    fn clone_is_deep() {
        let layer = Linear::new(2, 2, false);
        let copy = layer.clone();
        layer.weight.borrow_mut().data[0] += 1.0;
        assert_ne!(copy.weight.borrow().data[0], layer.weight.borrow().data[0]);
    }
}
