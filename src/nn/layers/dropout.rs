use crate::io::StateDict;
use crate::nn::Module;
use crate::tensor::{RawTensor, Tensor, TensorOps, with_rng};
use rand::Rng;

/// Scale-preserving keep mask: `1/(1-p)` with probability `1-p`, else 0.
fn keep_mask(size: usize, p: f32) -> Vec<f32> {
    let keep_prob = 1.0 - p;
    let scale = 1.0 / keep_prob;
    with_rng(|rng| {
        (0..size)
            .map(|_| {
                if rng.random::<f32>() < keep_prob {
                    scale
                } else {
                    0.0
                }
            })
            .collect()
    })
}

fn check_probability(p: f32) {
    assert!(
        (0.0..=1.0).contains(&p),
        "Dropout probability must be in [0, 1]"
    );
}

/// Element-wise dropout.
#[derive(Clone, Debug)]
pub struct Dropout {
    p: f32,
    training: bool,
}

impl Dropout {
    /// # Panics
    /// dropout prob must be in \[0,1\]
    #[must_use]
    pub fn new(p: f32) -> Self {
        check_probability(p);
        Self { p, training: true }
    }
}

impl Module for Dropout {
    fn forward(&self, x: &Tensor) -> Tensor {
        if !self.training || self.p == 0.0 {
            return x.clone();
        }
        if self.p == 1.0 {
            return x.elem_mul(&RawTensor::zeros(&[1]));
        }
        let shape = x.shape();
        let mask = RawTensor::new(keep_mask(shape.iter().product(), self.p), &shape, false);
        x.elem_mul(&mask)
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
        Box::new(self.clone())
    }

    fn train(&mut self, mode: bool) {
        self.training = mode;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

/// Channel-wise dropout over (B, C, H, W): whole feature maps are zeroed.
#[derive(Clone, Debug)]
pub struct Dropout2d {
    p: f32,
    training: bool,
}

impl Dropout2d {
    /// # Panics
    /// dropout prob must be in \[0,1\]
    #[must_use]
    pub fn new(p: f32) -> Self {
        check_probability(p);
        Self { p, training: true }
    }
}

impl Module for Dropout2d {
    fn forward(&self, x: &Tensor) -> Tensor {
        if !self.training || self.p == 0.0 {
            return x.clone();
        }
        let shape = x.shape();
        assert!(shape.len() >= 2, "Dropout2d expects at least (B, C)");
        if self.p == 1.0 {
            return x.elem_mul(&RawTensor::zeros(&[1]));
        }
        // One draw per (batch, channel), broadcast over the remaining axes
        let mut mask_shape = vec![1; shape.len()];
        mask_shape[0] = shape[0];
        mask_shape[1] = shape[1];
        let mask = RawTensor::new(keep_mask(shape[0] * shape[1], self.p), &mask_shape, false);
        x.elem_mul(&mask)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }

    fn state_dict(&self) -> StateDict {
        StateDict::new()
    }

    fn load_state_dict(&mut self, _state: &StateDict) {}

    fn clone_box(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }

    fn train(&mut self, mode: bool) {
        self.training = mode;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_mode_is_identity() {
        let mut drop = Dropout::new(0.5);
        drop.eval();
        let x = RawTensor::randn(&[4, 8]);
        assert_eq!(drop.forward(&x).to_vec(), x.to_vec());
    }

    #[test]
    fn dropout2d_zeroes_whole_maps() {
        crate::manual_seed(3);
        let drop = Dropout2d::new(0.5);
        let x = RawTensor::ones(&[4, 6, 2, 5]);
        let y = drop.forward(&x).to_vec();
        for map in y.chunks(10) {
            let first = map[0];
            assert!(first == 0.0 || first == 2.0);
            assert!(map.iter().all(|&v| v == first));
        }
    }
}
