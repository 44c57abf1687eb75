use crate::io::{StateDict, TensorData};
use crate::nn::{Module, assign};
use crate::tensor::{RawTensor, Tensor, TensorOps};

pub struct BatchNorm2d {
    num_features: usize,
    eps: f32,
    momentum: f32,
    training: bool,
    // Parameters (Learnable)
    gamma: Tensor,
    beta: Tensor,
    // Buffers (Non-learnable)
    running_mean: Tensor,
    running_var: Tensor,
}

impl BatchNorm2d {
    pub fn new(num_features: usize) -> Self {
        Self::new_with_params(num_features, 1e-5, 0.1)
    }

    pub fn new_with_params(num_features: usize, eps: f32, momentum: f32) -> Self {
        let gamma = RawTensor::ones(&[num_features]);
        gamma.borrow_mut().requires_grad = true;

        let beta = RawTensor::zeros(&[num_features]);
        beta.borrow_mut().requires_grad = true;

        BatchNorm2d {
            num_features,
            eps,
            momentum,
            training: true,
            gamma,
            beta,
            running_mean: RawTensor::zeros(&[num_features]),
            running_var: RawTensor::ones(&[num_features]),
        }
    }

    pub fn running_mean(&self) -> Vec<f32> {
        self.running_mean.to_vec()
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, x: &Tensor) -> Tensor {
        let (b, h, w) = {
            let xb = x.borrow();
            assert_eq!(xb.shape.len(), 4, "BatchNorm2d expected 4D input (B,C,H,W)");
            assert_eq!(xb.shape[1], self.num_features, "Channel mismatch");
            (xb.shape[0], xb.shape[2], xb.shape[3])
        };
        let count = b * h * w;

        // (B, C, H, W) -> (C, B*H*W): statistics per channel
        let x_flat = x.permute(&[1, 0, 2, 3]).reshape(&[self.num_features, count]);

        let (mean, var) = if self.training {
            let batch_mean = x_flat.mean_dim(1, true);
            let diff = x_flat.sub(&batch_mean);
            // Biased variance for normalisation
            let batch_var = diff.elem_mul(&diff).mean_dim(1, true);

            {
                let mut rm = self.running_mean.borrow_mut();
                let mut rv = self.running_var.borrow_mut();
                let bm = batch_mean.borrow();
                let bv = batch_var.borrow();
                let m = self.momentum;
                // Unbiased variance for the running estimate
                let correction = if count > 1 {
                    count as f32 / (count - 1) as f32
                } else {
                    1.0
                };
                for i in 0..self.num_features {
                    rm.data[i] = (1.0 - m) * rm.data[i] + m * bm.data[i];
                    rv.data[i] = (1.0 - m) * rv.data[i] + m * bv.data[i] * correction;
                }
            }

            (batch_mean, batch_var)
        } else {
            (
                self.running_mean.reshape(&[self.num_features, 1]),
                self.running_var.reshape(&[self.num_features, 1]),
            )
        };

        let eps = RawTensor::constant(self.eps, &[1]);
        let x_norm = x_flat.sub(&mean).div(&var.add(&eps).sqrt());

        let gamma = self.gamma.reshape(&[self.num_features, 1]);
        let beta = self.beta.reshape(&[self.num_features, 1]);
        x_norm
            .elem_mul(&gamma)
            .add(&beta)
            .reshape(&[self.num_features, b, h, w])
            .permute(&[1, 0, 2, 3])
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.gamma.clone(), self.beta.clone()]
    }

    fn train(&mut self, mode: bool) {
        self.training = mode;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("gamma".to_string(), TensorData::from_tensor(&self.gamma));
        state.insert("beta".to_string(), TensorData::from_tensor(&self.beta));
        state.insert(
            "running_mean".to_string(),
            TensorData::from_tensor(&self.running_mean),
        );
        state.insert(
            "running_var".to_string(),
            TensorData::from_tensor(&self.running_var),
        );
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) {
        assign(&self.gamma, state, "gamma");
        assign(&self.beta, state, "beta");
        assign(&self.running_mean, state, "running_mean");
        assign(&self.running_var, state, "running_var");
    }

    fn clone_box(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }
}

impl Clone for BatchNorm2d {
    fn clone(&self) -> Self {
        BatchNorm2d {
            num_features: self.num_features,
            eps: self.eps,
            momentum: self.momentum,
            training: self.training,
            gamma: RawTensor::detached_copy(&self.gamma),
            beta: RawTensor::detached_copy(&self.beta),
            running_mean: RawTensor::detached_copy(&self.running_mean),
            running_var: RawTensor::detached_copy(&self.running_var),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalises_each_channel_in_training() {
        let bn = BatchNorm2d::new(2);
        let x = RawTensor::new(
            vec![1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0],
            &[1, 2, 1, 4],
            false,
        );
        let y = bn.forward(&x).to_vec();
        let first: f32 = y[..4].iter().sum();
        let second: f32 = y[4..].iter().sum();
        assert!(first.abs() < 1e-4 && second.abs() < 1e-4);
        // running mean moved 10% of the way toward the batch mean
        let rm = bn.running_mean();
        assert!((rm[0] - 0.25).abs() < 1e-5);
        assert!((rm[1] - 2.5).abs() < 1e-5);
    }

    #[test]
    fn eval_uses_running_stats() {
        let mut bn = BatchNorm2d::new(1);
        bn.eval();
        let x = RawTensor::new(vec![3.0, -3.0], &[1, 1, 1, 2], false);
        let y = bn.forward(&x).to_vec();
        // running mean 0, var 1: near identity
        assert!((y[0] - 3.0).abs() < 1e-3);
        assert!((y[1] + 3.0).abs() < 1e-3);
    }

    #[test]
    fn batchnorm_gradient() {
        let bn = BatchNorm2d::new(2);
        let x = RawTensor::new(
            vec![0.5, -1.0, 2.0, 0.3, 1.5, 0.1, -0.7, 0.9],
            &[2, 2, 1, 2],
            true,
        );
        let w = RawTensor::new(
            vec![1.0, 2.0, -1.0, 0.5, 0.3, -2.0, 1.5, 1.0],
            &[2, 2, 1, 2],
            false,
        );
        assert!(RawTensor::check_gradients_simple(&x, |t| bn
            .forward(t)
            .elem_mul(&w)
            .sum()));
    }
}
