use crate::tensor::Tensor;

/// Adam with optional L2 weight decay folded into the gradient.
pub struct Adam {
    params: Vec<Tensor>,
    lr: f32,
    betas: (f32, f32),
    eps: f32,
    weight_decay: f32,
    m: Vec<Vec<f32>>, // 1st moment
    v: Vec<Vec<f32>>, // 2nd moment
    t: usize,         // timestep
}

impl Adam {
    #[must_use]
    pub fn new(
        params: Vec<Tensor>,
        lr: f32,
        betas: (f32, f32),
        eps: f32,
        weight_decay: f32,
    ) -> Self {
        let zeros = |params: &[Tensor]| -> Vec<Vec<f32>> {
            params
                .iter()
                .map(|p| vec![0.0; p.borrow().data.len()])
                .collect()
        };
        let m = zeros(&params);
        let v = zeros(&params);
        Adam {
            params,
            lr,
            betas,
            eps,
            weight_decay,
            m,
            v,
            t: 0,
        }
    }

    /// The usual defaults: betas (0.9, 0.999), eps 1e-8, no weight decay.
    #[must_use]
    pub fn with_lr(params: Vec<Tensor>, lr: f32) -> Self {
        Self::new(params, lr, (0.9, 0.999), 1e-8, 0.0)
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    pub fn zero_grad(&self) {
        for param in &self.params {
            param.borrow_mut().grad = None;
        }
    }

    pub fn step(&mut self) {
        self.t += 1;
        let m_hat_scale = 1.0 / (1.0 - self.betas.0.powi(self.t as i32));
        let v_hat_scale = 1.0 / (1.0 - self.betas.1.powi(self.t as i32));

        for (i, param) in self.params.iter().enumerate() {
            let mut p = param.borrow_mut();
            // Frozen or unused parameters carry no gradient
            if !p.requires_grad {
                continue;
            }
            let Some(mut grad) = p.grad.clone() else {
                continue;
            };

            if self.weight_decay != 0.0 {
                for (g, theta) in grad.iter_mut().zip(p.data.iter()) {
                    *g += self.weight_decay * *theta;
                }
            }

            let (m, v) = (&mut self.m[i], &mut self.v[i]);
            for ((theta, g), (m, v)) in p
                .data
                .iter_mut()
                .zip(&grad)
                .zip(m.iter_mut().zip(v.iter_mut()))
            {
                *m = self.betas.0 * *m + (1.0 - self.betas.0) * g;
                *v = self.betas.1 * *v + (1.0 - self.betas.1) * g * g;
                let m_hat = *m * m_hat_scale;
                let v_hat = *v * v_hat_scale;
                *theta -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{RawTensor, TensorOps};

    #[test]
    fn first_step_moves_by_learning_rate() {
        let w = RawTensor::new(vec![1.0, -1.0], &[2], true);
        let mut opt = Adam::with_lr(vec![w.clone()], 0.1);
        w.elem_mul(&w).sum().backward();
        opt.step();
        // bias-corrected first step is lr * sign(grad)
        let data = w.to_vec();
        assert!((data[0] - 0.9).abs() < 1e-5);
        assert!((data[1] + 0.9).abs() < 1e-5);
    }

    #[test]
    fn frozen_parameters_are_untouched() {
        let w = RawTensor::new(vec![1.0], &[1], true);
        let mut opt = Adam::with_lr(vec![w.clone()], 0.1);
        w.elem_mul(&w).sum().backward();
        w.borrow_mut().requires_grad = false;
        opt.step();
        assert_eq!(w.to_vec(), vec![1.0]);
    }
}
