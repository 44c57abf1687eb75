use crate::tensor::Tensor;

/// Stochastic Gradient Descent optimizer with optional momentum
///
/// Update rule:
/// - Without momentum: θ ← θ - lr·∇θ
/// - With momentum: v ← β·v - lr·∇θ, θ ← θ + v
pub struct SGD {
    params: Vec<Tensor>,
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    velocity: Vec<Vec<f32>>,
}

impl SGD {
    /// # Arguments
    /// * `params` - List of parameters to optimize
    /// * `lr` - Learning rate
    /// * `momentum` - Momentum coefficient (0.0 for none)
    /// * `weight_decay` - L2 penalty (0.0 for none)
    pub fn new(params: Vec<Tensor>, lr: f32, momentum: f32, weight_decay: f32) -> Self {
        let velocity = params
            .iter()
            .map(|p| vec![0.0; p.borrow().data.len()])
            .collect();
        SGD {
            params,
            lr,
            momentum,
            weight_decay,
            velocity,
        }
    }

    pub fn zero_grad(&self) {
        for param in &self.params {
            param.borrow_mut().grad = None;
        }
    }

    pub fn step(&mut self) {
        for (param, velocity) in self.params.iter().zip(self.velocity.iter_mut()) {
            let mut p = param.borrow_mut();
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

            if self.momentum > 0.0 {
                for (v, &g) in velocity.iter_mut().zip(&grad) {
                    *v = self.momentum * *v - self.lr * g;
                }
                for (d, &v) in p.data.iter_mut().zip(velocity.iter()) {
                    *d += v;
                }
            } else {
                for (d, &g) in p.data.iter_mut().zip(&grad) {
                    *d -= self.lr * g;
                }
            }
        }
    }
}
