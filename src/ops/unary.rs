use crate::autograd::{GradFn, needs_grad, record};
use crate::{RawTensor, Tensor};

#[derive(Clone, Copy, Debug)]
pub enum UnaryOp {
    Neg,
    Sqrt,
    Exp,
    Log,
    ReLU,
    Elu(f32),
    LeakyReLU(f32),
}

impl UnaryOp {
    fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::ReLU => x.max(0.0),
            UnaryOp::Elu(alpha) => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x.exp_m1()
                }
            }
            UnaryOp::LeakyReLU(slope) => {
                if x > 0.0 {
                    x
                } else {
                    slope * x
                }
            }
        }
    }

    /// d op(x) / dx
    fn derivative(self, x: f32) -> f32 {
        match self {
            UnaryOp::Neg => -1.0,
            UnaryOp::Sqrt => 0.5 / x.sqrt(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => 1.0 / x,
            UnaryOp::ReLU => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            UnaryOp::Elu(alpha) => {
                if x > 0.0 {
                    1.0
                } else {
                    alpha * x.exp()
                }
            }
            UnaryOp::LeakyReLU(slope) => {
                if x > 0.0 {
                    1.0
                } else {
                    slope
                }
            }
        }
    }
}

pub struct UnaryGradFn {
    op: UnaryOp,
}

impl GradFn for UnaryGradFn {
    fn backward(&self, out_grad: &RawTensor, parents: &[Tensor]) -> Vec<Option<Tensor>> {
        let x = parents[0].borrow();
        let grad_data: Vec<f32> = out_grad
            .data
            .iter()
            .zip(&x.data)
            .map(|(&g, &x)| g * self.op.derivative(x))
            .collect();
        vec![Some(RawTensor::new(grad_data, &x.shape, false))]
    }

    fn clone_box(&self) -> Box<dyn GradFn> {
        Box::new(Self { op: self.op })
    }
}

impl RawTensor {
    pub fn unary_op(self_t: &Tensor, op: UnaryOp) -> Tensor {
        let (data, shape) = {
            let s = self_t.borrow();
            (s.data.iter().map(|&x| op.apply(x)).collect(), s.shape.clone())
        };
        let out = Self::new(data, &shape, false);
        if needs_grad(&[self_t]) {
            record(&out, vec![self_t.clone()], Box::new(UnaryGradFn { op }));
        }
        out
    }

    pub fn neg(t: &Tensor) -> Tensor {
        Self::unary_op(t, UnaryOp::Neg)
    }
    pub fn sqrt(t: &Tensor) -> Tensor {
        Self::unary_op(t, UnaryOp::Sqrt)
    }
    pub fn exp(t: &Tensor) -> Tensor {
        Self::unary_op(t, UnaryOp::Exp)
    }
    pub fn log(t: &Tensor) -> Tensor {
        Self::unary_op(t, UnaryOp::Log)
    }
    pub fn relu(t: &Tensor) -> Tensor {
        Self::unary_op(t, UnaryOp::ReLU)
    }
    pub fn elu(t: &Tensor, alpha: f32) -> Tensor {
        Self::unary_op(t, UnaryOp::Elu(alpha))
    }
    pub fn leaky_relu(t: &Tensor, negative_slope: f32) -> Tensor {
        Self::unary_op(t, UnaryOp::LeakyReLU(negative_slope))
    }
}

#[cfg(test)]
mod tests {
    use crate::tensor::{RawTensor, TensorOps};

    #[test]
    fn elu_values_and_gradient() {
        let x = RawTensor::new(vec![-2.0, -0.5, 0.7, 3.0], &[4], true);
        let y = x.elu(1.0).to_vec();
        assert!((y[0] - ((-2.0f32).exp() - 1.0)).abs() < 1e-6);
        assert_eq!(y[3], 3.0);
        assert!(RawTensor::check_gradients_simple(&x, |t| t.elu(1.0).sum()));
    }

    #[test]
    fn leaky_relu_keeps_negative_slope() {
        let x = RawTensor::new(vec![-4.0, 5.0], &[2], true);
        let y = x.leaky_relu(0.25);
        assert_eq!(y.to_vec(), vec![-1.0, 5.0]);
        y.sum().backward();
        assert_eq!(x.grad().unwrap(), vec![0.25, 1.0]);
    }
}
