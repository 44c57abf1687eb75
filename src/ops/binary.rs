use crate::autograd::{GradFn, needs_grad, record};
use crate::{RawTensor, Tensor};

/// Binary operations: two inputs, one output
///
/// Broadcasting is automatically handled for compatible shapes.
#[derive(Clone, Copy, Debug)]
pub enum BinaryOp {
    Add, // x + y
    Sub, // x - y
    Mul, // x * y (element-wise)
    Div, // x / y (element-wise)
}

impl BinaryOp {
    fn apply(self, x: f32, y: f32) -> f32 {
        match self {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
        }
    }
}

/// Gradient function for binary operations
///
/// Gradients are summed over dimensions that were broadcast in the forward pass.
pub struct BinaryGradFn {
    op: BinaryOp,
}

impl GradFn for BinaryGradFn {
    fn backward(&self, out_grad: &RawTensor, parents: &[Tensor]) -> Vec<Option<Tensor>> {
        let x_val = parents[0].borrow();
        let y_val = parents[1].borrow();
        let out_shape = &out_grad.shape;

        let reduce_to = |grad: Vec<f32>, target: &[usize]| -> Tensor {
            let summed = RawTensor::sum_over_broadcast_dims(&grad, out_shape, target);
            RawTensor::new(summed, target, false)
        };

        let grad_x = x_val.requires_grad.then(|| {
            let grad: Vec<f32> = match self.op {
                BinaryOp::Add | BinaryOp::Sub => out_grad.data.clone(),
                BinaryOp::Mul => {
                    let y_bc = RawTensor::broadcast_to(&y_val.data, &y_val.shape, out_shape);
                    out_grad.data.iter().zip(&y_bc).map(|(&g, &y)| g * y).collect()
                }
                BinaryOp::Div => {
                    let y_bc = RawTensor::broadcast_to(&y_val.data, &y_val.shape, out_shape);
                    out_grad.data.iter().zip(&y_bc).map(|(&g, &y)| g / y).collect()
                }
            };
            reduce_to(grad, &x_val.shape)
        });

        let grad_y = y_val.requires_grad.then(|| {
            let grad: Vec<f32> = match self.op {
                BinaryOp::Add => out_grad.data.clone(),
                BinaryOp::Sub => out_grad.data.iter().map(|&g| -g).collect(),
                BinaryOp::Mul => {
                    let x_bc = RawTensor::broadcast_to(&x_val.data, &x_val.shape, out_shape);
                    out_grad.data.iter().zip(&x_bc).map(|(&g, &x)| g * x).collect()
                }
                BinaryOp::Div => {
                    let x_bc = RawTensor::broadcast_to(&x_val.data, &x_val.shape, out_shape);
                    let y_bc = RawTensor::broadcast_to(&y_val.data, &y_val.shape, out_shape);
                    out_grad
                        .data
                        .iter()
                        .zip(&x_bc)
                        .zip(&y_bc)
                        .map(|((&g, &x), &y)| -g * x / (y * y))
                        .collect()
                }
            };
            reduce_to(grad, &y_val.shape)
        });

        vec![grad_x, grad_y]
    }

    fn clone_box(&self) -> Box<dyn GradFn> {
        Box::new(BinaryGradFn { op: self.op })
    }
}

impl RawTensor {
    pub fn binary_op(self_t: &Tensor, other: &Tensor, op: BinaryOp) -> Tensor {
        let (out_shape, data) = {
            let a = self_t.borrow();
            let b = other.borrow();
            if a.shape == b.shape {
                let data = a
                    .data
                    .iter()
                    .zip(&b.data)
                    .map(|(&x, &y)| op.apply(x, y))
                    .collect();
                (a.shape.clone(), data)
            } else {
                let out_shape = Self::broadcast_shape(&a.shape, &b.shape);
                let a_bc = Self::broadcast_to(&a.data, &a.shape, &out_shape);
                let b_bc = Self::broadcast_to(&b.data, &b.shape, &out_shape);
                let data = a_bc
                    .iter()
                    .zip(&b_bc)
                    .map(|(&x, &y)| op.apply(x, y))
                    .collect();
                (out_shape, data)
            }
        };

        let out = Self::new(data, &out_shape, false);
        if needs_grad(&[self_t, other]) {
            record(
                &out,
                vec![self_t.clone(), other.clone()],
                Box::new(BinaryGradFn { op }),
            );
        }
        out
    }

    pub fn add(self_t: &Tensor, other: &Tensor) -> Tensor {
        Self::binary_op(self_t, other, BinaryOp::Add)
    }
    pub fn sub(self_t: &Tensor, other: &Tensor) -> Tensor {
        Self::binary_op(self_t, other, BinaryOp::Sub)
    }
    pub fn elem_mul(self_t: &Tensor, other: &Tensor) -> Tensor {
        Self::binary_op(self_t, other, BinaryOp::Mul)
    }
    pub fn div(self_t: &Tensor, other: &Tensor) -> Tensor {
        Self::binary_op(self_t, other, BinaryOp::Div)
    }

    /// Numpy-style broadcast of two shapes (aligned from the trailing dimension).
    ///
    /// # Panics
    /// Incompatible shapes
    #[must_use]
    pub fn broadcast_shape(shape_a: &[usize], shape_b: &[usize]) -> Vec<usize> {
        let max_len = shape_a.len().max(shape_b.len());
        let mut result = vec![1; max_len];
        for i in 0..max_len {
            let a_dim = if i < shape_a.len() { shape_a[shape_a.len() - 1 - i] } else { 1 };
            let b_dim = if i < shape_b.len() { shape_b[shape_b.len() - 1 - i] } else { 1 };
            result[max_len - 1 - i] = if a_dim == b_dim || b_dim == 1 {
                a_dim
            } else if a_dim == 1 {
                b_dim
            } else {
                panic!("Cannot broadcast shapes {shape_a:?} and {shape_b:?} at dimension {i}");
            };
        }
        result
    }

    pub(crate) fn broadcast_to(data: &[f32], from_shape: &[usize], to_shape: &[usize]) -> Vec<f32> {
        if from_shape == to_shape {
            return data.to_vec();
        }
        let offset = to_shape.len() - from_shape.len();
        let mut padded_from = vec![1; to_shape.len()];
        padded_from[offset..].copy_from_slice(from_shape);
        let from_strides = Self::compute_strides(&padded_from);
        let to_size: usize = to_shape.iter().product();

        let mut result = Vec::with_capacity(to_size);
        for i in 0..to_size {
            let mut from_idx = 0;
            let mut rem = i;
            for dim in (0..to_shape.len()).rev() {
                let coord = rem % to_shape[dim];
                rem /= to_shape[dim];
                if padded_from[dim] != 1 {
                    from_idx += coord * from_strides[dim];
                }
            }
            result.push(data[from_idx]);
        }
        result
    }

    pub(crate) fn sum_over_broadcast_dims(
        grad: &[f32],
        grad_shape: &[usize],
        target_shape: &[usize],
    ) -> Vec<f32> {
        if grad_shape == target_shape {
            return grad.to_vec();
        }
        let offset = grad_shape.len() - target_shape.len();
        let mut padded_target = vec![1; grad_shape.len()];
        padded_target[offset..].copy_from_slice(target_shape);
        let target_strides = Self::compute_strides(&padded_target);

        let mut result = vec![0.0; target_shape.iter().product()];
        for (i, &g) in grad.iter().enumerate() {
            let mut target_idx = 0;
            let mut rem = i;
            for dim in (0..grad_shape.len()).rev() {
                let coord = rem % grad_shape[dim];
                rem /= grad_shape[dim];
                if padded_target[dim] != 1 {
                    target_idx += coord * target_strides[dim];
                }
            }
            result[target_idx] += g;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use crate::tensor::{RawTensor, TensorOps};

    #[test]
    fn broadcast_add_shapes() {
        let a = RawTensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], false);
        let b = RawTensor::new(vec![10.0, 20.0], &[2, 1], false);
        let c = a.add(&b);
        assert_eq!(c.shape(), vec![2, 3]);
        assert_eq!(c.to_vec(), vec![11.0, 12.0, 13.0, 24.0, 25.0, 26.0]);
    }

    #[test]
    fn broadcast_gradients_sum_back() {
        let a = RawTensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], true);
        let b = RawTensor::new(vec![0.5, 2.0, -1.0], &[3], true);
        let loss = a.elem_mul(&b).sum();
        loss.backward();
        // d/db = column sums of a
        assert_eq!(b.grad().unwrap(), vec![5.0, 7.0, 9.0]);
        assert_eq!(a.grad().unwrap(), vec![0.5, 2.0, -1.0, 0.5, 2.0, -1.0]);
    }

    #[test]
    fn division_gradient_checks() {
        let y = RawTensor::new(vec![1.5, -2.0, 3.0], &[3], true);
        let x = RawTensor::new(vec![0.3, 0.7, -1.1], &[3], false);
        assert!(RawTensor::check_gradients_simple(&y, |t| x.div(t).sum()));
    }
}
