use crate::autograd::{GradFn, needs_grad, record};
use crate::tensor::TensorOps;
use crate::{RawTensor, Tensor};

/// Gradient for a full reduction to a single element: broadcast the scalar back
#[derive(Clone)]
pub struct SumGradFn {
    input_shape: Vec<usize>,
    scale: f32,
}

impl GradFn for SumGradFn {
    fn backward(&self, out_grad: &RawTensor, _parents: &[Tensor]) -> Vec<Option<Tensor>> {
        let g = out_grad.data[0] * self.scale;
        let size = self.input_shape.iter().product();
        vec![Some(RawTensor::new(vec![g; size], &self.input_shape, false))]
    }

    fn clone_box(&self) -> Box<dyn GradFn> {
        Box::new(self.clone())
    }
}

/// Gradient for sum_dim: broadcast the reduced gradient back along `dim`
#[derive(Clone)]
pub struct SumDimGradFn {
    input_shape: Vec<usize>,
    dim: usize,
}

impl GradFn for SumDimGradFn {
    fn backward(&self, out_grad: &RawTensor, _parents: &[Tensor]) -> Vec<Option<Tensor>> {
        let (outer, len, inner) = RawTensor::split_at_dim(&self.input_shape, self.dim);
        let mut result = vec![0.0; outer * len * inner];
        for o in 0..outer {
            for l in 0..len {
                let dst = (o * len + l) * inner;
                let src = o * inner;
                result[dst..dst + inner].copy_from_slice(&out_grad.data[src..src + inner]);
            }
        }
        vec![Some(RawTensor::new(result, &self.input_shape, false))]
    }

    fn clone_box(&self) -> Box<dyn GradFn> {
        Box::new(self.clone())
    }
}

/// Gradient for max_dim: only the winning element of each slice receives gradient
#[derive(Clone)]
pub struct MaxDimGradFn {
    input_shape: Vec<usize>,
    max_indices: Vec<usize>,
}

impl GradFn for MaxDimGradFn {
    fn backward(&self, out_grad: &RawTensor, _parents: &[Tensor]) -> Vec<Option<Tensor>> {
        let mut result = vec![0.0; self.input_shape.iter().product()];
        for (out_idx, &in_idx) in self.max_indices.iter().enumerate() {
            result[in_idx] += out_grad.data[out_idx];
        }
        vec![Some(RawTensor::new(result, &self.input_shape, false))]
    }

    fn clone_box(&self) -> Box<dyn GradFn> {
        Box::new(self.clone())
    }
}

impl RawTensor {
    /// View a shape as (outer, dim, inner) around axis `dim`.
    pub(crate) fn split_at_dim(shape: &[usize], dim: usize) -> (usize, usize, usize) {
        assert!(dim < shape.len(), "dim {dim} out of bounds for shape {shape:?}");
        let outer = shape[..dim].iter().product();
        let inner = shape[dim + 1..].iter().product();
        (outer, shape[dim], inner)
    }

    fn reduced_shape(shape: &[usize], dim: usize, keepdim: bool) -> Vec<usize> {
        let mut out = shape.to_vec();
        if keepdim {
            out[dim] = 1;
        } else {
            out.remove(dim);
        }
        out
    }

    /// Sum of all elements, shape [1]
    pub fn sum(self_t: &Tensor) -> Tensor {
        Self::full_reduce(self_t, false)
    }

    /// Mean of all elements, shape [1]
    pub fn mean(self_t: &Tensor) -> Tensor {
        Self::full_reduce(self_t, true)
    }

    fn full_reduce(self_t: &Tensor, average: bool) -> Tensor {
        let (total, shape, n) = {
            let s = self_t.borrow();
            (s.data.iter().sum::<f32>(), s.shape.clone(), s.data.len())
        };
        let scale = if average { 1.0 / n.max(1) as f32 } else { 1.0 };
        let out = Self::new(vec![total * scale], &[1], false);
        if needs_grad(&[self_t]) {
            record(
                &out,
                vec![self_t.clone()],
                Box::new(SumGradFn {
                    input_shape: shape,
                    scale,
                }),
            );
        }
        out
    }

    /// Sum along a specific axis
    ///
    /// # Examples
    /// x = [[1,2,3],[4,5,6]]
    /// x.sum_dim(1, false) -> [6, 15] shape [2]
    /// x.sum_dim(1, true)  -> [[6], [15]] shape [2,1]
    pub fn sum_dim(self_t: &Tensor, dim: usize, keepdim: bool) -> Tensor {
        let (result, shape) = {
            let s = self_t.borrow();
            let (outer, len, inner) = Self::split_at_dim(&s.shape, dim);
            let mut result = vec![0.0; outer * inner];
            for o in 0..outer {
                for l in 0..len {
                    let src = (o * len + l) * inner;
                    for i in 0..inner {
                        result[o * inner + i] += s.data[src + i];
                    }
                }
            }
            (result, s.shape.clone())
        };

        let out = Self::new(result, &Self::reduced_shape(&shape, dim, keepdim), false);
        if needs_grad(&[self_t]) {
            record(
                &out,
                vec![self_t.clone()],
                Box::new(SumDimGradFn {
                    input_shape: shape,
                    dim,
                }),
            );
        }
        out
    }

    /// Max along a specific axis; winning indices are kept for backward.
    pub fn max_dim(self_t: &Tensor, dim: usize, keepdim: bool) -> Tensor {
        let (result, max_indices, shape) = {
            let s = self_t.borrow();
            let (outer, len, inner) = Self::split_at_dim(&s.shape, dim);
            let mut result = vec![f32::NEG_INFINITY; outer * inner];
            let mut max_indices = vec![0; outer * inner];
            for o in 0..outer {
                for l in 0..len {
                    let src = (o * len + l) * inner;
                    for i in 0..inner {
                        let slot = o * inner + i;
                        if s.data[src + i] > result[slot] {
                            result[slot] = s.data[src + i];
                            max_indices[slot] = src + i;
                        }
                    }
                }
            }
            (result, max_indices, s.shape.clone())
        };

        let out = Self::new(result, &Self::reduced_shape(&shape, dim, keepdim), false);
        if needs_grad(&[self_t]) {
            record(
                &out,
                vec![self_t.clone()],
                Box::new(MaxDimGradFn {
                    input_shape: shape,
                    max_indices,
                }),
            );
        }
        out
    }

    /// Mean along a specific axis, implemented as sum_dim(dim) / size(dim)
    pub fn mean_dim(self_t: &Tensor, dim: usize, keepdim: bool) -> Tensor {
        let n = self_t.borrow().shape[dim] as f32;
        let sum = Self::sum_dim(self_t, dim, keepdim);
        sum.div(&Self::constant(n, &[1]))
    }

    pub fn softmax(self_t: &Tensor, dim: usize) -> Tensor {
        Self::log_softmax(self_t, dim).exp()
    }

    /// log(softmax(x)) computed as (x - max) - log(sum(exp(x - max)))
    pub fn log_softmax(self_t: &Tensor, dim: usize) -> Tensor {
        // The shift is a constant; gradients through it cancel exactly.
        let max = Self::detach(&Self::max_dim(self_t, dim, true));
        let shifted = self_t.sub(&max);
        let log_sum = shifted.exp().sum_dim(dim, true).log();
        shifted.sub(&log_sum)
    }
}

#[cfg(test)]
mod tests {
    use crate::tensor::{RawTensor, TensorOps};

    #[test]
    fn sum_dim_and_mean_dim() {
        let x = RawTensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], false);
        assert_eq!(x.sum_dim(1, false).to_vec(), vec![6.0, 15.0]);
        assert_eq!(x.sum_dim(0, true).shape(), vec![1, 3]);
        assert_eq!(x.mean_dim(1, true).to_vec(), vec![2.0, 5.0]);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let x = RawTensor::new(vec![1.0, 2.0, 3.0, -1.0, 0.0, 10.0], &[2, 3], false);
        let s = x.softmax(1).sum_dim(1, false).to_vec();
        for v in s {
            assert!((v - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn log_softmax_gradient() {
        let x = RawTensor::new(vec![0.2, -0.4, 1.3, 0.9, 0.1, -0.7], &[2, 3], true);
        let w = RawTensor::new(vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0], &[2, 3], false);
        assert!(RawTensor::check_gradients_simple(&x, |t| t
            .log_softmax(1)
            .elem_mul(&w)
            .sum()));
    }
}
