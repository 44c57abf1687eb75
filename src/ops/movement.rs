use crate::autograd::{GradFn, needs_grad, record};
use crate::{RawTensor, Tensor};

/// Movement operations: reshape/reorder data without changing values
///
/// Gradients "undo" the movement during backpropagation.
#[derive(Clone, Debug)]
pub enum MovementOp {
    Reshape,                                // Change shape, preserve order
    Permute { axes: Vec<usize> },           // Reorder axes
    Pad { padding: Vec<(usize, usize)> },   // Add zeros around edges
    Shrink { ranges: Vec<(usize, usize)> }, // Extract subregion
}

/// Unified gradient function for all movement operations
#[derive(Clone)]
pub struct MovementGradFn {
    op: MovementOp,
    original_shape: Vec<usize>,
}

impl GradFn for MovementGradFn {
    fn backward(&self, out_grad: &RawTensor, _parents: &[Tensor]) -> Vec<Option<Tensor>> {
        let grad = match &self.op {
            MovementOp::Reshape => out_grad.data.clone(),
            MovementOp::Permute { axes } => {
                let mut inverse_axes = vec![0; axes.len()];
                for (i, &ax) in axes.iter().enumerate() {
                    inverse_axes[ax] = i;
                }
                RawTensor::permute_data(&out_grad.data, &out_grad.shape, &inverse_axes).0
            }
            MovementOp::Pad { padding } => {
                // Cut the centre region back out
                let ranges: Vec<(usize, usize)> = padding
                    .iter()
                    .zip(&self.original_shape)
                    .map(|(&(before, _), &len)| (before, before + len))
                    .collect();
                RawTensor::shrink_data(&out_grad.data, &out_grad.shape, &ranges)
            }
            MovementOp::Shrink { ranges } => {
                let padding: Vec<(usize, usize)> = ranges
                    .iter()
                    .zip(&self.original_shape)
                    .map(|(&(start, end), &len)| (start, len - end))
                    .collect();
                RawTensor::pad_data(&out_grad.data, &out_grad.shape, &padding)
            }
        };
        vec![Some(RawTensor::new(grad, &self.original_shape, false))]
    }

    fn clone_box(&self) -> Box<dyn GradFn> {
        Box::new(self.clone())
    }
}

/// Gradient for concatenation: slice the output gradient back into pieces
#[derive(Clone)]
pub struct ConcatGradFn {
    dim: usize,
    shapes: Vec<Vec<usize>>,
}

impl GradFn for ConcatGradFn {
    fn backward(&self, out_grad: &RawTensor, parents: &[Tensor]) -> Vec<Option<Tensor>> {
        let mut start = 0;
        let mut grads = Vec::with_capacity(self.shapes.len());
        for (shape, parent) in self.shapes.iter().zip(parents) {
            let len = shape[self.dim];
            if parent.borrow().requires_grad {
                let ranges: Vec<(usize, usize)> = out_grad
                    .shape
                    .iter()
                    .enumerate()
                    .map(|(d, &n)| if d == self.dim { (start, start + len) } else { (0, n) })
                    .collect();
                let data = RawTensor::shrink_data(&out_grad.data, &out_grad.shape, &ranges);
                grads.push(Some(RawTensor::new(data, shape, false)));
            } else {
                grads.push(None);
            }
            start += len;
        }
        grads
    }

    fn clone_box(&self) -> Box<dyn GradFn> {
        Box::new(self.clone())
    }
}

// ===== MOVEMENT OPERATIONS =====
impl RawTensor {
    pub fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    fn movement(self_t: &Tensor, data: Vec<f32>, new_shape: &[usize], op: MovementOp) -> Tensor {
        let original_shape = self_t.borrow().shape.clone();
        let out = Self::new(data, new_shape, false);
        if needs_grad(&[self_t]) {
            record(
                &out,
                vec![self_t.clone()],
                Box::new(MovementGradFn { op, original_shape }),
            );
        }
        out
    }

    /// Reshape tensor to new shape (same number of elements)
    pub fn reshape(self_t: &Tensor, new_shape: &[usize]) -> Tensor {
        let data = {
            let s = self_t.borrow();
            assert_eq!(
                s.data.len(),
                new_shape.iter().product::<usize>(),
                "Cannot reshape {:?} to {new_shape:?}",
                s.shape
            );
            s.data.clone()
        };
        Self::movement(self_t, data, new_shape, MovementOp::Reshape)
    }

    /// Insert a size-1 axis at `dim`
    pub fn unsqueeze(self_t: &Tensor, dim: usize) -> Tensor {
        let mut shape = self_t.borrow().shape.clone();
        assert!(dim <= shape.len(), "unsqueeze dim {dim} out of range");
        shape.insert(dim, 1);
        Self::reshape(self_t, &shape)
    }

    /// Remove the size-1 axis at `dim`
    pub fn squeeze(self_t: &Tensor, dim: usize) -> Tensor {
        let mut shape = self_t.borrow().shape.clone();
        assert_eq!(shape.get(dim), Some(&1), "squeeze requires a size-1 axis at {dim}");
        shape.remove(dim);
        Self::reshape(self_t, &shape)
    }

    pub(crate) fn permute_data(data: &[f32], shape: &[usize], axes: &[usize]) -> (Vec<f32>, Vec<usize>) {
        assert_eq!(axes.len(), shape.len(), "Axes length must match rank");
        let new_shape: Vec<usize> = axes.iter().map(|&i| shape[i]).collect();
        let old_strides = Self::compute_strides(shape);
        // Stride in the old layout for each new axis
        let mapped: Vec<usize> = axes.iter().map(|&ax| old_strides[ax]).collect();

        let mut out = Vec::with_capacity(data.len());
        let mut coords = vec![0usize; new_shape.len()];
        for _ in 0..data.len() {
            let old_idx: usize = coords.iter().zip(&mapped).map(|(c, s)| c * s).sum();
            out.push(data[old_idx]);
            for d in (0..coords.len()).rev() {
                coords[d] += 1;
                if coords[d] < new_shape[d] {
                    break;
                }
                coords[d] = 0;
            }
        }
        (out, new_shape)
    }

    /// Permute (reorder) tensor axes
    pub fn permute(self_t: &Tensor, axes: &[usize]) -> Tensor {
        let mut sorted_axes = axes.to_vec();
        sorted_axes.sort_unstable();
        for (i, &ax) in sorted_axes.iter().enumerate() {
            assert_eq!(i, ax, "Invalid permutation axes {axes:?}");
        }
        let (data, new_shape) = {
            let s = self_t.borrow();
            Self::permute_data(&s.data, &s.shape, axes)
        };
        Self::movement(
            self_t,
            data,
            &new_shape,
            MovementOp::Permute {
                axes: axes.to_vec(),
            },
        )
    }

    pub(crate) fn pad_data(data: &[f32], shape: &[usize], padding: &[(usize, usize)]) -> Vec<f32> {
        let new_shape: Vec<usize> = shape
            .iter()
            .zip(padding)
            .map(|(&n, &(b, a))| n + b + a)
            .collect();
        let new_strides = Self::compute_strides(&new_shape);
        let mut out = vec![0.0; new_shape.iter().product()];
        let mut coords = vec![0usize; shape.len()];
        for &v in data {
            let idx: usize = coords
                .iter()
                .zip(padding)
                .zip(&new_strides)
                .map(|((c, p), s)| (c + p.0) * s)
                .sum();
            out[idx] = v;
            for d in (0..coords.len()).rev() {
                coords[d] += 1;
                if coords[d] < shape[d] {
                    break;
                }
                coords[d] = 0;
            }
        }
        out
    }

    /// Zero-pad each axis by (before, after)
    pub fn pad(self_t: &Tensor, padding: &[(usize, usize)]) -> Tensor {
        let (data, new_shape) = {
            let s = self_t.borrow();
            assert_eq!(padding.len(), s.shape.len(), "padding must cover every axis");
            let new_shape: Vec<usize> = s
                .shape
                .iter()
                .zip(padding)
                .map(|(&n, &(b, a))| n + b + a)
                .collect();
            (Self::pad_data(&s.data, &s.shape, padding), new_shape)
        };
        Self::movement(
            self_t,
            data,
            &new_shape,
            MovementOp::Pad {
                padding: padding.to_vec(),
            },
        )
    }

    pub(crate) fn shrink_data(data: &[f32], shape: &[usize], ranges: &[(usize, usize)]) -> Vec<f32> {
        let new_shape: Vec<usize> = ranges.iter().map(|&(s, e)| e - s).collect();
        let size: usize = new_shape.iter().product();
        let old_strides = Self::compute_strides(shape);
        let mut out = Vec::with_capacity(size);
        let mut coords = vec![0usize; shape.len()];
        for _ in 0..size {
            let idx: usize = coords
                .iter()
                .zip(ranges)
                .zip(&old_strides)
                .map(|((c, r), s)| (c + r.0) * s)
                .sum();
            out.push(data[idx]);
            for d in (0..coords.len()).rev() {
                coords[d] += 1;
                if coords[d] < new_shape[d] {
                    break;
                }
                coords[d] = 0;
            }
        }
        out
    }

    /// Extract the sub-region `[start, end)` along every axis
    pub fn shrink(self_t: &Tensor, ranges: &[(usize, usize)]) -> Tensor {
        let (data, new_shape) = {
            let s = self_t.borrow();
            assert_eq!(ranges.len(), s.shape.len(), "ranges must cover every axis");
            for (&(start, end), &n) in ranges.iter().zip(&s.shape) {
                assert!(start <= end && end <= n, "shrink range ({start}, {end}) out of bounds for {n}");
            }
            let new_shape: Vec<usize> = ranges.iter().map(|&(s, e)| e - s).collect();
            (Self::shrink_data(&s.data, &s.shape, ranges), new_shape)
        };
        Self::movement(
            self_t,
            data,
            &new_shape,
            MovementOp::Shrink {
                ranges: ranges.to_vec(),
            },
        )
    }

    /// Concatenate tensors along `dim`; all other axes must agree.
    pub fn cat(tensors: &[Tensor], dim: usize) -> Tensor {
        assert!(!tensors.is_empty(), "cat needs at least one tensor");
        let shapes: Vec<Vec<usize>> = tensors.iter().map(|t| t.borrow().shape.clone()).collect();
        let mut out_shape = shapes[0].clone();
        out_shape[dim] = 0;
        for shape in &shapes {
            assert_eq!(shape.len(), out_shape.len(), "cat rank mismatch");
            for (d, (&a, &b)) in shape.iter().zip(&shapes[0]).enumerate() {
                assert!(d == dim || a == b, "cat shape mismatch {shape:?} vs {:?}", shapes[0]);
            }
            out_shape[dim] += shape[dim];
        }

        let (outer, _, inner) = Self::split_at_dim(&out_shape, dim);
        let mut data = Vec::with_capacity(out_shape.iter().product());
        for o in 0..outer {
            for (t, shape) in tensors.iter().zip(&shapes) {
                let chunk = shape[dim] * inner;
                let t = t.borrow();
                data.extend_from_slice(&t.data[o * chunk..(o + 1) * chunk]);
            }
        }

        let out = Self::new(data, &out_shape, false);
        let refs: Vec<&Tensor> = tensors.iter().collect();
        if needs_grad(&refs) {
            record(
                &out,
                tensors.to_vec(),
                Box::new(ConcatGradFn { dim, shapes }),
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use crate::tensor::{RawTensor, TensorOps};

    #[test]
    fn permute_transposes_matrix() {
        let x = RawTensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], false);
        let y = x.permute(&[1, 0]);
        assert_eq!(y.shape(), vec![3, 2]);
        assert_eq!(y.to_vec(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn pad_then_shrink_restores_input() {
        let x = RawTensor::new(vec![1.0, 2.0, 3.0, 4.0], &[1, 2, 2], false);
        let padded = x.pad(&[(0, 0), (1, 0), (0, 2)]);
        assert_eq!(padded.shape(), vec![1, 3, 4]);
        let back = padded.shrink(&[(0, 1), (1, 3), (0, 2)]);
        assert_eq!(back.to_vec(), x.to_vec());
    }

    #[test]
    fn cat_gradient_routes_to_each_input() {
        let a = RawTensor::new(vec![1.0, 2.0], &[1, 1, 2], true);
        let b = RawTensor::new(vec![3.0, 4.0, 5.0, 6.0], &[1, 2, 2], true);
        let c = RawTensor::cat(&[a.clone(), b.clone()], 1);
        assert_eq!(c.shape(), vec![1, 3, 2]);
        assert_eq!(c.to_vec(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let w = RawTensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[1, 3, 2], false);
        c.elem_mul(&w).sum().backward();
        assert_eq!(a.grad().unwrap(), vec![1.0, 2.0]);
        assert_eq!(b.grad().unwrap(), vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn permute_gradient() {
        let x = RawTensor::new((0..24).map(|v| v as f32 * 0.1).collect(), &[2, 3, 4], true);
        let w = RawTensor::new((0..24).map(|v| (v % 5) as f32).collect(), &[4, 2, 3], false);
        assert!(RawTensor::check_gradients_simple(&x, |t| t
            .permute(&[2, 0, 1])
            .elem_mul(&w)
            .sum()));
    }
}
