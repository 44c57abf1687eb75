use crate::autograd::{GradFn, needs_grad, record};
use crate::io::StateDict;
use crate::nn::Module;
use crate::tensor::{RawTensor, Tensor, TensorOps};

/// Gradient routing shared by the pooling layers: every output element
/// scatters its gradient onto a weighted set of input elements.
#[derive(Clone)]
struct PoolGradFn {
    input_shape: Vec<usize>,
    // (output index, input index, weight)
    routes: Vec<(usize, usize, f32)>,
}

impl GradFn for PoolGradFn {
    fn backward(&self, out_grad: &RawTensor, _parents: &[Tensor]) -> Vec<Option<Tensor>> {
        let mut grad_input = vec![0.0; self.input_shape.iter().product()];
        for &(out_idx, in_idx, weight) in &self.routes {
            grad_input[in_idx] += out_grad.data[out_idx] * weight;
        }
        vec![Some(RawTensor::new(grad_input, &self.input_shape, false))]
    }

    fn clone_box(&self) -> Box<dyn GradFn> {
        Box::new(self.clone())
    }
}

fn finish_pool(
    input: &Tensor,
    out_data: Vec<f32>,
    out_shape: &[usize],
    routes: Vec<(usize, usize, f32)>,
) -> Tensor {
    let out = RawTensor::new(out_data, out_shape, false);
    if needs_grad(&[input]) {
        let input_shape = input.borrow().shape.clone();
        record(
            &out,
            vec![input.clone()],
            Box::new(PoolGradFn {
                input_shape,
                routes,
            }),
        );
    }
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PoolKind {
    Max,
    Avg,
}

/// Shared windowed 2D pooling over (B, C, H, W), stride defaults to the kernel.
fn pool2d(
    x: &Tensor,
    kind: PoolKind,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
) -> Tensor {
    let (pad_h, pad_w) = padding;
    let x_padded = if pad_h > 0 || pad_w > 0 {
        x.pad(&[(0, 0), (0, 0), (pad_h, pad_h), (pad_w, pad_w)])
    } else {
        x.clone()
    };

    let xp = x_padded.borrow();
    assert_eq!(xp.shape.len(), 4, "2D pooling expects input shape (B, C, H, W)");
    let (batch, channels, h, w) = (xp.shape[0], xp.shape[1], xp.shape[2], xp.shape[3]);
    let (kernel_h, kernel_w) = kernel;
    let (stride_h, stride_w) = stride;
    assert!(kernel_h > 0 && kernel_w > 0, "Kernel size must be positive");
    assert!(stride_h > 0 && stride_w > 0, "Stride must be positive");
    assert!(h >= kernel_h && w >= kernel_w, "Kernel larger than input");

    let h_out = (h - kernel_h) / stride_h + 1;
    let w_out = (w - kernel_w) / stride_w + 1;
    let mut out_data = vec![0.0; batch * channels * h_out * w_out];
    let window = (kernel_h * kernel_w) as f32;
    let mut routes = Vec::with_capacity(match kind {
        PoolKind::Max => out_data.len(),
        PoolKind::Avg => out_data.len() * kernel_h * kernel_w,
    });

    for plane in 0..batch * channels {
        let in_base = plane * h * w;
        for oh in 0..h_out {
            for ow in 0..w_out {
                let out_idx = (plane * h_out + oh) * w_out + ow;
                let mut best = (f32::NEG_INFINITY, 0usize);
                let mut total = 0.0;
                for kh in 0..kernel_h {
                    for kw in 0..kernel_w {
                        let in_idx = in_base + (oh * stride_h + kh) * w + ow * stride_w + kw;
                        let val = xp.data[in_idx];
                        match kind {
                            PoolKind::Max => {
                                if val > best.0 {
                                    best = (val, in_idx);
                                }
                            }
                            PoolKind::Avg => {
                                total += val;
                                routes.push((out_idx, in_idx, 1.0 / window));
                            }
                        }
                    }
                }
                out_data[out_idx] = match kind {
                    PoolKind::Max => {
                        routes.push((out_idx, best.1, 1.0));
                        best.0
                    }
                    PoolKind::Avg => total / window,
                };
            }
        }
    }
    drop(xp);

    finish_pool(&x_padded, out_data, &[batch, channels, h_out, w_out], routes)
}

/// 2D max pooling layer
///
/// Accepts tensors shaped (batch, channels, height, width) and downsamples each
/// spatial window to its maximum value.
#[derive(Clone, Debug)]
pub struct MaxPool2d {
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
}

impl MaxPool2d {
    /// Square-kernel constructor for convenience
    #[must_use]
    pub const fn new(kernel: usize, stride: usize, padding: usize) -> Self {
        Self {
            kernel: (kernel, kernel),
            stride: (stride, stride),
            padding: (padding, padding),
        }
    }

    /// Non-overlapping windows: stride equals the kernel
    #[must_use]
    pub const fn with_kernel(kernel: (usize, usize)) -> Self {
        Self {
            kernel,
            stride: kernel,
            padding: (0, 0),
        }
    }
}

/// 2D average pooling, same geometry rules as [`MaxPool2d`].
#[derive(Clone, Debug)]
pub struct AvgPool2d {
    kernel: (usize, usize),
    stride: (usize, usize),
}

impl AvgPool2d {
    #[must_use]
    pub const fn with_kernel(kernel: (usize, usize)) -> Self {
        Self {
            kernel,
            stride: kernel,
        }
    }
}

/// Averages (B, C, L) down to (B, C, output_size) with adaptive bin edges.
///
/// Bin `i` covers `[floor(i*L/out), ceil((i+1)*L/out))`, so bins may overlap
/// when `L` is not a multiple of `out`.
#[derive(Clone, Debug)]
pub struct AdaptiveAvgPool1d {
    output_size: usize,
}

impl AdaptiveAvgPool1d {
    #[must_use]
    pub const fn new(output_size: usize) -> Self {
        Self { output_size }
    }
}

macro_rules! stateless_module {
    ($ty:ty) => {
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
            Box::new(<$ty>::clone(self))
        }
    };
}

impl Module for MaxPool2d {
    fn forward(&self, x: &Tensor) -> Tensor {
        pool2d(x, PoolKind::Max, self.kernel, self.stride, self.padding)
    }
    stateless_module!(MaxPool2d);
}

impl Module for AvgPool2d {
    fn forward(&self, x: &Tensor) -> Tensor {
        pool2d(x, PoolKind::Avg, self.kernel, self.stride, (0, 0))
    }
    stateless_module!(AvgPool2d);
}

impl Module for AdaptiveAvgPool1d {
    fn forward(&self, x: &Tensor) -> Tensor {
        let (out_data, out_shape, routes) = {
            let xb = x.borrow();
            assert_eq!(xb.shape.len(), 3, "AdaptiveAvgPool1d expects (B, C, L)");
            let (planes, len) = (xb.shape[0] * xb.shape[1], xb.shape[2]);
            let out_len = self.output_size;
            assert!(out_len > 0, "output size must be positive");

            let mut out_data = vec![0.0; planes * out_len];
            let mut routes = Vec::new();
            for plane in 0..planes {
                for i in 0..out_len {
                    let start = i * len / out_len;
                    let end = ((i + 1) * len).div_ceil(out_len);
                    let width = (end - start) as f32;
                    let out_idx = plane * out_len + i;
                    let mut total = 0.0;
                    for j in start..end {
                        let in_idx = plane * len + j;
                        total += xb.data[in_idx];
                        routes.push((out_idx, in_idx, 1.0 / width));
                    }
                    out_data[out_idx] = total / width;
                }
            }
            (out_data, vec![xb.shape[0], xb.shape[1], out_len], routes)
        };
        finish_pool(x, out_data, &out_shape, routes)
    }
    stateless_module!(AdaptiveAvgPool1d);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maxpool2d_forward_values() {
        let pool = MaxPool2d::new(2, 2, 0);
        let data: Vec<f32> = (1..=16).map(|v| v as f32).collect();
        let x = RawTensor::new(data, &[1, 1, 4, 4], false);
        assert_eq!(pool.forward(&x).to_vec(), vec![6.0, 8.0, 14.0, 16.0]);
    }

    #[test]
    fn temporal_pool_drops_remainder() {
        // (1, 4) windows over 10 samples: floor(10 / 4) = 2 outputs
        let pool = MaxPool2d::with_kernel((1, 4));
        let x = RawTensor::randn(&[2, 3, 2, 10]);
        assert_eq!(pool.forward(&x).shape(), vec![2, 3, 2, 2]);
    }

    #[test]
    fn test_maxpool2d_gradcheck() {
        let pool = MaxPool2d::new(2, 2, 0);
        let data: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let x = RawTensor::new(data, &[1, 1, 4, 4], true);
        assert!(RawTensor::check_gradients_simple(&x, |t| pool.forward(t).sum()));
    }

    #[test]
    fn avgpool_values_and_gradient() {
        let pool = AvgPool2d::with_kernel((1, 2));
        let x = RawTensor::new(vec![1.0, 3.0, 5.0, 7.0, 9.0], &[1, 1, 1, 5], true);
        let y = pool.forward(&x);
        assert_eq!(y.to_vec(), vec![2.0, 6.0]);
        y.sum().backward();
        assert_eq!(x.grad().unwrap(), vec![0.5, 0.5, 0.5, 0.5, 0.0]);
    }

    #[test]
    fn adaptive_bins_overlap_when_uneven() {
        let pool = AdaptiveAvgPool1d::new(2);
        let x = RawTensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0], &[1, 1, 5], true);
        let y = pool.forward(&x);
        // bins [0, 3) and [2, 5)
        assert_eq!(y.to_vec(), vec![2.0, 4.0]);
        y.sum().backward();
        let g = x.grad().unwrap();
        assert!((g[2] - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn adaptive_pool_is_identity_when_sizes_match() {
        let pool = AdaptiveAvgPool1d::new(4);
        let x = RawTensor::randn(&[2, 3, 4]);
        assert_eq!(pool.forward(&x).to_vec(), x.to_vec());
    }
}
