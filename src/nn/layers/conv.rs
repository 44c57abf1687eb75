use crate::autograd::{GradFn, needs_grad, record};
use crate::io::{StateDict, TensorData};
use crate::nn::{Module, assign};
use crate::tensor::{RawTensor, Tensor, TensorOps};

/// Everything about a convolution except the channel counts and kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Conv2dOptions {
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub dilation: (usize, usize),
    pub groups: usize,
    pub bias: bool,
}

impl Default for Conv2dOptions {
    fn default() -> Self {
        Self {
            stride: (1, 1),
            padding: (0, 0),
            dilation: (1, 1),
            groups: 1,
            bias: true,
        }
    }
}

impl Conv2dOptions {
    pub fn padding(mut self, padding: (usize, usize)) -> Self {
        self.padding = padding;
        self
    }
    pub fn stride(mut self, stride: (usize, usize)) -> Self {
        self.stride = stride;
        self
    }
    pub fn dilation(mut self, dilation: (usize, usize)) -> Self {
        self.dilation = dilation;
        self
    }
    pub fn groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }
    pub fn bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }
}

/// 2D convolution over (B, C, H, W), with rectangular kernels, dilation and groups.
pub struct Conv2d {
    weight: Tensor,       // [out_channels, in_channels / groups, kernel_h, kernel_w]
    bias: Option<Tensor>, // [out_channels]
    in_channels: usize,
    out_channels: usize,
    kernel: (usize, usize),
    opts: Conv2dOptions,
}

/// Geometry shared by the forward loop and its gradient.
#[derive(Clone, Copy, Debug)]
struct ConvGeometry {
    batch: usize,
    in_ch: usize,
    out_ch: usize,
    in_h: usize,
    in_w: usize,
    out_h: usize,
    out_w: usize,
    kernel: (usize, usize),
    opts: Conv2dOptions,
}

impl ConvGeometry {
    fn in_per_group(&self) -> usize {
        self.in_ch / self.opts.groups
    }
    fn out_per_group(&self) -> usize {
        self.out_ch / self.opts.groups
    }

    /// Visit every (input index, weight index, output index) triple of the convolution.
    fn for_each_tap(&self, mut f: impl FnMut(usize, usize, usize)) {
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.opts.stride;
        let (ph, pw) = self.opts.padding;
        let (dh, dw) = self.opts.dilation;
        let cin_g = self.in_per_group();
        let cout_g = self.out_per_group();

        for b in 0..self.batch {
            for o in 0..self.out_ch {
                let group = o / cout_g;
                for ci in 0..cin_g {
                    let c = group * cin_g + ci;
                    let x_base = (b * self.in_ch + c) * self.in_h * self.in_w;
                    let w_base = (o * cin_g + ci) * kh * kw;
                    for ki in 0..kh {
                        for oh in 0..self.out_h {
                            let ih = (oh * sh + ki * dh) as isize - ph as isize;
                            if ih < 0 || ih as usize >= self.in_h {
                                continue;
                            }
                            let out_row = ((b * self.out_ch + o) * self.out_h + oh) * self.out_w;
                            let x_row = x_base + ih as usize * self.in_w;
                            for kj in 0..kw {
                                let w_idx = w_base + ki * kw + kj;
                                for ow in 0..self.out_w {
                                    let iw = (ow * sw + kj * dw) as isize - pw as isize;
                                    if iw < 0 || iw as usize >= self.in_w {
                                        continue;
                                    }
                                    f(x_row + iw as usize, w_idx, out_row + ow);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

#[derive(Clone)]
struct Conv2dGradFn {
    geometry: ConvGeometry,
}

impl GradFn for Conv2dGradFn {
    fn backward(&self, out_grad: &RawTensor, parents: &[Tensor]) -> Vec<Option<Tensor>> {
        let x = parents[0].borrow();
        let w = parents[1].borrow();
        let g = &out_grad.data;

        let mut dx = x.requires_grad.then(|| vec![0.0; x.data.len()]);
        let mut dw = w.requires_grad.then(|| vec![0.0; w.data.len()]);
        self.geometry.for_each_tap(|xi, wi, oi| {
            let go = g[oi];
            if let Some(dx) = dx.as_mut() {
                dx[xi] += go * w.data[wi];
            }
            if let Some(dw) = dw.as_mut() {
                dw[wi] += go * x.data[xi];
            }
        });

        vec![
            dx.map(|d| RawTensor::new(d, &x.shape, false)),
            dw.map(|d| RawTensor::new(d, &w.shape, false)),
        ]
    }

    fn clone_box(&self) -> Box<dyn GradFn> {
        Box::new(self.clone())
    }
}

impl Conv2d {
    /// Square-kernel constructor with stride/padding, like `nn.Conv2d(in, out, k, s, p)`
    pub fn new(
        in_ch: usize,
        out_ch: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        use_bias: bool,
    ) -> Self {
        Self::with_options(
            in_ch,
            out_ch,
            (kernel, kernel),
            Conv2dOptions::default()
                .stride((stride, stride))
                .padding((padding, padding))
                .bias(use_bias),
        )
    }

    /// # Panics
    /// Channel counts not divisible by `groups`
    pub fn with_options(
        in_ch: usize,
        out_ch: usize,
        kernel: (usize, usize),
        opts: Conv2dOptions,
    ) -> Self {
        assert!(opts.groups > 0, "groups must be positive");
        assert!(
            in_ch % opts.groups == 0 && out_ch % opts.groups == 0,
            "in_channels ({in_ch}) and out_channels ({out_ch}) must be divisible by groups ({})",
            opts.groups
        );
        let fan_in = in_ch / opts.groups * kernel.0 * kernel.1;
        let w = RawTensor::fan_in_uniform(&[out_ch, in_ch / opts.groups, kernel.0, kernel.1], fan_in);
        w.borrow_mut().requires_grad = true;
        let bias = opts.bias.then(|| {
            let b = RawTensor::fan_in_uniform(&[out_ch], fan_in);
            b.borrow_mut().requires_grad = true;
            b
        });
        Conv2d {
            weight: w,
            bias,
            in_channels: in_ch,
            out_channels: out_ch,
            kernel,
            opts,
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Output spatial size for an input of `(h, w)`.
    pub fn output_size(&self, h: usize, w: usize) -> (usize, usize) {
        let out = |len: usize, k: usize, s: usize, p: usize, d: usize| {
            let span = d * (k - 1) + 1;
            assert!(
                len + 2 * p >= span,
                "Conv2d kernel span {span} larger than padded input {}",
                len + 2 * p
            );
            (len + 2 * p - span) / s + 1
        };
        (
            out(h, self.kernel.0, self.opts.stride.0, self.opts.padding.0, self.opts.dilation.0),
            out(w, self.kernel.1, self.opts.stride.1, self.opts.padding.1, self.opts.dilation.1),
        )
    }
}

impl Module for Conv2d {
    fn forward(&self, x: &Tensor) -> Tensor {
        let (batch, in_h, in_w) = {
            let xb = x.borrow();
            assert_eq!(xb.shape.len(), 4, "Conv2d expects input shape (B, C, H, W)");
            assert_eq!(
                xb.shape[1], self.in_channels,
                "Conv2d expected {} input channels, got {}",
                self.in_channels, xb.shape[1]
            );
            (xb.shape[0], xb.shape[2], xb.shape[3])
        };
        let (out_h, out_w) = self.output_size(in_h, in_w);
        let geometry = ConvGeometry {
            batch,
            in_ch: self.in_channels,
            out_ch: self.out_channels,
            in_h,
            in_w,
            out_h,
            out_w,
            kernel: self.kernel,
            opts: self.opts,
        };

        let mut out_data = vec![0.0; batch * self.out_channels * out_h * out_w];
        {
            let xb = x.borrow();
            let wb = self.weight.borrow();
            geometry.for_each_tap(|xi, wi, oi| out_data[oi] += xb.data[xi] * wb.data[wi]);
        }

        let out = RawTensor::new(out_data, &[batch, self.out_channels, out_h, out_w], false);
        if needs_grad(&[x, &self.weight]) {
            record(
                &out,
                vec![x.clone(), self.weight.clone()],
                Box::new(Conv2dGradFn { geometry }),
            );
        }

        match &self.bias {
            Some(b) => out.add(&b.reshape(&[1, self.out_channels, 1, 1])),
            None => out,
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut p = vec![self.weight.clone()];
        if let Some(ref b) = self.bias {
            p.push(b.clone());
        }
        p
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

impl Clone for Conv2d {
    fn clone(&self) -> Self {
        Conv2d {
            weight: RawTensor::detached_copy(&self.weight),
            bias: self.bias.as_ref().map(RawTensor::detached_copy),
            in_channels: self.in_channels,
            out_channels: self.out_channels,
            kernel: self.kernel,
            opts: self.opts,
        }
    }
}

#[cfg(test)]
mod conv2d_tests {
    use super::*;
    use crate::tensor::manual_seed;

    #[test]
    fn test_conv2d_forward_shape() {
        let conv = Conv2d::new(3, 16, 3, 1, 1, true);
        let x = RawTensor::randn(&[1, 3, 8, 8]);
        assert_eq!(conv.forward(&x).shape(), vec![1, 16, 8, 8]);
    }

    #[test]
    fn rectangular_dilated_padding_keeps_length() {
        // kernel (1, 5) dilated by 2 with padding 4 preserves the width
        let conv = Conv2d::with_options(
            2,
            4,
            (1, 5),
            Conv2dOptions::default().dilation((1, 2)).padding((0, 4)),
        );
        let x = RawTensor::randn(&[2, 2, 3, 20]);
        assert_eq!(conv.forward(&x).shape(), vec![2, 4, 3, 20]);
    }

    #[test]
    fn identity_kernel_copies_input() {
        let conv = Conv2d::new(1, 1, 1, 1, 0, false);
        conv.weight.borrow_mut().data = vec![1.0];
        let x = RawTensor::new((0..6).map(|v| v as f32).collect(), &[1, 1, 2, 3], false);
        assert_eq!(conv.forward(&x).to_vec(), x.to_vec());
    }

    #[test]
    fn grouped_conv_only_sees_own_group() {
        let conv = Conv2d::with_options(
            2,
            2,
            (1, 1),
            Conv2dOptions::default().groups(2).bias(false),
        );
        conv.weight.borrow_mut().data = vec![2.0, 3.0];
        let x = RawTensor::new(vec![1.0, 10.0], &[1, 2, 1, 1], false);
        assert_eq!(conv.forward(&x).to_vec(), vec![2.0, 30.0]);
    }

    #[test]
    fn test_conv2d_gradient() {
        manual_seed(7);
        let conv = Conv2d::with_options(
            2,
            3,
            (2, 3),
            Conv2dOptions::default().padding((1, 1)).groups(1),
        );
        // positive weights keep the padded-edge gradients away from zero
        let n = conv.weight.borrow().data.len();
        conv.weight.borrow_mut().data = (0..n).map(|i| 0.1 + 0.05 * i as f32).collect();
        let x = RawTensor::randn(&[2, 2, 3, 4]);
        x.borrow_mut().requires_grad = true;
        assert!(RawTensor::check_gradients_simple(&x, |t| conv.forward(t).sum()));
    }

    #[test]
    fn weight_gradient_matches_numerical() {
        manual_seed(8);
        let conv = Conv2d::with_options(
            2,
            2,
            (1, 3),
            Conv2dOptions::default().groups(2).dilation((1, 2)).padding((0, 2)),
        );
        let x = RawTensor::randn(&[1, 2, 2, 6]);
        let w = conv.weight.clone();
        let passed = RawTensor::check_gradients_simple(&w, |wt| {
            let mut trial = conv.clone();
            trial.weight = wt.clone();
            trial.forward(&x).sum()
        });
        assert!(passed);
    }
}
