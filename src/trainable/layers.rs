//! Building blocks shared by the architectures in [`super::models`].

use crate::io::{StateDict, sub_state, with_prefix};
use crate::nn::layers::Activation;
use crate::nn::{BatchNorm2d, Conv2d, Conv2dOptions, Dropout2d, Module, Sequential};
use crate::tensor::{RawTensor, Tensor, TensorOps};

/// Options for [`ConvBlock2d`]; the convolution has a bias only without batch norm.
#[derive(Clone, Copy, Debug)]
pub struct ConvBlockOptions {
    pub conv: Conv2dOptions,
    pub dropout: f32,
    pub batch_norm: bool,
    pub activation: Activation,
    pub residual: bool,
}

impl Default for ConvBlockOptions {
    fn default() -> Self {
        Self {
            conv: Conv2dOptions::default(),
            dropout: 0.5,
            batch_norm: true,
            activation: Activation::LeakyRelu,
            residual: false,
        }
    }
}

/// Conv2d, optional batch norm, activation, optional residual sum, then channel dropout.
#[derive(Clone)]
pub struct ConvBlock2d {
    conv: Conv2d,
    batch_norm: Option<BatchNorm2d>,
    activation: Box<dyn Module>,
    dropout: Dropout2d,
    residual: bool,
    training: bool,
}

impl ConvBlock2d {
    pub fn new(in_filters: usize, out_filters: usize, kernel: (usize, usize)) -> Self {
        Self::with_options(in_filters, out_filters, kernel, ConvBlockOptions::default())
    }

    pub fn with_options(
        in_filters: usize,
        out_filters: usize,
        kernel: (usize, usize),
        opts: ConvBlockOptions,
    ) -> Self {
        let conv = Conv2d::with_options(
            in_filters,
            out_filters,
            kernel,
            opts.conv.bias(!opts.batch_norm),
        );
        ConvBlock2d {
            conv,
            batch_norm: opts.batch_norm.then(|| BatchNorm2d::new(out_filters)),
            activation: opts.activation.build(),
            dropout: Dropout2d::new(opts.dropout),
            residual: opts.residual,
            training: true,
        }
    }
}

impl Module for ConvBlock2d {
    fn forward(&self, x: &Tensor) -> Tensor {
        let mut out = self.conv.forward(x);
        if let Some(bn) = &self.batch_norm {
            out = bn.forward(&out);
        }
        out = self.activation.forward(&out);
        if self.residual {
            out = out.add(x);
        }
        self.dropout.forward(&out)
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.conv.parameters();
        if let Some(bn) = &self.batch_norm {
            params.extend(bn.parameters());
        }
        params
    }

    fn state_dict(&self) -> StateDict {
        let mut state = with_prefix("conv", self.conv.state_dict());
        if let Some(bn) = &self.batch_norm {
            state.extend(with_prefix("batch_norm", bn.state_dict()));
        }
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) {
        self.conv.load_state_dict(&sub_state(state, "conv"));
        if let Some(bn) = &mut self.batch_norm {
            bn.load_state_dict(&sub_state(state, "batch_norm"));
        }
    }

    fn clone_box(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }

    fn train(&mut self, mode: bool) {
        self.training = mode;
        if let Some(bn) = &mut self.batch_norm {
            bn.train(mode);
        }
        self.dropout.train(mode);
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

/// Which of the last two axes of `(B, F, H, W)` a [`DenseFilter`] convolves along.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterAxis {
    Height,
    Width,
}

/// Densely connected filter: appends `growth_rate` new feature maps to its input.
///
/// The new maps come from a 1x1 bottleneck followed by a length `filter_len`
/// convolution along one spatial axis.
#[derive(Clone)]
pub struct DenseFilter {
    net: Sequential,
}

impl DenseFilter {
    pub fn new(
        in_features: usize,
        growth_rate: usize,
        filter_len: usize,
        dropout: f32,
        bottleneck: usize,
        activation: Activation,
        axis: FilterAxis,
    ) -> Self {
        let (kernel, padding) = match axis {
            FilterAxis::Height => ((filter_len, 1), (filter_len / 2, 0)),
            FilterAxis::Width => ((1, filter_len), (0, filter_len / 2)),
        };
        let inner = bottleneck * growth_rate;
        let net = Sequential::new(vec![])
            .push(BatchNorm2d::new(in_features))
            .push_boxed(activation.build())
            .push(Conv2d::with_options(
                in_features,
                inner,
                (1, 1),
                Conv2dOptions::default(),
            ))
            .push(BatchNorm2d::new(inner))
            .push_boxed(activation.build())
            .push(Conv2d::with_options(
                inner,
                growth_rate,
                kernel,
                Conv2dOptions::default().padding(padding),
            ))
            .push(Dropout2d::new(dropout));
        DenseFilter { net }
    }
}

impl Module for DenseFilter {
    fn forward(&self, x: &Tensor) -> Tensor {
        RawTensor::cat(&[x.clone(), self.net.forward(x)], 1)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.net.parameters()
    }

    fn state_dict(&self) -> StateDict {
        with_prefix("net", self.net.state_dict())
    }

    fn load_state_dict(&mut self, state: &StateDict) {
        self.net.load_state_dict(&sub_state(state, "net"));
    }

    fn clone_box(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }

    fn train(&mut self, mode: bool) {
        self.net.train(mode);
    }

    fn is_training(&self) -> bool {
        self.net.is_training()
    }
}

/// Stack of [`DenseFilter`]s across EEG channels, optionally collapsing the
/// channel axis with a `(channels, 1)` convolution.
///
/// Input is `(B, F, channels, T)`, or `(B, T, channels)` which is lifted to a
/// single feature map first. Collapsed output is `(B, F + growth * depth, T)`.
#[derive(Clone)]
pub struct DenseSpatialFilter {
    net: Sequential,
    channel_collapse: Option<ConvBlock2d>,
    out_filters: usize,
}

impl DenseSpatialFilter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channels: usize,
        growth: usize,
        depth: usize,
        in_ch: usize,
        bottleneck: usize,
        dropout: f32,
        activation: Activation,
        collapse: bool,
    ) -> Self {
        let net = Sequential::new(
            (0..depth)
                .map(|d| {
                    Box::new(DenseFilter::new(
                        in_ch + growth * d,
                        growth,
                        5,
                        dropout,
                        bottleneck,
                        activation,
                        FilterAxis::Height,
                    )) as Box<dyn Module>
                })
                .collect(),
        );
        let out_filters = in_ch + growth * depth;
        let channel_collapse = collapse.then(|| {
            ConvBlock2d::with_options(
                out_filters,
                out_filters,
                (channels, 1),
                ConvBlockOptions {
                    dropout: 0.0,
                    ..ConvBlockOptions::default()
                },
            )
        });
        DenseSpatialFilter {
            net,
            channel_collapse,
            out_filters,
        }
    }

    pub fn out_filters(&self) -> usize {
        self.out_filters
    }
}

impl Module for DenseSpatialFilter {
    fn forward(&self, x: &Tensor) -> Tensor {
        let x = if x.shape().len() < 4 {
            x.unsqueeze(1).permute(&[0, 1, 3, 2])
        } else {
            x.clone()
        };
        let x = self.net.forward(&x);
        match &self.channel_collapse {
            Some(collapse) => collapse.forward(&x).squeeze(2),
            None => x,
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.net.parameters();
        if let Some(c) = &self.channel_collapse {
            params.extend(c.parameters());
        }
        params
    }

    fn state_dict(&self) -> StateDict {
        let mut state = with_prefix("net", self.net.state_dict());
        if let Some(c) = &self.channel_collapse {
            state.extend(with_prefix("channel_collapse", c.state_dict()));
        }
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) {
        self.net.load_state_dict(&sub_state(state, "net"));
        if let Some(c) = &mut self.channel_collapse {
            c.load_state_dict(&sub_state(state, "channel_collapse"));
        }
    }

    fn clone_box(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }

    fn train(&mut self, mode: bool) {
        self.net.train(mode);
        if let Some(c) = &mut self.channel_collapse {
            c.train(mode);
        }
    }

    fn is_training(&self) -> bool {
        self.net.is_training()
    }
}

/// How the layers of a [`TemporalFilter`] are connected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TemporalResidual {
    /// Layers in sequence, plus a 1x1 projection of the input.
    #[default]
    Netwise,
    /// Each layer's output is concatenated onto its input.
    Dense,
}

#[derive(Clone)]
enum TemporalNet {
    Netwise { net: Sequential, residual: Conv2d },
    Dense(Vec<Sequential>),
}

/// Dilated temporal convolutions over `(B, F, H, T)`; the time axis keeps its length.
///
/// Layer `i` of `depth` uses dilation `depth - i`. Even kernel lengths are
/// rounded up to the next odd length.
#[derive(Clone)]
pub struct TemporalFilter {
    net: TemporalNet,
    out_filters: usize,
}

impl TemporalFilter {
    pub fn new(
        channels: usize,
        filters: usize,
        depth: usize,
        temp_len: usize,
        dropout: f32,
        activation: Activation,
        residual: TemporalResidual,
    ) -> Self {
        let temp_len = temp_len + 1 - temp_len % 2;
        let layer = |in_ch: usize, i: usize| {
            let dilation = depth - i;
            Sequential::new(vec![])
                .push(Conv2d::with_options(
                    in_ch,
                    filters,
                    (1, temp_len),
                    Conv2dOptions::default()
                        .dilation((1, dilation))
                        .padding((0, dilation * (temp_len - 1) / 2)),
                ))
                .push_boxed(activation.build())
                .push(Dropout2d::new(dropout))
        };

        let (net, out_filters) = match residual {
            TemporalResidual::Netwise => {
                let net = Sequential::new(
                    (0..depth)
                        .map(|i| {
                            let in_ch = if i == 0 { channels } else { filters };
                            Box::new(layer(in_ch, i)) as Box<dyn Module>
                        })
                        .collect(),
                );
                let residual =
                    Conv2d::with_options(channels, filters, (1, 1), Conv2dOptions::default());
                (TemporalNet::Netwise { net, residual }, filters)
            }
            TemporalResidual::Dense => {
                let layers = (0..depth)
                    .map(|i| layer(channels + i * filters, i))
                    .collect();
                (TemporalNet::Dense(layers), channels + depth * filters)
            }
        };
        TemporalFilter { net, out_filters }
    }

    pub fn out_filters(&self) -> usize {
        self.out_filters
    }
}

impl Module for TemporalFilter {
    fn forward(&self, x: &Tensor) -> Tensor {
        match &self.net {
            TemporalNet::Netwise { net, residual } => net.forward(x).add(&residual.forward(x)),
            TemporalNet::Dense(layers) => layers.iter().fold(x.clone(), |acc, layer| {
                let new = layer.forward(&acc);
                RawTensor::cat(&[acc, new], 1)
            }),
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        match &self.net {
            TemporalNet::Netwise { net, residual } => {
                let mut params = net.parameters();
                params.extend(residual.parameters());
                params
            }
            TemporalNet::Dense(layers) => layers.iter().flat_map(Module::parameters).collect(),
        }
    }

    fn state_dict(&self) -> StateDict {
        match &self.net {
            TemporalNet::Netwise { net, residual } => {
                let mut state = with_prefix("net", net.state_dict());
                state.extend(with_prefix("residual", residual.state_dict()));
                state
            }
            TemporalNet::Dense(layers) => layers
                .iter()
                .enumerate()
                .flat_map(|(i, l)| with_prefix(&format!("net.{i}"), l.state_dict()))
                .collect(),
        }
    }

    fn load_state_dict(&mut self, state: &StateDict) {
        match &mut self.net {
            TemporalNet::Netwise { net, residual } => {
                net.load_state_dict(&sub_state(state, "net"));
                residual.load_state_dict(&sub_state(state, "residual"));
            }
            TemporalNet::Dense(layers) => {
                for (i, l) in layers.iter_mut().enumerate() {
                    l.load_state_dict(&sub_state(state, &format!("net.{i}")));
                }
            }
        }
    }

    fn clone_box(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }

    fn train(&mut self, mode: bool) {
        match &mut self.net {
            TemporalNet::Netwise { net, .. } => net.train(mode),
            TemporalNet::Dense(layers) => layers.iter_mut().for_each(|l| l.train(mode)),
        }
    }

    fn is_training(&self) -> bool {
        match &self.net {
            TemporalNet::Netwise { net, .. } => net.is_training(),
            TemporalNet::Dense(layers) => layers.first().is_some_and(Module::is_training),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::manual_seed;

    #[test]
    fn conv_block_residual_keeps_shape() {
        manual_seed(0);
        let block = ConvBlock2d::with_options(
            3,
            3,
            (1, 3),
            ConvBlockOptions {
                conv: Conv2dOptions::default().padding((0, 1)),
                residual: true,
                ..ConvBlockOptions::default()
            },
        );
        let keys: Vec<String> = block.state_dict().into_keys().collect();
        assert!(keys.contains(&"conv.weight".to_string()));
        assert!(!keys.contains(&"conv.bias".to_string()));
        assert!(keys.contains(&"batch_norm.running_mean".to_string()));
        let y = block.forward(&RawTensor::randn(&[2, 3, 2, 6]));
        assert_eq!(y.shape(), vec![2, 3, 2, 6]);
    }

    #[test]
    fn dense_filter_grows_features() {
        let filter = DenseFilter::new(4, 3, 5, 0.0, 2, Activation::LeakyRelu, FilterAxis::Height);
        let y = filter.forward(&RawTensor::randn(&[2, 4, 6, 5]));
        assert_eq!(y.shape(), vec![2, 7, 6, 5]);
    }

    #[test]
    fn dense_spatial_filter_collapses_channels() {
        let filter = DenseSpatialFilter::new(6, 3, 2, 4, 2, 0.0, Activation::LeakyRelu, true);
        assert_eq!(filter.out_filters(), 10);
        let y = filter.forward(&RawTensor::randn(&[2, 4, 6, 9]));
        assert_eq!(y.shape(), vec![2, 10, 9]);

        // (B, T, C) input is lifted to one feature map
        let single = DenseSpatialFilter::new(6, 3, 1, 1, 2, 0.0, Activation::Relu, false);
        let y = single.forward(&RawTensor::randn(&[2, 9, 6]));
        assert_eq!(y.shape(), vec![2, 4, 6, 9]);
    }

    #[test]
    fn temporal_filter_preserves_length() {
        let netwise =
            TemporalFilter::new(1, 4, 2, 6, 0.0, Activation::LeakyRelu, TemporalResidual::Netwise);
        let y = netwise.forward(&RawTensor::randn(&[2, 1, 3, 20]));
        assert_eq!(y.shape(), vec![2, 4, 3, 20]);

        let dense =
            TemporalFilter::new(2, 3, 2, 5, 0.0, Activation::Elu, TemporalResidual::Dense);
        assert_eq!(dense.out_filters(), 8);
        let y = dense.forward(&RawTensor::randn(&[1, 2, 3, 20]));
        assert_eq!(y.shape(), vec![1, 8, 3, 20]);
        assert_eq!(dense.state_dict().len(), 4);
    }

    #[test]
    fn temporal_filter_gradients_reach_every_layer() {
        let filter =
            TemporalFilter::new(1, 2, 2, 3, 0.0, Activation::LeakyRelu, TemporalResidual::Netwise);
        let x = RawTensor::randn(&[1, 1, 2, 8]);
        filter.forward(&x).sum().backward();
        for p in filter.parameters() {
            assert!(p.grad().is_some());
        }
    }
}
