//! Classification architectures split into a feature extractor and a classifier.

use super::layers::{DenseSpatialFilter, TemporalFilter, TemporalResidual};
use crate::data::{Dn3Dataset, Sfreq};
use crate::error::{Dn3Error, Result};
use crate::io::{
    StateDict, StateDictDiff, diff_state_dict, load_state_dict, load_state_dict_checked,
    save_state_dict, sub_state, with_prefix,
};
use crate::nn::layers::Activation;
use crate::nn::{
    AdaptiveAvgPool1d, AvgPool2d, BatchNorm2d, Conv2d, Conv2dOptions, Dropout, Dropout2d, ELU,
    Expand, Flatten, Linear, MaxPool2d, Module, Sequential,
};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Flatten followed by a Xavier-normal linear projection with zero bias.
pub fn default_classifier(features: usize, targets: usize) -> Sequential {
    Sequential::new(vec![])
        .push(Flatten::new())
        .push(Linear::xavier_normal(features, targets))
}

/// A model seen as a learned two-stage pipeline: feature extraction, then classification.
///
/// Implementors provide the feature stage and own a replaceable classifier; the
/// defaults here handle classification, freezing and persistence.
pub trait DN3BaseModel: Module {
    fn targets(&self) -> usize;
    fn samples(&self) -> usize;
    fn channels(&self) -> usize;

    /// Size of the flattened feature vector fed to the classifier.
    fn num_features_for_classification(&self) -> usize;

    fn features_forward(&self, x: &Tensor) -> Tensor;

    fn classifier(&self) -> &dyn Module;
    fn set_classifier(&mut self, classifier: Box<dyn Module>);

    fn return_features(&self) -> bool;
    fn set_return_features(&mut self, return_features: bool);

    fn classifier_forward(&self, features: &Tensor) -> Tensor {
        self.classifier().forward(features)
    }

    /// Predictions, plus the features they came from when `return_features` is set.
    fn forward_outputs(&self, x: &Tensor) -> (Tensor, Option<Tensor>) {
        let features = self.features_forward(x);
        let logits = self.classifier_forward(&features);
        if self.return_features() {
            (logits, Some(features))
        } else {
            (logits, None)
        }
    }

    /// Replace the classifier with a fresh [`default_classifier`].
    fn make_new_classification_layer(&mut self) {
        let classifier =
            default_classifier(self.num_features_for_classification(), self.targets());
        self.set_classifier(Box::new(classifier));
    }

    /// Stop (or with `unfreeze`, resume) gradient tracking for everything but the classifier.
    fn freeze_features(&mut self, unfreeze: bool, freeze_classifier: bool) {
        self.set_requires_grad(unfreeze);
        if !freeze_classifier {
            for p in self.classifier().parameters() {
                p.borrow_mut().requires_grad = true;
            }
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        save_state_dict(&self.state_dict(), path)
    }

    /// Restore weights from `path`. Strict loads reject any key or shape difference.
    fn load(&mut self, path: &Path, strict: bool) -> Result<StateDictDiff> {
        let state = load_state_dict(path)?;
        if strict {
            let diff = diff_state_dict(&self.state_dict(), &state);
            if !diff.is_empty() {
                return Err(Dn3Error::StateDictMismatch(diff.to_string()));
            }
        }
        Ok(load_state_dict_checked(self, &state))
    }
}

/// Constructors shared by the built-in architectures.
pub trait Architecture: DN3BaseModel + Sized {
    type Params: Default;
    const NAME: &'static str;

    fn build(targets: usize, samples: usize, channels: usize, params: Self::Params)
    -> Result<Self>;

    fn with_defaults(targets: usize, samples: usize, channels: usize) -> Result<Self> {
        Self::build(targets, samples, channels, Self::Params::default())
    }

    /// Size the model to a dataset's channel count and trial length.
    ///
    /// # Errors
    /// Datasets whose recordings disagree on the sampling frequency.
    fn from_dataset(dataset: &dyn Dn3Dataset, targets: usize, params: Self::Params) -> Result<Self> {
        let sfreq = match dataset.sfreq() {
            Sfreq::Uniform(f) => f,
            Sfreq::Mixed(rates) => {
                return Err(Dn3Error::SfreqMismatch {
                    expected: rates.first().copied().unwrap_or_default(),
                    found: rates.last().copied().unwrap_or_default(),
                });
            }
        };
        log::info!(
            "Creating {} using: {} channels with trials of {} samples at {}Hz",
            Self::NAME,
            dataset.channels().len(),
            dataset.sequence_length(),
            sfreq
        );
        Self::build(targets, dataset.sequence_length(), dataset.channels().len(), params)
    }
}

fn check_geometry(name: &str, targets: usize, samples: usize, channels: usize) -> Result<()> {
    if targets == 0 || samples == 0 || channels == 0 {
        return Err(Dn3Error::InvalidParameter(format!(
            "{name} needs positive targets, samples and channels (got {targets}, {samples}, {channels})"
        )));
    }
    Ok(())
}

/// Fields every model carries alongside its layers.
#[derive(Clone)]
struct Head {
    targets: usize,
    samples: usize,
    channels: usize,
    num_features: usize,
    classifier: Box<dyn Module>,
    return_features: bool,
    training: bool,
}

impl Head {
    fn new(targets: usize, samples: usize, channels: usize, num_features: usize) -> Self {
        Head {
            targets,
            samples,
            channels,
            num_features,
            classifier: Box::new(default_classifier(num_features, targets)),
            return_features: false,
            training: true,
        }
    }
}

/// Implements [`Module`] and [`DN3BaseModel`] for a model with a `head` field and
/// the named feature stages, applied in order.
macro_rules! dn3_model {
    ($ty:ty, [$($stage:ident),*]) => {
        impl Module for $ty {
            fn forward(&self, x: &Tensor) -> Tensor {
                self.classifier_forward(&self.features_forward(x))
            }

            fn parameters(&self) -> Vec<Tensor> {
                let mut params = Vec::new();
                $(params.extend(self.$stage.parameters());)*
                params.extend(self.head.classifier.parameters());
                params
            }

            fn state_dict(&self) -> StateDict {
                let mut state = StateDict::new();
                $(state.extend(with_prefix(stringify!($stage), self.$stage.state_dict()));)*
                state.extend(with_prefix("classifier", self.head.classifier.state_dict()));
                state
            }

            fn load_state_dict(&mut self, state: &StateDict) {
                $(self.$stage.load_state_dict(&sub_state(state, stringify!($stage)));)*
                self.head
                    .classifier
                    .load_state_dict(&sub_state(state, "classifier"));
            }

            fn clone_box(&self) -> Box<dyn Module> {
                Box::new(self.clone())
            }

            fn train(&mut self, mode: bool) {
                self.head.training = mode;
                $(self.$stage.train(mode);)*
                self.head.classifier.train(mode);
            }

            fn is_training(&self) -> bool {
                self.head.training
            }
        }

        impl DN3BaseModel for $ty {
            fn targets(&self) -> usize {
                self.head.targets
            }
            fn samples(&self) -> usize {
                self.head.samples
            }
            fn channels(&self) -> usize {
                self.head.channels
            }
            fn num_features_for_classification(&self) -> usize {
                self.head.num_features
            }
            fn features_forward(&self, x: &Tensor) -> Tensor {
                let features = x.clone();
                $(let features = self.$stage.forward(&features);)*
                features
            }
            fn classifier(&self) -> &dyn Module {
                self.head.classifier.as_ref()
            }
            fn set_classifier(&mut self, classifier: Box<dyn Module>) {
                self.head.classifier = classifier;
            }
            fn return_features(&self) -> bool {
                self.head.return_features
            }
            fn set_return_features(&mut self, return_features: bool) {
                self.head.return_features = return_features;
            }
        }
    };
}

/// Multinomial logistic regression over the raw trial: identity features.
#[derive(Clone)]
pub struct LogRegNetwork {
    head: Head,
}

dn3_model!(LogRegNetwork, []);

impl Architecture for LogRegNetwork {
    type Params = ();
    const NAME: &'static str = "LogRegNetwork";

    fn build(targets: usize, samples: usize, channels: usize, _params: ()) -> Result<Self> {
        check_geometry(Self::NAME, targets, samples, channels)?;
        Ok(LogRegNetwork {
            head: Head::new(targets, samples, channels, samples * channels),
        })
    }
}

/// Hyperparameters of [`TIDNet`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TIDNetParams {
    pub s_growth: usize,
    pub t_filters: usize,
    #[serde(alias = "do")]
    pub dropout: f32,
    pub pooling: usize,
    pub activation: Activation,
    pub temp_layers: usize,
    pub spat_layers: usize,
    pub temp_span: f64,
    pub bottleneck: usize,
    /// Output length of the summary pool; `samples / pooling` when unset.
    pub summary: Option<usize>,
    pub return_features: bool,
}

impl Default for TIDNetParams {
    fn default() -> Self {
        Self {
            s_growth: 24,
            t_filters: 32,
            dropout: 0.4,
            pooling: 20,
            activation: Activation::LeakyRelu,
            temp_layers: 2,
            spat_layers: 2,
            temp_span: 0.05,
            bottleneck: 3,
            summary: None,
            return_features: false,
        }
    }
}

/// Thinker Invariant DenseNet: dilated temporal filtering, a dense spatial
/// filter across channels, then an adaptive average summary.
#[derive(Clone)]
pub struct TIDNet {
    head: Head,
    temp_len: usize,
    temporal: Sequential,
    spatial: DenseSpatialFilter,
    extract_features: AdaptiveAvgPool1d,
}

dn3_model!(TIDNet, [temporal, spatial, extract_features]);

impl TIDNet {
    /// Temporal kernel length before rounding to odd.
    pub fn temp_len(&self) -> usize {
        self.temp_len
    }
}

impl Architecture for TIDNet {
    type Params = TIDNetParams;
    const NAME: &'static str = "TIDNet";

    fn build(targets: usize, samples: usize, channels: usize, params: TIDNetParams) -> Result<Self> {
        check_geometry(Self::NAME, targets, samples, channels)?;
        if params.pooling == 0 || params.pooling > samples {
            return Err(Dn3Error::InvalidParameter(format!(
                "TIDNet pooling {} must be between 1 and the {samples} samples",
                params.pooling
            )));
        }
        let temp_len = (params.temp_span * samples as f64).ceil().max(1.0) as usize;
        let summary = params.summary.unwrap_or(samples / params.pooling);
        if summary == 0 {
            return Err(Dn3Error::InvalidParameter("TIDNet summary must be positive".into()));
        }
        let num_features = (params.t_filters + params.s_growth * params.spat_layers) * summary;

        let temporal = Sequential::new(vec![])
            .push(Expand::new(1))
            .push(TemporalFilter::new(
                1,
                params.t_filters,
                params.temp_layers,
                temp_len,
                0.0,
                params.activation,
                TemporalResidual::Netwise,
            ))
            .push(MaxPool2d::with_kernel((1, params.pooling)))
            .push(Dropout2d::new(params.dropout));
        let spatial = DenseSpatialFilter::new(
            channels,
            params.s_growth,
            params.spat_layers,
            params.t_filters,
            params.bottleneck,
            params.dropout,
            params.activation,
            true,
        );

        let mut head = Head::new(targets, samples, channels, num_features);
        head.return_features = params.return_features;
        Ok(TIDNet {
            head,
            temp_len,
            temporal,
            spatial,
            extract_features: AdaptiveAvgPool1d::new(summary),
        })
    }
}

/// Hyperparameters of [`EEGNet`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EEGNetParams {
    #[serde(alias = "do")]
    pub dropout: f32,
    pub pooling: usize,
    #[serde(rename = "F1", alias = "f1")]
    pub f1: usize,
    #[serde(rename = "D", alias = "d")]
    pub d: usize,
    pub t_len: usize,
    #[serde(rename = "F2", alias = "f2")]
    pub f2: usize,
    pub return_features: bool,
}

impl Default for EEGNetParams {
    fn default() -> Self {
        Self {
            dropout: 0.25,
            pooling: 8,
            f1: 8,
            d: 2,
            t_len: 65,
            f2: 16,
            return_features: false,
        }
    }
}

/// EEGNet (Lawhern et al. 2018), without the kernel norm constraints.
#[derive(Clone)]
pub struct EEGNet {
    head: Head,
    init_conv: Sequential,
    depth_conv: Sequential,
    sep_conv: Sequential,
}

dn3_model!(EEGNet, [init_conv, depth_conv, sep_conv]);

impl Architecture for EEGNet {
    type Params = EEGNetParams;
    const NAME: &'static str = "EEGNet";

    fn build(targets: usize, samples: usize, channels: usize, params: EEGNetParams) -> Result<Self> {
        check_geometry(Self::NAME, targets, samples, channels)?;
        let EEGNetParams {
            dropout,
            pooling,
            f1,
            d,
            t_len,
            f2,
            return_features,
        } = params;
        if pooling < 2 {
            return Err(Dn3Error::InvalidParameter(format!(
                "EEGNet pooling must be at least 2, got {pooling}"
            )));
        }
        if t_len % 2 == 0 {
            return Err(Dn3Error::InvalidParameter(format!(
                "EEGNet t_len must be odd to keep the trial length, got {t_len}"
            )));
        }
        let num_features = f2 * ((samples / (pooling / 2)) / pooling);
        if num_features == 0 {
            return Err(Dn3Error::InvalidParameter(format!(
                "EEGNet pooling {pooling} leaves no features for {samples} samples"
            )));
        }

        let no_bias = Conv2dOptions::default().bias(false);
        let init_conv = Sequential::new(vec![])
            .push(Expand::new(1))
            .push(Conv2d::with_options(
                1,
                f1,
                (1, t_len),
                no_bias.padding((0, t_len / 2)),
            ))
            .push(BatchNorm2d::new(f1));
        let depth_conv = Sequential::new(vec![])
            .push(Conv2d::with_options(f1, d * f1, (channels, 1), no_bias.groups(f1)))
            .push(BatchNorm2d::new(d * f1))
            .push(ELU::default())
            .push(AvgPool2d::with_kernel((1, pooling / 2)))
            .push(Dropout::new(dropout));
        let sep_conv = Sequential::new(vec![])
            .push(Conv2d::with_options(
                d * f1,
                d * f1,
                (1, 17),
                no_bias.padding((0, 8)).groups(d * f1),
            ))
            .push(Conv2d::with_options(d * f1, f2, (1, 1), no_bias))
            .push(BatchNorm2d::new(f2))
            .push(ELU::default())
            .push(AvgPool2d::with_kernel((1, pooling)))
            .push(Dropout::new(dropout));

        let mut head = Head::new(targets, samples, channels, num_features);
        head.return_features = return_features;
        Ok(EEGNet {
            head,
            init_conv,
            depth_conv,
            sep_conv,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{RawTensor, TensorOps, manual_seed};
    use std::rc::Rc;

    #[test]
    fn feature_counts_follow_geometry() {
        let tidnet = TIDNet::with_defaults(4, 656, 64).unwrap();
        assert_eq!(tidnet.num_features_for_classification(), (32 + 24 * 2) * 32);
        assert_eq!(tidnet.temp_len(), 33);

        let eegnet = EEGNet::with_defaults(4, 656, 64).unwrap();
        assert_eq!(eegnet.num_features_for_classification(), 16 * ((656 / 4) / 8));

        let logreg = LogRegNetwork::with_defaults(2, 100, 3).unwrap();
        assert_eq!(logreg.num_features_for_classification(), 300);
    }

    #[test]
    fn bad_geometry_is_rejected() {
        assert!(EEGNet::with_defaults(4, 10, 8).is_err());
        assert!(TIDNet::with_defaults(4, 10, 8).is_err());
        assert!(LogRegNetwork::with_defaults(0, 10, 8).is_err());
    }

    #[test]
    fn eegnet_rejects_even_temporal_kernel() {
        let even = EEGNetParams {
            t_len: 64,
            ..EEGNetParams::default()
        };
        assert!(matches!(
            EEGNet::build(2, 63, 4, even),
            Err(Dn3Error::InvalidParameter(_))
        ));

        manual_seed(3);
        let odd = EEGNetParams {
            t_len: 15,
            ..EEGNetParams::default()
        };
        let mut model = EEGNet::build(2, 63, 4, odd).unwrap();
        model.eval();
        let out = model.forward(&RawTensor::randn(&[2, 4, 63]));
        assert_eq!(out.shape(), vec![2, 2]);
    }

    #[test]
    fn logreg_forward_and_features() {
        manual_seed(1);
        let mut model = LogRegNetwork::with_defaults(3, 5, 2).unwrap();
        let x = RawTensor::randn(&[4, 2, 5]);
        assert_eq!(model.forward(&x).shape(), vec![4, 3]);

        model.set_return_features(true);
        let (logits, features) = model.forward_outputs(&x);
        assert_eq!(logits.shape(), vec![4, 3]);
        assert_eq!(features.unwrap().to_vec(), x.to_vec());
    }

    #[test]
    fn classifier_starts_with_zero_bias() {
        let model = LogRegNetwork::with_defaults(3, 5, 2).unwrap();
        let state = model.state_dict();
        assert_eq!(state["classifier.1.bias"].data, vec![0.0; 3]);
        assert_eq!(state["classifier.1.weight"].shape, vec![10, 3]);
    }

    #[test]
    fn freeze_features_keeps_classifier_trainable() {
        let mut model = EEGNet::build(
            2,
            64,
            4,
            EEGNetParams {
                t_len: 9,
                ..EEGNetParams::default()
            },
        )
        .unwrap();
        model.freeze_features(false, false);
        let classifier = model.classifier().parameters();
        for p in model.parameters() {
            let in_classifier = classifier.iter().any(|c| Rc::ptr_eq(c, &p));
            assert_eq!(p.borrow().requires_grad, in_classifier);
        }

        model.freeze_features(false, true);
        assert!(model.parameters().iter().all(|p| !p.borrow().requires_grad));
        model.freeze_features(true, false);
        assert!(model.parameters().iter().all(|p| p.borrow().requires_grad));
    }

    #[test]
    fn clone_is_deep() {
        let model = LogRegNetwork::with_defaults(2, 4, 2).unwrap();
        let copy = model.clone();
        model.parameters()[0].borrow_mut().data[0] = 123.0;
        assert_ne!(copy.parameters()[0].borrow().data[0], 123.0);
    }

    #[test]
    fn params_deserialize_with_short_aliases() {
        let params: EEGNetParams = serde_yaml::from_str("F1: 4\nD: 3\ndo: 0.5\n").unwrap();
        assert_eq!(params.f1, 4);
        assert_eq!(params.d, 3);
        assert_eq!(params.dropout, 0.5);
        assert_eq!(params.f2, 16);

        let params: TIDNetParams =
            serde_yaml::from_str("pooling: 10\nactivation: elu\nsummary: 4\n").unwrap();
        assert_eq!(params.pooling, 10);
        assert_eq!(params.activation, Activation::Elu);
        assert_eq!(params.summary, Some(4));
        assert_eq!(params.s_growth, 24);
    }
}
