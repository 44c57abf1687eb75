use crate::io::StateDict;
use crate::nn::Module;
use crate::tensor::Tensor;
use crate::tensor::TensorOps;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default)]
pub struct ReLU;

#[derive(Clone, Copy, Debug)]
pub struct ELU {
    pub alpha: f32,
}

impl Default for ELU {
    fn default() -> Self {
        Self { alpha: 1.0 }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LeakyReLU {
    pub negative_slope: f32,
}

impl Default for LeakyReLU {
    fn default() -> Self {
        Self {
            negative_slope: 0.01,
        }
    }
}

macro_rules! activation_module {
    ($ty:ty, |$s:ident, $x:ident| $body:expr) => {
        impl Module for $ty {
            fn forward(&self, $x: &Tensor) -> Tensor {
                let $s = self;
                $body
            }

            fn parameters(&self) -> Vec<Tensor> {
                vec![] // No learnable params
            }

            fn state_dict(&self) -> StateDict {
                StateDict::new()
            }

            fn load_state_dict(&mut self, _state: &StateDict) {
                // Stateless
            }

            fn clone_box(&self) -> Box<dyn Module> {
                Box::new(*self)
            }
        }
    };
}

activation_module!(ReLU, |_s, x| x.relu());
activation_module!(ELU, |s, x| x.elu(s.alpha));
activation_module!(LeakyReLU, |s, x| x.leaky_relu(s.negative_slope));

/// Activation choice as it appears in hyperparameter files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    Elu,
    #[default]
    LeakyRelu,
}

impl Activation {
    pub fn build(self) -> Box<dyn Module> {
        match self {
            Activation::Relu => Box::new(ReLU),
            Activation::Elu => Box::new(ELU::default()),
            Activation::LeakyRelu => Box::new(LeakyReLU::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RawTensor;

    #[test]
    fn activation_names_deserialize() {
        let a: Activation = serde_yaml::from_str("elu").unwrap();
        assert_eq!(a, Activation::Elu);
        let x = RawTensor::new(vec![-1.0, 2.0], &[2], false);
        let y = Activation::LeakyRelu.build().forward(&x).to_vec();
        assert!((y[0] + 0.01).abs() < 1e-7);
        assert_eq!(y[1], 2.0);
    }
}
