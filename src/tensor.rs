use crate::autograd::GradFn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use std::cell::RefCell;
use std::rc::Rc;

/// Type alias for a reference-counted, interior-mutable tensor.
///
/// We use `Rc<RefCell<RawTensor>>` to allow multiple references to the same tensor
/// (needed for computation graphs) while still allowing mutation (for gradient accumulation).
/// Single-threaded only.
pub type Tensor = Rc<RefCell<RawTensor>>;

// ===== RAW TENSOR STRUCTURE =====

/// The core tensor structure containing data and gradient tracking
///
/// Fields:
/// - `data`: flat Vec<f32> of actual values (row-major order)
/// - `shape`: dimensions, e.g. [batch, channels, height, width]
/// - `grad`: accumulated gradient (Some once backward reached this tensor)
/// - `requires_grad`: whether to track gradients for this tensor
/// - `grad_fn`: function to compute parent gradients during backward
/// - `parents`: input tensors that this tensor depends on
pub struct RawTensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
    pub grad: Option<Vec<f32>>,
    pub requires_grad: bool,
    pub grad_fn: Option<Box<dyn GradFn>>,
    pub parents: Vec<Tensor>,
}

impl Clone for RawTensor {
    fn clone(&self) -> Self {
        RawTensor {
            data: self.data.clone(),
            shape: self.shape.clone(),
            grad: self.grad.clone(),
            requires_grad: self.requires_grad,
            grad_fn: self.grad_fn.as_ref().map(|gf| gf.clone_box()),
            parents: self.parents.clone(),
        }
    }
}

impl std::fmt::Debug for RawTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("requires_grad", &self.requires_grad)
            .field("has_grad", &self.grad.is_some())
            .finish()
    }
}

// ===== RANDOMNESS =====

thread_local! {
    static RNG: RefCell<StdRng> = RefCell::new(StdRng::from_os_rng());
}

/// Borrow the crate-wide random generator (initialisation, dropout, shuffling).
pub fn with_rng<T>(f: impl FnOnce(&mut StdRng) -> T) -> T {
    RNG.with(|rng| f(&mut rng.borrow_mut()))
}

/// Re-seed the crate-wide random generator for reproducible runs.
pub fn manual_seed(seed: u64) {
    RNG.with(|rng| *rng.borrow_mut() = StdRng::seed_from_u64(seed));
}

// ===== TENSOR CONSTRUCTORS =====
impl RawTensor {
    /// Create a new tensor from data and shape
    ///
    /// # Panics
    /// Panics if data.len() != shape.product()
    pub fn new(data: Vec<f32>, shape: &[usize], requires_grad: bool) -> Tensor {
        assert_eq!(
            data.len(),
            shape.iter().product::<usize>(),
            "Data length must match shape {shape:?}"
        );
        Rc::new(RefCell::new(RawTensor {
            data,
            shape: shape.to_vec(),
            grad: None,
            requires_grad,
            grad_fn: None,
            parents: vec![],
        }))
    }

    /// A learnable leaf tensor.
    pub fn parameter(data: Vec<f32>, shape: &[usize]) -> Tensor {
        Self::new(data, shape, true)
    }

    pub fn zeros(shape: &[usize]) -> Tensor {
        Self::constant(0.0, shape)
    }

    pub fn ones(shape: &[usize]) -> Tensor {
        Self::constant(1.0, shape)
    }

    pub fn constant(value: f32, shape: &[usize]) -> Tensor {
        let size = shape.iter().product();
        Self::new(vec![value; size], shape, false)
    }

    /// Values uniformly distributed in [low, high)
    pub fn uniform(shape: &[usize], low: f32, high: f32) -> Tensor {
        let size = shape.iter().product();
        let data = with_rng(|rng| (0..size).map(|_| rng.random_range(low..high)).collect());
        Self::new(data, shape, false)
    }

    /// Values from N(0, std^2)
    pub fn normal(shape: &[usize], std: f32) -> Tensor {
        let size = shape.iter().product();
        let data = with_rng(|rng| {
            (0..size)
                .map(|_| {
                    let z: f32 = StandardNormal.sample(rng);
                    z * std
                })
                .collect()
        });
        Self::new(data, shape, false)
    }

    /// Values from N(0, 1)
    pub fn randn(shape: &[usize]) -> Tensor {
        Self::normal(shape, 1.0)
    }

    /// Xavier/Glorot uniform: U(-a, a) with a = sqrt(6 / (fan_in + fan_out))
    pub fn xavier_uniform(shape: &[usize], fan_in: usize, fan_out: usize) -> Tensor {
        let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
        Self::uniform(shape, -limit, limit)
    }

    /// Xavier/Glorot normal: N(0, 2 / (fan_in + fan_out))
    pub fn xavier_normal(shape: &[usize], fan_in: usize, fan_out: usize) -> Tensor {
        let std = (2.0 / (fan_in + fan_out) as f32).sqrt();
        Self::normal(shape, std)
    }

    /// Kaiming-style uniform bound used for conv/linear defaults: U(-1/sqrt(fan_in), 1/sqrt(fan_in))
    pub fn fan_in_uniform(shape: &[usize], fan_in: usize) -> Tensor {
        let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
        Self::uniform(shape, -bound, bound)
    }

    /// Copy data and flags into a fresh leaf, cutting all graph links.
    pub fn detached_copy(t: &Tensor) -> Tensor {
        let src = t.borrow();
        Self::new(src.data.clone(), &src.shape, src.requires_grad)
    }

    /// Copy data into a fresh leaf that never requires grad.
    pub fn detach(t: &Tensor) -> Tensor {
        let src = t.borrow();
        Self::new(src.data.clone(), &src.shape, false)
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

// ===== LOSS FUNCTIONS =====
impl RawTensor {
    pub fn mse_loss(pred: &Tensor, target: &Tensor) -> Tensor {
        let diff = pred.sub(target);
        diff.elem_mul(&diff).mean()
    }

    /// Mean cross entropy between `[batch, classes]` logits and class indices.
    pub fn cross_entropy_loss(logits: &Tensor, targets: &[usize]) -> Tensor {
        let (batch, classes) = {
            let l = logits.borrow();
            assert_eq!(l.shape.len(), 2, "cross entropy expects [batch, classes]");
            (l.shape[0], l.shape[1])
        };
        assert_eq!(batch, targets.len(), "one target per batch row");
        let mut one_hot = vec![0.0; batch * classes];
        for (row, &t) in targets.iter().enumerate() {
            assert!(t < classes, "target {t} out of range for {classes} classes");
            one_hot[row * classes + t] = 1.0;
        }
        let one_hot = Self::new(one_hot, &[batch, classes], false);
        let log_probs = logits.log_softmax(1);
        log_probs.elem_mul(&one_hot).sum_dim(1, false).neg().mean()
    }
}

// ===== NUMERICAL GRADIENT CHECKING =====

impl RawTensor {
    /// Check gradients numerically using central finite differences
    ///
    /// Analytical gradient: what backward() computes
    /// Numerical gradient: (f(x+ε) - f(x-ε)) / (2ε)
    ///
    /// # Returns
    /// (max_error, mean_error, passed)
    pub fn check_gradients<F>(
        tensor: &Tensor,
        loss_fn: F,
        epsilon: f32,
        tolerance: f32,
    ) -> (f32, f32, bool)
    where
        F: Fn(&Tensor) -> Tensor,
    {
        let loss = loss_fn(tensor);
        loss.backward();

        let analytical_grad = tensor.grad().expect("Tensor must have gradient");
        let mut numerical_grad = vec![0.0; analytical_grad.len()];

        let original_data = tensor.borrow().data.clone();
        let original_shape = tensor.borrow().shape.clone();

        for i in 0..original_data.len() {
            let mut data_plus = original_data.clone();
            data_plus[i] += epsilon;
            let val_plus = crate::autograd::no_grad(|| {
                let loss = loss_fn(&RawTensor::new(data_plus, &original_shape, false));
                let value = loss.borrow().data[0];
                value
            });

            let mut data_minus = original_data.clone();
            data_minus[i] -= epsilon;
            let val_minus = crate::autograd::no_grad(|| {
                let loss = loss_fn(&RawTensor::new(data_minus, &original_shape, false));
                let value = loss.borrow().data[0];
                value
            });
            numerical_grad[i] = (val_plus - val_minus) / (2.0 * epsilon);
        }

        let mut max_error: f32 = 0.0;
        let mut total_error: f32 = 0.0;

        for (i, (&analytical, &numerical)) in
            analytical_grad.iter().zip(&numerical_grad).enumerate()
        {
            let error = (analytical - numerical).abs();
            let relative_error = if numerical.abs() > 1e-3 {
                error / numerical.abs()
            } else {
                error
            };

            max_error = max_error.max(relative_error);
            total_error += relative_error;

            if relative_error > tolerance {
                log::warn!(
                    "Gradient mismatch at index {i}: analytical={analytical:.6e}, numerical={numerical:.6e}, error={relative_error:.6e}"
                );
            }
        }

        let mean_error = total_error / analytical_grad.len().max(1) as f32;
        (max_error, mean_error, max_error < tolerance)
    }

    /// Gradient checker with defaults suited to f32 (epsilon=1e-2, tolerance=2e-2)
    pub fn check_gradients_simple<F>(tensor: &Tensor, loss_fn: F) -> bool
    where
        F: Fn(&Tensor) -> Tensor,
    {
        let (max_err, mean_err, passed) = Self::check_gradients(tensor, loss_fn, 1e-2, 2e-2);
        if !passed {
            log::warn!("Gradient check FAILED: max_error={max_err:.6e}, mean_error={mean_err:.6e}");
        }
        passed
    }
}

// ===== TRAIT-BASED API =====

/// Public trait for tensor operations
///
/// This provides a more ergonomic API: `tensor.add(&other)` instead of `RawTensor::add(&tensor, &other)`
pub trait TensorOps {
    // Binary ops
    fn add(&self, other: &Tensor) -> Tensor;
    fn sub(&self, other: &Tensor) -> Tensor;
    fn elem_mul(&self, other: &Tensor) -> Tensor;
    fn div(&self, other: &Tensor) -> Tensor;

    // Unary ops
    fn neg(&self) -> Tensor;
    fn sqrt(&self) -> Tensor;
    fn exp(&self) -> Tensor;
    fn log(&self) -> Tensor;
    fn relu(&self) -> Tensor;
    fn elu(&self, alpha: f32) -> Tensor;
    fn leaky_relu(&self, negative_slope: f32) -> Tensor;

    // Reduce ops
    fn sum(&self) -> Tensor;
    fn mean(&self) -> Tensor;
    fn sum_dim(&self, dim: usize, keepdim: bool) -> Tensor;
    fn max_dim(&self, dim: usize, keepdim: bool) -> Tensor;
    fn mean_dim(&self, dim: usize, keepdim: bool) -> Tensor;
    fn softmax(&self, dim: usize) -> Tensor;
    fn log_softmax(&self, dim: usize) -> Tensor;

    // Movement ops
    fn reshape(&self, new_shape: &[usize]) -> Tensor;
    fn permute(&self, axes: &[usize]) -> Tensor;
    fn pad(&self, padding: &[(usize, usize)]) -> Tensor;
    fn shrink(&self, ranges: &[(usize, usize)]) -> Tensor;
    fn unsqueeze(&self, dim: usize) -> Tensor;
    fn squeeze(&self, dim: usize) -> Tensor;

    // Matmul
    fn matmul(&self, other: &Tensor) -> Tensor;
    fn transpose(&self) -> Tensor;

    // Gradient ops
    fn backward(&self);
    fn grad(&self) -> Option<Vec<f32>>;

    // Inspection
    fn shape(&self) -> Vec<usize>;
    fn to_vec(&self) -> Vec<f32>;
    fn item(&self) -> f32;
}

impl TensorOps for Tensor {
    fn add(&self, other: &Tensor) -> Tensor {
        RawTensor::add(self, other)
    }
    fn sub(&self, other: &Tensor) -> Tensor {
        RawTensor::sub(self, other)
    }
    fn elem_mul(&self, other: &Tensor) -> Tensor {
        RawTensor::elem_mul(self, other)
    }
    fn div(&self, other: &Tensor) -> Tensor {
        RawTensor::div(self, other)
    }

    fn neg(&self) -> Tensor {
        RawTensor::neg(self)
    }
    fn sqrt(&self) -> Tensor {
        RawTensor::sqrt(self)
    }
    fn exp(&self) -> Tensor {
        RawTensor::exp(self)
    }
    fn log(&self) -> Tensor {
        RawTensor::log(self)
    }
    fn relu(&self) -> Tensor {
        RawTensor::relu(self)
    }
    fn elu(&self, alpha: f32) -> Tensor {
        RawTensor::elu(self, alpha)
    }
    fn leaky_relu(&self, negative_slope: f32) -> Tensor {
        RawTensor::leaky_relu(self, negative_slope)
    }

    fn sum(&self) -> Tensor {
        RawTensor::sum(self)
    }
    fn mean(&self) -> Tensor {
        RawTensor::mean(self)
    }
    fn sum_dim(&self, dim: usize, keepdim: bool) -> Tensor {
        RawTensor::sum_dim(self, dim, keepdim)
    }
    fn max_dim(&self, dim: usize, keepdim: bool) -> Tensor {
        RawTensor::max_dim(self, dim, keepdim)
    }
    fn mean_dim(&self, dim: usize, keepdim: bool) -> Tensor {
        RawTensor::mean_dim(self, dim, keepdim)
    }
    fn softmax(&self, dim: usize) -> Tensor {
        RawTensor::softmax(self, dim)
    }
    fn log_softmax(&self, dim: usize) -> Tensor {
        RawTensor::log_softmax(self, dim)
    }

    fn reshape(&self, new_shape: &[usize]) -> Tensor {
        RawTensor::reshape(self, new_shape)
    }
    fn permute(&self, axes: &[usize]) -> Tensor {
        RawTensor::permute(self, axes)
    }
    fn pad(&self, padding: &[(usize, usize)]) -> Tensor {
        RawTensor::pad(self, padding)
    }
    fn shrink(&self, ranges: &[(usize, usize)]) -> Tensor {
        RawTensor::shrink(self, ranges)
    }
    fn unsqueeze(&self, dim: usize) -> Tensor {
        RawTensor::unsqueeze(self, dim)
    }
    fn squeeze(&self, dim: usize) -> Tensor {
        RawTensor::squeeze(self, dim)
    }

    fn matmul(&self, other: &Tensor) -> Tensor {
        RawTensor::matmul(self, other)
    }
    fn transpose(&self) -> Tensor {
        RawTensor::transpose(self)
    }

    fn backward(&self) {
        RawTensor::backward(self)
    }
    fn grad(&self) -> Option<Vec<f32>> {
        self.borrow().grad.clone()
    }

    fn shape(&self) -> Vec<usize> {
        self.borrow().shape.clone()
    }
    fn to_vec(&self) -> Vec<f32> {
        self.borrow().data.clone()
    }
    fn item(&self) -> f32 {
        let t = self.borrow();
        assert_eq!(t.data.len(), 1, "item() requires a single-element tensor");
        t.data[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_entropy_matches_hand_computation() {
        let logits = RawTensor::new(vec![2.0, 0.0, 0.0, 0.0, 0.0, 3.0], &[2, 3], true);
        let loss = RawTensor::cross_entropy_loss(&logits, &[0, 2]);

        let row = |z: [f32; 3], t: usize| {
            let m = z.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let lse = z.iter().map(|v| (v - m).exp()).sum::<f32>().ln() + m;
            lse - z[t]
        };
        let expected = (row([2.0, 0.0, 0.0], 0) + row([0.0, 0.0, 3.0], 2)) / 2.0;
        assert!((loss.item() - expected).abs() < 1e-5);

        let passed = RawTensor::check_gradients_simple(&logits, |t| {
            RawTensor::cross_entropy_loss(t, &[0, 2])
        });
        assert!(passed);
    }

    #[test]
    fn seeded_generator_is_reproducible() {
        manual_seed(7);
        let a = RawTensor::randn(&[16]).to_vec();
        manual_seed(7);
        let b = RawTensor::randn(&[16]).to_vec();
        assert_eq!(a, b);
    }

    #[test]
    fn xavier_normal_has_expected_spread() {
        manual_seed(1);
        let w = RawTensor::xavier_normal(&[200, 100], 200, 100).to_vec();
        let var = w.iter().map(|v| v * v).sum::<f32>() / w.len() as f32;
        let expected = 2.0 / 300.0;
        assert!((var - expected).abs() < expected * 0.15);
    }
}
