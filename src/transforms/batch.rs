use crate::error::{Dn3Error, Result};
use crate::tensor::{Tensor, TensorOps, with_rng};
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;

/// An operation on a whole batch of trials, applied after batching.
pub trait BatchTransform {
    /// `training` is false for evaluation batches, where most transforms are the identity.
    fn apply(&self, x: &Tensor, training: bool) -> Tensor;

    fn name(&self) -> &str;
}

/// Crops the end of the time axis of an entire batch to a random length.
///
/// The kept length is drawn from the last `len(crop_weights)` positions, weighted
/// by `crop_weights`, or uniformly from the last `max_crop_frac` of the axis.
#[derive(Clone, Debug)]
pub struct RandomTemporalCrop {
    max_crop_frac: f64,
    crop_weights: Option<Vec<f64>>,
    temporal_axis: usize,
}

impl RandomTemporalCrop {
    /// Crops the last axis of `(B, C, T)` batches uniformly.
    pub fn new(max_crop_frac: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&max_crop_frac) {
            return Err(Dn3Error::InvalidParameter(format!(
                "max_crop_frac must be in [0, 1], got {max_crop_frac}"
            )));
        }
        Ok(Self {
            max_crop_frac,
            crop_weights: None,
            temporal_axis: 2,
        })
    }

    /// Weighted crop positions; the last weight is for keeping all but one sample.
    pub fn with_weights(crop_weights: Vec<f64>) -> Result<Self> {
        WeightedIndex::new(&crop_weights)
            .map_err(|e| Dn3Error::InvalidParameter(format!("crop_weights: {e}")))?;
        Ok(Self {
            max_crop_frac: 0.0,
            crop_weights: Some(crop_weights),
            temporal_axis: 2,
        })
    }

    pub fn temporal_axis(mut self, axis: usize) -> Self {
        self.temporal_axis = axis;
        self
    }

    fn weights_for(&self, len: usize) -> Vec<f64> {
        match &self.crop_weights {
            Some(weights) => weights.clone(),
            None => vec![1.0; (len as f64 * self.max_crop_frac) as usize],
        }
    }
}

impl Default for RandomTemporalCrop {
    fn default() -> Self {
        Self {
            max_crop_frac: 0.25,
            crop_weights: None,
            temporal_axis: 2,
        }
    }
}

impl BatchTransform for RandomTemporalCrop {
    /// # Panics
    /// More crop weights than samples on the temporal axis.
    fn apply(&self, x: &Tensor, training: bool) -> Tensor {
        if !training {
            return x.clone();
        }
        let shape = x.shape();
        let len = shape[self.temporal_axis];
        let weights = self.weights_for(len);
        if weights.is_empty() {
            return x.clone();
        }
        assert!(
            weights.len() <= len,
            "{} crop positions for an axis of {len} samples",
            weights.len()
        );
        let no_crop_len = len - weights.len();
        let Ok(dist) = WeightedIndex::new(&weights) else {
            return x.clone();
        };
        let keep = (no_crop_len + with_rng(|rng| dist.sample(rng))).max(1);

        let ranges: Vec<(usize, usize)> = shape
            .iter()
            .enumerate()
            .map(|(axis, &n)| if axis == self.temporal_axis { (0, keep) } else { (0, n) })
            .collect();
        x.shrink(&ranges)
    }

    fn name(&self) -> &str {
        "RandomTemporalCrop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{RawTensor, manual_seed};

    #[test]
    fn identity_outside_training() {
        let crop = RandomTemporalCrop::default();
        let x = RawTensor::randn(&[2, 3, 40]);
        assert_eq!(crop.apply(&x, false).shape(), vec![2, 3, 40]);
    }

    #[test]
    fn uniform_crop_stays_in_last_fraction() {
        manual_seed(11);
        let crop = RandomTemporalCrop::new(0.25).unwrap();
        let x = RawTensor::randn(&[2, 3, 40]);
        for _ in 0..20 {
            let t = crop.apply(&x, true).shape()[2];
            assert!((30..40).contains(&t), "cropped to {t}");
        }
    }

    #[test]
    fn weights_pick_the_only_allowed_position() {
        let crop = RandomTemporalCrop::with_weights(vec![0.0, 1.0, 0.0])
            .unwrap()
            .temporal_axis(1);
        let x = RawTensor::new((0..20).map(|v| v as f32).collect(), &[2, 10], false);
        let y = crop.apply(&x, true);
        // positions 7, 8, 9 are candidates and only 8 has weight
        assert_eq!(y.shape(), vec![2, 8]);
        assert_eq!(y.to_vec()[..8], (0..8).map(|v| v as f32).collect::<Vec<_>>()[..]);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(RandomTemporalCrop::new(1.5).is_err());
        assert!(RandomTemporalCrop::with_weights(vec![0.0, 0.0]).is_err());
        assert!(RandomTemporalCrop::with_weights(vec![]).is_err());
    }
}
