use super::{Dn3Dataset, Trial};
use crate::error::{Dn3Error, Result};
use crate::tensor::{RawTensor, Tensor, TensorOps, with_rng};
use rand::seq::SliceRandom;

/// A stacked group of trials: `x` is `[batch, channels, samples]`.
#[derive(Clone, Debug)]
pub struct Batch {
    pub x: Tensor,
    pub y: Option<Vec<usize>>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.x.shape().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stack trials along a new leading axis. Labels are kept only when every trial has one.
    pub fn stack(trials: &[Trial]) -> Result<Self> {
        let first = trials
            .first()
            .ok_or_else(|| Dn3Error::InvalidParameter("cannot stack an empty batch".into()))?;
        let shape = first.x.shape();
        let mut data = Vec::with_capacity(trials.len() * first.x.borrow().numel());
        for trial in trials {
            let x = trial.x.borrow();
            if x.shape != shape {
                return Err(Dn3Error::InvalidParameter(format!(
                    "trial shapes differ within a batch: {shape:?} and {:?}",
                    x.shape
                )));
            }
            data.extend_from_slice(&x.data);
        }
        let mut batch_shape = vec![trials.len()];
        batch_shape.extend_from_slice(&shape);

        let y = trials.iter().map(|t| t.y).collect::<Option<Vec<_>>>();
        Ok(Batch {
            x: RawTensor::new(data, &batch_shape, false),
            y,
        })
    }
}

/// Mini-batches over any indexable collection of trials.
pub struct DataLoader<'a> {
    dataset: &'a dyn Dn3Dataset,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
}

impl<'a> DataLoader<'a> {
    pub fn new(dataset: &'a dyn Dn3Dataset, batch_size: usize) -> Self {
        DataLoader {
            dataset,
            batch_size: batch_size.max(1),
            shuffle: false,
            drop_last: false,
        }
    }

    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches one pass yields.
    pub fn num_batches(&self) -> usize {
        let n = self.dataset.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    /// One pass over the dataset; a new order is drawn per call when shuffling.
    pub fn iter(&self) -> Batches<'a> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            with_rng(|rng| order.shuffle(rng));
        }
        if self.drop_last {
            order.truncate(self.num_batches() * self.batch_size);
        }
        Batches {
            dataset: self.dataset,
            order,
            batch_size: self.batch_size,
            position: 0,
        }
    }
}

pub struct Batches<'a> {
    dataset: &'a dyn Dn3Dataset,
    order: Vec<usize>,
    batch_size: usize,
    position: usize,
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.order.len());
        let indices = &self.order[self.position..end];
        self.position = end;

        let trials = indices
            .iter()
            .map(|&i| self.dataset.get(i))
            .collect::<Result<Vec<_>>>();
        Some(trials.and_then(|t| Batch::stack(&t)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Sfreq;
    use crate::tensor::manual_seed;

    struct Counting {
        n: usize,
        channels: Vec<String>,
    }

    impl Dn3Dataset for Counting {
        fn len(&self) -> usize {
            self.n
        }
        fn get(&self, index: usize) -> Result<Trial> {
            Ok(Trial {
                x: RawTensor::constant(index as f32, &[2, 3]),
                y: Some(index % 2),
            })
        }
        fn channels(&self) -> &[String] {
            &self.channels
        }
        fn sequence_length(&self) -> usize {
            3
        }
        fn sfreq(&self) -> Sfreq {
            Sfreq::Uniform(100.0)
        }
    }

    fn counting(n: usize) -> Counting {
        Counting {
            n,
            channels: vec!["a".into(), "b".into()],
        }
    }

    #[test]
    fn batches_in_order_with_remainder() {
        let data = counting(7);
        let loader = DataLoader::new(&data, 3);
        assert_eq!(loader.num_batches(), 3);
        let batches: Vec<Batch> = loader.iter().map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].x.shape(), vec![3, 2, 3]);
        assert_eq!(batches[2].len(), 1);
        assert_eq!(batches[2].x.to_vec(), vec![6.0; 6]);
        assert_eq!(batches[0].y, Some(vec![0, 1, 0]));
    }

    #[test]
    fn drop_last_discards_partial_batch() {
        let data = counting(7);
        let loader = DataLoader::new(&data, 3).drop_last(true);
        assert_eq!(loader.num_batches(), 2);
        assert!(loader.iter().all(|b| b.unwrap().len() == 3));
    }

    #[test]
    fn shuffle_visits_every_trial_once() {
        manual_seed(3);
        let data = counting(10);
        let loader = DataLoader::new(&data, 4).shuffle(true);
        let mut seen: Vec<usize> = loader
            .iter()
            .flat_map(|b| {
                let b = b.unwrap();
                let x = b.x.to_vec();
                (0..b.len()).map(move |i| x[i * 6] as usize).collect::<Vec<_>>()
            })
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn mismatched_trials_are_rejected() {
        let trials = vec![
            Trial {
                x: RawTensor::zeros(&[2, 3]),
                y: None,
            },
            Trial {
                x: RawTensor::zeros(&[2, 4]),
                y: None,
            },
        ];
        assert!(matches!(
            Batch::stack(&trials),
            Err(Dn3Error::InvalidParameter(_))
        ));
        let unlabeled = Batch::stack(&trials[..1]).unwrap();
        assert!(unlabeled.y.is_none());
    }
}
