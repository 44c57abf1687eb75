//! Training loops around a model, an optimiser and a loss.

use crate::autograd::no_grad;
use crate::data::{Batch, DataLoader, Dn3Dataset};
use crate::error::{Dn3Error, Result};
use crate::nn::{Adam, Module};
use crate::tensor::{RawTensor, Tensor, TensorOps};
use crate::transforms::BatchTransform;
use crate::utils::ProgressBar;
use std::fmt;

/// One optimiser step.
#[derive(Clone, Debug, PartialEq)]
pub struct StepMetrics {
    pub epoch: usize,
    pub iteration: usize,
    pub loss: f32,
    pub accuracy: f32,
    pub lr: f32,
}

/// Loss and accuracy over a whole dataset.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Metrics {
    pub loss: f32,
    pub accuracy: f32,
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loss {:.4}, accuracy {:.3}", self.loss, self.accuracy)
    }
}

/// Summary of one epoch; `validation` is set when a validation set was given.
#[derive(Clone, Debug, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train: Metrics,
    pub validation: Option<Metrics>,
}

/// Logits for every trial, `[trials, targets]`, with their labels when known.
#[derive(Clone, Debug)]
pub struct Predictions {
    pub logits: Tensor,
    pub targets: Option<Vec<usize>>,
}

impl Predictions {
    pub fn predicted_classes(&self) -> Vec<usize> {
        argmax_rows(&self.logits)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FitOptions {
    pub epochs: usize,
    pub batch_size: usize,
    pub shuffle: bool,
    pub drop_last: bool,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            epochs: 1,
            batch_size: 8,
            shuffle: true,
            drop_last: false,
        }
    }
}

fn argmax_rows(logits: &Tensor) -> Vec<usize> {
    let l = logits.borrow();
    let classes = l.shape.last().copied().unwrap_or(1).max(1);
    l.data
        .chunks(classes)
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                    if v > best.1 { (i, v) } else { best }
                })
                .0
        })
        .collect()
}

fn count_correct(logits: &Tensor, targets: &[usize]) -> usize {
    argmax_rows(logits)
        .iter()
        .zip(targets)
        .filter(|(p, t)| p == t)
        .count()
}

fn labels(batch: &Batch) -> Result<&[usize]> {
    batch.y.as_deref().ok_or_else(|| {
        Dn3Error::InvalidParameter("classification needs labelled trials".into())
    })
}

/// Supervised classification with Adam and cross entropy.
pub struct StandardClassification<M: Module> {
    model: M,
    optimizer: Adam,
    weight_decay: f32,
    transforms: Vec<Box<dyn BatchTransform>>,
    show_progress: bool,
}

impl<M: Module> StandardClassification<M> {
    pub fn new(model: M) -> Self {
        Self::with_optimizer(model, 1e-3, 0.0)
    }

    pub fn with_optimizer(model: M, learning_rate: f32, weight_decay: f32) -> Self {
        let optimizer = Adam::new(
            model.parameters(),
            learning_rate,
            (0.9, 0.999),
            1e-8,
            weight_decay,
        );
        StandardClassification {
            model,
            optimizer,
            weight_decay,
            transforms: Vec::new(),
            show_progress: true,
        }
    }

    pub fn show_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Add a transform applied to training batches only.
    pub fn add_batch_transform(mut self, transform: impl BatchTransform + 'static) -> Self {
        self.transforms.push(Box::new(transform));
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn learning_rate(&self) -> f32 {
        self.optimizer.lr()
    }

    pub fn set_learning_rate(&mut self, lr: f32) {
        self.optimizer.set_lr(lr);
    }

    pub fn weight_decay(&self) -> f32 {
        self.weight_decay
    }

    fn train_step(&mut self, batch: Batch) -> Result<(f32, usize, usize)> {
        let targets = labels(&batch)?.to_vec();
        let x = self
            .transforms
            .iter()
            .fold(batch.x, |x, t| t.apply(&x, true));

        self.optimizer.zero_grad();
        let logits = self.model.forward(&x);
        let loss = RawTensor::cross_entropy_loss(&logits, &targets);
        loss.backward();
        self.optimizer.step();

        Ok((loss.item(), count_correct(&logits, &targets), targets.len()))
    }

    /// Train for `options.epochs` epochs.
    ///
    /// `step_callback` runs after every optimiser step with the model in training
    /// mode; `epoch_callback` runs after every epoch with the model in evaluation
    /// mode. Returns one row per step and one per epoch.
    pub fn fit<S, E>(
        &mut self,
        training: &dyn Dn3Dataset,
        options: FitOptions,
        validation: Option<&dyn Dn3Dataset>,
        mut step_callback: S,
        mut epoch_callback: E,
    ) -> Result<(Vec<StepMetrics>, Vec<EpochMetrics>)>
    where
        S: FnMut(&StepMetrics, &M),
        E: FnMut(&EpochMetrics, &M),
    {
        let loader = DataLoader::new(training, options.batch_size)
            .shuffle(options.shuffle)
            .drop_last(options.drop_last);
        if loader.num_batches() == 0 {
            return Err(Dn3Error::InvalidParameter(format!(
                "{} trials make no batches of {}",
                training.len(),
                options.batch_size
            )));
        }

        let mut train_log = Vec::with_capacity(options.epochs * loader.num_batches());
        let mut eval_log = Vec::with_capacity(options.epochs);
        for epoch in 1..=options.epochs {
            self.model.train(true);
            let mut bar = if self.show_progress {
                ProgressBar::new(loader.num_batches(), &format!("Epoch {epoch}"))
            } else {
                ProgressBar::hidden(loader.num_batches())
            };

            let (mut loss_sum, mut correct, mut seen) = (0.0f32, 0usize, 0usize);
            for (iteration, batch) in loader.iter().enumerate() {
                let (loss, batch_correct, batch_len) = self.train_step(batch?)?;
                loss_sum += loss * batch_len as f32;
                correct += batch_correct;
                seen += batch_len;

                let row = StepMetrics {
                    epoch,
                    iteration: iteration + 1,
                    loss,
                    accuracy: batch_correct as f32 / batch_len as f32,
                    lr: self.optimizer.lr(),
                };
                bar.inc_with(format!("loss {:.4} acc {:.3}", row.loss, row.accuracy));
                step_callback(&row, &self.model);
                train_log.push(row);
            }
            bar.finish();

            let train = Metrics {
                loss: loss_sum / seen.max(1) as f32,
                accuracy: correct as f32 / seen.max(1) as f32,
            };
            self.model.eval();
            let validation = validation
                .map(|v| self.evaluate(v, options.batch_size))
                .transpose()?;
            match &validation {
                Some(v) => log::info!("Epoch {epoch}: training {train}; validation {v}"),
                None => log::info!("Epoch {epoch}: training {train}"),
            }
            let summary = EpochMetrics {
                epoch,
                train,
                validation,
            };
            epoch_callback(&summary, &self.model);
            eval_log.push(summary);
        }
        Ok((train_log, eval_log))
    }

    /// Loss and accuracy over `dataset` in evaluation mode, without gradients.
    pub fn evaluate(&mut self, dataset: &dyn Dn3Dataset, batch_size: usize) -> Result<Metrics> {
        let predictions = self.predict(dataset, batch_size)?;
        let targets = predictions.targets.as_deref().ok_or_else(|| {
            Dn3Error::InvalidParameter("evaluation needs labelled trials".into())
        })?;
        let loss = no_grad(|| RawTensor::cross_entropy_loss(&predictions.logits, targets).item());
        let accuracy = count_correct(&predictions.logits, targets) as f32 / targets.len() as f32;
        Ok(Metrics { loss, accuracy })
    }

    /// Logits for every trial of `dataset`, in order.
    pub fn predict(&mut self, dataset: &dyn Dn3Dataset, batch_size: usize) -> Result<Predictions> {
        if dataset.is_empty() {
            return Err(Dn3Error::InvalidParameter("cannot predict on an empty dataset".into()));
        }
        let was_training = self.model.is_training();
        self.model.eval();
        let loader = DataLoader::new(dataset, batch_size);

        let mut logits = Vec::with_capacity(loader.num_batches());
        let mut targets = Some(Vec::with_capacity(dataset.len()));
        for batch in loader.iter() {
            let batch = batch?;
            logits.push(no_grad(|| self.model.forward(&batch.x)));
            match batch.y {
                Some(y) => {
                    if let Some(all) = targets.as_mut() {
                        all.extend(y);
                    }
                }
                None => targets = None,
            }
        }
        if was_training {
            self.model.train(true);
        }
        Ok(Predictions {
            logits: no_grad(|| RawTensor::cat(&logits, 0)),
            targets,
        })
    }
}
