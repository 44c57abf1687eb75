mod common;

use dn3::io::StateDict;
use dn3::{
    Dataset, Dn3Dataset, ExperimentConfig, FitOptions, Linear, Module, RandomTemporalCrop,
    StandardClassification, Tensor, TensorOps, manual_seed,
};
use std::path::Path;

/// A bare classifier outside the DN3 model family.
#[derive(Clone)]
struct DummyClassifier {
    classifier: Linear,
    training: bool,
}

impl DummyClassifier {
    fn new(channels: usize, samples: usize, targets: usize) -> Self {
        Self {
            classifier: Linear::new(channels * samples, targets, true),
            training: true,
        }
    }
}

impl Module for DummyClassifier {
    fn forward(&self, x: &Tensor) -> Tensor {
        let shape = x.shape();
        let flat = x.reshape(&[shape[0], shape[1..].iter().product()]);
        self.classifier.forward(&flat)
    }
    fn parameters(&self) -> Vec<Tensor> {
        self.classifier.parameters()
    }
    fn state_dict(&self) -> StateDict {
        self.classifier.state_dict()
    }
    fn load_state_dict(&mut self, state: &StateDict) {
        self.classifier.load_state_dict(state);
    }
    fn clone_box(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }
    fn train(&mut self, mode: bool) {
        self.training = mode;
    }
    fn is_training(&self) -> bool {
        self.training
    }
}

const NUM_EPOCHS: usize = 10;

fn dummy_dataset(dir: &Path) -> Dataset {
    common::init_logging();
    common::write_mmidb(&dir.join("mmidb"), 1, 0);
    let text = "
Configuratron:
datasets:
  dummy:
    toplevel: mmidb
    tmin: 0
    samples: 32
    decimate: 2
";
    ExperimentConfig::from_str_with_root(text, dir)
        .unwrap()
        .dataset("dummy")
        .unwrap()
        .auto_construct_dataset()
        .unwrap()
}

#[test]
fn make_simple_classifier_trainable() {
    let dir = tempfile::tempdir().unwrap();
    let dataset = dummy_dataset(dir.path());
    let classifier = DummyClassifier::new(dataset.channels().len(), dataset.sequence_length(), 4);
    let trainable = StandardClassification::new(classifier);
    assert!((trainable.learning_rate() - 1e-3).abs() < 1e-9);
}

#[test]
fn trainable_fit() {
    manual_seed(42);
    let dir = tempfile::tempdir().unwrap();
    let dataset = dummy_dataset(dir.path());
    let batch_size = common::EVENTS.len() - 1;
    let classifier = DummyClassifier::new(dataset.channels().len(), dataset.sequence_length(), 4);
    let mut trainable = StandardClassification::new(classifier).show_progress(false);

    let options = FitOptions {
        epochs: NUM_EPOCHS,
        batch_size,
        shuffle: true,
        drop_last: true,
    };
    let (train_log, eval_log) = trainable
        .fit(
            &dataset,
            options,
            None,
            |_, model| assert!(model.is_training()),
            |_, model| assert!(!model.is_training()),
        )
        .unwrap();

    assert_eq!(train_log.len(), NUM_EPOCHS * (dataset.len() / batch_size));
    assert_eq!(eval_log.len(), NUM_EPOCHS);
    assert!(eval_log.iter().all(|e| e.validation.is_none()));
    assert!(train_log.iter().all(|row| row.loss.is_finite()));
}

#[test]
fn batch_transforms_only_touch_training() {
    manual_seed(7);
    let dir = tempfile::tempdir().unwrap();
    let dataset = dummy_dataset(dir.path());
    // a pooled model tolerates shorter trials
    let classifier = dn3::Sequential::new(vec![])
        .push(dn3::AdaptiveAvgPool1d::new(4))
        .push(dn3::Flatten::new())
        .push(Linear::new(dataset.channels().len() * 4, 3, true));
    let mut trainable = StandardClassification::new(classifier)
        .show_progress(false)
        .add_batch_transform(RandomTemporalCrop::new(0.5).unwrap());

    let options = FitOptions {
        epochs: 2,
        batch_size: 4,
        ..FitOptions::default()
    };
    let (train_log, _) = trainable
        .fit(&dataset, options, Some(&dataset), |_, _| {}, |_, _| {})
        .unwrap();
    assert_eq!(train_log.len(), 2 * dataset.len().div_ceil(4));

    let predictions = trainable.predict(&dataset, 4).unwrap();
    assert_eq!(predictions.logits.shape(), vec![dataset.len(), 3]);
}
