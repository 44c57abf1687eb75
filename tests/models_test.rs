mod common;

use dn3::trainable::models::default_classifier;
use dn3::{
    Architecture, DN3BaseModel, Dn3Error, EEGNet, EEGNetParams, ExperimentConfig, LogRegNetwork,
    Module, RawTensor, TIDNet, TIDNetParams, TensorOps, manual_seed, no_grad,
};

fn small_tidnet() -> TIDNetParams {
    TIDNetParams {
        s_growth: 4,
        t_filters: 6,
        pooling: 8,
        bottleneck: 2,
        ..TIDNetParams::default()
    }
}

fn small_eegnet() -> EEGNetParams {
    EEGNetParams {
        f1: 4,
        d: 2,
        t_len: 15,
        f2: 8,
        ..EEGNetParams::default()
    }
}

#[test]
fn eegnet_forward_shape() {
    manual_seed(0);
    let model = EEGNet::build(3, 128, 4, small_eegnet()).unwrap();
    assert_eq!(model.num_features_for_classification(), 8 * ((128 / 4) / 8));
    let y = model.forward(&RawTensor::randn(&[2, 4, 128]));
    assert_eq!(y.shape(), vec![2, 3]);
}

#[test]
fn tidnet_forward_backward() {
    manual_seed(1);
    let mut model = TIDNet::build(2, 64, 3, small_tidnet()).unwrap();
    assert_eq!(model.num_features_for_classification(), (6 + 4 * 2) * 8);
    model.set_return_features(true);

    let x = RawTensor::randn(&[2, 3, 64]);
    let (logits, features) = model.forward_outputs(&x);
    assert_eq!(logits.shape(), vec![2, 2]);
    assert_eq!(features.unwrap().shape(), vec![2, 14, 8]);

    RawTensor::cross_entropy_loss(&logits, &[0, 1]).backward();
    assert!(model.parameters().iter().all(|p| p.grad().is_some()));
}

#[test]
fn eval_mode_is_deterministic() {
    manual_seed(2);
    let mut model = EEGNet::build(2, 64, 3, small_eegnet()).unwrap();
    model.eval();
    let x = RawTensor::randn(&[1, 3, 64]);
    let a = no_grad(|| model.forward(&x)).to_vec();
    let b = no_grad(|| model.forward(&x)).to_vec();
    assert_eq!(a, b);
}

#[test]
fn from_dataset_uses_geometry() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();
    common::write_mmidb(&dir.path().join("mmidb"), 2, 1);
    let text = "
Configuratron:
datasets:
  uniform:
    toplevel: mmidb
    tmin: 0
    samples: 64
    exclude_people: [S002]
  mixed:
    toplevel: mmidb
    tmin: 0
    samples: 64
";
    let config = ExperimentConfig::from_str_with_root(text, dir.path()).unwrap();
    let uniform = config.dataset("uniform").unwrap().auto_construct_dataset().unwrap();
    let model = LogRegNetwork::from_dataset(&uniform, 3, ()).unwrap();
    assert_eq!(model.channels(), common::CHANNELS.len());
    assert_eq!(model.samples(), 64);
    assert_eq!(model.num_features_for_classification(), 64 * common::CHANNELS.len());

    let mixed = config.dataset("mixed").unwrap().auto_construct_dataset().unwrap();
    assert!(matches!(
        EEGNet::from_dataset(&mixed, 3, small_eegnet()),
        Err(Dn3Error::SfreqMismatch { .. })
    ));
}

#[test]
fn save_and_load_round_trip() {
    manual_seed(3);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("eegnet.bin");
    let model = EEGNet::build(2, 64, 3, small_eegnet()).unwrap();
    model.save(&path).unwrap();

    let mut restored = EEGNet::build(2, 64, 3, small_eegnet()).unwrap();
    let diff = restored.load(&path, true).unwrap();
    assert!(diff.is_empty());
    assert_eq!(restored.state_dict(), model.state_dict());

    // a different head no longer matches
    let mut wider = EEGNet::build(4, 64, 3, small_eegnet()).unwrap();
    assert!(matches!(
        wider.load(&path, true),
        Err(Dn3Error::StateDictMismatch(_))
    ));
    let diff = wider.load(&path, false).unwrap();
    assert_eq!(diff.shape_mismatches.len(), 2);
    assert_eq!(
        wider.state_dict()["init_conv.1.weight"],
        model.state_dict()["init_conv.1.weight"]
    );
}

#[test]
fn new_classification_layer_replaces_head() {
    let mut model = LogRegNetwork::with_defaults(2, 8, 2).unwrap();
    model.set_classifier(Box::new(default_classifier(16, 5)));
    assert_eq!(model.forward(&RawTensor::randn(&[3, 2, 8])).shape(), vec![3, 5]);
    model.make_new_classification_layer();
    assert_eq!(model.forward(&RawTensor::randn(&[3, 2, 8])).shape(), vec![3, 2]);
}

#[test]
fn clone_is_deep_copy() {
    let model = TIDNet::build(2, 64, 3, small_tidnet()).unwrap();
    let copy = model.clone();
    for p in model.parameters() {
        p.borrow_mut().data.iter_mut().for_each(|v| *v += 1.0);
    }
    let before = copy.state_dict();
    assert_ne!(before, model.state_dict());
    assert_eq!(copy.clone().state_dict(), before);
}
