//! Model benchmarks
//!
//! Forward and training-step cost of the bundled architectures on a small
//! motor-imagery sized batch (8 trials, 16 channels, 256 samples).

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use dn3::{
    Architecture, EEGNet, EEGNetParams, Module, RawTensor, TIDNet, TIDNetParams, Tensor, TensorOps,
};

const BATCH: usize = 8;
const CHANNELS: usize = 16;
const SAMPLES: usize = 256;
const TARGETS: usize = 4;

fn batch() -> Tensor {
    let size = BATCH * CHANNELS * SAMPLES;
    let data: Vec<f32> = (0..size).map(|i| (i as f32 * 0.01).sin()).collect();
    RawTensor::new(data, &[BATCH, CHANNELS, SAMPLES], false)
}

fn labels() -> Vec<usize> {
    (0..BATCH).map(|i| i % TARGETS).collect()
}

fn small_tidnet() -> TIDNet {
    let params = TIDNetParams {
        s_growth: 8,
        t_filters: 8,
        pooling: 16,
        ..TIDNetParams::default()
    };
    TIDNet::build(TARGETS, SAMPLES, CHANNELS, params).expect("valid TIDNet geometry")
}

fn eegnet() -> EEGNet {
    EEGNet::build(TARGETS, SAMPLES, CHANNELS, EEGNetParams::default())
        .expect("valid EEGNet geometry")
}

// ===== FORWARD =====

fn bench_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("model_forward");
    group.sample_size(20);

    group.bench_function("eegnet", |b| {
        let mut model = eegnet();
        model.eval();
        let x = batch();
        b.iter(|| black_box(&model).forward(black_box(&x)));
    });

    group.bench_function("tidnet", |b| {
        let mut model = small_tidnet();
        model.eval();
        let x = batch();
        b.iter(|| black_box(&model).forward(black_box(&x)));
    });

    group.finish();
}

// ===== FORWARD + BACKWARD =====

fn bench_backward(c: &mut Criterion) {
    let mut group = c.benchmark_group("model_backward");
    group.sample_size(10);

    group.bench_function("eegnet", |b| {
        let mut model = eegnet();
        let x = batch();
        let y = labels();
        b.iter(|| {
            model.zero_grad();
            let loss = RawTensor::cross_entropy_loss(&model.forward(&x), &y);
            loss.backward();
            black_box(loss.item())
        });
    });

    group.bench_function("tidnet", |b| {
        let mut model = small_tidnet();
        let x = batch();
        let y = labels();
        b.iter(|| {
            model.zero_grad();
            let loss = RawTensor::cross_entropy_loss(&model.forward(&x), &y);
            loss.backward();
            black_box(loss.item())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_forward, bench_backward);
criterion_main!(benches);
