//! Train a classifier on one dataset of an experiment configuration.
//!
//! ```text
//! cargo run --example train_from_config -- experiment.yml motor_imagery --model tidnet
//! ```
//!
//! Model hyperparameters are read from an auxiliary section named after the
//! model (`eegnet:` or `tidnet:`) when the configuration has one.

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use dn3::{
    Architecture, DN3BaseModel, Dn3Dataset, EEGNet, EEGNetParams, ExperimentConfig, FitOptions,
    RandomTemporalCrop, StandardClassification, TIDNet, TIDNetParams,
};
use serde::de::DeserializeOwned;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Model {
    Eegnet,
    Tidnet,
}

#[derive(Parser, Debug)]
#[command(about = "Train a DN3 model from an experiment configuration")]
struct Args {
    /// Experiment configuration (YAML)
    config: PathBuf,
    /// Dataset key under `datasets`; the first one when omitted
    dataset: Option<String>,
    #[arg(long, value_enum, default_value = "eegnet")]
    model: Model,
    #[arg(long, default_value_t = 10)]
    epochs: usize,
    #[arg(long, default_value_t = 16)]
    batch_size: usize,
    #[arg(long, default_value_t = 1e-3)]
    lr: f32,
    /// Randomly crop the end of training batches
    #[arg(long)]
    crop: bool,
    /// Write the trained weights here
    #[arg(long)]
    save: Option<PathBuf>,
}

fn count_targets(dataset: &dyn Dn3Dataset) -> anyhow::Result<usize> {
    let mut highest = None;
    for i in 0..dataset.len() {
        let label = dataset
            .get(i)?
            .y
            .with_context(|| format!("trial {i} has no label; configure `events` or `tlen`"))?;
        highest = highest.max(Some(label));
    }
    highest
        .map(|h| h + 1)
        .context("dataset has no trials to train on")
}

fn params<P: DeserializeOwned + Default>(
    config: &ExperimentConfig,
    name: &str,
) -> anyhow::Result<P> {
    if config.has_auxiliary(name) {
        Ok(config.auxiliary_as(name)?)
    } else {
        Ok(P::default())
    }
}

fn train<M: DN3BaseModel>(
    model: M,
    dataset: &dyn Dn3Dataset,
    args: &Args,
) -> anyhow::Result<M> {
    let mut process = StandardClassification::with_optimizer(model, args.lr, 0.01);
    if args.crop {
        process = process.add_batch_transform(RandomTemporalCrop::default());
    }
    let options = FitOptions {
        epochs: args.epochs,
        batch_size: args.batch_size,
        ..FitOptions::default()
    };
    let (_, epochs) = process.fit(
        dataset,
        options,
        None,
        |_, _| {},
        |epoch, _| println!("epoch {:>3}: {}", epoch.epoch, epoch.train),
    )?;
    if epochs.is_empty() {
        bail!("no epochs were run");
    }
    Ok(process.into_model())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = ExperimentConfig::from_path(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let entry = match &args.dataset {
        Some(name) => config.dataset(name)?,
        None => config
            .datasets()
            .first()
            .context("configuration lists no datasets")?,
    };
    let dataset = entry.auto_construct_dataset()?;
    let targets = count_targets(&dataset)?;

    match args.model {
        Model::Eegnet => {
            let p: EEGNetParams = params(&config, "eegnet")?;
            let model = EEGNet::from_dataset(&dataset, targets, p)?;
            let model = train(model, &dataset, &args)?;
            if let Some(path) = &args.save {
                model.save(path)?;
            }
        }
        Model::Tidnet => {
            let p: TIDNetParams = params(&config, "tidnet")?;
            let model = TIDNet::from_dataset(&dataset, targets, p)?;
            let model = train(model, &dataset, &args)?;
            if let Some(path) = &args.save {
                model.save(path)?;
            }
        }
    }
    Ok(())
}
