mod common;

use common::{ALT_SFREQ, RUNS, SECONDS, SFREQ};
use dn3::data::DataLoader;
use dn3::{Dn3Dataset, ExperimentConfig, Sfreq, TensorOps};
use std::path::Path;

const NUM_SUBJECTS: usize = 6;
const ALT_SUBJECTS: usize = 2;

const EXPERIMENT: &str = "
Configuratron:
  preload: true

datasets:
  mmidb_minimally_specified_raw:
    toplevel: mmidb
    tlen: 1.5
    stride: 40
  mmidb_minimally_specified_epoch:
    toplevel: mmidb
    tmin: 0
    tlen: 1
  mmidb_fully_specified:
    toplevel: mmidb
    tmin: -0.25
    tlen: 1
    events: {T1: 0, T2: 1}
    exclude_people: [S005, S006]
    decimate: 2
  mmidb_formatted:
    toplevel: mmidb
    filename_format: S{subject}R{session}
    exclude_sessions: ['02']
    samples: 64
    stride: 64
";

fn experiment(dir: &Path) -> ExperimentConfig {
    common::init_logging();
    common::write_mmidb(&dir.join("mmidb"), NUM_SUBJECTS, ALT_SUBJECTS);
    ExperimentConfig::from_str_with_root(EXPERIMENT, dir).unwrap()
}

#[test]
fn minimally_specified_raw_construct() {
    let dir = tempfile::tempdir().unwrap();
    let config = experiment(dir.path());
    let dataset = config
        .dataset("mmidb_minimally_specified_raw")
        .unwrap()
        .auto_construct_dataset()
        .unwrap();
    assert_eq!(dataset.get_thinkers().len(), NUM_SUBJECTS);
    assert_eq!(dataset.channels().len(), common::CHANNELS.len());

    let windows = |sfreq: usize| {
        let len = (1.5 * sfreq as f64).round() as usize;
        (sfreq * SECONDS - len) / 40 + 1
    };
    let per_thinker = dataset.trials_per_thinker();
    assert_eq!(per_thinker["S001"], RUNS * windows(SFREQ));
    assert_eq!(per_thinker["S006"], RUNS * windows(ALT_SFREQ));
    assert!(dataset.get(0).unwrap().y.is_none());
}

#[test]
fn minimally_specified_epoch_construct() {
    let dir = tempfile::tempdir().unwrap();
    let config = experiment(dir.path());
    let dataset = config
        .dataset("mmidb_minimally_specified_epoch")
        .unwrap()
        .auto_construct_dataset()
        .unwrap();
    assert_eq!(dataset.get_thinkers().len(), NUM_SUBJECTS);
    assert_eq!(
        dataset.sfreq(),
        Sfreq::Mixed(vec![ALT_SFREQ as f64, SFREQ as f64])
    );
    // every cue fits, labels come from the sorted event names
    let cues = common::cues(SECONDS).len();
    assert_eq!(dataset.len(), NUM_SUBJECTS * RUNS * cues);
    let labels: Vec<usize> = (0..3).map(|i| dataset.get(i).unwrap().y.unwrap()).collect();
    assert_eq!(labels, vec![0, 1, 2]);
}

#[test]
fn fully_specified_construct() {
    let dir = tempfile::tempdir().unwrap();
    let config = experiment(dir.path());
    let fully = config.dataset("mmidb_fully_specified").unwrap();
    let dataset = fully.auto_construct_dataset().unwrap();
    // exclusion removed exactly the named thinkers
    assert_eq!(dataset.get_thinkers().len(), NUM_SUBJECTS - 2);
    assert!(dataset.thinker("S005").is_none());
    // after exclusion a single, decimated rate remains
    assert_eq!(
        dataset.sfreq(),
        Sfreq::Uniform(SFREQ as f64 / fully.decimate as f64)
    );
    assert_eq!(dataset.sequence_length(), 80);

    let trial = dataset.get(0).unwrap();
    assert_eq!(trial.x.shape(), vec![common::CHANNELS.len(), 80]);
    // T0 cues are not requested: T1, T2 alternate with a T0 between each pair
    let labels: Vec<usize> = (0..4).map(|i| dataset.get(i).unwrap().y.unwrap()).collect();
    assert_eq!(labels, vec![0, 1, 0, 1]);
}

#[test]
fn filename_format_and_session_exclusion() {
    let dir = tempfile::tempdir().unwrap();
    let config = experiment(dir.path());
    let dataset = config
        .dataset("mmidb_formatted")
        .unwrap()
        .auto_construct_dataset()
        .unwrap();
    assert_eq!(
        dataset.get_thinkers(),
        vec!["001", "002", "003", "004", "005", "006"]
    );
    let thinker = dataset.thinker("001").unwrap();
    assert_eq!(thinker.sessions().len(), 1);
    assert_eq!(thinker.sessions()[0].session, "01");
    assert_eq!(thinker.len(), SFREQ * SECONDS / 64);
}

#[test]
fn on_the_fly_raw_matches_preloaded() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = experiment(dir.path());
    let name = "mmidb_minimally_specified_raw";
    let preload = config.dataset(name).unwrap().auto_construct_dataset().unwrap();

    let entry = config.dataset_mut(name).unwrap();
    entry.set_on_the_fly(true);
    let on_the_fly = entry.auto_construct_dataset().unwrap();
    assert_eq!(preload.len(), on_the_fly.len());

    let step = preload.len() / 40;
    for round in 0..2 {
        for i in (round..preload.len()).step_by(step) {
            assert_eq!(
                preload.get(i).unwrap().x.to_vec(),
                on_the_fly.get(i).unwrap().x.to_vec(),
                "trial {i} differs"
            );
        }
    }
}

#[test]
fn loader_batches_uniform_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let config = experiment(dir.path());
    let dataset = config
        .dataset("mmidb_fully_specified")
        .unwrap()
        .auto_construct_dataset()
        .unwrap();
    let loader = DataLoader::new(&dataset, 8).shuffle(true).drop_last(true);
    let mut batches = 0;
    for batch in loader.iter() {
        let batch = batch.unwrap();
        assert_eq!(batch.x.shape(), vec![8, common::CHANNELS.len(), 80]);
        assert_eq!(batch.y.unwrap().len(), 8);
        batches += 1;
    }
    assert_eq!(batches, dataset.len() / 8);
}
