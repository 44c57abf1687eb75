use super::discovery::{FilenameFormat, find_recordings, group_thinkers, identify_sessions};
use super::include::{load_document, resolve_value};
use crate::data::edf::read_edf;
use crate::data::{
    Dataset, Dn3Dataset, Recording, SequenceLength, SignalPipeline, Thinker, Windowing,
};
use crate::error::{Dn3Error, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;

const SETTINGS_KEY: &str = "Configuratron";
const DATASETS_KEY: &str = "datasets";

/// The `Configuratron` section: experiment-wide defaults.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConfiguratronSettings {
    /// Only build these datasets, in this order.
    pub use_only: Option<Vec<String>>,
    pub preload: Option<bool>,
    /// Resample every recording to this rate.
    pub sfreq: Option<f64>,
    pub samples: Option<usize>,
    /// Prefix for relative `toplevel` paths.
    pub relative_directory: Option<PathBuf>,
}

/// A parsed experiment: dataset configurations plus free-form auxiliaries.
#[derive(Clone, Debug)]
pub struct ExperimentConfig {
    pub settings: ConfiguratronSettings,
    datasets: Vec<DatasetConfig>,
    auxiliaries: BTreeMap<String, Value>,
}

impl ExperimentConfig {
    /// Load the YAML document at `path`, resolving includes relative to its directory.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let document = load_document(path)?;
        let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::from_document(document, &root)
    }

    /// Parse YAML text whose includes and relative paths are resolved against `root`.
    pub fn from_str_with_root(text: &str, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let document = resolve_value(serde_yaml::from_str(text)?, root)?;
        Self::from_document(document, root)
    }

    fn from_document(document: Value, root: &Path) -> Result<Self> {
        let Value::Mapping(mut document) = document else {
            return Err(Dn3Error::invalid(
                "experiment",
                "top level of an experiment must be a mapping",
            ));
        };

        let settings = match document.remove(SETTINGS_KEY) {
            None => {
                return Err(Dn3Error::MissingField {
                    context: "experiment".into(),
                    field: SETTINGS_KEY.into(),
                });
            }
            Some(Value::Null) => ConfiguratronSettings::default(),
            Some(value) => serde_yaml::from_value(value)?,
        };

        let declared = match document.remove(DATASETS_KEY) {
            Some(Value::Mapping(entries)) => entries
                .into_iter()
                .map(|(key, value)| Ok((key_name(&key)?, value)))
                .collect::<Result<Vec<_>>>()?,
            Some(Value::Sequence(entries)) => entries
                .into_iter()
                .enumerate()
                .map(|(i, value)| (i.to_string(), value))
                .collect(),
            Some(other) => {
                return Err(Dn3Error::invalid(
                    DATASETS_KEY,
                    format!("expected a mapping or list, found {other:?}"),
                ));
            }
            None => {
                return Err(Dn3Error::MissingField {
                    context: "experiment".into(),
                    field: DATASETS_KEY.into(),
                });
            }
        };

        let selected = match &settings.use_only {
            None => declared,
            Some(names) => {
                let mut by_name: BTreeMap<String, Value> = declared.into_iter().collect();
                names
                    .iter()
                    .map(|name| {
                        by_name
                            .remove(name)
                            .map(|value| (name.clone(), value))
                            .ok_or_else(|| Dn3Error::UnknownDataset(name.clone()))
                    })
                    .collect::<Result<Vec<_>>>()?
            }
        };

        let datasets = selected
            .into_iter()
            .map(|(name, value)| DatasetConfig::from_value(&name, value, &settings, root))
            .collect::<Result<Vec<_>>>()?;
        log::info!("Configuratron found {} datasets", datasets.len());

        let auxiliaries = document
            .into_iter()
            .map(|(key, value)| Ok((key_name(&key)?, value)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(ExperimentConfig {
            settings,
            datasets,
            auxiliaries,
        })
    }

    pub fn datasets(&self) -> &[DatasetConfig] {
        &self.datasets
    }

    pub fn datasets_mut(&mut self) -> &mut [DatasetConfig] {
        &mut self.datasets
    }

    pub fn dataset_names(&self) -> Vec<&str> {
        self.datasets.iter().map(|d| d.key.as_str()).collect()
    }

    pub fn dataset(&self, name: &str) -> Result<&DatasetConfig> {
        self.datasets
            .iter()
            .find(|d| d.key == name)
            .ok_or_else(|| Dn3Error::UnknownDataset(name.to_string()))
    }

    pub fn dataset_mut(&mut self, name: &str) -> Result<&mut DatasetConfig> {
        self.datasets
            .iter_mut()
            .find(|d| d.key == name)
            .ok_or_else(|| Dn3Error::UnknownDataset(name.to_string()))
    }

    pub fn has_auxiliary(&self, name: &str) -> bool {
        self.auxiliaries.contains_key(name)
    }

    pub fn auxiliary(&self, name: &str) -> Result<&Value> {
        self.auxiliaries
            .get(name)
            .ok_or_else(|| Dn3Error::UnknownAuxiliary(name.to_string()))
    }

    /// Deserialize an auxiliary into a typed record.
    pub fn auxiliary_as<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        Ok(serde_yaml::from_value(self.auxiliary(name)?.clone())?)
    }

    pub fn auxiliaries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.auxiliaries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

fn key_name(key: &Value) -> Result<String> {
    match key {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(Dn3Error::invalid("key", format!("unsupported key {other:?}"))),
    }
}

/// Fields a dataset entry may declare; everything else becomes an auxiliary.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DatasetFields {
    name: Option<String>,
    toplevel: Option<PathBuf>,
    tmin: Option<f64>,
    tlen: Option<f64>,
    samples: Option<usize>,
    sfreq: Option<f64>,
    decimate: Option<usize>,
    stride: Option<usize>,
    events: Option<Value>,
    exclude_people: Vec<String>,
    exclude_sessions: Vec<String>,
    file_extensions: Option<Vec<String>>,
    filename_format: Option<String>,
    picks: Option<Vec<String>>,
    exclude_channels: Vec<String>,
    rename_channels: BTreeMap<String, String>,
    hpf: Option<f64>,
    lpf: Option<f64>,
    load_onthefly: Option<bool>,
    preload: Option<bool>,
}

const DATASET_FIELDS: &[&str] = &[
    "name",
    "toplevel",
    "tmin",
    "tlen",
    "samples",
    "sfreq",
    "decimate",
    "stride",
    "events",
    "exclude_people",
    "exclude_sessions",
    "file_extensions",
    "filename_format",
    "picks",
    "exclude_channels",
    "rename_channels",
    "hpf",
    "lpf",
    "load_onthefly",
    "preload",
];

/// How epoch annotations map to class labels.
#[derive(Clone, Debug, PartialEq)]
pub enum EventLabels {
    /// Every annotation found, labelled by sorted description.
    All,
    Mapped(BTreeMap<String, usize>),
}

fn scalar_name(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(Dn3Error::invalid(
            "events",
            format!("event names must be strings or numbers, found {other:?}"),
        )),
    }
}

fn parse_events(events: Option<Value>) -> Result<EventLabels> {
    match events {
        None | Some(Value::Null) => Ok(EventLabels::All),
        Some(Value::Sequence(names)) => names
            .iter()
            .enumerate()
            .map(|(label, name)| Ok((scalar_name(name)?, label)))
            .collect::<Result<_>>()
            .map(EventLabels::Mapped),
        Some(Value::Mapping(pairs)) => pairs
            .iter()
            .map(|(name, label)| {
                let label = label.as_u64().ok_or_else(|| {
                    Dn3Error::invalid("events", format!("label for {name:?} must be an index"))
                })?;
                Ok((scalar_name(name)?, label as usize))
            })
            .collect::<Result<_>>()
            .map(EventLabels::Mapped),
        Some(other) => Err(Dn3Error::invalid(
            "events",
            format!("expected a list or mapping, found {other:?}"),
        )),
    }
}

/// One dataset entry with experiment defaults applied.
#[derive(Clone, Debug)]
pub struct DatasetConfig {
    /// Key under `datasets`.
    pub key: String,
    pub name: String,
    pub toplevel: PathBuf,
    pub tmin: Option<f64>,
    pub tlen: Option<f64>,
    pub samples: Option<usize>,
    pub sfreq: Option<f64>,
    pub decimate: usize,
    pub stride: usize,
    pub events: EventLabels,
    pub exclude_people: Vec<String>,
    pub exclude_sessions: Vec<String>,
    pub file_extensions: Vec<String>,
    pub filename_format: Option<String>,
    pub picks: Option<Vec<String>>,
    pub exclude_channels: Vec<String>,
    pub rename_channels: BTreeMap<String, String>,
    pub hpf: Option<f64>,
    pub lpf: Option<f64>,
    on_the_fly: bool,
    auxiliaries: BTreeMap<String, Value>,
}

impl DatasetConfig {
    /// Build a dataset entry from its resolved YAML value.
    ///
    /// `root` anchors relative `toplevel` paths, after any `relative_directory` prefix.
    pub fn from_value(
        key: &str,
        value: Value,
        defaults: &ConfiguratronSettings,
        root: &Path,
    ) -> Result<Self> {
        let Value::Mapping(mapping) = value else {
            return Err(Dn3Error::invalid(
                key,
                "a dataset entry must be a mapping",
            ));
        };
        let (known, extra): (Mapping, Mapping) = mapping
            .into_iter()
            .partition(|(k, _)| k.as_str().is_some_and(|k| DATASET_FIELDS.contains(&k)));
        let fields: DatasetFields = serde_yaml::from_value(Value::Mapping(known))?;
        let auxiliaries = extra
            .into_iter()
            .map(|(k, v)| Ok((key_name(&k)?, v)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        let toplevel = fields.toplevel.ok_or_else(|| Dn3Error::MissingField {
            context: format!("dataset `{key}`"),
            field: "toplevel".into(),
        })?;
        let toplevel = if toplevel.is_absolute() {
            toplevel
        } else {
            match &defaults.relative_directory {
                Some(prefix) => root.join(prefix).join(toplevel),
                None => root.join(toplevel),
            }
        };

        let decimate = fields.decimate.unwrap_or(1);
        if decimate == 0 {
            return Err(Dn3Error::invalid("decimate", "must be at least 1"));
        }
        let stride = fields.stride.unwrap_or(1);
        if stride == 0 {
            return Err(Dn3Error::invalid("stride", "must be at least 1"));
        }
        if fields.samples == Some(0) {
            return Err(Dn3Error::invalid("samples", "must be at least 1"));
        }
        if let Some(tlen) = fields.tlen
            && !(tlen > 0.0)
        {
            return Err(Dn3Error::invalid("tlen", format!("must be positive, got {tlen}")));
        }
        // The dataset's own length wins; the global sample count only fills a gap.
        let samples = match (fields.samples, fields.tlen) {
            (Some(samples), _) => Some(samples),
            (None, Some(_)) => None,
            (None, None) => defaults.samples,
        };
        if samples == Some(0) {
            return Err(Dn3Error::invalid("Configuratron.samples", "must be at least 1"));
        }
        if samples.is_none() && fields.tlen.is_none() {
            return Err(Dn3Error::MissingField {
                context: format!("dataset `{key}`"),
                field: "tlen or samples".into(),
            });
        }
        let on_the_fly = fields
            .load_onthefly
            .or(fields.preload.or(defaults.preload).map(|preload| !preload))
            .unwrap_or(false);

        Ok(DatasetConfig {
            key: key.to_string(),
            name: fields.name.unwrap_or_else(|| key.to_string()),
            toplevel,
            tmin: fields.tmin,
            tlen: fields.tlen,
            samples,
            sfreq: fields.sfreq.or(defaults.sfreq),
            decimate,
            stride,
            events: parse_events(fields.events)?,
            exclude_people: fields.exclude_people,
            exclude_sessions: fields.exclude_sessions,
            file_extensions: fields
                .file_extensions
                .unwrap_or_else(|| vec![".edf".into(), ".bdf".into()]),
            filename_format: fields.filename_format,
            picks: fields.picks,
            exclude_channels: fields.exclude_channels,
            rename_channels: fields.rename_channels,
            hpf: fields.hpf,
            lpf: fields.lpf,
            on_the_fly,
            auxiliaries,
        })
    }

    pub fn on_the_fly(&self) -> bool {
        self.on_the_fly
    }

    /// Switch between preloaded and on-the-fly recordings for the next construction.
    pub fn set_on_the_fly(&mut self, on_the_fly: bool) {
        self.on_the_fly = on_the_fly;
    }

    pub fn is_epoched(&self) -> bool {
        self.tmin.is_some()
    }

    pub fn has_auxiliary(&self, name: &str) -> bool {
        self.auxiliaries.contains_key(name)
    }

    pub fn auxiliary(&self, name: &str) -> Result<&Value> {
        self.auxiliaries
            .get(name)
            .ok_or_else(|| Dn3Error::UnknownAuxiliary(name.to_string()))
    }

    pub fn auxiliary_as<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        Ok(serde_yaml::from_value(self.auxiliary(name)?.clone())?)
    }

    fn sequence_length(&self) -> SequenceLength {
        match (self.samples, self.tlen) {
            (Some(samples), _) => SequenceLength::Samples(samples),
            (None, Some(tlen)) => SequenceLength::Seconds(tlen),
            // from_value rejects entries with neither
            (None, None) => SequenceLength::Samples(0),
        }
    }

    fn pipeline(&self) -> Result<SignalPipeline> {
        Ok(SignalPipeline {
            picks: self.picks.clone(),
            exclude_channels: compile_patterns(&self.exclude_channels)?,
            rename_channels: self.rename_channels.clone(),
            hpf: self.hpf,
            lpf: self.lpf,
            target_sfreq: self.sfreq,
            decimate: self.decimate,
        })
    }

    fn windowing(&self, files: &[PathBuf]) -> Result<Windowing> {
        let length = self.sequence_length();
        let Some(tmin) = self.tmin else {
            return Ok(Windowing::Raw {
                length,
                stride: self.stride,
            });
        };
        let labels = match &self.events {
            EventLabels::Mapped(labels) => labels.clone(),
            EventLabels::All => {
                let mut descriptions = BTreeSet::new();
                for file in files {
                    descriptions.extend(read_edf(file)?.annotations.into_iter().map(|a| a.description));
                }
                log::info!(
                    "{}: labelling {} event types found in annotations",
                    self.name,
                    descriptions.len()
                );
                descriptions
                    .into_iter()
                    .enumerate()
                    .map(|(label, description)| (description, label))
                    .collect()
            }
        };
        Ok(Windowing::Epoched {
            length,
            tmin,
            labels,
        })
    }

    /// Discover, load and window every recording under `toplevel`.
    pub fn auto_construct_dataset(&self) -> Result<Dataset> {
        let format = self
            .filename_format
            .as_deref()
            .map(FilenameFormat::parse)
            .transpose()?;
        let files = find_recordings(&self.toplevel, &self.file_extensions)?;
        let sessions = identify_sessions(files, format.as_ref());
        let excluded_people = compile_patterns(&self.exclude_people)?;
        let excluded_sessions = compile_patterns(&self.exclude_sessions)?;
        let grouped = group_thinkers(sessions, &excluded_people, &excluded_sessions);
        if grouped.is_empty() {
            return Err(Dn3Error::NoRecordings(self.toplevel.clone()));
        }

        let paths: Vec<PathBuf> = grouped.values().flatten().map(|f| f.path.clone()).collect();
        let windowing = self.windowing(&paths)?;
        let pipeline = Rc::new(self.pipeline()?);

        let mut thinkers = Vec::with_capacity(grouped.len());
        for (id, files) in grouped {
            let mut sessions = Vec::with_capacity(files.len());
            for file in files {
                let recording =
                    Recording::load(file.session, &file.path, &pipeline, &windowing, self.on_the_fly)?;
                if recording.is_empty() {
                    log::warn!("{} yields no trials", file.path.display());
                }
                sessions.push(recording);
            }
            thinkers.push(Thinker::new(id, sessions));
        }

        let dataset = Dataset::new(self.name.clone(), thinkers)?;
        log::info!(
            "Constructed {}: {} thinkers, {} trials of {} samples at {:?}",
            self.name,
            dataset.get_thinkers().len(),
            dataset.len(),
            dataset.sequence_length(),
            dataset.sfreq()
        );
        Ok(dataset)
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<glob::Pattern>> {
    patterns
        .iter()
        .map(|p| glob::Pattern::new(p).map_err(Dn3Error::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "
Configuratron:
  sfreq: 128
datasets:
  first:
    toplevel: data/first
    tlen: 2.5
  second:
    name: Second one
    toplevel: /abs/second
    samples: 256
    tmin: -0.5
    events: [T1, T2]
    extra_setting: 7
another_extra: hello
";

    #[test]
    fn datasets_and_auxiliaries_are_separated() {
        let config = ExperimentConfig::from_str_with_root(MINIMAL, "/root/exp").unwrap();
        assert_eq!(config.datasets().len(), 2);
        assert_eq!(config.dataset_names(), vec!["first", "second"]);
        assert!(config.has_auxiliary("another_extra"));
        assert!(!config.has_auxiliary("datasets"));
        assert_eq!(config.auxiliary_as::<String>("another_extra").unwrap(), "hello");
        assert!(matches!(
            config.auxiliary("missing"),
            Err(Dn3Error::UnknownAuxiliary(_))
        ));

        let first = config.dataset("first").unwrap();
        assert_eq!(first.toplevel, PathBuf::from("/root/exp/data/first"));
        assert_eq!(first.sfreq, Some(128.0));
        assert_eq!(first.decimate, 1);
        assert!(!first.is_epoched());

        let second = config.dataset("second").unwrap();
        assert_eq!(second.name, "Second one");
        assert_eq!(second.toplevel, PathBuf::from("/abs/second"));
        assert_eq!(
            second.events,
            EventLabels::Mapped(BTreeMap::from([("T1".into(), 0), ("T2".into(), 1)]))
        );
        assert_eq!(second.auxiliary_as::<u32>("extra_setting").unwrap(), 7);
        assert!(matches!(
            config.dataset("third"),
            Err(Dn3Error::UnknownDataset(_))
        ));
    }

    #[test]
    fn use_only_selects_and_orders() {
        let text = MINIMAL.replace("  sfreq: 128", "  use_only: [second]");
        let config = ExperimentConfig::from_str_with_root(&text, "/").unwrap();
        assert_eq!(config.dataset_names(), vec!["second"]);

        let text = MINIMAL.replace("  sfreq: 128", "  use_only: [nope]");
        assert!(matches!(
            ExperimentConfig::from_str_with_root(&text, "/"),
            Err(Dn3Error::UnknownDataset(_))
        ));
    }

    #[test]
    fn required_fields_fail_fast() {
        let no_settings = "datasets:\n  a:\n    toplevel: x\n    tlen: 1\n";
        assert!(matches!(
            ExperimentConfig::from_str_with_root(no_settings, "/"),
            Err(Dn3Error::MissingField { .. })
        ));
        let no_toplevel = "Configuratron:\ndatasets:\n  a:\n    tlen: 1\n";
        assert!(matches!(
            ExperimentConfig::from_str_with_root(no_toplevel, "/"),
            Err(Dn3Error::MissingField { field, .. }) if field == "toplevel"
        ));
        let no_length = "Configuratron:\ndatasets:\n  a:\n    toplevel: x\n";
        assert!(ExperimentConfig::from_str_with_root(no_length, "/").is_err());
    }

    #[test]
    fn event_mappings_and_preload_defaults() {
        let text = "
Configuratron:
  preload: false
  samples: 100
datasets:
  - toplevel: a
    tmin: 0
    events: {left: 1, right: 0}
  - toplevel: b
    load_onthefly: false
";
        let config = ExperimentConfig::from_str_with_root(text, "/data").unwrap();
        let first = config.dataset("0").unwrap();
        assert_eq!(
            first.events,
            EventLabels::Mapped(BTreeMap::from([("left".into(), 1), ("right".into(), 0)]))
        );
        assert!(first.on_the_fly());
        assert_eq!(first.samples, Some(100));
        assert!(!config.dataset("1").unwrap().on_the_fly());
    }

    #[test]
    fn dataset_length_takes_precedence_over_global_samples() {
        let text = "
Configuratron:
  samples: 100
datasets:
  own_samples:
    toplevel: a
    samples: 64
    tlen: 1.5
  own_tlen:
    toplevel: b
    tlen: 1.5
  neither:
    toplevel: c
";
        let config = ExperimentConfig::from_str_with_root(text, "/data").unwrap();
        let own_samples = config.dataset("own_samples").unwrap();
        assert_eq!(own_samples.sequence_length(), SequenceLength::Samples(64));
        let own_tlen = config.dataset("own_tlen").unwrap();
        assert_eq!(own_tlen.samples, None);
        assert_eq!(own_tlen.sequence_length(), SequenceLength::Seconds(1.5));
        let neither = config.dataset("neither").unwrap();
        assert_eq!(neither.sequence_length(), SequenceLength::Samples(100));
    }

    #[test]
    fn non_positive_lengths_are_rejected() {
        for entry in ["tlen: 0", "tlen: -2.5", "samples: 0"] {
            let text = format!("Configuratron:\ndatasets:\n  a:\n    toplevel: x\n    {entry}\n");
            assert!(
                matches!(
                    ExperimentConfig::from_str_with_root(&text, "/"),
                    Err(Dn3Error::InvalidConfig { .. })
                ),
                "{entry} was accepted"
            );
        }
        let global = "Configuratron:\n  samples: 0\ndatasets:\n  a:\n    toplevel: x\n";
        assert!(matches!(
            ExperimentConfig::from_str_with_root(global, "/"),
            Err(Dn3Error::InvalidConfig { .. })
        ));
    }
}
