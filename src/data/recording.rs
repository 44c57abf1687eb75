use super::edf::{Annotation, read_edf};
use super::filter;
use super::{Dn3Dataset, Sfreq, Trial};
use crate::error::{Dn3Error, Result};
use crate::tensor::RawTensor;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Channel selection and signal processing applied to every loaded file.
#[derive(Clone, Debug)]
pub struct SignalPipeline {
    pub picks: Option<Vec<String>>,
    pub exclude_channels: Vec<glob::Pattern>,
    pub rename_channels: BTreeMap<String, String>,
    pub hpf: Option<f64>,
    pub lpf: Option<f64>,
    pub target_sfreq: Option<f64>,
    pub decimate: usize,
}

impl Default for SignalPipeline {
    fn default() -> Self {
        Self {
            picks: None,
            exclude_channels: Vec::new(),
            rename_channels: BTreeMap::new(),
            hpf: None,
            lpf: None,
            target_sfreq: None,
            decimate: 1,
        }
    }
}

/// Channel data after the pipeline ran.
#[derive(Clone, Debug)]
pub struct ProcessedSignal {
    pub channels: Vec<String>,
    pub sfreq: f64,
    pub data: Vec<Vec<f32>>,
    pub annotations: Vec<Annotation>,
}

impl ProcessedSignal {
    pub fn num_samples(&self) -> usize {
        self.data.first().map_or(0, Vec::len)
    }
}

impl SignalPipeline {
    /// Read `path` and apply picks, exclusions, renaming, filtering, resampling and decimation.
    pub fn load(&self, path: &Path) -> Result<ProcessedSignal> {
        let raw = read_edf(path)?;
        let mut channels = raw.channels;
        let mut data = raw.data;

        if let Some(picks) = &self.picks {
            let mut picked = Vec::with_capacity(picks.len());
            for pick in picks {
                let idx = channels.iter().position(|c| c == pick).ok_or_else(|| {
                    Dn3Error::invalid(
                        "picks",
                        format!("channel `{pick}` not found in {}", path.display()),
                    )
                })?;
                picked.push(idx);
            }
            channels = picked.iter().map(|&i| channels[i].clone()).collect();
            data = picked.iter().map(|&i| data[i].clone()).collect();
        }

        if !self.exclude_channels.is_empty() {
            let keep: Vec<bool> = channels
                .iter()
                .map(|c| !self.exclude_channels.iter().any(|p| p.matches(c)))
                .collect();
            channels = channels
                .into_iter()
                .zip(&keep)
                .filter_map(|(c, &k)| k.then_some(c))
                .collect();
            data = data
                .into_iter()
                .zip(&keep)
                .filter_map(|(d, &k)| k.then_some(d))
                .collect();
        }
        if channels.is_empty() {
            return Err(Dn3Error::signal(path, "no channels left after picks/exclusions"));
        }

        for name in &mut channels {
            if let Some(new_name) = self.rename_channels.get(name.as_str()) {
                *name = new_name.clone();
            }
        }

        let mut sfreq = raw.sfreq;
        if let Some(hpf) = self.hpf {
            filter::highpass(&mut data, sfreq, hpf);
        }
        if let Some(lpf) = self.lpf {
            filter::lowpass(&mut data, sfreq, lpf);
        }
        if let Some(target) = self.target_sfreq
            && (target - sfreq).abs() > f64::EPSILON
        {
            log::debug!("Resampling {} from {sfreq}Hz to {target}Hz", path.display());
            filter::resample(&mut data, sfreq, target);
            sfreq = target;
        }
        sfreq = filter::decimate(&mut data, sfreq, self.decimate);

        Ok(ProcessedSignal {
            channels,
            sfreq,
            data,
            annotations: raw.annotations,
        })
    }
}

/// Length of every trial, either fixed or derived from the sampling rate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SequenceLength {
    Samples(usize),
    Seconds(f64),
}

impl SequenceLength {
    pub fn at(self, sfreq: f64) -> usize {
        match self {
            SequenceLength::Samples(n) => n,
            SequenceLength::Seconds(tlen) => (tlen * sfreq).round() as usize,
        }
    }
}

/// How a continuous signal is cut into trials.
#[derive(Clone, Debug)]
pub enum Windowing {
    /// Sliding windows every `stride` samples, unlabeled.
    Raw { length: SequenceLength, stride: usize },
    /// One window per matching annotation, starting `tmin` seconds from its onset.
    Epoched {
        length: SequenceLength,
        tmin: f64,
        labels: BTreeMap<String, usize>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Window {
    start: usize,
    label: Option<usize>,
}

fn windows_for(signal: &ProcessedSignal, windowing: &Windowing) -> (usize, Vec<Window>) {
    let n = signal.num_samples();
    match windowing {
        Windowing::Raw { length, stride } => {
            let len = length.at(signal.sfreq);
            let stride = (*stride).max(1);
            if len == 0 || n < len {
                return (len, Vec::new());
            }
            let count = (n - len) / stride + 1;
            let windows = (0..count)
                .map(|i| Window {
                    start: i * stride,
                    label: None,
                })
                .collect();
            (len, windows)
        }
        Windowing::Epoched {
            length,
            tmin,
            labels,
        } => {
            let len = length.at(signal.sfreq);
            let windows = signal
                .annotations
                .iter()
                .filter_map(|a| {
                    let label = *labels.get(&a.description)?;
                    let start = ((a.onset + tmin) * signal.sfreq).round();
                    if start < 0.0 || start as usize + len > n {
                        log::debug!(
                            "Dropping `{}` at {}s: window leaves the recording",
                            a.description,
                            a.onset
                        );
                        return None;
                    }
                    Some(Window {
                        start: start as usize,
                        label: Some(label),
                    })
                })
                .collect();
            (len, windows)
        }
    }
}

enum SignalSource {
    Preloaded(Vec<Vec<f32>>),
    OnTheFly(Rc<SignalPipeline>),
}

/// One session of one thinker, cut into trials.
pub struct Recording {
    pub session: String,
    path: PathBuf,
    channels: Vec<String>,
    sfreq: f64,
    sequence_length: usize,
    windows: Vec<Window>,
    source: SignalSource,
}

impl Recording {
    /// Load `path` through `pipeline` and window it; on-the-fly recordings drop
    /// their samples and re-read the file on every access.
    pub fn load(
        session: impl Into<String>,
        path: impl Into<PathBuf>,
        pipeline: &Rc<SignalPipeline>,
        windowing: &Windowing,
        on_the_fly: bool,
    ) -> Result<Self> {
        let path = path.into();
        let signal = pipeline.load(&path)?;
        let (sequence_length, windows) = windows_for(&signal, windowing);
        let source = if on_the_fly {
            SignalSource::OnTheFly(Rc::clone(pipeline))
        } else {
            SignalSource::Preloaded(signal.data)
        };
        Ok(Recording {
            session: session.into(),
            path,
            channels: signal.channels,
            sfreq: signal.sfreq,
            sequence_length,
            windows,
            source,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_on_the_fly(&self) -> bool {
        matches!(self.source, SignalSource::OnTheFly(_))
    }

    pub fn sfreq_hz(&self) -> f64 {
        self.sfreq
    }

    /// Labels of every trial, in order.
    pub fn labels(&self) -> Vec<Option<usize>> {
        self.windows.iter().map(|w| w.label).collect()
    }

    fn slice(&self, data: &[Vec<f32>], window: Window) -> Trial {
        let len = self.sequence_length;
        let mut x = Vec::with_capacity(data.len() * len);
        for row in data {
            x.extend_from_slice(&row[window.start..window.start + len]);
        }
        Trial {
            x: RawTensor::new(x, &[data.len(), len], false),
            y: window.label,
        }
    }
}

impl Dn3Dataset for Recording {
    fn len(&self) -> usize {
        self.windows.len()
    }

    fn get(&self, index: usize) -> Result<Trial> {
        let window = *self.windows.get(index).ok_or(Dn3Error::IndexOutOfRange {
            index,
            len: self.windows.len(),
        })?;
        match &self.source {
            SignalSource::Preloaded(data) => Ok(self.slice(data, window)),
            SignalSource::OnTheFly(pipeline) => {
                let signal = pipeline.load(&self.path)?;
                if signal.num_samples() < window.start + self.sequence_length {
                    return Err(Dn3Error::signal(&self.path, "file changed since it was indexed"));
                }
                Ok(self.slice(&signal.data, window))
            }
        }
    }

    fn channels(&self) -> &[String] {
        &self.channels
    }

    fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    fn sfreq(&self) -> Sfreq {
        Sfreq::Uniform(self.sfreq)
    }
}
