use super::recording::Recording;
use crate::error::{Dn3Error, Result};
use crate::tensor::Tensor;
use std::collections::BTreeMap;

/// One example: `x` is `[channels, samples]`, `y` the class index when labelled.
#[derive(Clone, Debug)]
pub struct Trial {
    pub x: Tensor,
    pub y: Option<usize>,
}

/// Sampling frequency of a collection of recordings.
#[derive(Clone, Debug, PartialEq)]
pub enum Sfreq {
    Uniform(f64),
    /// Sorted distinct rates
    Mixed(Vec<f64>),
}

impl Sfreq {
    pub fn from_rates(rates: impl IntoIterator<Item = f64>) -> Option<Self> {
        let mut rates: Vec<f64> = rates.into_iter().collect();
        rates.sort_by(f64::total_cmp);
        rates.dedup_by(|a, b| (*a - *b).abs() < 1e-9);
        match rates.len() {
            0 => None,
            1 => Some(Sfreq::Uniform(rates[0])),
            _ => Some(Sfreq::Mixed(rates)),
        }
    }

    pub fn uniform(&self) -> Option<f64> {
        match self {
            Sfreq::Uniform(f) => Some(*f),
            Sfreq::Mixed(_) => None,
        }
    }

    pub fn rates(&self) -> Vec<f64> {
        match self {
            Sfreq::Uniform(f) => vec![*f],
            Sfreq::Mixed(rates) => rates.clone(),
        }
    }
}

/// Anything that can be indexed for trials: recordings, thinkers and datasets.
pub trait Dn3Dataset {
    fn len(&self) -> usize;
    fn get(&self, index: usize) -> Result<Trial>;
    fn channels(&self) -> &[String];
    fn sequence_length(&self) -> usize;
    fn sfreq(&self) -> Sfreq;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Locate `index` among concatenated parts given their cumulative end offsets.
fn locate(ends: &[usize], index: usize) -> Result<(usize, usize)> {
    let len = ends.last().copied().unwrap_or(0);
    if index >= len {
        return Err(Dn3Error::IndexOutOfRange { index, len });
    }
    let part = ends.partition_point(|&end| end <= index);
    let start = if part == 0 { 0 } else { ends[part - 1] };
    Ok((part, index - start))
}

fn cumulative(lengths: impl Iterator<Item = usize>) -> Vec<usize> {
    lengths
        .scan(0, |total, n| {
            *total += n;
            Some(*total)
        })
        .collect()
}

/// A single subject: an ordered set of sessions.
pub struct Thinker {
    pub id: String,
    sessions: Vec<Recording>,
    ends: Vec<usize>,
}

impl Thinker {
    pub fn new(id: impl Into<String>, mut sessions: Vec<Recording>) -> Self {
        sessions.sort_by(|a, b| a.session.cmp(&b.session));
        let ends = cumulative(sessions.iter().map(Dn3Dataset::len));
        Thinker {
            id: id.into(),
            sessions,
            ends,
        }
    }

    pub fn sessions(&self) -> &[Recording] {
        &self.sessions
    }

    pub fn session(&self, name: &str) -> Option<&Recording> {
        self.sessions.iter().find(|s| s.session == name)
    }
}

impl Dn3Dataset for Thinker {
    fn len(&self) -> usize {
        self.ends.last().copied().unwrap_or(0)
    }

    fn get(&self, index: usize) -> Result<Trial> {
        let (session, offset) = locate(&self.ends, index)?;
        self.sessions[session].get(offset)
    }

    fn channels(&self) -> &[String] {
        self.sessions.first().map(|s| s.channels()).unwrap_or(&[])
    }

    fn sequence_length(&self) -> usize {
        self.sessions.first().map_or(0, Dn3Dataset::sequence_length)
    }

    fn sfreq(&self) -> Sfreq {
        Sfreq::from_rates(self.sessions.iter().map(Recording::sfreq_hz))
            .unwrap_or(Sfreq::Mixed(Vec::new()))
    }
}

/// An ordered set of thinkers sharing a channel layout.
pub struct Dataset {
    pub name: String,
    thinkers: Vec<Thinker>,
    ends: Vec<usize>,
}

impl Dataset {
    /// # Errors
    /// Thinkers whose recordings disagree on the channel count.
    pub fn new(name: impl Into<String>, mut thinkers: Vec<Thinker>) -> Result<Self> {
        let name = name.into();
        thinkers.sort_by(|a, b| a.id.cmp(&b.id));

        let mut reference: Option<(&str, &[String])> = None;
        for thinker in &thinkers {
            for session in thinker.sessions() {
                let channels = session.channels();
                match reference {
                    None => reference = Some((thinker.id.as_str(), channels)),
                    Some((_, expected)) if expected.len() != channels.len() => {
                        return Err(Dn3Error::invalid(
                            "channels",
                            format!(
                                "{name}: {}/{} has {} channels, expected {}",
                                thinker.id,
                                session.session,
                                channels.len(),
                                expected.len()
                            ),
                        ));
                    }
                    Some((first, expected)) if expected != channels => {
                        log::warn!(
                            "{name}: channel names of {} differ from {first}",
                            thinker.id
                        );
                    }
                    Some(_) => {}
                }
            }
        }

        let ends = cumulative(thinkers.iter().map(Dn3Dataset::len));
        Ok(Dataset {
            name,
            thinkers,
            ends,
        })
    }

    /// Thinker ids in order.
    pub fn get_thinkers(&self) -> Vec<&str> {
        self.thinkers.iter().map(|t| t.id.as_str()).collect()
    }

    pub fn thinker(&self, id: &str) -> Option<&Thinker> {
        self.thinkers.iter().find(|t| t.id == id)
    }

    pub fn thinkers(&self) -> &[Thinker] {
        &self.thinkers
    }

    pub fn trials_per_thinker(&self) -> BTreeMap<String, usize> {
        self.thinkers
            .iter()
            .map(|t| (t.id.clone(), t.len()))
            .collect()
    }
}

impl Dn3Dataset for Dataset {
    fn len(&self) -> usize {
        self.ends.last().copied().unwrap_or(0)
    }

    fn get(&self, index: usize) -> Result<Trial> {
        let (thinker, offset) = locate(&self.ends, index)?;
        self.thinkers[thinker].get(offset)
    }

    fn channels(&self) -> &[String] {
        self.thinkers.first().map(|t| t.channels()).unwrap_or(&[])
    }

    fn sequence_length(&self) -> usize {
        self.thinkers.first().map_or(0, Dn3Dataset::sequence_length)
    }

    fn sfreq(&self) -> Sfreq {
        Sfreq::from_rates(self.thinkers.iter().flat_map(|t| t.sfreq().rates()))
            .unwrap_or(Sfreq::Mixed(Vec::new()))
    }
}
