//! EDF, EDF+ and BDF signal files.
//!
//! Only the parts needed to build datasets are supported: continuous data
//! records, per-channel physical scaling and EDF+ annotations. Every data
//! channel must share one sampling rate.

use crate::error::{Dn3Error, Result};
use std::fs;
use std::path::Path;

const ANNOTATION_LABEL: &str = "EDF Annotations";
const BDF_ANNOTATION_LABEL: &str = "BDF Annotations";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdfFormat {
    /// 16-bit samples
    Edf,
    /// 24-bit samples (BioSemi)
    Bdf,
}

impl EdfFormat {
    fn sample_bytes(self) -> usize {
        match self {
            EdfFormat::Edf => 2,
            EdfFormat::Bdf => 3,
        }
    }

    fn digital_range(self) -> (i32, i32) {
        match self {
            EdfFormat::Edf => (-32768, 32767),
            EdfFormat::Bdf => (-8_388_608, 8_388_607),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SignalHeader {
    pub label: String,
    pub physical_dimension: String,
    pub physical_min: f64,
    pub physical_max: f64,
    pub digital_min: i32,
    pub digital_max: i32,
    pub samples_per_record: usize,
}

impl SignalHeader {
    fn is_annotation(&self) -> bool {
        self.label == ANNOTATION_LABEL || self.label == BDF_ANNOTATION_LABEL
    }

    /// Multiplier taking the file's physical unit to volts.
    fn unit_scale(&self) -> f64 {
        match self.physical_dimension.trim() {
            "uV" | "µV" | "μV" => 1e-6,
            "mV" => 1e-3,
            "nV" => 1e-9,
            _ => 1.0,
        }
    }

    fn gain_offset(&self) -> (f64, f64) {
        let digital_span = f64::from(self.digital_max - self.digital_min);
        let gain = if digital_span == 0.0 {
            1.0
        } else {
            (self.physical_max - self.physical_min) / digital_span
        };
        let offset = self.physical_min - gain * f64::from(self.digital_min);
        (gain, offset)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EdfHeader {
    pub format: EdfFormat,
    pub patient: String,
    pub recording: String,
    pub num_records: usize,
    pub record_duration: f64,
    pub signals: Vec<SignalHeader>,
}

impl EdfHeader {
    fn data_signals(&self) -> impl Iterator<Item = (usize, &SignalHeader)> {
        self.signals
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_annotation())
    }

    /// Names of the data (non-annotation) channels.
    pub fn channel_names(&self) -> Vec<String> {
        self.data_signals().map(|(_, s)| s.label.clone()).collect()
    }

    /// Sampling frequency shared by every data channel.
    ///
    /// The record duration is stored as 8 ASCII characters, so rates within
    /// 1e-3 of an integer are snapped to it.
    pub fn sfreq(&self) -> Option<f64> {
        let (_, first) = self.data_signals().next()?;
        let sfreq = first.samples_per_record as f64 / self.record_duration;
        Some(if (sfreq - sfreq.round()).abs() < 1e-3 {
            sfreq.round()
        } else {
            sfreq
        })
    }

    fn record_bytes(&self) -> usize {
        self.signals
            .iter()
            .map(|s| s.samples_per_record * self.format.sample_bytes())
            .sum()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Annotation {
    pub onset: f64,
    pub duration: f64,
    pub description: String,
}

/// A fully decoded recording: per-channel samples in volts.
#[derive(Clone, Debug)]
pub struct EdfRecording {
    pub header: EdfHeader,
    pub channels: Vec<String>,
    pub sfreq: f64,
    pub data: Vec<Vec<f32>>,
    pub annotations: Vec<Annotation>,
}

impl EdfRecording {
    pub fn num_samples(&self) -> usize {
        self.data.first().map_or(0, Vec::len)
    }
}

// ===== READING =====

struct Cursor<'a> {
    path: &'a Path,
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn field(&mut self, width: usize) -> Result<String> {
        let end = self.pos + width;
        let raw = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| Dn3Error::signal(self.path, "header truncated"))?;
        self.pos = end;
        Ok(String::from_utf8_lossy(raw).trim().to_string())
    }

    fn number<T: std::str::FromStr>(&mut self, width: usize, name: &str) -> Result<T> {
        let text = self.field(width)?;
        text.parse()
            .map_err(|_| Dn3Error::signal(self.path, format!("invalid {name} `{text}`")))
    }

    fn skip(&mut self, width: usize) {
        self.pos += width;
    }

    /// One field per signal, as the header lays them out column by column.
    fn per_signal<T>(
        &mut self,
        ns: usize,
        mut parse: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<Vec<T>> {
        (0..ns).map(|_| parse(self)).collect()
    }
}

/// Parse the fixed and per-signal headers from `bytes`; `file_len` bounds the record count.
fn parse_header(path: &Path, bytes: &[u8], file_len: usize) -> Result<EdfHeader> {
    if bytes.len() < 256 {
        return Err(Dn3Error::signal(path, "file shorter than the fixed header"));
    }
    let format = if bytes[0] == 0xFF && &bytes[1..8] == b"BIOSEMI" {
        EdfFormat::Bdf
    } else {
        EdfFormat::Edf
    };

    let mut c = Cursor {
        path,
        bytes,
        pos: 8,
    };
    let patient = c.field(80)?;
    let recording = c.field(80)?;
    c.skip(16); // start date and time
    let header_bytes: usize = c.number(8, "header size")?;
    let reserved = c.field(44)?;
    let num_records: i64 = c.number(8, "record count")?;
    let record_duration: f64 = c.number(8, "record duration")?;
    let ns: usize = c.number(4, "signal count")?;

    if reserved.ends_with("+D") || reserved.starts_with("EDF+D") {
        return Err(Dn3Error::signal(path, "discontinuous EDF+ files are not supported"));
    }
    if record_duration <= 0.0 {
        return Err(Dn3Error::signal(path, "record duration must be positive"));
    }
    if header_bytes != 256 * (ns + 1) {
        return Err(Dn3Error::signal(
            path,
            format!("header declares {header_bytes} bytes for {ns} signals"),
        ));
    }

    let labels = c.per_signal(ns, |c| c.field(16))?;
    c.skip(80 * ns); // transducer
    let dims = c.per_signal(ns, |c| c.field(8))?;
    let pmin = c.per_signal(ns, |c| c.number::<f64>(8, "physical minimum"))?;
    let pmax = c.per_signal(ns, |c| c.number::<f64>(8, "physical maximum"))?;
    let dmin = c.per_signal(ns, |c| c.number::<i32>(8, "digital minimum"))?;
    let dmax = c.per_signal(ns, |c| c.number::<i32>(8, "digital maximum"))?;
    c.skip(80 * ns); // prefiltering
    let spr = c.per_signal(ns, |c| c.number::<usize>(8, "samples per record"))?;

    let signals = (0..ns)
        .map(|i| SignalHeader {
            label: labels[i].clone(),
            physical_dimension: dims[i].clone(),
            physical_min: pmin[i],
            physical_max: pmax[i],
            digital_min: dmin[i],
            digital_max: dmax[i],
            samples_per_record: spr[i],
        })
        .collect::<Vec<_>>();

    let mut header = EdfHeader {
        format,
        patient,
        recording,
        num_records: 0,
        record_duration,
        signals,
    };

    // -1 means "unknown"; derive it from the file size
    let available = file_len.saturating_sub(header_bytes) / header.record_bytes().max(1);
    header.num_records = match usize::try_from(num_records) {
        Ok(declared) if declared > available => {
            log::warn!(
                "{}: header declares {declared} records but only {available} are present",
                path.display()
            );
            available
        }
        Ok(declared) => declared,
        Err(_) => available,
    };

    let rates: Vec<usize> = header
        .data_signals()
        .map(|(_, s)| s.samples_per_record)
        .collect();
    if rates.windows(2).any(|w| w[0] != w[1]) {
        return Err(Dn3Error::signal(
            path,
            "data channels with different sampling rates are not supported",
        ));
    }
    Ok(header)
}

/// Read only the header; cheap enough for metadata scans.
pub fn read_header(path: impl AsRef<Path>) -> Result<EdfHeader> {
    use std::io::Read;
    let path = path.as_ref();
    let file_len = fs::metadata(path)?.len() as usize;
    let mut file = fs::File::open(path)?;
    let mut bytes = vec![0u8; 256];
    file.read_exact(&mut bytes)
        .map_err(|_| Dn3Error::signal(path, "file shorter than the fixed header"))?;
    let ns: usize = String::from_utf8_lossy(&bytes[252..256])
        .trim()
        .parse()
        .map_err(|_| Dn3Error::signal(path, "invalid signal count"))?;
    let mut signal_headers = vec![0u8; 256 * ns];
    file.read_exact(&mut signal_headers)
        .map_err(|_| Dn3Error::signal(path, "signal headers truncated"))?;
    bytes.extend(signal_headers);
    parse_header(path, &bytes, file_len)
}

fn decode_sample(format: EdfFormat, raw: &[u8]) -> i32 {
    match format {
        EdfFormat::Edf => i32::from(i16::from_le_bytes([raw[0], raw[1]])),
        EdfFormat::Bdf => {
            let unsigned = i32::from(raw[0]) | (i32::from(raw[1]) << 8) | (i32::from(raw[2]) << 16);
            // sign-extend from 24 bits
            (unsigned << 8) >> 8
        }
    }
}

/// Decode one record's annotation bytes (time-stamped annotation lists).
fn parse_tals(bytes: &[u8], out: &mut Vec<Annotation>) {
    for tal in bytes.split(|&b| b == 0).filter(|t| !t.is_empty()) {
        let mut parts = tal.split(|&b| b == 0x14);
        let Some(timing) = parts.next() else { continue };
        let timing = String::from_utf8_lossy(timing);
        let mut timing = timing.split('\u{15}');
        let Some(onset) = timing.next().and_then(|s| s.trim().parse::<f64>().ok()) else {
            continue;
        };
        let duration = timing
            .next()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .unwrap_or(0.0);
        for text in parts {
            let description = String::from_utf8_lossy(text).trim().to_string();
            // The first empty description of a record is its time-keeping entry
            if !description.is_empty() {
                out.push(Annotation {
                    onset,
                    duration,
                    description,
                });
            }
        }
    }
}

/// Read a whole EDF/EDF+/BDF file, scaling data channels to volts.
pub fn read_edf(path: impl AsRef<Path>) -> Result<EdfRecording> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    let header = parse_header(path, &bytes, bytes.len())?;
    let width = header.format.sample_bytes();

    let data_idx: Vec<usize> = header.data_signals().map(|(i, _)| i).collect();
    let spr = data_idx
        .first()
        .map_or(0, |&i| header.signals[i].samples_per_record);
    let mut data: Vec<Vec<f32>> = data_idx
        .iter()
        .map(|_| Vec::with_capacity(spr * header.num_records))
        .collect();
    let scaling: Vec<(f64, f64, f64)> = header
        .signals
        .iter()
        .map(|s| {
            let (gain, offset) = s.gain_offset();
            (gain, offset, s.unit_scale())
        })
        .collect();
    let mut annotations = Vec::new();

    let mut pos = 256 * (header.signals.len() + 1);
    for _ in 0..header.num_records {
        let mut slot = 0;
        for (i, signal) in header.signals.iter().enumerate() {
            let len = signal.samples_per_record * width;
            let chunk = &bytes[pos..pos + len];
            pos += len;
            if signal.is_annotation() {
                parse_tals(chunk, &mut annotations);
                continue;
            }
            let (gain, offset, unit) = scaling[i];
            data[slot].extend(chunk.chunks_exact(width).map(|raw| {
                let digital = f64::from(decode_sample(header.format, raw));
                ((digital * gain + offset) * unit) as f32
            }));
            slot += 1;
        }
    }

    annotations.sort_by(|a, b| a.onset.total_cmp(&b.onset));
    let sfreq = header
        .sfreq()
        .ok_or_else(|| Dn3Error::signal(path, "no data channels"))?;
    Ok(EdfRecording {
        channels: header.channel_names(),
        sfreq,
        data,
        annotations,
        header,
    })
}

// ===== WRITING =====

/// Fit a number into an ASCII header field of `width` characters.
fn fit_number(value: f64, width: usize) -> String {
    if value.fract() == 0.0 {
        let s = format!("{}", value as i64);
        if s.len() <= width {
            return s;
        }
    }
    for precision in (0..width).rev() {
        let s = format!("{value:.precision$}");
        if s.len() <= width {
            return s;
        }
    }
    format!("{}", value.round() as i64)
}

fn push_field(out: &mut Vec<u8>, text: &str, width: usize) {
    let mut bytes: Vec<u8> = text.bytes().take(width).collect();
    bytes.resize(width, b' ');
    out.extend(bytes);
}

fn encode_sample(format: EdfFormat, value: i32, out: &mut Vec<u8>) {
    match format {
        EdfFormat::Edf => out.extend((value as i16).to_le_bytes()),
        EdfFormat::Bdf => out.extend(&value.to_le_bytes()[..3]),
    }
}

/// Write channels (in volts) as a continuous EDF+/BDF file.
///
/// Records last one second when the length is a whole number of seconds,
/// otherwise the file holds a single record, so reading back yields exactly
/// `data[0].len()` samples.
pub fn write_edf(
    path: impl AsRef<Path>,
    format: EdfFormat,
    channels: &[String],
    sfreq: usize,
    data: &[Vec<f32>],
    annotations: &[Annotation],
) -> Result<()> {
    let path = path.as_ref();
    if channels.len() != data.len() {
        return Err(Dn3Error::invalid(
            "channels",
            format!("{} names for {} data rows", channels.len(), data.len()),
        ));
    }
    let n = data.first().map_or(0, Vec::len);
    if sfreq == 0 || n == 0 || data.iter().any(|row| row.len() != n) {
        return Err(Dn3Error::invalid(
            "data",
            "rows must be non-empty, equally long, with a positive sampling rate",
        ));
    }
    let (spr, num_records) = if n % sfreq == 0 {
        (sfreq, n / sfreq)
    } else {
        (n, 1)
    };
    let record_duration = spr as f64 / sfreq as f64;

    let tal = |onset: f64, duration: Option<f64>, text: &str| -> Vec<u8> {
        let mut bytes = format!("{onset:+}").into_bytes();
        if let Some(d) = duration.filter(|&d| d > 0.0) {
            bytes.push(0x15);
            bytes.extend(format!("{d}").bytes());
        }
        bytes.push(0x14);
        bytes.extend(text.bytes());
        bytes.push(0x14);
        bytes.push(0);
        bytes
    };
    let mut record_tals: Vec<Vec<u8>> = (0..num_records)
        .map(|r| {
            let mut b = format!("{:+}", r as f64 * record_duration).into_bytes();
            b.extend([0x14, 0x14, 0]);
            b
        })
        .collect();
    for a in annotations {
        let r = ((a.onset / record_duration) as usize).min(num_records - 1);
        record_tals[r].extend(tal(a.onset, Some(a.duration), &a.description));
    }
    let width = format.sample_bytes();
    let annotation_spr = record_tals
        .iter()
        .map(|t| t.len().div_ceil(width))
        .max()
        .unwrap_or(1);

    let (dmin, dmax) = format.digital_range();
    let ranges: Vec<(f64, f64)> = data
        .iter()
        .map(|row| {
            let lo = row.iter().fold(f32::INFINITY, |m, &v| m.min(v)) as f64 * 1e6;
            let hi = row.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v)) as f64 * 1e6;
            let (lo, hi) = if hi > lo { (lo, hi) } else { (lo - 1.0, lo + 1.0) };
            // the rounded header text must still bound the data
            let lo: f64 = fit_number(lo.floor(), 8).parse().unwrap_or(lo.floor());
            let hi: f64 = fit_number(hi.ceil(), 8).parse().unwrap_or(hi.ceil());
            (lo, hi)
        })
        .collect();

    let ns = channels.len() + 1;
    let mut out = Vec::new();
    match format {
        EdfFormat::Edf => push_field(&mut out, "0", 8),
        EdfFormat::Bdf => {
            out.push(0xFF);
            push_field(&mut out, "BIOSEMI", 7);
        }
    }
    push_field(&mut out, "X X X X", 80);
    push_field(&mut out, "Startdate X X X X", 80);
    push_field(&mut out, "01.01.00", 8);
    push_field(&mut out, "00.00.00", 8);
    push_field(&mut out, &(256 * (ns + 1)).to_string(), 8);
    push_field(
        &mut out,
        match format {
            EdfFormat::Edf => "EDF+C",
            EdfFormat::Bdf => "BDF+C",
        },
        44,
    );
    push_field(&mut out, &num_records.to_string(), 8);
    push_field(&mut out, &fit_number(record_duration, 8), 8);
    push_field(&mut out, &ns.to_string(), 4);

    let annotation_label = match format {
        EdfFormat::Edf => ANNOTATION_LABEL,
        EdfFormat::Bdf => BDF_ANNOTATION_LABEL,
    };
    for name in channels {
        push_field(&mut out, name, 16);
    }
    push_field(&mut out, annotation_label, 16);
    for _ in 0..ns {
        push_field(&mut out, "", 80);
    }
    for _ in channels {
        push_field(&mut out, "uV", 8);
    }
    push_field(&mut out, "", 8);
    for (lo, _) in &ranges {
        push_field(&mut out, &fit_number(*lo, 8), 8);
    }
    push_field(&mut out, "-1", 8);
    for (_, hi) in &ranges {
        push_field(&mut out, &fit_number(*hi, 8), 8);
    }
    push_field(&mut out, "1", 8);
    for _ in 0..ns {
        push_field(&mut out, &dmin.to_string(), 8);
    }
    for _ in 0..ns {
        push_field(&mut out, &dmax.to_string(), 8);
    }
    for _ in 0..ns {
        push_field(&mut out, "", 80);
    }
    for _ in channels {
        push_field(&mut out, &spr.to_string(), 8);
    }
    push_field(&mut out, &annotation_spr.to_string(), 8);
    for _ in 0..ns {
        push_field(&mut out, "", 32);
    }

    let digital_span = f64::from(dmax) - f64::from(dmin);
    for (r, tals) in record_tals.iter().enumerate() {
        for (row, &(lo, hi)) in data.iter().zip(&ranges) {
            for &v in &row[r * spr..(r + 1) * spr] {
                let phys = f64::from(v) * 1e6;
                let digital = ((phys - lo) / (hi - lo) * digital_span + f64::from(dmin)).round();
                encode_sample(
                    format,
                    digital.clamp(f64::from(dmin), f64::from(dmax)) as i32,
                    &mut out,
                );
            }
        }
        let mut padded = tals.clone();
        padded.resize(annotation_spr * width, 0);
        out.extend(padded);
    }

    fs::write(path, out)?;
    Ok(())
}
