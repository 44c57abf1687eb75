//! Synthetic recordings laid out like a PhysioNet motor-imagery download.
#![allow(dead_code)]

use dn3::data::edf::{Annotation, EdfFormat, write_edf};
use std::f64::consts::PI;
use std::fs;
use std::path::Path;

pub const CHANNELS: [&str; 4] = ["Fc5.", "C3..", "Cz..", "C4.."];
pub const SFREQ: usize = 160;
pub const ALT_SFREQ: usize = 128;
pub const SECONDS: usize = 20;
pub const RUNS: usize = 2;
pub const EVENTS: [&str; 3] = ["T0", "T1", "T2"];

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Cue annotations every two seconds, cycling through [`EVENTS`].
pub fn cues(seconds: usize) -> Vec<Annotation> {
    (0..seconds / 2)
        .map(|i| Annotation {
            onset: 0.5 + 2.0 * i as f64,
            duration: 1.0,
            description: EVENTS[i % EVENTS.len()].to_string(),
        })
        .collect()
}

/// A few microvolt-scale sinusoids, different per channel and run.
pub fn signal(sfreq: usize, seconds: usize, seed: usize) -> Vec<Vec<f32>> {
    (0..CHANNELS.len())
        .map(|c| {
            (0..sfreq * seconds)
                .map(|i| {
                    let t = i as f64 / sfreq as f64;
                    let f = 3.0 + c as f64 + seed as f64 * 0.5;
                    (20e-6 * (2.0 * PI * f * t).sin() + 5e-6 * (2.0 * PI * 11.0 * t).cos()) as f32
                })
                .collect()
        })
        .collect()
}

/// `root/S00k/S00kR0r.edf` for every subject; the last `alt_rate` subjects are recorded at [`ALT_SFREQ`].
pub fn write_mmidb(root: &Path, subjects: usize, alt_rate: usize) {
    let channels: Vec<String> = CHANNELS.iter().map(|c| c.to_string()).collect();
    for s in 1..=subjects {
        let subject = format!("S{s:03}");
        let dir = root.join(&subject);
        fs::create_dir_all(&dir).unwrap();
        let sfreq = if s > subjects - alt_rate { ALT_SFREQ } else { SFREQ };
        for r in 1..=RUNS {
            let path = dir.join(format!("{subject}R{r:02}.edf"));
            write_edf(
                &path,
                EdfFormat::Edf,
                &channels,
                sfreq,
                &signal(sfreq, SECONDS, s * RUNS + r),
                &cues(SECONDS),
            )
            .unwrap();
        }
    }
}

pub fn write_file(path: &Path, text: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, text).unwrap();
}
