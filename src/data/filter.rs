//! Windowed-sinc FIR filtering, decimation and resampling of channel data.

use std::f64::consts::PI;

/// Odd tap count for a transition band of roughly `cutoff` (normalised, cycles/sample).
fn tap_count(cutoff: f64, signal_len: usize) -> usize {
    let taps = ((4.0 / cutoff.max(1e-3)).ceil() as usize).clamp(3, 1001);
    let taps = taps.min(signal_len.max(3));
    if taps % 2 == 0 { taps - 1 } else { taps }
}

/// Hamming-windowed sinc low-pass kernel with unit DC gain.
fn lowpass_kernel(cutoff: f64, taps: usize) -> Vec<f64> {
    let mid = (taps / 2) as f64;
    let mut kernel: Vec<f64> = (0..taps)
        .map(|i| {
            let n = i as f64 - mid;
            let sinc = if n == 0.0 {
                2.0 * cutoff
            } else {
                (2.0 * PI * cutoff * n).sin() / (PI * n)
            };
            let window = 0.54 - 0.46 * (2.0 * PI * i as f64 / (taps - 1) as f64).cos();
            sinc * window
        })
        .collect();
    let total: f64 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= total;
    }
    kernel
}

/// Spectral inversion of the low-pass kernel.
fn highpass_kernel(cutoff: f64, taps: usize) -> Vec<f64> {
    let mut kernel = lowpass_kernel(cutoff, taps);
    for k in &mut kernel {
        *k = -*k;
    }
    kernel[taps / 2] += 1.0;
    kernel
}

/// Centred (zero-phase) convolution with edge samples repeated past the ends.
fn convolve_centred(signal: &[f32], kernel: &[f64]) -> Vec<f32> {
    let n = signal.len() as isize;
    let half = (kernel.len() / 2) as isize;
    (0..n)
        .map(|i| {
            kernel
                .iter()
                .enumerate()
                .map(|(k, &w)| {
                    let j = (i + k as isize - half).clamp(0, n - 1);
                    w * f64::from(signal[j as usize])
                })
                .sum::<f64>() as f32
        })
        .collect()
}

/// Low-pass every channel at `cutoff_hz`.
pub fn lowpass(data: &mut [Vec<f32>], sfreq: f64, cutoff_hz: f64) {
    let cutoff = cutoff_hz / sfreq;
    if cutoff >= 0.5 {
        return;
    }
    for row in data.iter_mut() {
        let kernel = lowpass_kernel(cutoff, tap_count(cutoff, row.len()));
        *row = convolve_centred(row, &kernel);
    }
}

/// High-pass every channel at `cutoff_hz`.
pub fn highpass(data: &mut [Vec<f32>], sfreq: f64, cutoff_hz: f64) {
    let cutoff = cutoff_hz / sfreq;
    if cutoff <= 0.0 {
        return;
    }
    for row in data.iter_mut() {
        let kernel = highpass_kernel(cutoff, tap_count(cutoff, row.len()));
        *row = convolve_centred(row, &kernel);
    }
}

/// Anti-alias at a third of the new rate, then keep every `factor`-th sample.
///
/// Returns the new sampling frequency.
pub fn decimate(data: &mut [Vec<f32>], sfreq: f64, factor: usize) -> f64 {
    if factor <= 1 {
        return sfreq;
    }
    let new_sfreq = sfreq / factor as f64;
    lowpass(data, sfreq, new_sfreq / 3.0);
    for row in data.iter_mut() {
        *row = row.iter().step_by(factor).copied().collect();
    }
    new_sfreq
}

/// Resample to `new_sfreq` by linear interpolation, low-passing first when downsampling.
pub fn resample(data: &mut [Vec<f32>], sfreq: f64, new_sfreq: f64) {
    if (sfreq - new_sfreq).abs() < f64::EPSILON {
        return;
    }
    if new_sfreq < sfreq {
        lowpass(data, sfreq, new_sfreq / 3.0);
    }
    let ratio = sfreq / new_sfreq;
    for row in data.iter_mut() {
        let n = row.len();
        if n == 0 {
            continue;
        }
        let out_len = ((n as f64) / ratio).round().max(1.0) as usize;
        *row = (0..out_len)
            .map(|i| {
                let t = i as f64 * ratio;
                let left = (t.floor() as usize).min(n - 1);
                let right = (left + 1).min(n - 1);
                let frac = t - left as f64;
                ((1.0 - frac) * f64::from(row[left]) + frac * f64::from(row[right])) as f32
            })
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(n: usize, freq: f64, sfreq: f64) -> Vec<f32> {
        (0..n)
            .map(|i| (2.0 * PI * freq * i as f64 / sfreq).sin() as f32)
            .collect()
    }

    fn rms(x: &[f32]) -> f64 {
        (x.iter().map(|&v| f64::from(v).powi(2)).sum::<f64>() / x.len() as f64).sqrt()
    }

    #[test]
    fn lowpass_keeps_slow_and_removes_fast() {
        let mut slow = vec![tone(1600, 2.0, 160.0)];
        let mut fast = vec![tone(1600, 60.0, 160.0)];
        lowpass(&mut slow, 160.0, 15.0);
        lowpass(&mut fast, 160.0, 15.0);
        // ignore the edges
        assert!(rms(&slow[0][200..1400]) > 0.65);
        assert!(rms(&fast[0][200..1400]) < 0.05);
    }

    #[test]
    fn highpass_removes_offset() {
        let mut data = vec![vec![3.0f32; 800]];
        highpass(&mut data, 100.0, 1.0);
        assert!(data[0][400].abs() < 1e-3);
    }

    #[test]
    fn decimate_divides_rate_and_length() {
        let mut data = vec![tone(640, 3.0, 160.0), tone(640, 5.0, 160.0)];
        let new_sfreq = decimate(&mut data, 160.0, 2);
        assert_eq!(new_sfreq, 80.0);
        assert_eq!(data[0].len(), 320);
        assert_eq!(data[1].len(), 320);
    }

    #[test]
    fn resample_changes_length_proportionally() {
        let mut data = vec![tone(1280, 3.0, 128.0)];
        resample(&mut data, 128.0, 160.0);
        assert_eq!(data[0].len(), 1600);
    }
}
