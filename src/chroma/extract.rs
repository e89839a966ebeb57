//! Short-time spectral analysis producing one chroma vector per hop.
//!
//! Each hop slides a power-of-two window over the signal, applies a Hamming
//! taper, takes the magnitude spectrum up to 10 kHz, keeps only strict local
//! maxima and folds every surviving bin onto its nearest pitch class.

use rustfft::{FftPlanner, num_complex::Complex};
use thiserror::Error;

use super::vector::{ChromaMatrix, ChromaVector, PITCH_CLASSES};
use crate::audio::{DecodeError, SampleSource};

/// Reference frequency for octave folding (A0 in the 440 Hz tuning).
pub const A0: f64 = 440.0 / 16.0;

/// Bins above this frequency carry little harmonic information.
const MAX_FREQUENCY_HZ: f64 = 10_000.0;

/// Largest window the power-of-two snapping will pick.
const MAX_WINDOW_EXPONENT: u32 = 15;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Window of {0} ms is too short at this sample rate")]
    WindowTooShort(f64),
    #[error("Hop size ratio {ratio} is invalid for a {window}-sample window")]
    InvalidHopRatio { ratio: usize, window: usize },
    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(f32),
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
}

/// Chroma extraction parameters.
#[derive(Debug, Clone, Copy)]
pub struct ChromaExtractor {
    pub window_ms: f64,
    /// 1 = no overlap, 2 = 50% overlap, 3 = 66% overlap, ...
    pub hopsize_ratio: usize,
}

impl Default for ChromaExtractor {
    fn default() -> Self {
        Self {
            window_ms: 93.0,
            hopsize_ratio: 2,
        }
    }
}

impl ChromaExtractor {
    pub fn new(window_ms: f64, hopsize_ratio: usize) -> Self {
        Self {
            window_ms,
            hopsize_ratio,
        }
    }

    /// Window length in samples for a given sample rate.
    pub fn window_len(&self, sample_rate: f32) -> Result<usize, ExtractError> {
        if !(sample_rate > 0.0) {
            return Err(ExtractError::InvalidSampleRate(sample_rate));
        }
        let ideal = (sample_rate as f64 * self.window_ms / 1000.0) as usize;
        if ideal < 2 {
            return Err(ExtractError::WindowTooShort(self.window_ms));
        }
        Ok(closest_power_of_two(ideal))
    }

    /// Run the analysis over `source` until it can no longer supply a full hop.
    pub fn extract(&self, source: &mut dyn SampleSource) -> Result<ChromaMatrix, ExtractError> {
        let sample_rate = source.sample_rate();
        let win_len = self.window_len(sample_rate)?;
        if self.hopsize_ratio == 0 || self.hopsize_ratio > win_len {
            return Err(ExtractError::InvalidHopRatio {
                ratio: self.hopsize_ratio,
                window: win_len,
            });
        }
        let hop = win_len / self.hopsize_ratio;

        log::debug!(
            "Chroma extraction: {} Hz, window {} samples, hop {}",
            sample_rate,
            win_len,
            hop
        );

        let window = hamming_window(win_len);
        let pitch_of_bin = bin_pitch_classes(win_len, sample_rate as f64);
        let cutoff = spectrum_cutoff(win_len, sample_rate as f64);

        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(win_len);
        let mut bins = vec![Complex::new(0.0, 0.0); win_len];
        let mut magnitude = vec![0.0_f64; win_len / 2];

        let mut audio = vec![0.0_f64; win_len];
        let mut chroma = ChromaMatrix::new();

        // Prime everything but the last hop so the first frame is all signal
        if !shift_and_read(&mut audio, source, hop * (self.hopsize_ratio - 1))? {
            return Ok(chroma);
        }

        while shift_and_read(&mut audio, source, hop)? {
            for ((c, &a), &w) in bins.iter_mut().zip(&audio).zip(&window) {
                *c = Complex::new(a * w, 0.0);
            }
            fft.process(&mut bins);

            magnitude.iter_mut().for_each(|m| *m = 0.0);
            for (m, c) in magnitude.iter_mut().zip(&bins).take(cutoff) {
                *m = c.norm();
            }
            let peaks = peak_pick(&magnitude);

            let mut acc = [0.0_f64; PITCH_CLASSES];
            for (i, &p) in peaks.iter().enumerate().take(cutoff).skip(1) {
                if p > 0.0 {
                    acc[pitch_of_bin[i]] += p;
                }
            }
            chroma.push(ChromaVector::new(acc.map(|v| v as f32)));
        }

        log::debug!("Extracted {} chroma frames", chroma.len());
        Ok(chroma)
    }
}

/// Snap `n` to whichever bounding power of two is closer (ties go up),
/// searching up to 2^15.
pub fn closest_power_of_two(n: usize) -> usize {
    for p in 1..=MAX_WINDOW_EXPONENT {
        let high = 1usize << p;
        let low = 1usize << (p - 1);
        if low <= n && n <= high {
            return if n - low < high - n { low } else { high };
        }
    }
    1 << MAX_WINDOW_EXPONENT
}

pub fn hamming_window(n: usize) -> Vec<f64> {
    let denom = (n.max(2) - 1) as f64;
    (0..n)
        .map(|i| 0.54 - 0.46 * (2.0 * std::f64::consts::PI * i as f64 / denom).cos())
        .collect()
}

/// Number of octaves `frequency` lies above A0.
pub fn octave(frequency: f64) -> f64 {
    let o = (frequency / A0).log2();
    log::trace!("Frequency {} belongs to octave {}", frequency, o);
    o
}

/// Nearest pitch class of `frequency` (0 = A in this folding).
pub fn pitch_class(frequency: f64) -> usize {
    let o = octave(frequency);
    let class = (12.0 * (o - o.floor())).round() as usize;
    class % PITCH_CLASSES
}

/// Pitch class of every bin below Nyquist. Bin 0 (DC) is never used.
fn bin_pitch_classes(win_len: usize, sample_rate: f64) -> Vec<usize> {
    (0..win_len / 2)
        .map(|i| {
            if i == 0 {
                0
            } else {
                pitch_class(i as f64 * sample_rate / win_len as f64)
            }
        })
        .collect()
}

/// First bin index at or above the 10 kHz limit, capped at Nyquist.
fn spectrum_cutoff(win_len: usize, sample_rate: f64) -> usize {
    let limit = (MAX_FREQUENCY_HZ / sample_rate * win_len as f64).ceil() as usize;
    limit.min(win_len / 2)
}

/// Keep only bins strictly greater than both neighbours.
fn peak_pick(spectrum: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; spectrum.len()];
    for i in 1..spectrum.len().saturating_sub(1) {
        if spectrum[i] > spectrum[i - 1] && spectrum[i] > spectrum[i + 1] {
            out[i] = spectrum[i];
        }
    }
    out
}

/// Shift `buffer` left by `n` and append `n` fresh samples.
/// Returns false (leaving the buffer untouched) when fewer than `n` remain.
fn shift_and_read(
    buffer: &mut [f64],
    source: &mut dyn SampleSource,
    n: usize,
) -> Result<bool, DecodeError> {
    if n == 0 {
        return Ok(true);
    }
    let fresh = source.read_samples(n)?;
    if fresh.len() < n {
        return Ok(false);
    }
    buffer.copy_within(n.., 0);
    let len = buffer.len();
    buffer[len - n..].copy_from_slice(&fresh);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::BufferSource;

    fn sine(freq: f64, sample_rate: f64, secs: f64) -> Vec<f64> {
        let n = (sample_rate * secs) as usize;
        (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / sample_rate).sin())
            .collect()
    }

    #[test]
    fn test_octave_of_a4() {
        assert_eq!(octave(440.0), 4.0);
        assert_eq!(octave(A0), 0.0);
    }

    #[test]
    fn test_pitch_class_folding() {
        assert_eq!(pitch_class(440.0), 0);
        assert_eq!(pitch_class(880.0), 0);
        // One semitone above A
        assert_eq!(pitch_class(440.0 * 2f64.powf(1.0 / 12.0)), 1);
        // Slightly flat still rounds to A; wraps from 12 to 0
        assert_eq!(pitch_class(439.0), 0);
    }

    #[test]
    fn test_closest_power_of_two() {
        assert_eq!(closest_power_of_two(1488), 1024);
        assert_eq!(closest_power_of_two(1600), 2048);
        assert_eq!(closest_power_of_two(1536), 2048); // tie goes up
        assert_eq!(closest_power_of_two(4096), 4096);
        assert_eq!(closest_power_of_two(1_000_000), 1 << 15);
    }

    #[test]
    fn test_hamming_endpoints() {
        let w = hamming_window(8);
        assert!((w[0] - 0.08).abs() < 1e-12);
        assert!((w[7] - 0.08).abs() < 1e-12);
    }

    #[test]
    fn test_peak_pick_strict() {
        let p = peak_pick(&[0.0, 1.0, 3.0, 3.0, 2.0, 5.0, 1.0]);
        assert_eq!(p, vec![0.0, 0.0, 0.0, 0.0, 0.0, 5.0, 0.0]);
    }

    #[test]
    fn test_sweep_produces_frames() {
        let sr = 16_000.0;
        let n = (2.0 * sr) as usize;
        // Linear sweep 200 Hz -> 2 kHz
        let samples: Vec<f64> = (0..n)
            .map(|i| {
                let t = i as f64 / sr;
                let f = 200.0 + 900.0 * t;
                (2.0 * std::f64::consts::PI * f * t).sin()
            })
            .collect();
        let mut src = BufferSource::new(samples, sr as f32);
        let chroma = ChromaExtractor::new(93.0, 2).extract(&mut src).unwrap();

        assert!(!chroma.is_empty());
        // 1024-sample window, 512 hop: prime 512 then one frame per hop
        assert_eq!(chroma.len(), (n - 512) / 512);
        for v in &chroma {
            assert_eq!(v.bins().len(), 12);
            assert!(v.bins().iter().all(|&b| b >= 0.0));
        }
    }

    #[test]
    fn test_pure_tone_lands_on_its_pitch_class() {
        let sr = 16_000.0;
        // Classes are counted from A, and C5 sits three semitones above A4
        let c5 = 440.0 * 2f64.powf(3.0 / 12.0);
        let mut src = BufferSource::new(sine(c5, sr, 1.0), sr as f32);
        let chroma = ChromaExtractor::new(256.0, 2).extract(&mut src).unwrap();
        assert!(!chroma.is_empty());
        for v in &chroma {
            let argmax = v
                .bins()
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                .map(|(i, _)| i)
                .unwrap();
            assert_eq!(argmax, 3);
        }
    }

    #[test]
    fn test_short_input_yields_nothing() {
        let mut src = BufferSource::new(vec![0.0; 100], 16_000.0);
        let chroma = ChromaExtractor::default().extract(&mut src).unwrap();
        assert!(chroma.is_empty());
    }

    #[test]
    fn test_invalid_hop_ratio() {
        let mut src = BufferSource::new(vec![0.0; 100], 16_000.0);
        let err = ChromaExtractor::new(93.0, 0).extract(&mut src).unwrap_err();
        assert!(matches!(err, ExtractError::InvalidHopRatio { .. }));
    }

    #[test]
    fn test_silence_has_zero_energy() {
        let mut src = BufferSource::new(vec![0.0; 8000], 16_000.0);
        let chroma = ChromaExtractor::default().extract(&mut src).unwrap();
        assert!(chroma.iter().all(|v| v.energy() == 0.0));
    }
}
