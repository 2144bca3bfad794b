//! Remote photoplethysmography (rPPG) heart-rate estimation
//!
//! Estimates heart rate from the per-frame cheek color sample. Once enough
//! history exists, the most recent window is z-score normalized, smoothed
//! with a moving average, peak-picked (minimum separation + prominence), and
//! the peak-to-peak intervals are converted to BPM and range-filtered.
//!
//! This is a best-effort heuristic: it is restartable and lossy, with no
//! guarantee of convergence to a ground-truth heart rate.

use std::collections::VecDeque;

use crate::config::HeartRateConfig;

/// Rolling cheek-signal history plus the peak-picking estimator
#[derive(Debug, Clone)]
pub struct HeartRateEstimator {
    config: HeartRateConfig,
    history: VecDeque<f64>,
}

impl Default for HeartRateEstimator {
    fn default() -> Self {
        Self::new(HeartRateConfig::default())
    }
}

impl HeartRateEstimator {
    pub fn new(config: HeartRateConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.history_cap),
            config,
        }
    }

    /// Append one cheek sample, evicting beyond the history cap
    pub fn push(&mut self, sample: f64) {
        if !sample.is_finite() {
            return;
        }
        self.history.push_back(sample);
        while self.history.len() > self.config.history_cap.max(1) {
            self.history.pop_front();
        }
    }

    pub fn sample_count(&self) -> usize {
        self.history.len()
    }

    pub fn is_ready(&self) -> bool {
        self.history.len() >= self.config.min_samples
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Estimate BPM from the most recent window, or `None` when there is not
    /// enough history or fewer than two usable peaks.
    pub fn estimate(&self, fps: f64) -> Option<f64> {
        if !self.is_ready() || fps <= 0.0 {
            return None;
        }
        let start = self.history.len().saturating_sub(self.config.window);
        let window: Vec<f64> = self.history.iter().skip(start).copied().collect();
        estimate_bpm(&window, fps, &self.config)
    }
}

/// The normalize → smooth → peak-pick → range-filter pipeline on one window
pub fn estimate_bpm(signal: &[f64], fps: f64, config: &HeartRateConfig) -> Option<f64> {
    if signal.len() < 3 || fps <= 0.0 || config.max_bpm <= 0.0 {
        return None;
    }

    let normalized = normalize(signal);
    let smoothing = config.smoothing_window.min(normalized.len() / 2).max(1);
    let smoothed = smooth(&normalized, smoothing);

    let distance = ((fps * 60.0 / config.max_bpm).floor() as usize).max(config.min_peak_distance);
    let peaks = find_peaks(&smoothed, distance, config.prominence);
    if peaks.len() < 2 {
        return None;
    }

    let bpms: Vec<f64> = peaks
        .windows(2)
        .map(|pair| 60.0 * fps / (pair[1] - pair[0]) as f64)
        .filter(|bpm| (config.min_bpm..=config.max_bpm).contains(bpm))
        .collect();

    if bpms.is_empty() {
        return None;
    }
    Some(bpms.iter().sum::<f64>() / bpms.len() as f64)
}

/// Zero-mean, unit-variance normalization
pub fn normalize(signal: &[f64]) -> Vec<f64> {
    if signal.is_empty() {
        return Vec::new();
    }
    let n = signal.len() as f64;
    let mean = signal.iter().sum::<f64>() / n;
    let std = (signal.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    signal.iter().map(|v| (v - mean) / (std + 1e-6)).collect()
}

/// Centered moving average with zero padding at the edges (output length = input length)
pub fn smooth(signal: &[f64], window: usize) -> Vec<f64> {
    let window = window.max(1);
    let half = (window - 1) / 2;
    let n = signal.len() as isize;

    (0..signal.len())
        .map(|i| {
            let hi = (i + half) as isize;
            let lo = hi - (window as isize - 1);
            let sum: f64 = (lo.max(0)..=hi.min(n - 1))
                .map(|j| signal[j as usize])
                .sum();
            sum / window as f64
        })
        .collect()
}

/// Peak indices with at least `distance` samples between kept peaks and at
/// least `prominence` above the higher of the two surrounding bases.
/// Flat-topped maxima resolve to the middle sample of the plateau.
pub fn find_peaks(signal: &[f64], distance: usize, prominence: f64) -> Vec<usize> {
    let candidates = local_maxima(signal);
    let spaced = select_by_distance(signal, &candidates, distance.max(1));
    spaced
        .into_iter()
        .filter(|&peak| peak_prominence(signal, peak) >= prominence)
        .collect()
}

fn local_maxima(signal: &[f64]) -> Vec<usize> {
    let mut peaks = Vec::new();
    if signal.len() < 3 {
        return peaks;
    }
    let last = signal.len() - 1;
    let mut i = 1;
    while i < last {
        if signal[i - 1] < signal[i] {
            let mut ahead = i + 1;
            while ahead < last && signal[ahead] == signal[i] {
                ahead += 1;
            }
            if signal[ahead] < signal[i] {
                peaks.push((i + ahead - 1) / 2);
                i = ahead;
                continue;
            }
        }
        i += 1;
    }
    peaks
}

/// Keep the tallest peaks first, discarding neighbours closer than `distance`
fn select_by_distance(signal: &[f64], peaks: &[usize], distance: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..peaks.len()).collect();
    order.sort_by(|&a, &b| {
        signal[peaks[b]]
            .total_cmp(&signal[peaks[a]])
            .then(b.cmp(&a))
    });

    let mut keep = vec![true; peaks.len()];
    for &j in &order {
        if !keep[j] {
            continue;
        }
        for k in (0..j).rev() {
            if peaks[j] - peaks[k] >= distance {
                break;
            }
            keep[k] = false;
        }
        for k in j + 1..peaks.len() {
            if peaks[k] - peaks[j] >= distance {
                break;
            }
            keep[k] = false;
        }
    }

    peaks
        .iter()
        .zip(keep)
        .filter_map(|(&p, k)| k.then_some(p))
        .collect()
}

fn peak_prominence(signal: &[f64], peak: usize) -> f64 {
    let height = signal[peak];

    let mut left_min = height;
    for &v in signal[..peak].iter().rev() {
        if v > height {
            break;
        }
        left_min = left_min.min(v);
    }

    let mut right_min = height;
    for &v in &signal[peak + 1..] {
        if v > height {
            break;
        }
        right_min = right_min.min(v);
    }

    height - left_min.max(right_min)
}
