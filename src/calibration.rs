//! Baseline calibration
//!
//! A two-phase state machine: while `Collecting`, every face frame contributes
//! one sample of each indicator. When the configured [`CalibrationPolicy`] is
//! satisfied (or on an explicit `finalize`), the accumulated samples are frozen
//! into a [`Baseline`] and the calibrator becomes `Ready` until `reset`.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{CalibrationConfig, CalibrationPolicy};
use crate::types::Baseline;
use crate::window::{count_onsets, mean, std_dev};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationState {
    Collecting,
    Ready,
}

/// One face frame's contribution to calibration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationSample {
    pub timestamp: f64,
    pub blink: bool,
    pub hand_contact: bool,
    pub gaze: Option<f64>,
    pub lip_ratio: Option<f64>,
    pub bpm: Option<f64>,
    pub emotion: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BaselineCalibrator {
    config: CalibrationConfig,
    state: CalibrationState,
    started_at: Option<f64>,
    last_seen: Option<f64>,
    frames: u32,
    blinks: Vec<bool>,
    hand_contacts: Vec<bool>,
    gaze: Vec<f64>,
    lip_ratios: Vec<f64>,
    bpms: Vec<f64>,
    emotions: Vec<String>,
    baseline: Baseline,
}

impl Default for BaselineCalibrator {
    fn default() -> Self {
        Self::new(CalibrationConfig::default())
    }
}

impl BaselineCalibrator {
    pub fn new(config: CalibrationConfig) -> Self {
        Self {
            config,
            state: CalibrationState::Collecting,
            started_at: None,
            last_seen: None,
            frames: 0,
            blinks: Vec::new(),
            hand_contacts: Vec::new(),
            gaze: Vec::new(),
            lip_ratios: Vec::new(),
            bpms: Vec::new(),
            emotions: Vec::new(),
            baseline: Baseline::default(),
        }
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == CalibrationState::Ready
    }

    pub fn baseline(&self) -> &Baseline {
        &self.baseline
    }

    pub fn policy(&self) -> CalibrationPolicy {
        self.config.policy
    }

    /// Face frames observed so far in this calibration
    pub fn frames(&self) -> u32 {
        self.frames
    }

    /// Record one face frame. Returns `true` when this sample completed calibration.
    pub fn observe(&mut self, sample: CalibrationSample) -> bool {
        if self.is_ready() {
            return false;
        }

        let now = sample.timestamp;
        self.started_at.get_or_insert(now);
        self.last_seen = Some(now);
        self.frames += 1;

        self.blinks.push(sample.blink);
        self.hand_contacts.push(sample.hand_contact);
        if let Some(gaze) = sample.gaze {
            self.gaze.push(gaze);
        }
        if let Some(ratio) = sample.lip_ratio {
            self.lip_ratios.push(ratio);
        }
        if let Some(bpm) = sample.bpm {
            self.bpms.push(bpm);
        }
        if let Some(emotion) = sample.emotion {
            if self.emotions.last() != Some(&emotion) {
                self.emotions.push(emotion);
            }
        }

        if self.is_due(now) {
            self.finalize();
            return true;
        }
        false
    }

    fn elapsed(&self, now: f64) -> f64 {
        self.started_at.map(|start| (now - start).max(0.0)).unwrap_or(0.0)
    }

    fn is_due(&self, now: f64) -> bool {
        let elapsed = self.elapsed(now);
        match self.config.policy {
            CalibrationPolicy::Duration { seconds } => elapsed >= seconds,
            CalibrationPolicy::FrameCount { frames } => self.frames >= frames,
            CalibrationPolicy::Both { seconds, frames } => {
                elapsed >= seconds && self.frames >= frames
            }
            CalibrationPolicy::Manual => false,
        }
    }

    /// Fraction of the policy satisfied, in [0, 1]. A manual policy reports 0
    /// until finalized.
    pub fn progress(&self, now: f64) -> f64 {
        if self.is_ready() {
            return 1.0;
        }
        let elapsed = self.elapsed(now);
        let ratio = |done: f64, target: f64| {
            if target <= 0.0 {
                1.0
            } else {
                (done / target).clamp(0.0, 1.0)
            }
        };
        match self.config.policy {
            CalibrationPolicy::Duration { seconds } => ratio(elapsed, seconds),
            CalibrationPolicy::FrameCount { frames } => ratio(self.frames as f64, frames as f64),
            CalibrationPolicy::Both { seconds, frames } => {
                ratio(elapsed, seconds).min(ratio(self.frames as f64, frames as f64))
            }
            CalibrationPolicy::Manual => 0.0,
        }
    }

    /// Freeze the collected samples into the baseline. No-op once ready.
    pub fn finalize(&mut self) -> &Baseline {
        if self.is_ready() {
            return &self.baseline;
        }

        let elapsed = match (self.started_at, self.last_seen) {
            (Some(start), Some(end)) => (end - start).max(0.0),
            _ => 0.0,
        };
        let per_second = |count: usize| {
            if elapsed > 0.0 {
                count as f64 / elapsed
            } else {
                0.0
            }
        };

        let valid_bpms: Vec<f64> = self
            .bpms
            .iter()
            .copied()
            .filter(|bpm| (self.config.min_bpm..=self.config.max_bpm).contains(bpm))
            .collect();
        let bpm = if valid_bpms.len() >= self.config.min_bpm_samples {
            mean(valid_bpms.iter().copied()).unwrap_or(0.0)
        } else {
            warn!(
                valid = valid_bpms.len(),
                required = self.config.min_bpm_samples,
                "insufficient heart-rate samples, BPM baseline not established"
            );
            0.0
        };

        let nonzero_gaze: Vec<f64> = self.gaze.iter().copied().filter(|g| *g != 0.0).collect();

        self.baseline = Baseline {
            bpm,
            blink_rate: per_second(count_onsets(self.blinks.iter().copied())),
            gaze_stability: std_dev(&nonzero_gaze).unwrap_or(0.0),
            lip_ratio: mean(self.lip_ratios.iter().copied()).unwrap_or(0.0),
            dominant_emotion: dominant_label(&self.emotions).unwrap_or_else(|| "neutral".to_string()),
            hand_face_frequency: per_second(count_onsets(self.hand_contacts.iter().copied())),
            calibrated: true,
            sample_count: self.frames,
        };
        self.state = CalibrationState::Ready;

        info!(
            bpm = self.baseline.bpm,
            blink_rate = self.baseline.blink_rate,
            gaze_stability = self.baseline.gaze_stability,
            lip_ratio = self.baseline.lip_ratio,
            hand_face_frequency = self.baseline.hand_face_frequency,
            dominant_emotion = %self.baseline.dominant_emotion,
            frames = self.frames,
            elapsed,
            "calibration complete"
        );
        &self.baseline
    }

    /// Discard all samples and the baseline, returning to a fresh `Collecting`
    pub fn reset(&mut self) {
        debug!("calibration reset");
        *self = Self::new(self.config.clone());
    }
}

/// Most frequent label; ties go to the label seen first
fn dominant_label(labels: &[String]) -> Option<String> {
    let mut best: Option<(&String, usize)> = None;
    for label in labels {
        let count = labels.iter().filter(|l| *l == label).count();
        if best.map_or(true, |(_, top)| count > top) {
            best = Some((label, count));
        }
    }
    best.map(|(label, _)| label.clone())
}
