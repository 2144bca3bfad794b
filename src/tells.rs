//! Per-frame tell generation
//!
//! Each detection kind compares a live statistic against the calibrated
//! baseline using its current adaptive threshold. Evaluations are throttled
//! per kind on the frame clock, and every tell lives for a fixed number of
//! processed frames unless refreshed.
//!
//! The gaze detector is a heuristic, not a statistical stability test: a
//! quantized gaze value that has (almost) never occurred in the recent window
//! and sits far from the window mean counts as a shift.

use std::collections::BTreeMap;
use tracing::debug;

use crate::config::TellConfig;
use crate::thresholds::AdaptiveThresholdManager;
use crate::types::{Baseline, IndicatorKind, Tell, TellMap};
use crate::window::RollingWindow;

/// Heart-rate state as shown by the BPM display tell
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeartRateStatus {
    /// Not enough history for an estimate yet
    Collecting { samples: usize, required: usize },
    /// History is sufficient but no estimate survived peak picking
    Calculating,
    Estimate(f64),
}

impl HeartRateStatus {
    pub fn bpm(&self) -> Option<f64> {
        match self {
            HeartRateStatus::Estimate(bpm) => Some(*bpm),
            _ => None,
        }
    }
}

/// Live measurements for one frame with a detected face
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMeasurements {
    pub timestamp: f64,
    pub fps: f64,
    pub eyes_closed: bool,
    pub hand_contact: bool,
    pub gaze: Option<f64>,
    pub lip_ratio: Option<f64>,
    pub heart_rate: HeartRateStatus,
}

/// Minimum spacing between two evaluations of one detector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throttle {
    interval: f64,
    last: Option<f64>,
}

impl Throttle {
    pub fn new(interval: f64) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Consume an evaluation slot if the interval has elapsed
    pub fn ready(&mut self, now: f64) -> bool {
        match self.last {
            Some(last) if now - last < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[derive(Debug, Clone)]
pub struct TellGenerator {
    config: TellConfig,
    tells: TellMap,
    closed: RollingWindow<bool>,
    contact: RollingWindow<bool>,
    gaze_bins: RollingWindow<i64>,
    gaze_values: RollingWindow<f64>,
    throttles: BTreeMap<IndicatorKind, Throttle>,
}

impl Default for TellGenerator {
    fn default() -> Self {
        Self::new(TellConfig::default())
    }
}

impl TellGenerator {
    pub fn new(config: TellConfig) -> Self {
        let throttles = IndicatorKind::DETECTIONS
            .into_iter()
            .map(|kind| (kind, Throttle::new(config.throttle.interval(kind))))
            .collect();
        Self {
            closed: RollingWindow::new(config.rolling_frames),
            contact: RollingWindow::new(config.rolling_frames),
            gaze_bins: RollingWindow::new(config.rolling_frames),
            gaze_values: RollingWindow::new(config.rolling_frames),
            tells: TellMap::new(),
            throttles,
            config,
        }
    }

    pub fn tells(&self) -> &TellMap {
        &self.tells
    }

    /// Drop every tell, rolling window and throttle
    pub fn reset(&mut self) {
        self.tells.clear();
        self.closed.clear();
        self.contact.clear();
        self.gaze_bins.clear();
        self.gaze_values.clear();
        for throttle in self.throttles.values_mut() {
            throttle.reset();
        }
    }

    /// Advance one frame. `measurements` is `None` when no face was found;
    /// `detecting` is false while calibrating or when the caller gates detection.
    pub fn process(
        &mut self,
        measurements: Option<&FrameMeasurements>,
        baseline: &Baseline,
        thresholds: &AdaptiveThresholdManager,
        detecting: bool,
    ) -> &TellMap {
        let detecting = detecting && baseline.calibrated;

        if detecting {
            self.tells.retain(|kind, tell| {
                if !kind.is_detection() {
                    return true;
                }
                tell.ttl = tell.ttl.saturating_sub(1);
                tell.ttl > 0
            });
        } else {
            self.tells.retain(|kind, _| !kind.is_detection());
        }

        let display = display_text(measurements, baseline, thresholds, detecting);
        self.tells.insert(
            IndicatorKind::AvgBpmDisplay,
            Tell::new(IndicatorKind::AvgBpmDisplay, display, self.config.ttl_frames),
        );

        let Some(m) = measurements else {
            return &self.tells;
        };

        self.closed.push(m.eyes_closed);
        self.contact.push(m.hand_contact);

        if detecting {
            let fired = [
                self.check_bpm(m, baseline, thresholds),
                self.check_blink(m, baseline, thresholds),
                self.check_hand(m, baseline, thresholds),
                self.check_gaze(m, baseline, thresholds),
                self.check_lips(m, thresholds),
            ];
            for (kind, text) in fired.into_iter().flatten() {
                debug!(kind = %kind, text = %text, "tell fired");
                self.tells
                    .insert(kind, Tell::new(kind, text, self.config.ttl_frames));
            }
        }

        if let Some(gaze) = m.gaze {
            self.gaze_bins.push(gaze_bin(gaze, self.config.gaze_resolution));
            self.gaze_values.push(gaze);
        }

        &self.tells
    }

    fn throttle_ready(&mut self, kind: IndicatorKind, now: f64) -> bool {
        self.throttles
            .get_mut(&kind)
            .map_or(true, |throttle| throttle.ready(now))
    }

    fn check_bpm(
        &mut self,
        m: &FrameMeasurements,
        baseline: &Baseline,
        thresholds: &AdaptiveThresholdManager,
    ) -> Option<(IndicatorKind, String)> {
        let bpm = m.heart_rate.bpm()?;
        if !baseline.has_bpm() || !self.throttle_ready(IndicatorKind::BpmChange, m.timestamp) {
            return None;
        }
        let delta = bpm - baseline.bpm;
        let allowed = baseline.bpm * thresholds.threshold(IndicatorKind::BpmChange) / 100.0;
        if delta.abs() <= allowed {
            return None;
        }
        let direction = if delta > 0.0 { "increase" } else { "decrease" };
        Some((
            IndicatorKind::BpmChange,
            format!("Heart rate {} ({:+.1} BPM)", direction, delta),
        ))
    }

    fn check_blink(
        &mut self,
        m: &FrameMeasurements,
        baseline: &Baseline,
        thresholds: &AdaptiveThresholdManager,
    ) -> Option<(IndicatorKind, String)> {
        let recent = self.config.blink_recent_frames;
        if baseline.blink_rate <= 0.0
            || self.closed.len() < recent
            || !self.throttle_ready(IndicatorKind::Blink, m.timestamp)
        {
            return None;
        }
        let rate = onset_rate(self.closed.recent_onsets(recent), recent, m.fps)?;
        let delta = rate - baseline.blink_rate;
        let allowed = baseline.blink_rate * thresholds.threshold(IndicatorKind::Blink) / 100.0;
        if delta.abs() <= allowed {
            return None;
        }
        let direction = if delta > 0.0 { "up" } else { "down" };
        Some((
            IndicatorKind::Blink,
            format!(
                "Blink rate {} ({:.1}/min vs baseline {:.1}/min)",
                direction,
                rate * 60.0,
                baseline.blink_rate * 60.0
            ),
        ))
    }

    fn check_hand(
        &mut self,
        m: &FrameMeasurements,
        baseline: &Baseline,
        thresholds: &AdaptiveThresholdManager,
    ) -> Option<(IndicatorKind, String)> {
        let recent = self.config.hand_recent_frames;
        if !m.hand_contact
            || self.contact.len() < recent
            || !self.throttle_ready(IndicatorKind::Hand, m.timestamp)
        {
            return None;
        }
        let rate = onset_rate(self.contact.recent_onsets(recent), recent, m.fps)?;
        let limit = baseline.hand_face_frequency * self.config.hand_rate_multiplier
            / thresholds.sensitivity(IndicatorKind::Hand);
        (rate > limit).then(|| (IndicatorKind::Hand, "Frequent hand-face contact".to_string()))
    }

    fn check_gaze(
        &mut self,
        m: &FrameMeasurements,
        baseline: &Baseline,
        thresholds: &AdaptiveThresholdManager,
    ) -> Option<(IndicatorKind, String)> {
        let gaze = m.gaze?;
        if baseline.gaze_stability <= 0.0
            || !self.gaze_bins.is_full()
            || !self.throttle_ready(IndicatorKind::Gaze, m.timestamp)
        {
            return None;
        }
        let bin = gaze_bin(gaze, self.config.gaze_resolution);
        let repeats = self.gaze_bins.iter().filter(|b| **b == bin).count();
        let recurrence = repeats as f64 / self.gaze_bins.capacity() as f64;
        let deviation = (gaze - self.gaze_values.mean()?).abs();
        let allowed = baseline.gaze_stability * thresholds.threshold(IndicatorKind::Gaze) / 100.0;

        (recurrence < self.config.gaze_recurrence && deviation > allowed)
            .then(|| (IndicatorKind::Gaze, format!("Gaze shift ({:.2})", deviation)))
    }

    fn check_lips(
        &mut self,
        m: &FrameMeasurements,
        thresholds: &AdaptiveThresholdManager,
    ) -> Option<(IndicatorKind, String)> {
        let ratio = m.lip_ratio?;
        if !self.throttle_ready(IndicatorKind::Lips, m.timestamp) {
            return None;
        }
        let cutoff = self.config.lip_compression_ratio * thresholds.sensitivity(IndicatorKind::Lips);
        (ratio < cutoff).then(|| {
            (
                IndicatorKind::Lips,
                format!("Lip compression (ratio: {:.3})", ratio),
            )
        })
    }
}

fn gaze_bin(gaze: f64, resolution: f64) -> i64 {
    if resolution <= 0.0 {
        return 0;
    }
    (gaze / resolution).round() as i64
}

/// Onsets per second over the most recent `frames` samples
fn onset_rate(onsets: usize, frames: usize, fps: f64) -> Option<f64> {
    if fps <= 0.0 || frames == 0 {
        return None;
    }
    Some(onsets as f64 / (frames as f64 / fps))
}

fn display_text(
    measurements: Option<&FrameMeasurements>,
    baseline: &Baseline,
    thresholds: &AdaptiveThresholdManager,
    detecting: bool,
) -> String {
    let Some(m) = measurements else {
        return "BPM: No face detected".to_string();
    };
    match m.heart_rate {
        HeartRateStatus::Collecting { samples, required } => {
            format!("BPM: Collecting... ({}/{})", samples, required)
        }
        HeartRateStatus::Calculating => "BPM: Calculating...".to_string(),
        HeartRateStatus::Estimate(bpm) if !detecting => format!("BPM: {:.1} (Calibrating)", bpm),
        HeartRateStatus::Estimate(bpm) if baseline.has_bpm() => {
            let delta = bpm - baseline.bpm;
            let allowed = baseline.bpm * thresholds.threshold(IndicatorKind::BpmChange) / 100.0;
            if delta.abs() > allowed {
                format!(
                    "BPM: {:.1} ({:+.0}% from baseline)",
                    bpm,
                    delta / baseline.bpm * 100.0
                )
            } else {
                format!("BPM: {:.1} (normal)", bpm)
            }
        }
        HeartRateStatus::Estimate(bpm) => format!("BPM: {:.1}", bpm),
    }
}
