//! Session review timeline
//!
//! [`ReviewSession`] is fed the [`FrameOutput`] of every processed frame and
//! keeps what a reviewer needs afterwards: a timeline of tell onsets, key
//! moments (accepted alerts, high-stress spans, operator markers) and the
//! per-frame stress and heart-rate series behind [`SessionStats`]. Times are
//! seconds from the first recorded frame.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::TellError;
use crate::types::{Baseline, FrameOutput, IndicatorKind};
use crate::window::{mean, std_dev};

/// Alerts at or above this confidence count as high confidence
pub const HIGH_CONFIDENCE: f64 = 0.7;

/// Heart-rate readings outside this range are left out of the statistics
const PLAUSIBLE_BPM: (f64, f64) = (50.0, 200.0);

/// One tell onset (a new tell, or a refresh of a live one)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TellEvent {
    pub timestamp: f64,
    pub frame_number: u64,
    pub kind: IndicatorKind,
    pub text: String,
    pub stress_level: u8,
    /// Confidence of the alert accepted on the same frame, 0 otherwise
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MomentReason {
    AlertCluster,
    HighStress,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyMoment {
    pub timestamp: f64,
    pub frame_number: u64,
    pub reason: MomentReason,
    pub indicators: Vec<IndicatorKind>,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
}

/// Share of frames at each stress level, in percent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StressDistribution {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub duration: f64,
    pub total_frames: u64,
    pub calibration_duration: f64,
    pub total_tells: usize,
    pub tells_by_type: BTreeMap<IndicatorKind, usize>,
    pub tells_per_minute: f64,
    pub stress_distribution: StressDistribution,
    pub avg_stress_level: f64,
    /// First time the peak stress level was reached
    pub max_stress_timestamp: f64,
    pub baseline_bpm: f64,
    pub avg_bpm: f64,
    pub min_bpm: f64,
    pub max_bpm: f64,
    pub bpm_variance: f64,
    pub total_alerts: usize,
    pub high_confidence_alerts: usize,
    pub avg_alert_confidence: f64,
    pub key_moments_count: usize,
}

/// Stress level and heart rate of one frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameSample {
    pub timestamp: f64,
    pub stress_level: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bpm: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewSession {
    pub session_name: String,
    /// Stream time of the first recorded frame
    pub started_at: Option<f64>,
    pub calibration_end: Option<f64>,
    pub baseline_bpm: f64,
    pub frame_count: u64,
    pub events: Vec<TellEvent>,
    pub key_moments: Vec<KeyMoment>,
    pub frames: Vec<FrameSample>,
    #[serde(skip)]
    live: BTreeMap<IndicatorKind, u32>,
    #[serde(skip)]
    in_high_stress: bool,
}

impl Default for ReviewSession {
    fn default() -> Self {
        Self::new(format!("session_{}", Utc::now().format("%Y%m%d_%H%M%S")))
    }
}

#[derive(Serialize)]
struct ReviewDocument<'a> {
    #[serde(flatten)]
    session: &'a ReviewSession,
    statistics: SessionStats,
}

impl ReviewSession {
    pub fn new(session_name: impl Into<String>) -> Self {
        Self {
            session_name: session_name.into(),
            started_at: None,
            calibration_end: None,
            baseline_bpm: 0.0,
            frame_count: 0,
            events: Vec::new(),
            key_moments: Vec::new(),
            frames: Vec::new(),
            live: BTreeMap::new(),
            in_high_stress: false,
        }
    }

    fn elapsed(&self, timestamp: f64) -> f64 {
        self.started_at
            .map_or(0.0, |start| (timestamp - start).max(0.0))
    }

    /// Add one processed frame to the timeline
    pub fn record(&mut self, output: &FrameOutput, baseline: &Baseline) {
        self.started_at.get_or_insert(output.timestamp);
        let at = self.elapsed(output.timestamp);
        let frame_number = self.frame_count;

        if !output.calibrating && baseline.calibrated && self.calibration_end.is_none() {
            self.calibration_end = Some(at);
            self.baseline_bpm = baseline.bpm;
        }

        let confidence = output.alert.as_ref().map_or(0.0, |alert| alert.confidence);
        for (kind, tell) in output.tells.iter().filter(|(kind, _)| kind.is_detection()) {
            let onset = self.live.get(kind).map_or(true, |&ttl| tell.ttl > ttl);
            if onset {
                self.events.push(TellEvent {
                    timestamp: at,
                    frame_number,
                    kind: *kind,
                    text: tell.text.clone(),
                    stress_level: output.stress_level,
                    confidence,
                });
            }
        }
        self.live = output
            .tells
            .iter()
            .filter(|(kind, _)| kind.is_detection())
            .map(|(kind, tell)| (*kind, tell.ttl))
            .collect();

        if let Some(alert) = &output.alert {
            self.key_moments.push(KeyMoment {
                timestamp: at,
                frame_number,
                reason: MomentReason::AlertCluster,
                indicators: alert.indicators.iter().copied().collect(),
                confidence: alert.confidence,
                notes: String::new(),
            });
        }

        let high = output.stress_level >= 3;
        if high && !self.in_high_stress {
            self.key_moments.push(KeyMoment {
                timestamp: at,
                frame_number,
                reason: MomentReason::HighStress,
                indicators: self.live.keys().copied().collect(),
                confidence,
                notes: String::new(),
            });
        }
        self.in_high_stress = high;

        self.frames.push(FrameSample {
            timestamp: at,
            stress_level: output.stress_level,
            bpm: output.bpm,
        });
        self.frame_count += 1;
    }

    /// Pin an operator note to the most recent frame
    pub fn add_marker(&mut self, notes: impl Into<String>) {
        let timestamp = self.frames.last().map_or(0.0, |frame| frame.timestamp);
        self.key_moments.push(KeyMoment {
            timestamp,
            frame_number: self.frame_count.saturating_sub(1),
            reason: MomentReason::Manual,
            indicators: Vec::new(),
            confidence: 0.0,
            notes: notes.into(),
        });
    }

    pub fn stats(&self) -> SessionStats {
        let duration = self.frames.last().map_or(0.0, |frame| frame.timestamp);

        let mut tells_by_type = BTreeMap::new();
        for event in &self.events {
            *tells_by_type.entry(event.kind).or_insert(0) += 1;
        }
        let total_tells = self.events.len();

        let frames = self.frames.len().max(1) as f64;
        let share = |level: u8| {
            self.frames.iter().filter(|f| f.stress_level == level).count() as f64 / frames * 100.0
        };
        let stress_distribution = StressDistribution {
            low: share(1),
            medium: share(2),
            high: share(3),
        };
        let avg_stress_level = mean(self.frames.iter().map(|f| f.stress_level as f64)).unwrap_or(0.0);
        let max_stress_timestamp = self
            .frames
            .iter()
            .fold(None::<&FrameSample>, |best, frame| match best {
                Some(b) if b.stress_level >= frame.stress_level => Some(b),
                _ => Some(frame),
            })
            .map_or(0.0, |frame| frame.timestamp);

        let bpms: Vec<f64> = self
            .frames
            .iter()
            .filter_map(|f| f.bpm)
            .filter(|bpm| (PLAUSIBLE_BPM.0..=PLAUSIBLE_BPM.1).contains(bpm))
            .collect();

        let alerts: Vec<f64> = self
            .key_moments
            .iter()
            .filter(|m| m.reason == MomentReason::AlertCluster)
            .map(|m| m.confidence)
            .collect();

        SessionStats {
            duration,
            total_frames: self.frame_count,
            calibration_duration: self.calibration_end.unwrap_or(0.0),
            total_tells,
            tells_by_type,
            tells_per_minute: if duration > 0.0 {
                total_tells as f64 / duration * 60.0
            } else {
                0.0
            },
            stress_distribution,
            avg_stress_level,
            max_stress_timestamp,
            baseline_bpm: self.baseline_bpm,
            avg_bpm: mean(bpms.iter().copied()).unwrap_or(0.0),
            min_bpm: bpms.iter().copied().reduce(f64::min).unwrap_or(0.0),
            max_bpm: bpms.iter().copied().reduce(f64::max).unwrap_or(0.0),
            bpm_variance: std_dev(&bpms).map_or(0.0, |sd| sd * sd),
            total_alerts: alerts.len(),
            high_confidence_alerts: alerts.iter().filter(|c| **c >= HIGH_CONFIDENCE).count(),
            avg_alert_confidence: mean(alerts.iter().copied()).unwrap_or(0.0),
            key_moments_count: self.key_moments.len(),
        }
    }

    /// The timeline together with its computed statistics
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&ReviewDocument {
            session: self,
            statistics: self.stats(),
        })
    }

    /// Load a saved review; the stored statistics are recomputed, not trusted
    pub fn from_json(json: &str) -> Result<Self, TellError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, TellError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Write the review as `<session_name>_review.json` under `dir`
    pub fn save_to_dir(&self, dir: &Path) -> Result<PathBuf, TellError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}_review.json", self.session_name));
        std::fs::write(&path, self.to_json()?)?;
        info!(
            path = %path.display(),
            events = self.events.len(),
            moments = self.key_moments.len(),
            "review saved"
        );
        Ok(path)
    }
}
