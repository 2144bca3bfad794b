//! Detector configuration
//!
//! Every section and field carries a documented default. Documents are loaded
//! leniently: a missing field takes its default, and a section whose fields
//! cannot be decoded is replaced wholesale by its default (with a warning).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

use crate::error::TellError;
use crate::types::IndicatorKind;

/// When the calibration phase is considered complete
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CalibrationPolicy {
    /// Complete once this many seconds have elapsed since the first observed face
    Duration { seconds: f64 },
    /// Complete once this many face frames have been observed
    FrameCount { frames: u32 },
    /// Both conditions must hold (the stricter one wins)
    Both { seconds: f64, frames: u32 },
    /// Complete only on an explicit `finish_calibration` request
    Manual,
}

impl Default for CalibrationPolicy {
    fn default() -> Self {
        CalibrationPolicy::Duration { seconds: 30.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub policy: CalibrationPolicy,
    /// Valid heart-rate samples required before a BPM baseline is trusted
    pub min_bpm_samples: usize,
    pub min_bpm: f64,
    pub max_bpm: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            policy: CalibrationPolicy::default(),
            min_bpm_samples: 10,
            min_bpm: 50.0,
            max_bpm: 150.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartRateConfig {
    /// Most recent samples analysed per estimate
    pub window: usize,
    /// History length required before estimating
    pub min_samples: usize,
    /// Hard cap on retained history
    pub history_cap: usize,
    pub smoothing_window: usize,
    /// Minimum peak prominence in z-score units
    pub prominence: f64,
    pub min_bpm: f64,
    pub max_bpm: f64,
    /// Lower bound on the peak separation, in samples
    pub min_peak_distance: usize,
}

impl Default for HeartRateConfig {
    fn default() -> Self {
        Self {
            window: 120,
            min_samples: 60,
            history_cap: 1200,
            smoothing_window: 5,
            prominence: 0.3,
            min_bpm: 50.0,
            max_bpm: 150.0,
            min_peak_distance: 10,
        }
    }
}

/// Minimum seconds between two evaluations of each detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub bpm_change: f64,
    pub blink: f64,
    pub hand: f64,
    pub gaze: f64,
    pub lips: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            bpm_change: 1.0,
            blink: 2.0,
            hand: 3.0,
            gaze: 0.5,
            lips: 0.5,
        }
    }
}

impl ThrottleConfig {
    pub fn interval(&self, kind: IndicatorKind) -> f64 {
        match kind {
            IndicatorKind::BpmChange => self.bpm_change,
            IndicatorKind::Blink => self.blink,
            IndicatorKind::Hand => self.hand,
            IndicatorKind::Gaze => self.gaze,
            IndicatorKind::Lips => self.lips,
            IndicatorKind::AvgBpmDisplay => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TellConfig {
    /// Lifetime of a new tell, in processed frames
    pub ttl_frames: u32,
    /// Capacity of the rolling indicator windows
    pub rolling_frames: usize,
    /// Eye aspect ratio below which the eyes count as closed
    pub eye_closed_ratio: f64,
    /// Mouth aspect ratio below which the lips count as compressed
    pub lip_compression_ratio: f64,
    /// Contact rate multiple of baseline that fires a hand tell
    pub hand_rate_multiplier: f64,
    pub hand_recent_frames: usize,
    pub blink_recent_frames: usize,
    /// Gaze values are quantized to this step before recurrence counting
    pub gaze_resolution: f64,
    /// Share of the gaze window below which a value counts as novel
    pub gaze_recurrence: f64,
    pub throttle: ThrottleConfig,
}

impl Default for TellConfig {
    fn default() -> Self {
        Self {
            ttl_frames: 20,
            rolling_frames: 120,
            eye_closed_ratio: 0.15,
            lip_compression_ratio: 0.35,
            hand_rate_multiplier: 3.0,
            hand_recent_frames: 90,
            blink_recent_frames: 90,
            gaze_resolution: 0.1,
            gaze_recurrence: 0.01,
            throttle: ThrottleConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Seconds within which co-occurring indicators form one cluster
    pub cluster_window: f64,
    /// Seconds of raw indicator events retained
    pub lookback: f64,
    pub confidence_base: f64,
    pub confidence_per_indicator: f64,
    /// Confidence at or above which an alert is offered to the filter
    pub alert_threshold: f64,
    /// Minimum seconds between two accepted alerts
    pub cooldown: f64,
    /// Seconds within which identical clusters count as repetitions
    pub repetition_window: f64,
    pub min_repetitions: usize,
    /// Clusters this large bypass the cooldown
    pub min_cluster_size: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cluster_window: 3.0,
            lookback: 10.0,
            confidence_base: 0.2,
            confidence_per_indicator: 0.25,
            alert_threshold: 0.6,
            cooldown: 1.2,
            repetition_window: 5.0,
            min_repetitions: 2,
            min_cluster_size: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Percentage-of-baseline deviation required to fire, per detection kind
    #[serde(deserialize_with = "lenient_thresholds")]
    pub defaults: BTreeMap<IndicatorKind, f64>,
    /// Multiplier applied to each detected kind's threshold
    pub decay_factor: f64,
    /// Multiplier applied to correlated kinds (bpm_change → blink, hand → gaze)
    pub correlated_factor: f64,
    /// Thresholds never drop below `default * min_ratio`
    pub min_ratio: f64,
    /// Alerts at or above this confidence adapt the thresholds
    pub high_confidence: f64,
    /// Minutes of detection history retained for summaries
    pub history_minutes: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            defaults: default_thresholds(),
            decay_factor: 0.99,
            correlated_factor: 0.99,
            min_ratio: 0.8,
            high_confidence: 0.7,
            history_minutes: 10.0,
        }
    }
}

pub fn default_thresholds() -> BTreeMap<IndicatorKind, f64> {
    BTreeMap::from([
        (IndicatorKind::BpmChange, 30.0),
        (IndicatorKind::Blink, 40.0),
        (IndicatorKind::Gaze, 50.0),
        (IndicatorKind::Hand, 20.0),
        (IndicatorKind::Lips, 30.0),
    ])
}

/// Accepts a `{kind: pct}` object; unknown kinds and non-numeric or
/// non-positive values are dropped and any kind left uncovered takes its default.
pub(crate) fn lenient_thresholds<'de, D>(deserializer: D) -> Result<BTreeMap<IndicatorKind, f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = serde_json::Value::deserialize(deserializer)?;
    let mut thresholds = default_thresholds();

    if let Some(map) = raw.as_object() {
        for (key, value) in map {
            let kind = serde_json::from_value::<IndicatorKind>(serde_json::Value::String(
                key.clone(),
            ));
            match (kind, value.as_f64()) {
                (Ok(kind), Some(pct)) if kind.is_detection() && pct > 0.0 => {
                    thresholds.insert(kind, pct);
                }
                _ => warn!(key = %key, "ignoring malformed threshold entry"),
            }
        }
    }

    Ok(thresholds)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoodConfig {
    /// Face frames between classifier dispatches
    pub dispatch_every: u32,
    pub min_score: f64,
    pub neutral_min_score: f64,
    /// Accepted labels retained for majority voting
    pub history: usize,
    pub min_votes: usize,
    pub neutral_min_votes: usize,
    /// Share of the history a label needs to become the current mood
    pub consistency: f64,
}

impl Default for MoodConfig {
    fn default() -> Self {
        Self {
            dispatch_every: 5,
            min_score: 0.5,
            neutral_min_score: 0.35,
            history: 6,
            min_votes: 3,
            neutral_min_votes: 2,
            consistency: 0.5,
        }
    }
}

/// Complete detector configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub calibration: CalibrationConfig,
    pub heart_rate: HeartRateConfig,
    pub tells: TellConfig,
    pub alerts: AlertConfig,
    pub thresholds: ThresholdConfig,
    pub mood: MoodConfig,
}

impl DetectorConfig {
    /// Load configuration from JSON, falling back to defaults per section
    pub fn from_json(json: &str) -> Result<Self, TellError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let root = value.as_object().ok_or_else(|| {
            TellError::InvalidConfig("configuration must be a JSON object".to_string())
        })?;

        Ok(Self {
            calibration: section(root, "calibration"),
            heart_rate: section(root, "heart_rate"),
            tells: section(root, "tells"),
            alerts: section(root, "alerts"),
            thresholds: section(root, "thresholds"),
            mood: section(root, "mood"),
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, TellError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

fn section<T>(root: &serde_json::Map<String, serde_json::Value>, name: &str) -> T
where
    T: DeserializeOwned + Default,
{
    field_or(root, name, T::default)
}

/// Decode one member of a JSON object, falling back when it is missing or malformed
pub(crate) fn field_or<T, F>(root: &serde_json::Map<String, serde_json::Value>, name: &str, fallback: F) -> T
where
    T: DeserializeOwned,
    F: FnOnce() -> T,
{
    match root.get(name) {
        None => fallback(),
        Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|e| {
            warn!(field = name, error = %e, "malformed field, using default");
            fallback()
        }),
    }
}
