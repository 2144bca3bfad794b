//! Core types for the Tellwatch pipeline
//!
//! This module defines the data structures that flow through each stage of the
//! per-frame pipeline: landmark input, tells, the calibrated baseline, and alerts.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::TellError;

/// Minimum number of face-mesh points (468 without iris refinement)
pub const FACE_LANDMARK_COUNT: usize = 468;

/// Face-mesh point count when iris refinement is enabled
pub const FACE_LANDMARK_COUNT_WITH_IRIS: usize = 478;

/// Minimum number of points in a hand landmark set
pub const HAND_LANDMARK_COUNT: usize = 21;

/// Indicator kinds that can produce a tell
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    BpmChange,
    Blink,
    Hand,
    Gaze,
    Lips,
    AvgBpmDisplay,
}

impl IndicatorKind {
    /// Kinds produced by deviation detectors (everything except the BPM display)
    pub const DETECTIONS: [IndicatorKind; 5] = [
        IndicatorKind::BpmChange,
        IndicatorKind::Blink,
        IndicatorKind::Hand,
        IndicatorKind::Gaze,
        IndicatorKind::Lips,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorKind::BpmChange => "bpm_change",
            IndicatorKind::Blink => "blink",
            IndicatorKind::Hand => "hand",
            IndicatorKind::Gaze => "gaze",
            IndicatorKind::Lips => "lips",
            IndicatorKind::AvgBpmDisplay => "avg_bpm_display",
        }
    }

    /// Fixed priority weight used when scoring an alert cluster
    pub fn weight(&self) -> i64 {
        match self {
            IndicatorKind::BpmChange => 30,
            IndicatorKind::Hand => 20,
            IndicatorKind::Blink => 15,
            IndicatorKind::Lips => 15,
            IndicatorKind::Gaze => 10,
            IndicatorKind::AvgBpmDisplay => 5,
        }
    }

    /// Whether this kind reports a deviation (as opposed to informational display)
    pub fn is_detection(&self) -> bool {
        !matches!(self, IndicatorKind::AvgBpmDisplay)
    }
}

impl fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A time-limited record that an indicator deviated from baseline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tell {
    pub kind: IndicatorKind,
    pub text: String,
    /// Remaining lifetime in processed frames
    pub ttl: u32,
}

impl Tell {
    pub fn new(kind: IndicatorKind, text: impl Into<String>, ttl: u32) -> Self {
        Self {
            kind,
            text: text.into(),
            ttl,
        }
    }
}

/// At most one live tell per kind
pub type TellMap = BTreeMap<IndicatorKind, Tell>;

/// Per-session reference statistics captured once during calibration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Baseline {
    /// Mean heart rate; 0 means "not established"
    pub bpm: f64,
    /// Eye-closure onsets per second
    pub blink_rate: f64,
    /// Standard deviation of non-zero gaze samples
    pub gaze_stability: f64,
    /// Mean mouth aspect ratio
    pub lip_ratio: f64,
    pub dominant_emotion: String,
    /// Hand-to-face contact onsets per second
    pub hand_face_frequency: f64,
    pub calibrated: bool,
    pub sample_count: u32,
}

impl Default for Baseline {
    fn default() -> Self {
        Self {
            bpm: 0.0,
            blink_rate: 0.0,
            gaze_stability: 0.0,
            lip_ratio: 0.0,
            dominant_emotion: "neutral".to_string(),
            hand_face_frequency: 0.0,
            calibrated: false,
            sample_count: 0,
        }
    }
}

impl Baseline {
    /// A zero heart rate baseline suppresses BPM-delta detection
    pub fn has_bpm(&self) -> bool {
        self.bpm > 0.0
    }
}

/// A scored cluster of co-occurring indicators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub priority: i64,
    /// Seconds, on the same clock as the frame timestamps
    pub timestamp: f64,
    pub indicators: BTreeSet<IndicatorKind>,
    /// In [0, 1]
    pub confidence: f64,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.indicators.iter().map(|k| k.as_str()).collect();
        write!(
            f,
            "ALERT ({}%): {}",
            (self.confidence * 100.0).round() as i64,
            names.join(", ")
        )
    }
}

/// A normalized landmark point (x, y in [0, 1] image space)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

impl Landmark {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, z: 0.0 }
    }

    pub fn distance(&self, other: &Landmark) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Face-mesh landmark set with stable semantic indices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceLandmarks {
    pub points: Vec<Landmark>,
}

impl FaceLandmarks {
    pub fn new(points: Vec<Landmark>) -> Result<Self, TellError> {
        let face = Self { points };
        face.validate()?;
        Ok(face)
    }

    pub fn validate(&self) -> Result<(), TellError> {
        if self.points.len() < FACE_LANDMARK_COUNT {
            return Err(TellError::InvalidLandmarks(format!(
                "face set has {} points, expected at least {}",
                self.points.len(),
                FACE_LANDMARK_COUNT
            )));
        }
        Ok(())
    }

    pub fn point(&self, index: usize) -> Option<&Landmark> {
        self.points.get(index)
    }

    /// Iris points (468..478) are present
    pub fn has_iris(&self) -> bool {
        self.points.len() >= FACE_LANDMARK_COUNT_WITH_IRIS
    }
}

/// Hand landmark set (21 points per hand)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandLandmarks {
    pub points: Vec<Landmark>,
}

impl HandLandmarks {
    pub fn is_complete(&self) -> bool {
        self.points.len() >= HAND_LANDMARK_COUNT
    }
}

/// RGB frame, row-major, 3 bytes per pixel
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, TellError> {
        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            return Err(TellError::InvalidFrame(format!(
                "frame buffer has {} bytes, expected {}",
                pixels.len(),
                expected
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        self.pixels
            .get(offset..offset + 3)
            .map(|p| [p[0], p[1], p[2]])
    }
}

fn default_fps() -> f64 {
    30.0
}

fn default_true() -> bool {
    true
}

/// Everything the pipeline consumes for one frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameInput {
    /// Frame timestamp in seconds
    pub timestamp: f64,
    #[serde(default = "default_fps")]
    pub fps: f64,
    /// Caller-side gate: detection runs only when this and the baseline are both calibrated
    #[serde(default = "default_true")]
    pub calibrated: bool,
    #[serde(default)]
    pub face: Option<FaceLandmarks>,
    #[serde(default)]
    pub hands: Vec<HandLandmarks>,
    /// Precomputed cheek color sample; takes precedence over sampling `image`
    #[serde(default)]
    pub cheek_signal: Option<f64>,
    #[serde(skip)]
    pub image: Option<Frame>,
    /// Operator note to pin to this moment in the review timeline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
}

impl FrameInput {
    pub fn new(timestamp: f64) -> Self {
        Self {
            timestamp,
            fps: default_fps(),
            calibrated: true,
            face: None,
            hands: Vec::new(),
            cheek_signal: None,
            image: None,
            marker: None,
        }
    }
}

/// Everything the pipeline produces for one frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameOutput {
    pub timestamp: f64,
    pub tells: TellMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<Alert>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bpm: Option<f64>,
    pub calibrating: bool,
    pub calibration_progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,
    pub stress_level: u8,
}
