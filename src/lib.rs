//! Tellwatch - Online behavioral tell detection from facial landmark streams
//!
//! Tellwatch turns a stream of per-frame face and hand landmarks into
//! short-lived "tells" (heart-rate change, blink-rate change, gaze shift,
//! hand-face contact, lip compression) and a small number of clustered,
//! rate-limited alerts, adapting its own sensitivity over a session:
//! calibration → heart-rate estimation → tell generation → alert clustering
//! → threshold adaptation.
//!
//! ## Modules
//!
//! - **Signals**: landmark geometry and the rPPG heart-rate estimator
//! - **Detection**: calibration, tells, alerts and adaptive thresholds
//! - **Session**: per-session memory, behavioral patterns and persistence
//! - **Review**: tell timeline, key moments and session statistics

pub mod alert;
pub mod calibration;
pub mod config;
pub mod detector;
pub mod error;
pub mod landmarks;
pub mod mood;
pub mod review;
pub mod rppg;
pub mod session;
pub mod tells;
pub mod thresholds;
pub mod types;
pub mod window;

#[cfg(test)]
pub(crate) mod fixtures;

pub use alert::{stress_level, AlertManager, FilterOutcome};
pub use calibration::BaselineCalibrator;
pub use config::{CalibrationPolicy, DetectorConfig};
pub use detector::Detector;
pub use error::TellError;
pub use mood::{EmotionClassifier, EmotionScore};
pub use review::ReviewSession;
pub use rppg::HeartRateEstimator;
pub use session::SessionMemory;
pub use tells::TellGenerator;
pub use thresholds::AdaptiveThresholdManager;
pub use types::{
    Alert, Baseline, FaceLandmarks, Frame, FrameInput, FrameOutput, HandLandmarks, IndicatorKind,
    Landmark, Tell, TellMap,
};

/// Tellwatch version reported by the CLI
pub const TELLWATCH_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name for emitted documents
pub const PRODUCER_NAME: &str = "tellwatch";
