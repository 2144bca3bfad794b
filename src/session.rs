//! Session memory
//!
//! An append-only record of one session: the frozen baseline, every detection
//! event with the thresholds in force at the time, and behavioral patterns
//! derived from the event stream. Written once at session end; a saved
//! document is for review only and never seeds a new session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

use crate::config::{default_thresholds, field_or, lenient_thresholds};
use crate::error::TellError;
use crate::types::{Baseline, IndicatorKind};

/// Confidence slope over recent events above which a session is escalating
const ESCALATION_SLOPE: f64 = 0.1;
/// Recent events considered for escalation
const ESCALATION_EVENTS: usize = 5;
/// Intervals shorter than this many seconds count towards burst behavior
const BURST_INTERVAL: f64 = 30.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    /// Stream clock, seconds
    pub timestamp: f64,
    /// Seconds since the session started
    pub session_time: f64,
    pub indicators: BTreeSet<IndicatorKind>,
    pub confidence: f64,
    pub thresholds_at_time: BTreeMap<IndicatorKind, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorPair {
    pub indicators: [IndicatorKind; 2],
    pub frequency: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehavioralPatterns {
    pub escalation_detected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_rate: Option<f64>,
    pub common_indicator_pairs: Vec<IndicatorPair>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strongest_correlation: Option<IndicatorPair>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_detection_interval: Option<f64>,
    pub burst_behavior: bool,
    pub burst_count: usize,
}

impl BehavioralPatterns {
    /// Human-readable notes on the detected patterns
    pub fn insights(&self) -> Vec<String> {
        let mut notes = Vec::new();
        if let (true, Some(rate)) = (self.escalation_detected, self.escalation_rate) {
            notes.push(format!("Escalation pattern detected (rate: {:.3})", rate));
        }
        if let Some(pair) = &self.strongest_correlation {
            notes.push(format!(
                "Strong correlation: {} + {} ({} times)",
                pair.indicators[0], pair.indicators[1], pair.frequency
            ));
        }
        if self.burst_behavior {
            notes.push(format!("Burst behavior: {} rapid detections", self.burst_count));
        }
        notes
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub duration: f64,
    pub total_detections: usize,
    pub deception_count: usize,
    pub avg_confidence: f64,
    pub behavioral_patterns: BehavioralPatterns,
    pub insights: Vec<String>,
    pub current_thresholds: BTreeMap<IndicatorKind, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMemory {
    pub session_id: String,
    /// Wall-clock creation time
    pub timestamp: DateTime<Utc>,
    pub baseline_metrics: Baseline,
    pub detection_events: Vec<DetectionEvent>,
    /// Events at or above the high-confidence cutoff
    pub deception_count: usize,
    pub confidence_scores: Vec<f64>,
    pub behavioral_patterns: BehavioralPatterns,
    pub adaptive_thresholds: BTreeMap<IndicatorKind, f64>,
    /// Stream clock at session start
    #[serde(default)]
    pub started_at: f64,
}

impl SessionMemory {
    /// Start a fresh session seeded with the given thresholds
    pub fn start(started_at: f64, thresholds: BTreeMap<IndicatorKind, f64>) -> Self {
        let now = Utc::now();
        let short_id = Uuid::new_v4().simple().to_string();
        let session_id = format!(
            "session_{}_{}",
            now.format("%Y%m%d_%H%M%S"),
            &short_id[..8]
        );
        info!(session_id = %session_id, "session started");
        Self {
            session_id,
            timestamp: now,
            baseline_metrics: Baseline::default(),
            detection_events: Vec::new(),
            deception_count: 0,
            confidence_scores: Vec::new(),
            behavioral_patterns: BehavioralPatterns::default(),
            adaptive_thresholds: thresholds,
            started_at,
        }
    }

    pub fn set_baseline(&mut self, baseline: Baseline) {
        self.baseline_metrics = baseline;
    }

    pub fn set_thresholds(&mut self, thresholds: BTreeMap<IndicatorKind, f64>) {
        self.adaptive_thresholds = thresholds;
    }

    /// Append one detection event and refresh the behavioral patterns
    pub fn record(
        &mut self,
        indicators: &BTreeSet<IndicatorKind>,
        confidence: f64,
        timestamp: f64,
        thresholds_at_time: BTreeMap<IndicatorKind, f64>,
        high_confidence: bool,
    ) {
        self.detection_events.push(DetectionEvent {
            timestamp,
            session_time: (timestamp - self.started_at).max(0.0),
            indicators: indicators.clone(),
            confidence,
            thresholds_at_time,
        });
        self.confidence_scores.push(confidence);
        if high_confidence {
            self.deception_count += 1;
        }
        self.analyze_patterns();
    }

    fn analyze_patterns(&mut self) {
        let events = &self.detection_events;
        if events.len() < 2 {
            return;
        }
        let patterns = &mut self.behavioral_patterns;

        let recent: Vec<f64> = events
            .iter()
            .skip(events.len().saturating_sub(ESCALATION_EVENTS))
            .map(|e| e.confidence)
            .collect();
        if recent.len() >= 3 {
            let slope = linear_slope(&recent);
            if slope > ESCALATION_SLOPE {
                patterns.escalation_detected = true;
                patterns.escalation_rate = Some(slope);
            }
        }

        let mut pairs: BTreeMap<(IndicatorKind, IndicatorKind), usize> = BTreeMap::new();
        for event in events {
            let kinds: Vec<IndicatorKind> = event.indicators.iter().copied().collect();
            for (i, &a) in kinds.iter().enumerate() {
                for &b in &kinds[i + 1..] {
                    *pairs.entry((a, b)).or_insert(0) += 1;
                }
            }
        }
        patterns.common_indicator_pairs = pairs
            .into_iter()
            .map(|((a, b), frequency)| IndicatorPair {
                indicators: [a, b],
                frequency,
            })
            .collect();
        patterns.strongest_correlation = patterns
            .common_indicator_pairs
            .iter()
            .fold(None, |best: Option<&IndicatorPair>, pair| match best {
                Some(top) if top.frequency >= pair.frequency => Some(top),
                _ => Some(pair),
            })
            .cloned();

        if events.len() >= 3 {
            let intervals: Vec<f64> = events
                .windows(2)
                .map(|w| w[1].session_time - w[0].session_time)
                .collect();
            patterns.avg_detection_interval =
                Some(intervals.iter().sum::<f64>() / intervals.len() as f64);
            let short = intervals.iter().filter(|i| **i < BURST_INTERVAL).count();
            if short >= 2 {
                patterns.burst_behavior = true;
                patterns.burst_count = short;
            }
        }
    }

    pub fn avg_confidence(&self) -> f64 {
        if self.confidence_scores.is_empty() {
            return 0.0;
        }
        self.confidence_scores.iter().sum::<f64>() / self.confidence_scores.len() as f64
    }

    /// Summary as of stream time `now`
    pub fn summary(&self, now: f64) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            duration: (now - self.started_at).max(0.0),
            total_detections: self.detection_events.len(),
            deception_count: self.deception_count,
            avg_confidence: self.avg_confidence(),
            behavioral_patterns: self.behavioral_patterns.clone(),
            insights: self.behavioral_patterns.insights(),
            current_thresholds: self.adaptive_thresholds.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load a saved document; missing or malformed fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, TellError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let root = value.as_object().ok_or_else(|| {
            TellError::InvalidConfig("session document must be a JSON object".to_string())
        })?;

        let adaptive_thresholds = root
            .get("adaptive_thresholds")
            .and_then(|v| lenient_thresholds(v.clone()).ok())
            .unwrap_or_else(default_thresholds);

        Ok(Self {
            session_id: field_or(root, "session_id", String::new),
            timestamp: field_or(root, "timestamp", Utc::now),
            baseline_metrics: field_or(root, "baseline_metrics", Baseline::default),
            detection_events: field_or(root, "detection_events", Vec::new),
            deception_count: field_or(root, "deception_count", || 0),
            confidence_scores: field_or(root, "confidence_scores", Vec::new),
            behavioral_patterns: field_or(root, "behavioral_patterns", BehavioralPatterns::default),
            adaptive_thresholds,
            started_at: field_or(root, "started_at", || 0.0),
        })
    }

    pub fn load(path: &Path) -> Result<Self, TellError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Write the document as `memory_<YYYYmmdd_HHMMSS>.json` under `dir`
    pub fn save_to_dir(&self, dir: &Path) -> Result<PathBuf, TellError> {
        std::fs::create_dir_all(dir)?;
        let filename = format!("memory_{}.json", Utc::now().format("%Y%m%d_%H%M%S"));
        let path = dir.join(filename);
        std::fs::write(&path, self.to_json()?)?;
        info!(path = %path.display(), events = self.detection_events.len(), "session saved");
        Ok(path)
    }
}

/// Least-squares slope of `values` against their indices
fn linear_slope(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    if values.len() < 2 {
        return 0.0;
    }
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n;
    let (num, den) = values
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(num, den), (i, y)| {
            let dx = i as f64 - mean_x;
            (num + dx * (y - mean_y), den + dx * dx)
        });
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn set(kinds: &[IndicatorKind]) -> BTreeSet<IndicatorKind> {
        kinds.iter().copied().collect()
    }

    fn session_with_events(events: &[(f64, &[IndicatorKind], f64)]) -> SessionMemory {
        let mut session = SessionMemory::start(100.0, default_thresholds());
        for &(t, kinds, confidence) in events {
            session.record(&set(kinds), confidence, t, default_thresholds(), confidence >= 0.7);
        }
        session
    }

    #[test]
    fn test_session_id_format() {
        let session = SessionMemory::start(0.0, default_thresholds());
        assert!(session.session_id.starts_with("session_"));
        assert_eq!(session.session_id.len(), "session_20240101_000000_".len() + 8);
    }

    #[test]
    fn test_record_counts_deception() {
        use IndicatorKind::*;
        let session = session_with_events(&[
            (101.0, &[Hand, Lips], 0.7),
            (102.0, &[Gaze], 0.45),
            (103.0, &[BpmChange, Hand, Lips], 0.95),
        ]);
        assert_eq!(session.detection_events.len(), 3);
        assert_eq!(session.deception_count, 2);
        assert_eq!(session.detection_events[0].session_time, 1.0);
        assert!((session.avg_confidence() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_escalation_pattern() {
        use IndicatorKind::*;
        let session = session_with_events(&[
            (101.0, &[Hand], 0.45),
            (102.0, &[Hand, Lips], 0.7),
            (103.0, &[Hand, Lips, Gaze], 0.95),
        ]);
        let patterns = &session.behavioral_patterns;
        assert!(patterns.escalation_detected);
        assert!((patterns.escalation_rate.unwrap() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_pairs_and_bursts() {
        use IndicatorKind::*;
        let session = session_with_events(&[
            (110.0, &[Hand, Lips], 0.7),
            (120.0, &[Hand, Lips], 0.7),
            (125.0, &[Hand, Gaze], 0.7),
            (200.0, &[Blink], 0.45),
        ]);
        let patterns = &session.behavioral_patterns;
        assert!(!patterns.escalation_detected);
        assert_eq!(
            patterns.strongest_correlation,
            Some(IndicatorPair {
                indicators: [Hand, Lips],
                frequency: 2
            })
        );
        assert_eq!(patterns.common_indicator_pairs.len(), 2);
        assert!((patterns.avg_detection_interval.unwrap() - 30.0).abs() < 1e-9);
        assert!(patterns.burst_behavior);
        assert_eq!(patterns.burst_count, 2);

        let insights = patterns.insights();
        assert_eq!(
            insights,
            vec![
                "Strong correlation: hand + lips (2 times)".to_string(),
                "Burst behavior: 2 rapid detections".to_string(),
            ]
        );
    }

    #[test]
    fn test_summary() {
        use IndicatorKind::*;
        let session = session_with_events(&[(101.0, &[Hand, Lips], 0.7)]);
        let summary = session.summary(160.0);
        assert_eq!(summary.duration, 60.0);
        assert_eq!(summary.total_detections, 1);
        assert_eq!(summary.deception_count, 1);
        assert_eq!(summary.current_thresholds, default_thresholds());
    }

    #[test]
    fn test_round_trip() {
        use IndicatorKind::*;
        let mut session = session_with_events(&[
            (101.25, &[Hand, Lips], 0.7),
            (102.5, &[BpmChange, Hand, Lips], 0.95),
        ]);
        session.set_baseline(Baseline {
            bpm: 72.5,
            calibrated: true,
            ..Default::default()
        });
        let mut tightened = default_thresholds();
        tightened.insert(Hand, 19.8);
        session.set_thresholds(tightened);

        let json = session.to_json().unwrap();
        let loaded = SessionMemory::from_json(&json).unwrap();
        assert_eq!(loaded.detection_events, session.detection_events);
        assert_eq!(loaded.adaptive_thresholds, session.adaptive_thresholds);
        assert_eq!(loaded, session);
    }

    #[test]
    fn test_lenient_load() {
        let loaded = SessionMemory::from_json(
            r#"{"session_id": "s1", "deception_count": "many", "adaptive_thresholds": {"hand": 18.0, "gaze": null}}"#,
        )
        .unwrap();
        assert_eq!(loaded.session_id, "s1");
        assert_eq!(loaded.deception_count, 0);
        assert!(loaded.detection_events.is_empty());
        assert_eq!(loaded.adaptive_thresholds[&IndicatorKind::Hand], 18.0);
        assert_eq!(loaded.adaptive_thresholds[&IndicatorKind::Gaze], 50.0);
        assert!(SessionMemory::from_json("42").is_err());
    }

    #[test]
    fn test_save_to_dir() {
        let dir = std::env::temp_dir().join(format!("tellwatch-test-{}", Uuid::new_v4()));
        let session = session_with_events(&[(101.0, &[IndicatorKind::Hand], 0.45)]);
        let path = session.save_to_dir(&dir).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("memory_") && name.ends_with(".json"));

        let loaded = SessionMemory::load(&path).unwrap();
        assert_eq!(loaded, session);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_linear_slope() {
        assert!((linear_slope(&[1.0, 2.0, 3.0]) - 1.0).abs() < 1e-9);
        assert_eq!(linear_slope(&[0.5]), 0.0);
        assert!(linear_slope(&[0.9, 0.5, 0.1]) < 0.0);
    }
}
