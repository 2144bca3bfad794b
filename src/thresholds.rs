//! Adaptive detection thresholds
//!
//! Each detection kind carries a percentage-of-baseline deviation threshold,
//! seeded from defaults at session start. High-confidence alerts tighten the
//! thresholds of the kinds involved multiplicatively, never below
//! `default * min_ratio`, so a session grows more sensitive to repeated
//! patterns without becoming unboundedly sensitive.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, info};

use crate::config::ThresholdConfig;
use crate::types::IndicatorKind;

/// Fallback for a kind missing from the configured defaults
const FALLBACK_THRESHOLD: f64 = 20.0;

/// One alert as seen by the threshold learner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub timestamp: f64,
    pub indicators: BTreeSet<IndicatorKind>,
    pub confidence: f64,
}

/// Recent detection history at a glance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSummary {
    pub total_detections: usize,
    pub successful_detections: usize,
    pub avg_confidence: f64,
    /// Most frequent first
    pub most_common_indicators: Vec<(IndicatorKind, usize)>,
    pub learning_active: bool,
}

#[derive(Debug, Clone)]
pub struct AdaptiveThresholdManager {
    config: ThresholdConfig,
    current: BTreeMap<IndicatorKind, f64>,
    history: VecDeque<DetectionRecord>,
    successful_detections: usize,
}

impl Default for AdaptiveThresholdManager {
    fn default() -> Self {
        Self::new(ThresholdConfig::default())
    }
}

impl AdaptiveThresholdManager {
    pub fn new(config: ThresholdConfig) -> Self {
        Self {
            current: config.defaults.clone(),
            config,
            history: VecDeque::new(),
            successful_detections: 0,
        }
    }

    pub fn default_threshold(&self, kind: IndicatorKind) -> f64 {
        self.config
            .defaults
            .get(&kind)
            .copied()
            .unwrap_or(FALLBACK_THRESHOLD)
    }

    /// Current threshold in percent of baseline
    pub fn threshold(&self, kind: IndicatorKind) -> f64 {
        self.current
            .get(&kind)
            .copied()
            .unwrap_or_else(|| self.default_threshold(kind))
    }

    pub fn floor(&self, kind: IndicatorKind) -> f64 {
        self.default_threshold(kind) * self.config.min_ratio
    }

    /// How much more sensitive than default a kind has become (>= 1)
    pub fn sensitivity(&self, kind: IndicatorKind) -> f64 {
        let current = self.threshold(kind);
        if current <= 0.0 {
            return 1.0;
        }
        (self.default_threshold(kind) / current).max(1.0)
    }

    pub fn snapshot(&self) -> BTreeMap<IndicatorKind, f64> {
        self.current.clone()
    }

    pub fn successful_detections(&self) -> usize {
        self.successful_detections
    }

    pub fn history(&self) -> impl Iterator<Item = &DetectionRecord> {
        self.history.iter()
    }

    /// Record an alert. Returns `true` if it was confident enough to adapt the thresholds.
    pub fn record_detection(
        &mut self,
        indicators: &BTreeSet<IndicatorKind>,
        confidence: f64,
        timestamp: f64,
    ) -> bool {
        self.history.push_back(DetectionRecord {
            timestamp,
            indicators: indicators.clone(),
            confidence,
        });
        let cutoff = timestamp - self.config.history_minutes * 60.0;
        while self
            .history
            .front()
            .is_some_and(|record| record.timestamp <= cutoff)
        {
            self.history.pop_front();
        }

        if confidence < self.config.high_confidence {
            debug!(confidence, "detection below learning confidence");
            return false;
        }

        self.successful_detections += 1;
        self.adapt(indicators);
        info!(
            detection = self.successful_detections,
            confidence,
            thresholds = ?self.current,
            "adaptive thresholds tightened"
        );
        true
    }

    fn adapt(&mut self, indicators: &BTreeSet<IndicatorKind>) {
        for &kind in indicators.iter().filter(|k| k.is_detection()) {
            self.tighten(kind, self.config.decay_factor);
        }
        if indicators.contains(&IndicatorKind::BpmChange) {
            self.tighten(IndicatorKind::Blink, self.config.correlated_factor);
        }
        if indicators.contains(&IndicatorKind::Hand) {
            self.tighten(IndicatorKind::Gaze, self.config.correlated_factor);
        }
    }

    fn tighten(&mut self, kind: IndicatorKind, factor: f64) {
        let floor = self.floor(kind);
        let current = self.threshold(kind);
        // Never loosen: a factor above 1 or a current value already under the floor stays put
        let next = (current * factor.min(1.0)).max(floor).min(current);
        self.current.insert(kind, next);
    }

    pub fn summary(&self) -> DetectionSummary {
        let total = self.history.len();
        let avg_confidence = if total == 0 {
            0.0
        } else {
            self.history.iter().map(|r| r.confidence).sum::<f64>() / total as f64
        };

        let mut counts: BTreeMap<IndicatorKind, usize> = BTreeMap::new();
        for record in &self.history {
            for &kind in &record.indicators {
                *counts.entry(kind).or_insert(0) += 1;
            }
        }
        let mut most_common: Vec<(IndicatorKind, usize)> = counts.into_iter().collect();
        most_common.sort_by(|a, b| b.1.cmp(&a.1));

        DetectionSummary {
            total_detections: total,
            successful_detections: self.successful_detections,
            avg_confidence,
            most_common_indicators: most_common,
            learning_active: self.successful_detections > 0,
        }
    }

    /// Percent each tightened threshold has dropped below its default
    pub fn improvements(&self) -> BTreeMap<IndicatorKind, f64> {
        self.current
            .iter()
            .filter_map(|(&kind, &current)| {
                let default = self.default_threshold(kind);
                let pct = (default - current) / default * 100.0;
                (default > 0.0 && pct > 0.0).then_some((kind, pct))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn set(kinds: &[IndicatorKind]) -> BTreeSet<IndicatorKind> {
        kinds.iter().copied().collect()
    }

    #[test]
    fn test_seeded_from_defaults() {
        let manager = AdaptiveThresholdManager::default();
        assert_eq!(manager.threshold(IndicatorKind::BpmChange), 30.0);
        assert_eq!(manager.threshold(IndicatorKind::Blink), 40.0);
        assert_eq!(manager.threshold(IndicatorKind::Gaze), 50.0);
        assert_eq!(manager.threshold(IndicatorKind::Hand), 20.0);
        assert_eq!(manager.threshold(IndicatorKind::Lips), 30.0);
        assert_eq!(manager.sensitivity(IndicatorKind::Hand), 1.0);
        assert!(manager.improvements().is_empty());
    }

    #[test]
    fn test_low_confidence_does_not_adapt() {
        let mut manager = AdaptiveThresholdManager::default();
        assert!(!manager.record_detection(&set(&[IndicatorKind::Hand]), 0.45, 1.0));
        assert_eq!(manager.threshold(IndicatorKind::Hand), 20.0);
        assert_eq!(manager.summary().total_detections, 1);
        assert!(!manager.summary().learning_active);
    }

    #[test]
    fn test_decay_and_correlated_adjustment() {
        let mut manager = AdaptiveThresholdManager::default();
        assert!(manager.record_detection(
            &set(&[IndicatorKind::BpmChange, IndicatorKind::Hand]),
            0.7,
            1.0
        ));
        assert!((manager.threshold(IndicatorKind::BpmChange) - 29.7).abs() < 1e-9);
        assert!((manager.threshold(IndicatorKind::Hand) - 19.8).abs() < 1e-9);
        // Correlated kinds move too
        assert!((manager.threshold(IndicatorKind::Blink) - 39.6).abs() < 1e-9);
        assert!((manager.threshold(IndicatorKind::Gaze) - 49.5).abs() < 1e-9);
        assert_eq!(manager.threshold(IndicatorKind::Lips), 30.0);
        assert!(manager.sensitivity(IndicatorKind::Hand) > 1.0);
    }

    #[test]
    fn test_hand_alerts_reach_floor() {
        let config = ThresholdConfig {
            decay_factor: 0.97,
            ..Default::default()
        };
        let mut manager = AdaptiveThresholdManager::new(config);
        let hand = set(&[IndicatorKind::Hand]);
        let mut previous = manager.threshold(IndicatorKind::Hand);
        for i in 0..10 {
            manager.record_detection(&hand, 0.9, i as f64);
            let current = manager.threshold(IndicatorKind::Hand);
            assert!(current <= previous);
            previous = current;
        }
        assert!((manager.threshold(IndicatorKind::Hand) - 16.0).abs() < 1e-9);

        manager.record_detection(&hand, 0.9, 10.0);
        assert!((manager.threshold(IndicatorKind::Hand) - 16.0).abs() < 1e-9);
        assert!((manager.improvements()[&IndicatorKind::Hand] - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_default_decay_clamps_on_23rd_alert() {
        let mut manager = AdaptiveThresholdManager::default();
        let hand = set(&[IndicatorKind::Hand]);
        for n in 1..=22 {
            manager.record_detection(&hand, 0.7, n as f64);
            let expected = 20.0 * 0.99f64.powi(n);
            assert!((manager.threshold(IndicatorKind::Hand) - expected).abs() < 1e-9);
            assert!((manager.threshold(IndicatorKind::Gaze) - 2.5 * expected).abs() < 1e-9);
        }
        assert!(manager.threshold(IndicatorKind::Hand) > manager.floor(IndicatorKind::Hand));

        manager.record_detection(&hand, 0.7, 23.0);
        assert_eq!(
            manager.threshold(IndicatorKind::Hand),
            manager.floor(IndicatorKind::Hand)
        );
        assert_eq!(manager.threshold(IndicatorKind::Hand), 16.0);
        assert_eq!(manager.threshold(IndicatorKind::Gaze), 40.0);

        manager.record_detection(&hand, 0.7, 24.0);
        assert_eq!(manager.threshold(IndicatorKind::Hand), 16.0);
        assert_eq!(manager.threshold(IndicatorKind::Lips), 30.0);
    }

    #[test]
    fn test_thresholds_never_below_floor() {
        let mut manager = AdaptiveThresholdManager::default();
        let all: BTreeSet<IndicatorKind> = IndicatorKind::DETECTIONS.into_iter().collect();
        for i in 0..500 {
            manager.record_detection(&all, 1.0, i as f64);
        }
        for kind in IndicatorKind::DETECTIONS {
            assert!(manager.threshold(kind) >= manager.floor(kind) - 1e-9);
            assert!(manager.threshold(kind) <= manager.default_threshold(kind));
        }
    }

    #[test]
    fn test_display_kind_is_not_adapted() {
        let mut manager = AdaptiveThresholdManager::default();
        manager.record_detection(&set(&[IndicatorKind::AvgBpmDisplay]), 0.9, 0.0);
        assert_eq!(manager.snapshot(), crate::config::default_thresholds());
    }

    #[test]
    fn test_summary_and_history_window() {
        let mut manager = AdaptiveThresholdManager::default();
        manager.record_detection(&set(&[IndicatorKind::Hand]), 0.5, 0.0);
        manager.record_detection(&set(&[IndicatorKind::Hand, IndicatorKind::Lips]), 0.9, 60.0);
        manager.record_detection(&set(&[IndicatorKind::Hand]), 0.7, 120.0);

        let summary = manager.summary();
        assert_eq!(summary.total_detections, 3);
        assert_eq!(summary.successful_detections, 2);
        assert!((summary.avg_confidence - 0.7).abs() < 1e-9);
        assert_eq!(
            summary.most_common_indicators,
            vec![(IndicatorKind::Hand, 3), (IndicatorKind::Lips, 1)]
        );
        assert!(summary.learning_active);

        // Ten minutes later the first two events have aged out
        manager.record_detection(&set(&[IndicatorKind::Gaze]), 0.2, 660.0);
        assert_eq!(manager.history().count(), 2);
        assert_eq!(manager.summary().successful_detections, 2);
    }
}
