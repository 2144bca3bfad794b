//! Alert clustering, scoring and filtering
//!
//! Every invocation scores the indicators seen within the clustering window
//! and records the resulting alert in a priority queue, whether or not it is
//! surfaced. Only alerts above the confidence threshold that pass the
//! cooldown/repetition filter are returned to the caller.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, VecDeque};
use tracing::{debug, info};

use crate::config::AlertConfig;
use crate::types::{Alert, IndicatorKind, TellMap};

/// Stress level from the live detection tells: 0 none, 1 one, 2 two or three, 3 four or more
pub fn stress_level(tells: &TellMap) -> u8 {
    match tells.keys().filter(|kind| kind.is_detection()).count() {
        0 => 0,
        1 => 1,
        2 | 3 => 2,
        _ => 3,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    Accepted,
    Suppressed,
}

#[derive(Debug, Clone)]
struct QueuedAlert {
    sequence: u64,
    alert: Alert,
}

impl QueuedAlert {
    fn key(&self) -> (i64, Reverse<u64>) {
        (self.alert.priority, Reverse(self.sequence))
    }
}

impl PartialEq for QueuedAlert {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedAlert {}

impl PartialOrd for QueuedAlert {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedAlert {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Max-heap of alerts by priority; equal priorities leave in insertion order
#[derive(Debug, Clone, Default)]
pub struct AlertQueue {
    heap: BinaryHeap<QueuedAlert>,
    next_sequence: u64,
}

impl AlertQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, alert: Alert) {
        self.heap.push(QueuedAlert {
            sequence: self.next_sequence,
            alert,
        });
        self.next_sequence += 1;
    }

    pub fn pop(&mut self) -> Option<Alert> {
        self.heap.pop().map(|queued| queued.alert)
    }

    /// Highest-priority alerts without removing them
    pub fn top(&self, limit: usize) -> Vec<Alert> {
        let mut queued: Vec<&QueuedAlert> = self.heap.iter().collect();
        queued.sort_by(|a, b| b.cmp(a));
        queued
            .into_iter()
            .take(limit)
            .map(|q| q.alert.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct AlertManager {
    config: AlertConfig,
    queue: AlertQueue,
    events: VecDeque<(f64, IndicatorKind)>,
    patterns: VecDeque<(f64, BTreeSet<IndicatorKind>)>,
    last_accepted: Option<f64>,
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new(AlertConfig::default())
    }
}

impl AlertManager {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config,
            queue: AlertQueue::new(),
            events: VecDeque::new(),
            patterns: VecDeque::new(),
            last_accepted: None,
        }
    }

    pub fn confidence(&self, cluster_size: usize) -> f64 {
        (self.config.confidence_base + self.config.confidence_per_indicator * cluster_size as f64)
            .min(1.0)
    }

    pub fn priority(cluster: &BTreeSet<IndicatorKind>, stress_level: u8) -> i64 {
        cluster.iter().map(|kind| kind.weight()).sum::<i64>() + stress_level as i64 * 10
    }

    /// Score the current tells. Returns an alert only if it is confident
    /// enough and passes the false-positive filter.
    pub fn process(&mut self, tells: &TellMap, stress_level: u8, timestamp: f64) -> Option<Alert> {
        let present: Vec<IndicatorKind> = tells
            .keys()
            .copied()
            .filter(|kind| kind.is_detection())
            .collect();
        if present.is_empty() {
            return None;
        }

        self.events
            .extend(present.iter().map(|&kind| (timestamp, kind)));
        let cutoff = timestamp - self.config.lookback;
        self.events.retain(|(t, _)| *t >= cutoff);

        let since = timestamp - self.config.cluster_window;
        let cluster: BTreeSet<IndicatorKind> = self
            .events
            .iter()
            .filter(|(t, _)| *t >= since)
            .map(|(_, kind)| *kind)
            .collect();

        let mut details: BTreeMap<String, String> = tells
            .iter()
            .filter(|(kind, _)| kind.is_detection())
            .map(|(kind, tell)| (kind.as_str().to_string(), tell.text.clone()))
            .collect();
        details.insert("stress_level".to_string(), stress_level.to_string());

        let alert = Alert {
            priority: Self::priority(&cluster, stress_level),
            timestamp,
            confidence: self.confidence(cluster.len()),
            indicators: cluster,
            details,
        };
        self.queue.push(alert.clone());

        if alert.confidence < self.config.alert_threshold {
            return None;
        }

        match self.filter(&alert.indicators, timestamp) {
            FilterOutcome::Accepted => {
                self.last_accepted = Some(timestamp);
                info!(
                    priority = alert.priority,
                    confidence = alert.confidence,
                    indicators = %alert,
                    "alert accepted"
                );
                Some(alert)
            }
            FilterOutcome::Suppressed => {
                debug!(confidence = alert.confidence, "alert suppressed by cooldown");
                None
            }
        }
    }

    /// Suppress only when inside the cooldown, not a repeated pattern and a small cluster
    fn filter(&mut self, cluster: &BTreeSet<IndicatorKind>, timestamp: f64) -> FilterOutcome {
        let cooling = self.within_cooldown(timestamp);
        let repeated = self.record_pattern(cluster, timestamp);
        let small = self.is_small_cluster(cluster);
        if cooling && !repeated && small {
            FilterOutcome::Suppressed
        } else {
            FilterOutcome::Accepted
        }
    }

    fn within_cooldown(&self, timestamp: f64) -> bool {
        self.last_accepted
            .is_some_and(|last| timestamp - last < self.config.cooldown)
    }

    fn is_small_cluster(&self, cluster: &BTreeSet<IndicatorKind>) -> bool {
        cluster.len() < self.config.min_cluster_size
    }

    /// Whether this exact set already occurred `min_repetitions` times in the
    /// repetition window; the set is remembered either way.
    fn record_pattern(&mut self, cluster: &BTreeSet<IndicatorKind>, timestamp: f64) -> bool {
        let cutoff = timestamp - self.config.repetition_window;
        self.patterns.retain(|(t, _)| *t >= cutoff);
        let seen = self
            .patterns
            .iter()
            .filter(|(_, pattern)| pattern == cluster)
            .count();
        self.patterns.push_back((timestamp, cluster.clone()));
        seen >= self.config.min_repetitions
    }

    /// Remove and return the highest-priority recorded alert
    pub fn dequeue(&mut self) -> Option<Alert> {
        self.queue.pop()
    }

    pub fn pending(&self, limit: usize) -> Vec<Alert> {
        self.queue.top(limit)
    }

    pub fn recorded(&self) -> usize {
        self.queue.len()
    }

    pub fn last_accepted(&self) -> Option<f64> {
        self.last_accepted
    }

    /// Forget the event log, cluster patterns and cooldown. Recorded alerts
    /// stay queued.
    pub fn clear_history(&mut self) {
        self.events.clear();
        self.patterns.clear();
        self.last_accepted = None;
    }
}
