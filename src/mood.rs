//! Background mood classification
//!
//! The emotion classifier is an external collaborator behind
//! [`EmotionClassifier`]. [`MoodWorker`] runs at most one classification at a
//! time on a private copy of the frame and leaves its result in a single slot
//! that the frame loop polls without blocking (last write wins).
//! [`MoodTracker`] smooths accepted labels into a current mood by majority vote.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use tracing::{debug, info};

use crate::config::MoodConfig;
use crate::error::TellError;
use crate::types::Frame;

pub const NEUTRAL: &str = "neutral";

/// Top label reported by a classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionScore {
    pub label: String,
    pub score: f64,
}

impl EmotionScore {
    pub fn new(label: impl Into<String>, score: f64) -> Self {
        Self {
            label: label.into(),
            score,
        }
    }
}

/// Opaque emotion classifier. `Ok(None)` means no face/emotion was found.
pub trait EmotionClassifier: Send + Sync {
    fn top_emotion(&self, frame: &Frame) -> Result<Option<EmotionScore>, TellError>;
}

type Slot = Arc<Mutex<Option<Result<Option<EmotionScore>, TellError>>>>;

/// Clears the busy flag when the classification thread finishes, even on panic
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct MoodWorker {
    classifier: Arc<dyn EmotionClassifier>,
    busy: Arc<AtomicBool>,
    slot: Slot,
}

impl MoodWorker {
    pub fn new(classifier: Arc<dyn EmotionClassifier>) -> Self {
        Self {
            classifier,
            busy: Arc::new(AtomicBool::new(false)),
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Start classifying `frame` unless a classification is already running.
    /// Returns whether a task was started.
    pub fn dispatch(&self, frame: Frame) -> Result<bool, TellError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }

        let guard = BusyGuard(Arc::clone(&self.busy));
        let classifier = Arc::clone(&self.classifier);
        let slot = Arc::clone(&self.slot);

        thread::Builder::new()
            .name("mood-classifier".to_string())
            .spawn(move || {
                let _guard = guard;
                let result = classifier.top_emotion(&frame);
                *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
            })?;
        Ok(true)
    }

    /// Take the latest finished result, if any
    pub fn poll(&self) -> Option<Result<Option<EmotionScore>, TellError>> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Majority-vote smoothing of classifier labels
#[derive(Debug, Clone)]
pub struct MoodTracker {
    config: MoodConfig,
    history: VecDeque<String>,
    current: Option<String>,
}

impl Default for MoodTracker {
    fn default() -> Self {
        Self::new(MoodConfig::default())
    }
}

impl MoodTracker {
    pub fn new(config: MoodConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.history),
            config,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Feed one classifier result. Returns the new mood when it changed.
    pub fn observe(&mut self, emotion: &EmotionScore) -> Option<&str> {
        let strong = emotion.score > self.config.min_score;
        let weak_neutral = emotion.label == NEUTRAL && emotion.score > self.config.neutral_min_score;
        if !strong && !weak_neutral {
            debug!(label = %emotion.label, score = emotion.score, "mood result below score floor");
            return None;
        }

        self.history.push_back(emotion.label.clone());
        while self.history.len() > self.config.history.max(1) {
            self.history.pop_front();
        }

        let required = if strong {
            self.config.min_votes
        } else {
            self.config.neutral_min_votes
        };
        if self.history.len() < required {
            return None;
        }

        let (top, count) = self.majority()?;
        if (count as f64) < self.history.len() as f64 * self.config.consistency {
            return None;
        }
        if !strong && top != NEUTRAL {
            return None;
        }
        if self.current.as_deref() == Some(top.as_str()) {
            return None;
        }

        info!(mood = %top, votes = count, window = self.history.len(), "mood changed");
        self.current = Some(top);
        self.current.as_deref()
    }

    /// Most common label; ties go to the label seen first
    fn majority(&self) -> Option<(String, usize)> {
        let mut best: Option<(&String, usize)> = None;
        for label in &self.history {
            let count = self.history.iter().filter(|l| *l == label).count();
            if best.map_or(true, |(_, top)| count > top) {
                best = Some((label, count));
            }
        }
        best.map(|(label, count)| (label.clone(), count))
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.current = None;
    }
}
