//! Fixed-capacity rolling windows
//!
//! The blink, hand-contact and gaze histories are owned ring buffers: pushing
//! past capacity evicts the oldest sample.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollingWindow<T> {
    values: VecDeque<T>,
    capacity: usize,
}

impl<T> RollingWindow<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: T) {
        self.values.push_back(value);
        while self.values.len() > self.capacity {
            self.values.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.values.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.values.iter()
    }

    /// The most recent `n` values, oldest first
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &T> {
        self.values.iter().skip(self.values.len().saturating_sub(n))
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

impl RollingWindow<bool> {
    /// false→true transitions among the most recent `n` samples
    pub fn recent_onsets(&self, n: usize) -> usize {
        count_onsets(self.recent(n).copied())
    }
}

impl RollingWindow<f64> {
    pub fn mean(&self) -> Option<f64> {
        mean(self.values.iter().copied())
    }
}

/// Count false→true transitions between consecutive samples
pub fn count_onsets(samples: impl IntoIterator<Item = bool>) -> usize {
    let mut previous: Option<bool> = None;
    let mut onsets = 0;
    for current in samples {
        if previous == Some(false) && current {
            onsets += 1;
        }
        previous = Some(current);
    }
    onsets
}

pub fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        return None;
    }
    Some(sum / count as f64)
}

/// Population standard deviation
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let mean = mean(values.iter().copied())?;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}
