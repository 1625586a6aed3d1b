//! Analysis tap: the most recent captured samples, for level metering.

use crate::defaults;
use crate::sync::lock;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Bounded window of the newest normalized samples.
///
/// Written by the capture worker, read by the VAD monitor. Older samples
/// fall off the front once the window is full.
#[derive(Debug)]
pub struct AnalysisTap {
    window: Mutex<VecDeque<f32>>,
    capacity: usize,
}

impl AnalysisTap {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, samples: &[f32]) {
        let mut window = lock(&self.window);
        let skip = samples.len().saturating_sub(self.capacity);
        for &sample in &samples[skip..] {
            if window.len() == self.capacity {
                window.pop_front();
            }
            window.push_back(sample);
        }
    }

    /// Copy of the current window, oldest sample first.
    pub fn snapshot(&self) -> Vec<f32> {
        lock(&self.window).iter().copied().collect()
    }

    pub fn clear(&self) {
        lock(&self.window).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.window).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for AnalysisTap {
    fn default() -> Self {
        Self::new(defaults::ANALYSIS_WINDOW)
    }
}
