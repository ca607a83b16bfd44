//! Response time and load trackers
//!
//! TigerStyle: Bounded sample windows, validated inputs.

use crate::error::{RegistryError, RegistryResult};
use beacon_core::constants::RESPONSE_TIME_EMA_ALPHA;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const LOAD_WEIGHT_CPU: f64 = 0.4;
const LOAD_WEIGHT_MEMORY: f64 = 0.3;
const LOAD_WEIGHT_ACTIVE_REQUESTS: f64 = 0.3;

/// Rolling response-time window plus an exponential moving average
#[derive(Debug, Clone)]
pub struct ResponseTimeTracker {
    samples_ms: VecDeque<f64>,
    window_count_max: usize,
    ema_ms: Option<f64>,
    last_updated_ms: u64,
}

impl ResponseTimeTracker {
    pub fn new(window_count_max: usize) -> Self {
        assert!(window_count_max > 0, "window must be positive");
        Self {
            samples_ms: VecDeque::with_capacity(window_count_max.min(1024)),
            window_count_max,
            ema_ms: None,
            last_updated_ms: 0,
        }
    }

    pub fn record(&mut self, duration_ms: f64, now_ms: u64) {
        debug_assert!(duration_ms >= 0.0);
        if self.samples_ms.len() == self.window_count_max {
            self.samples_ms.pop_front();
        }
        self.samples_ms.push_back(duration_ms);
        self.ema_ms = Some(match self.ema_ms {
            None => duration_ms,
            Some(prev) => RESPONSE_TIME_EMA_ALPHA * duration_ms + (1.0 - RESPONSE_TIME_EMA_ALPHA) * prev,
        });
        self.last_updated_ms = now_ms;
        debug_assert!(self.samples_ms.len() <= self.window_count_max);
    }

    pub fn ema_ms(&self) -> Option<f64> {
        self.ema_ms
    }

    /// Plain mean over the window
    pub fn mean_ms(&self) -> Option<f64> {
        if self.samples_ms.is_empty() {
            return None;
        }
        Some(self.samples_ms.iter().sum::<f64>() / self.samples_ms.len() as f64)
    }

    pub fn sample_count(&self) -> usize {
        self.samples_ms.len()
    }

    pub fn last_updated_ms(&self) -> u64 {
        self.last_updated_ms
    }
}

/// One load report from an instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub active_requests: u64,
}

impl LoadSample {
    pub fn new(cpu_percent: f64, memory_percent: f64, active_requests: u64) -> Self {
        Self {
            cpu_percent,
            memory_percent,
            active_requests,
        }
    }

    pub fn validate(&self) -> RegistryResult<()> {
        if !(0.0..=100.0).contains(&self.cpu_percent) {
            return Err(RegistryError::invalid_input(
                "cpu_percent",
                format!("{} is outside [0, 100]", self.cpu_percent),
            ));
        }
        if !(0.0..=100.0).contains(&self.memory_percent) {
            return Err(RegistryError::invalid_input(
                "memory_percent",
                format!("{} is outside [0, 100]", self.memory_percent),
            ));
        }
        Ok(())
    }

    /// Blended load in [0, 1]
    pub fn score(&self) -> f64 {
        let raw = self.cpu_percent * LOAD_WEIGHT_CPU
            + self.memory_percent * LOAD_WEIGHT_MEMORY
            + self.active_requests as f64 * LOAD_WEIGHT_ACTIVE_REQUESTS;
        (raw / 100.0).clamp(0.0, 1.0)
    }
}

/// Latest load report for an instance
#[derive(Debug, Clone, Copy)]
pub struct LoadTracker {
    pub sample: LoadSample,
    pub last_updated_ms: u64,
}

impl LoadTracker {
    pub fn new(sample: LoadSample, now_ms: u64) -> Self {
        Self {
            sample,
            last_updated_ms: now_ms,
        }
    }

    pub fn score(&self) -> f64 {
        self.sample.score()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ema() {
        let mut tracker = ResponseTimeTracker::new(10);
        assert_eq!(tracker.ema_ms(), None);

        tracker.record(100.0, 1);
        assert_eq!(tracker.ema_ms(), Some(100.0));

        tracker.record(200.0, 2);
        let ema = tracker.ema_ms().unwrap();
        assert!((ema - 110.0).abs() < 1e-9);
        assert_eq!(tracker.last_updated_ms(), 2);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut tracker = ResponseTimeTracker::new(3);
        for ms in [10.0, 20.0, 30.0, 40.0] {
            tracker.record(ms, 0);
        }
        assert_eq!(tracker.sample_count(), 3);
        assert_eq!(tracker.mean_ms(), Some(30.0));
    }

    #[test]
    fn test_load_score() {
        assert_eq!(LoadSample::new(0.0, 0.0, 0).score(), 0.0);
        let score = LoadSample::new(50.0, 50.0, 10).score();
        assert!((score - 0.38).abs() < 1e-9);
        assert_eq!(LoadSample::new(100.0, 100.0, 1000).score(), 1.0);
    }

    #[test]
    fn test_load_validation() {
        assert!(LoadSample::new(50.0, 50.0, 0).validate().is_ok());
        assert!(LoadSample::new(101.0, 50.0, 0).validate().is_err());
        assert!(LoadSample::new(50.0, -1.0, 0).validate().is_err());
        assert!(LoadSample::new(f64::NAN, 0.0, 0).validate().is_err());
    }
}
