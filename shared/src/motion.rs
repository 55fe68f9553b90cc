//! Shake detection over device-motion samples.
//!
//! The shell streams accelerometer readings as [`MotionSample`]s while the
//! listener is active. The detector rate-limits evaluation, compares the change
//! in summed acceleration against a threshold, and debounces consecutive shakes.

use serde::{Deserialize, Serialize};

use crate::UnixTimeMs;

/// Acceleration including gravity, in m/s².
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Acceleration {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Acceleration {
    fn sum(self) -> f64 {
        self.x + self.y + self.z
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    pub timestamp_ms: UnixTimeMs,
    /// Missing when the sensor reports no reading for this tick.
    pub acceleration: Option<Acceleration>,
}

/// Configuration for [`ShakeDetector`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShakeConfig {
    /// Minimum speed metric that counts as a shake.
    /// Default: 15.0
    pub threshold: f64,

    /// Samples closer than this to the last evaluated one are skipped.
    /// Default: 1000
    pub sample_interval_ms: u64,

    /// Minimum time between two reported shakes.
    /// Default: 5000
    pub debounce_ms: u64,
}

impl Default for ShakeConfig {
    fn default() -> Self {
        Self {
            threshold: crate::SHAKE_THRESHOLD,
            sample_interval_ms: crate::SHAKE_SAMPLE_INTERVAL.as_millis() as u64,
            debounce_ms: crate::SHAKE_DEBOUNCE.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Evaluated {
    at: u64,
    sum: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ShakeDetector {
    config: ShakeConfig,
    listening: bool,
    last: Option<Evaluated>,
    last_shake: Option<u64>,
}

impl ShakeDetector {
    pub fn new(config: ShakeConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &ShakeConfig {
        &self.config
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Returns false if the detector was already listening.
    pub fn start(&mut self) -> bool {
        if self.listening {
            return false;
        }
        self.listening = true;
        self.last = None;
        true
    }

    /// Returns false if the detector was not listening.
    pub fn stop(&mut self) -> bool {
        if !self.listening {
            return false;
        }
        self.listening = false;
        self.last = None;
        true
    }

    /// Feeds one sample; true when it completes a shake.
    pub fn observe(&mut self, sample: MotionSample) -> bool {
        if !self.listening {
            return false;
        }
        let Some(acceleration) = sample.acceleration else {
            return false;
        };
        let now = sample.timestamp_ms.0;
        let sum = acceleration.sum();

        let Some(last) = self.last else {
            self.last = Some(Evaluated { at: now, sum });
            return false;
        };

        let elapsed = now.saturating_sub(last.at);
        if elapsed <= self.config.sample_interval_ms {
            return false;
        }
        self.last = Some(Evaluated { at: now, sum });

        let speed = (sum - last.sum).abs() / elapsed as f64 * 10_000.0;
        if speed <= self.config.threshold {
            return false;
        }

        let debounced = self
            .last_shake
            .is_some_and(|at| now.saturating_sub(at) <= self.config.debounce_ms);
        if debounced {
            return false;
        }

        self.last_shake = Some(now);
        true
    }
}
