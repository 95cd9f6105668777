//! Parameter smoothing
//!
//! Click-free parameter changes via one-pole exponential smoothers.
//! Targets are published with atomic stores so a control thread can write
//! while the audio thread consumes; the audio thread is the single reader
//! and owns all other state. Zero allocation after construction.

use std::sync::atomic::{AtomicU64, Ordering};

/// One-pole exponentially smoothed parameter
#[derive(Debug)]
pub struct SmoothedParam {
    /// Target value (set from control thread)
    target: AtomicU64,
    /// Current smoothed value
    current: f64,
    /// Per-sample smoothing coefficient
    coeff: f64,
    /// Minimum value
    min_value: f64,
    /// Maximum value
    max_value: f64,
}

impl SmoothedParam {
    /// Create a smoothed parameter clamped to [min, max]
    pub fn new(
        initial_value: f64,
        smoothing_time_ms: f64,
        sample_rate: f64,
        min: f64,
        max: f64,
    ) -> Self {
        let initial = initial_value.clamp(min, max);
        Self {
            target: AtomicU64::new(initial.to_bits()),
            current: initial,
            coeff: Self::calculate_coeff(smoothing_time_ms, sample_rate),
            min_value: min,
            max_value: max,
        }
    }

    /// Normalized [0,1] parameter with the given smoothing time
    pub fn normalized(initial_value: f64, smoothing_time_ms: f64, sample_rate: f64) -> Self {
        Self::new(initial_value, smoothing_time_ms, sample_rate, 0.0, 1.0)
    }

    /// Reach ~63% of a step in `smoothing_time_ms`
    fn calculate_coeff(time_ms: f64, sample_rate: f64) -> f64 {
        let samples = (time_ms / 1000.0) * sample_rate;
        if samples <= 0.0 {
            1.0
        } else {
            1.0 - (-1.0 / samples).exp()
        }
    }

    /// Set target value (thread-safe)
    #[inline]
    pub fn set_target(&self, value: f64) {
        let clamped = value.clamp(self.min_value, self.max_value);
        self.target.store(clamped.to_bits(), Ordering::Relaxed);
    }

    /// Get target value
    #[inline]
    pub fn target(&self) -> f64 {
        f64::from_bits(self.target.load(Ordering::Relaxed))
    }

    /// Get current smoothed value
    #[inline]
    pub fn current(&self) -> f64 {
        self.current
    }

    /// Set current and target immediately (initialization / reset)
    pub fn set_immediate(&mut self, value: f64) {
        let clamped = value.clamp(self.min_value, self.max_value);
        self.current = clamped;
        self.target.store(clamped.to_bits(), Ordering::Relaxed);
    }

    /// Advance one sample
    #[inline]
    pub fn next(&mut self) -> f64 {
        let target = self.target();
        self.current += self.coeff * (target - self.current);
        self.current
    }

    /// Advance by `n` samples in one step (hop-granular engines)
    #[inline]
    pub fn skip(&mut self, n: usize) -> f64 {
        let target = self.target();
        // (1-c)^n shrinks the remaining distance to target
        let remain = (1.0 - self.coeff).powi(n as i32);
        self.current = target + (self.current - target) * remain;
        self.current
    }

    /// Snap to target instantly
    pub fn reset(&mut self) {
        self.current = self.target();
    }
}
