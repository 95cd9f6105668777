//! Parameter types for audio processors

use serde::{Deserialize, Serialize};

/// Parameter value (normalized 0.0-1.0)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedValue(f64);

impl NormalizedValue {
    pub const ZERO: Self = Self(0.0);
    pub const ONE: Self = Self(1.0);
    pub const HALF: Self = Self(0.5);

    #[inline]
    pub fn new(value: f64) -> Self {
        Self(value.clamp(0.0, 1.0))
    }

    #[inline]
    pub fn get(self) -> f64 {
        self.0
    }

    /// Map to a range
    #[inline]
    pub fn map(self, min: f64, max: f64) -> f64 {
        min + self.0 * (max - min)
    }

    /// Map logarithmically (for frequency, etc.)
    #[inline]
    pub fn map_log(self, min: f64, max: f64) -> f64 {
        let log_min = min.ln();
        let log_max = max.ln();
        (log_min + self.0 * (log_max - log_min)).exp()
    }
}

impl Default for NormalizedValue {
    fn default() -> Self {
        Self::HALF
    }
}
