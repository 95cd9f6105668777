//! Numeric safety helpers
//!
//! Denormal flushing and NaN/Inf scrubbing. Every engine sanitizes each
//! output sample in its mix loop so no non-finite value persists in any
//! buffer across a block.

use chimera_core::Sample;

/// Values below this magnitude are flushed to exact zero
const DENORMAL_THRESHOLD: f64 = 1e-30;

/// Flush denormals to zero
#[inline(always)]
pub fn flush_denormal(x: Sample) -> Sample {
    if x.abs() < DENORMAL_THRESHOLD {
        0.0
    } else {
        x
    }
}

/// Replace non-finite values with zero and flush denormals
#[inline(always)]
pub fn sanitize(x: Sample) -> Sample {
    if x.is_finite() {
        flush_denormal(x)
    } else {
        0.0
    }
}
