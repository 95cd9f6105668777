//! Sample types and level conversions

/// Type alias for audio samples (always f64 for maximum precision)
pub type Sample = f64;

/// Convert decibels to linear gain
#[inline]
pub fn db_to_linear(db: f64) -> f64 {
    10.0_f64.powf(db / 20.0)
}

/// Convert linear gain to decibels (floored at -120 dB for silence)
#[inline]
pub fn linear_to_db(linear: f64) -> f64 {
    if linear > 1e-6 {
        20.0 * linear.log10()
    } else {
        -120.0
    }
}
