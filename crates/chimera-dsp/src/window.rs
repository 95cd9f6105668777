//! Window table for STFT analysis/synthesis
//!
//! Precomputed Hann window plus the overlap-add normalization constant for
//! the configured hop. The same window is applied on both the analysis and
//! synthesis sides, so reconstruction scales by `hop / sum(w^2)`; at integer
//! overlap factors the squared-window sum across overlapping frames is flat
//! and unity gain holds by construction. The inverse-FFT `1/N` scaling is
//! applied separately at synthesis time (realfft is unnormalized).

use std::f64::consts::PI;

use chimera_core::{ChimeraError, ChimeraResult, Sample};

/// Immutable Hann window + overlap-add gain
#[derive(Debug, Clone)]
pub struct WindowTable {
    coefficients: Vec<Sample>,
    overlap_gain: f64,
    hop_size: usize,
}

impl WindowTable {
    /// Build a Hann window for `frame_size` with overlap-add normalization
    /// for `hop_size`. Fails if the hop does not evenly divide the frame or
    /// exceeds it.
    pub fn build(frame_size: usize, hop_size: usize) -> ChimeraResult<Self> {
        if frame_size < 2 {
            return Err(ChimeraError::InvalidFrameSize(frame_size));
        }
        if hop_size == 0 || hop_size > frame_size || frame_size % hop_size != 0 {
            return Err(ChimeraError::InvalidHopSize {
                frame: frame_size,
                hop: hop_size,
            });
        }

        let coefficients: Vec<Sample> = (0..frame_size)
            .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / (frame_size - 1) as f64).cos()))
            .collect();

        let window_square_sum: f64 = coefficients.iter().map(|w| w * w).sum();
        let overlap_gain = hop_size as f64 / window_square_sum;

        Ok(Self {
            coefficients,
            overlap_gain,
            hop_size,
        })
    }

    /// Window coefficients (length = frame size)
    #[inline]
    pub fn coefficients(&self) -> &[Sample] {
        &self.coefficients
    }

    /// Scale factor restoring unity gain after dual-windowed overlap-add
    #[inline]
    pub fn overlap_gain(&self) -> f64 {
        self.overlap_gain
    }

    /// Frame length
    #[inline]
    pub fn frame_size(&self) -> usize {
        self.coefficients.len()
    }

    /// Hop the table was normalized for
    #[inline]
    pub fn hop_size(&self) -> usize {
        self.hop_size
    }
}
