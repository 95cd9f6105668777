//! chimera-dsp: Real-time spectral and feedback-delay engines
//!
//! Block-based FFT processing core plus a modulated feedback delay network.
//!
//! ## Modules
//! - `window` - Hann window table with overlap-add normalization
//! - `stft` - Hop-based FFT framing/reconstruction with per-bin transforms
//! - `freeze` - Spectral freeze (capture/hold/decay with bin operations)
//! - `gate` - Per-bin spectral gate with decimated envelopes
//! - `feedback` - Dual delay lines with cross-feedback and LFO modulation
//! - `smoothing` - One-pole parameter smoothers
//! - `integrity` - Denormal flushing and NaN/Inf scrubbing

pub mod feedback;
pub mod freeze;
pub mod gate;
pub mod integrity;
pub mod smoothing;
pub mod stft;
pub mod window;

use chimera_core::{ChimeraResult, Sample};

/// Trait for all DSP processors
pub trait Processor: Send {
    /// Reset processor state without reallocating
    fn reset(&mut self);

    /// Get latency in samples
    fn latency(&self) -> usize {
        0
    }
}

/// Stereo processor trait
pub trait StereoProcessor: Processor {
    /// Process a stereo sample pair
    fn process_sample(&mut self, left: Sample, right: Sample) -> (Sample, Sample);

    /// Process stereo blocks
    fn process_block(&mut self, left: &mut [Sample], right: &mut [Sample]) {
        debug_assert_eq!(left.len(), right.len());
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            (*l, *r) = self.process_sample(*l, *r);
        }
    }
}

/// Host-facing engine surface: prepared once (non-real-time), then driven
/// block-by-block on the audio thread. Parameter values arrive normalized
/// [0,1] and are clamped, never rejected.
pub trait AudioEngine: Processor {
    /// Allocate and size all internal state. Not real-time safe.
    fn prepare(&mut self, sample_rate: f64, max_block_size: usize) -> ChimeraResult<()>;

    /// Process one block in place. Never allocates, never panics, never
    /// returns an error: numeric faults degrade to clamped/zeroed output.
    fn process(&mut self, left: &mut [Sample], right: &mut [Sample]);

    /// Set a normalized parameter by index. Unknown indices are ignored.
    fn set_parameter(&mut self, index: u32, value: f64);
}
