//! Error types for the Chimera DSP core
//!
//! Errors are only produced at `prepare()` time. The real-time path never
//! returns errors: numeric faults are scrubbed in place so that every
//! `process()` call produces a buffer.

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum ChimeraError {
    #[error("Invalid FFT frame size: {0} (must be a power of two >= 256)")]
    InvalidFrameSize(usize),

    #[error("Invalid hop size {hop} for frame size {frame} (hop must evenly divide frame)")]
    InvalidHopSize { frame: usize, hop: usize },

    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(f64),

    #[error("Invalid channel count: {0}")]
    InvalidChannelCount(usize),

    #[error("Invalid maximum block size: {0}")]
    InvalidBlockSize(usize),
}

/// Result type alias
pub type ChimeraResult<T> = Result<T, ChimeraError>;
