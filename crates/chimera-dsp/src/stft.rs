//! Hop-based FFT framing and overlap-add reconstruction
//!
//! `SpectralFrameProcessor` owns the windowing, framing, forward/inverse FFT
//! and overlap-add plumbing shared by the spectral engines; callers supply a
//! per-bin transform that mutates the half-spectrum in place.
//!
//! Real-time contract: all buffers are sized at `prepare()` time, the block
//! path never allocates and never errors. Pathological transforms are
//! contained by clamping windowed synthesis samples to [-10, 10] before
//! overlap-add and the popped output to [-2, 2], so a corrupted frame cannot
//! poison the ring indefinitely.

use std::sync::Arc;

use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;

use chimera_core::{ChimeraError, ChimeraResult, Sample};

use crate::integrity::sanitize;
use crate::window::WindowTable;

/// Per-bin transform: (half-spectrum bins, bin count, sample rate)
pub type BinTransform<'a> = dyn FnMut(&mut [Complex<Sample>], usize, f64) + 'a;

/// Per-channel STFT state
struct SpectralFrame {
    /// Staging for the next hop's worth of input
    input_accum: Vec<Sample>,
    accum_pos: usize,
    /// Sliding analysis frame (shift-left by hop every hop)
    input_buffer: Vec<Sample>,
    /// Overlap-add output ring; positions are cleared as they are read
    output_ring: Vec<Sample>,
    read_pos: usize,
    write_pos: usize,
    /// Hops completed since prepare/reset
    hop_count: u64,
}

impl SpectralFrame {
    fn new(frame_size: usize, hop_size: usize) -> Self {
        Self {
            input_accum: vec![0.0; hop_size],
            accum_pos: 0,
            input_buffer: vec![0.0; frame_size],
            output_ring: vec![0.0; frame_size * 2],
            read_pos: 0,
            write_pos: 0,
            hop_count: 0,
        }
    }

    fn reset(&mut self) {
        self.input_accum.fill(0.0);
        self.accum_pos = 0;
        self.input_buffer.fill(0.0);
        self.output_ring.fill(0.0);
        self.read_pos = 0;
        self.write_pos = 0;
        self.hop_count = 0;
    }
}

/// Generic hop-based FFT processor with caller-supplied bin transforms
pub struct SpectralFrameProcessor {
    frame_size: usize,
    hop_size: usize,
    sample_rate: f64,
    window: WindowTable,
    channels: Vec<SpectralFrame>,
    fft_forward: Arc<dyn RealToComplex<f64>>,
    fft_inverse: Arc<dyn ComplexToReal<f64>>,
    /// Windowed time-domain scratch (frame_size)
    time_scratch: Vec<Sample>,
    /// Half-spectrum scratch (frame_size / 2 + 1)
    spectrum: Vec<Complex<Sample>>,
}

impl SpectralFrameProcessor {
    /// Allocate all state for the given configuration.
    ///
    /// `frame_size` must be a power of two >= 256; `hop_size` must evenly
    /// divide it. Not real-time safe.
    pub fn prepare(
        sample_rate: f64,
        frame_size: usize,
        hop_size: usize,
        max_channels: usize,
    ) -> ChimeraResult<Self> {
        if !frame_size.is_power_of_two() || frame_size < 256 {
            return Err(ChimeraError::InvalidFrameSize(frame_size));
        }
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(ChimeraError::InvalidSampleRate(sample_rate));
        }
        if max_channels == 0 {
            return Err(ChimeraError::InvalidChannelCount(max_channels));
        }
        let window = WindowTable::build(frame_size, hop_size)?;

        let mut planner = RealFftPlanner::<f64>::new();
        let fft_forward = planner.plan_fft_forward(frame_size);
        let fft_inverse = planner.plan_fft_inverse(frame_size);

        let channels = (0..max_channels)
            .map(|_| SpectralFrame::new(frame_size, hop_size))
            .collect();

        log::debug!(
            "SpectralFrameProcessor: frame={frame_size} hop={hop_size} \
             latency={} samples @ {sample_rate} Hz",
            frame_size - hop_size
        );

        Ok(Self {
            frame_size,
            hop_size,
            sample_rate,
            window,
            channels,
            fft_forward,
            fft_inverse,
            time_scratch: vec![0.0; frame_size],
            spectrum: vec![Complex::new(0.0, 0.0); frame_size / 2 + 1],
        })
    }

    #[inline]
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    #[inline]
    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    #[inline]
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Half-spectrum length as processed by bin transforms
    #[inline]
    pub fn num_bins(&self) -> usize {
        self.frame_size / 2 + 1
    }

    /// Framing delay between input and reconstructed output
    #[inline]
    pub fn latency(&self) -> usize {
        self.frame_size - self.hop_size
    }

    /// Sum of the analysis window coefficients.
    ///
    /// A bin-centered sinusoid of amplitude `a` shows up in the forward
    /// spectrum with magnitude `a * window_sum / 2`, so callers comparing
    /// bin magnitudes against amplitude-domain thresholds scale by
    /// `2 / window_sum`.
    #[inline]
    pub fn window_sum(&self) -> f64 {
        self.window.coefficients().iter().sum()
    }

    /// Clear all per-channel state without reallocating
    pub fn reset(&mut self) {
        for channel in &mut self.channels {
            channel.reset();
        }
    }

    /// Process one channel's block through the hop pipeline.
    ///
    /// Every `hop_size` accumulated samples: window, forward FFT, apply
    /// `transform` to the half-spectrum, inverse FFT, window again, scale by
    /// the overlap gain and add into the output ring. Pops one fully-summed
    /// output sample per input sample. Out-of-range channels and mismatched
    /// slice lengths produce silence rather than a panic.
    pub fn process_block(
        &mut self,
        channel: usize,
        input: &[Sample],
        output: &mut [Sample],
        transform: &mut BinTransform<'_>,
    ) {
        if channel >= self.channels.len() || input.len() != output.len() {
            output.fill(0.0);
            return;
        }

        let frame = self.frame_size;
        let hop = self.hop_size;
        let ring_len = frame * 2;
        let norm = self.window.overlap_gain() / frame as f64;

        for (in_sample, out_sample) in input.iter().zip(output.iter_mut()) {
            let ch = &mut self.channels[channel];

            // Non-finite input must never reach the FFT
            ch.input_accum[ch.accum_pos] = sanitize(*in_sample);
            ch.accum_pos += 1;

            if ch.accum_pos >= hop {
                ch.accum_pos = 0;

                // Slide the analysis frame and append the new hop
                ch.input_buffer.copy_within(hop.., 0);
                ch.input_buffer[frame - hop..].copy_from_slice(&ch.input_accum);

                for (scratch, (&sample, &win)) in self
                    .time_scratch
                    .iter_mut()
                    .zip(ch.input_buffer.iter().zip(self.window.coefficients()))
                {
                    *scratch = sample * win;
                }

                let _ = self
                    .fft_forward
                    .process(&mut self.time_scratch, &mut self.spectrum);

                transform(&mut self.spectrum, frame / 2 + 1, self.sample_rate);

                // realfft expects purely real DC/Nyquist bins on the way back
                self.spectrum[0].im = 0.0;
                self.spectrum[frame / 2].im = 0.0;

                let _ = self
                    .fft_inverse
                    .process(&mut self.spectrum, &mut self.time_scratch);

                let ch = &mut self.channels[channel];
                for (i, (&sample, &win)) in self
                    .time_scratch
                    .iter()
                    .zip(self.window.coefficients())
                    .enumerate()
                {
                    let v = sanitize(sample * norm * win).clamp(-10.0, 10.0);
                    let pos = (ch.write_pos + i) % ring_len;
                    ch.output_ring[pos] += v;
                }
                ch.write_pos = (ch.write_pos + hop) % ring_len;
                ch.hop_count += 1;
            }

            let ch = &mut self.channels[channel];
            let out = ch.output_ring[ch.read_pos];
            ch.output_ring[ch.read_pos] = 0.0; // clear for the next overlap-add
            ch.read_pos = (ch.read_pos + 1) % ring_len;

            *out_sample = out.clamp(-2.0, 2.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(_bins: &mut [Complex<Sample>], _count: usize, _rate: f64) {}

    #[test]
    fn test_prepare_validation() {
        assert!(SpectralFrameProcessor::prepare(48000.0, 100, 25, 2).is_err());
        assert!(SpectralFrameProcessor::prepare(48000.0, 1000, 250, 2).is_err());
        assert!(SpectralFrameProcessor::prepare(48000.0, 2048, 500, 2).is_err());
        assert!(SpectralFrameProcessor::prepare(0.0, 2048, 512, 2).is_err());
        assert!(SpectralFrameProcessor::prepare(48000.0, 2048, 512, 0).is_err());
        assert!(SpectralFrameProcessor::prepare(48000.0, 2048, 512, 2).is_ok());
    }

    #[test]
    fn test_identity_reconstruction_sine() {
        for &(frame, hop) in &[(256usize, 64usize), (1024, 256), (2048, 512), (1024, 128)] {
            let mut stft = SpectralFrameProcessor::prepare(48000.0, frame, hop, 1).unwrap();
            let latency = stft.latency();

            let total = frame * 6;
            let input: Vec<f64> = (0..total)
                .map(|i| (2.0 * std::f64::consts::PI * 440.0 * i as f64 / 48000.0).sin() * 0.5)
                .collect();
            let mut output = vec![0.0; total];
            stft.process_block(0, &input, &mut output, &mut identity);

            // Compare after the startup transient has fully flushed
            for t in frame * 2..total {
                let expected = input[t - latency];
                assert!(
                    (output[t] - expected).abs() < 1e-3,
                    "frame {frame} hop {hop}: sample {t}: {} vs {expected}",
                    output[t]
                );
            }
        }
    }

    #[test]
    fn test_identity_reconstruction_constant() {
        let frame = 2048;
        let hop = 512;
        let mut stft = SpectralFrameProcessor::prepare(48000.0, frame, hop, 1).unwrap();

        let total = frame * 6;
        let input = vec![0.25; total];
        let mut output = vec![0.0; total];
        stft.process_block(0, &input, &mut output, &mut identity);

        // COLA ripple of the symmetric Hann at this frame/hop is ~2e-5
        for t in frame * 2..total {
            assert!((output[t] - 0.25).abs() < 1e-4, "sample {t}: {}", output[t]);
        }
    }

    #[test]
    fn test_non_finite_input_scrubbed() {
        let mut stft = SpectralFrameProcessor::prepare(48000.0, 1024, 256, 1).unwrap();

        let mut input = vec![0.1; 4096];
        input[100] = f64::NAN;
        input[200] = f64::INFINITY;
        let mut output = vec![0.0; 4096];
        stft.process_block(0, &input, &mut output, &mut identity);

        assert!(output.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_pathological_transform_bounded() {
        let mut stft = SpectralFrameProcessor::prepare(48000.0, 1024, 256, 1).unwrap();

        let input = vec![0.5; 8192];
        let mut output = vec![0.0; 8192];
        let mut explode = |bins: &mut [Complex<Sample>], _count: usize, _rate: f64| {
            for bin in bins.iter_mut() {
                *bin *= 1e12;
            }
        };
        stft.process_block(0, &input, &mut output, &mut explode);

        assert!(output.iter().all(|x| x.is_finite() && x.abs() <= 2.0));
    }

    #[test]
    fn test_independent_channels() {
        let mut stft = SpectralFrameProcessor::prepare(48000.0, 1024, 256, 2).unwrap();

        let total = 6144;
        let left_in = vec![0.3; total];
        let right_in = vec![0.0; total];
        let mut left_out = vec![0.0; total];
        let mut right_out = vec![0.0; total];
        stft.process_block(0, &left_in, &mut left_out, &mut identity);
        stft.process_block(1, &right_in, &mut right_out, &mut identity);

        assert!((left_out[total - 1] - 0.3).abs() < 1e-3);
        assert!(right_out[total - 1].abs() < 1e-9);
    }

    #[test]
    fn test_out_of_range_channel_silent() {
        let mut stft = SpectralFrameProcessor::prepare(48000.0, 1024, 256, 1).unwrap();
        let input = vec![0.5; 512];
        let mut output = vec![1.0; 512];
        stft.process_block(3, &input, &mut output, &mut identity);
        assert!(output.iter().all(|&x| x == 0.0));
    }
}
